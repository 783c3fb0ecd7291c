// Integration tests for broadcast sessions
//
// Runs broadcasters and viewers end to end over the loopback network:
// - Viewer admission and teardown on stop
// - Composition changes reaching connected viewers
// - Per-viewer failure isolation, including a viewer whose transport hangs
// - Collaborator notifications

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use synctv_broadcast::{
    BroadcastConfig, BroadcastDeps, BroadcastOptions, BroadcasterSession, ComposedStream,
    ConnectionState, Error, IceCandidate, LoopbackNetwork, MediaCaptureService, MediaTrack,
    Notification, PeerConnectionFactory, PeerId, PeerTransport, QualityTier,
    RecordingCollaborator, Resolution, SessionCollaborator, SessionDescription, SessionEvent,
    SessionId, SessionRecord, SignalingHub, SourceKind, SourceMix, SyntheticBackend, TrackKind,
    TransportEventSender, TransportFactory, ViewerConnection, ViewerConnector,
};
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};

/// Loopback transports whose track swaps never complete once `hang` is set
/// at creation time
struct HangingSwaps {
    network: Arc<LoopbackNetwork>,
    hang: AtomicBool,
}

struct HangingTransport {
    inner: Arc<dyn PeerTransport>,
    hang: bool,
}

#[async_trait]
impl TransportFactory for HangingSwaps {
    async fn create(
        &self,
        local: &PeerId,
        remote: &PeerId,
        events: TransportEventSender,
    ) -> synctv_broadcast::Result<Arc<dyn PeerTransport>> {
        let inner = self.network.create(local, remote, events).await?;
        Ok(Arc::new(HangingTransport {
            inner,
            hang: self.hang.load(Ordering::SeqCst),
        }))
    }
}

#[async_trait]
impl PeerTransport for HangingTransport {
    async fn create_offer(&self) -> synctv_broadcast::Result<SessionDescription> {
        self.inner.create_offer().await
    }

    async fn create_answer(&self) -> synctv_broadcast::Result<SessionDescription> {
        self.inner.create_answer().await
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> synctv_broadcast::Result<()> {
        self.inner.set_remote_description(description).await
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> synctv_broadcast::Result<()> {
        self.inner.add_candidate(candidate).await
    }

    async fn replace_track(
        &self,
        kind: TrackKind,
        track: Option<MediaTrack>,
    ) -> synctv_broadcast::Result<()> {
        if self.hang {
            std::future::pending::<()>().await;
        }
        self.inner.replace_track(kind, track).await
    }

    async fn probe(&self) -> synctv_broadcast::Result<()> {
        self.inner.probe().await
    }

    async fn close(&self) -> synctv_broadcast::Result<()> {
        self.inner.close().await
    }
}

struct Harness {
    network: Arc<LoopbackNetwork>,
    backend: Arc<SyntheticBackend>,
    collaborator: Arc<RecordingCollaborator>,
    deps: BroadcastDeps,
    connector: ViewerConnector,
}

fn harness() -> Harness {
    let network = LoopbackNetwork::new();
    harness_over(network.clone(), network)
}

fn harness_over(network: Arc<LoopbackNetwork>, transports: Arc<dyn TransportFactory>) -> Harness {
    let backend = SyntheticBackend::new();
    let collaborator = RecordingCollaborator::new();
    let config = BroadcastConfig::default();
    let hub = SignalingHub::from_config(&config);
    let peers = Arc::new(PeerConnectionFactory::new(transports, config));
    let shared: Arc<dyn SessionCollaborator> = collaborator.clone();

    Harness {
        network,
        backend: backend.clone(),
        collaborator,
        deps: BroadcastDeps {
            capture: MediaCaptureService::new(backend),
            peers: Arc::clone(&peers),
            hub: Arc::clone(&hub),
            collaborator: Arc::clone(&shared),
        },
        connector: ViewerConnector::new(peers, hub, shared),
    }
}

async fn start(harness: &Harness, options: BroadcastOptions) -> BroadcasterSession {
    BroadcasterSession::start(harness.deps.clone(), SessionId::from("movie-night"), options)
        .await
        .unwrap()
}

async fn join(harness: &Harness, session: &BroadcasterSession) -> ViewerConnection {
    harness
        .connector
        .connect(session.session_id(), session.peer_id())
        .await
        .unwrap()
}

/// The broadcaster admits a viewer once its own side is connected
async fn wait_for_viewers(session: &BroadcasterSession, expected: usize) {
    timeout(Duration::from_secs(5), async {
        while session.viewer_count().await != expected {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("registry never reached {expected} viewers"));
}

async fn wait_for_inbound(
    viewer: &ViewerConnection,
    condition: impl FnMut(&ComposedStream) -> bool,
) {
    let mut inbound = viewer.watch_inbound();
    timeout(Duration::from_secs(5), inbound.wait_for(condition))
        .await
        .expect("inbound stream never matched")
        .unwrap();
}

/// Events a stop produced: closed viewers, then the final count
fn drain_stop_events(events: &mut broadcast::Receiver<SessionEvent>) -> (usize, Option<usize>) {
    let mut left = 0;
    let mut stopped = None;
    while let Ok(event) = events.try_recv() {
        match event {
            SessionEvent::ViewerLeft { .. } => left += 1,
            SessionEvent::Stopped { viewers_closed } => stopped = Some(viewers_closed),
            _ => {}
        }
    }
    (left, stopped)
}

async fn wait_for_state(viewer: &ViewerConnection, expected: ConnectionState, within: Duration) {
    let mut state = viewer.watch_state();
    timeout(within, state.wait_for(|s| *s == expected))
        .await
        .unwrap_or_else(|_| panic!("viewer never reached {expected}"))
        .unwrap();
}

#[tokio::test]
async fn test_medium_broadcast_reaches_viewer() {
    let harness = harness();
    let session = start(&harness, BroadcastOptions::default()).await;

    let viewer = join(&harness, &session).await;
    assert_eq!(viewer.state(), ConnectionState::Connected);

    wait_for_inbound(&viewer, |s| s.track_count() == 2).await;
    let inbound = viewer.inbound();
    let video = inbound.video().unwrap();
    assert_eq!(video.settings().resolution, Some(Resolution::new(1280, 720)));
    assert_eq!(video.settings().frame_rate, Some(30));
    assert_eq!(inbound.track_count(), 2);

    wait_for_viewers(&session, 1).await;
    let stats = session.stats().await.unwrap();
    assert_eq!(stats.viewer_count, 1);
    assert_eq!(stats.quality, "medium");
    assert_eq!(stats.target_bitrate_kbps, Some(2000));
    assert_eq!((stats.video_tracks, stats.audio_tracks), (1, 1));

    let mut events = session.subscribe();
    session.stop().await;
    assert_eq!(drain_stop_events(&mut events), (1, Some(1)));
    wait_for_state(&viewer, ConnectionState::Closed, Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_stop_closes_every_viewer() {
    for viewers in [0usize, 1, 5] {
        let harness = harness();
        let session = start(&harness, BroadcastOptions::default()).await;

        let mut connected = Vec::new();
        for _ in 0..viewers {
            connected.push(join(&harness, &session).await);
        }
        wait_for_viewers(&session, viewers).await;
        assert_eq!(session.viewers().await.len(), viewers);

        let mut events = session.subscribe();
        session.stop().await;
        assert_eq!(drain_stop_events(&mut events), (viewers, Some(viewers)));
        for viewer in &connected {
            wait_for_state(viewer, ConnectionState::Closed, Duration::from_secs(5)).await;
        }
        assert!(harness.backend.issued_tracks().iter().all(|t| !t.is_live()));
    }
}

#[tokio::test]
async fn test_screen_share_end_falls_back_to_camera_in_place() {
    let harness = harness();
    let session = start(
        &harness,
        BroadcastOptions {
            screen: true,
            ..BroadcastOptions::default()
        },
    )
    .await;
    let mut events = session.subscribe();

    let viewer = join(&harness, &session).await;
    wait_for_inbound(&viewer, |s| {
        s.video().is_some_and(|v| v.source() == SourceKind::Screen)
    })
    .await;
    let connection = viewer.connection().id();

    assert_eq!(harness.backend.end_screen_share(), 2);

    wait_for_inbound(&viewer, |s| {
        s.video().is_some_and(|v| v.source() == SourceKind::Camera)
    })
    .await;

    // Same connection, never torn down
    assert_eq!(viewer.connection().id(), connection);
    assert_eq!(viewer.state(), ConnectionState::Connected);
    assert_eq!(
        session.composed_stream().audio().unwrap().source(),
        SourceKind::Camera
    );

    let ended = timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(SessionEvent::ScreenShareEnded) = events.recv().await {
                return;
            }
        }
    })
    .await;
    assert!(ended.is_ok());

    session.stop().await;
}

#[tokio::test]
async fn test_camera_toggle_reaches_viewer() {
    let harness = harness();
    let session = start(&harness, BroadcastOptions::default()).await;
    let viewer = join(&harness, &session).await;
    wait_for_inbound(&viewer, |s| s.track_count() == 2).await;

    session.set_camera_enabled(false).await.unwrap();
    wait_for_inbound(&viewer, |s| s.video().is_none()).await;
    assert!(viewer.inbound().audio().is_some());

    session.start_screen_share().await.unwrap();
    wait_for_inbound(&viewer, |s| {
        s.video().is_some_and(|v| v.source() == SourceKind::Screen)
    })
    .await;

    session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_viewer_is_isolated() {
    let harness = harness();
    let session = start(&harness, BroadcastOptions::default()).await;

    let healthy = join(&harness, &session).await;
    let doomed = join(&harness, &session).await;
    wait_for_viewers(&session, 2).await;

    harness.network.stall(doomed.peer_id());
    // Two missed probes, then five reconnect attempts with backoff
    sleep(Duration::from_secs(60)).await;

    // Failed on its own, or closed by the broadcaster giving up first
    assert!(doomed.state().is_terminal());
    assert!(doomed.connection().last_error().is_some());
    assert_eq!(healthy.state(), ConnectionState::Connected);
    assert_eq!(session.viewer_count().await, 1);

    let remaining = session.viewers().await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(&remaining[0].viewer, healthy.peer_id());

    session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_hanging_viewer_does_not_stall_the_session() {
    let network = LoopbackNetwork::new();
    let transports = Arc::new(HangingSwaps {
        network: network.clone(),
        hang: AtomicBool::new(false),
    });
    let harness = harness_over(network, transports.clone());
    let session = start(&harness, BroadcastOptions::default()).await;

    let healthy = join(&harness, &session).await;
    wait_for_inbound(&healthy, |s| s.track_count() == 2).await;
    wait_for_viewers(&session, 1).await;

    // Every transport created from here on hangs on track swaps
    transports.hang.store(true, Ordering::SeqCst);
    let stuck_join = tokio::spawn({
        let connector = harness.connector.clone();
        let session_id = session.session_id().clone();
        let broadcaster = session.peer_id().clone();
        async move { connector.connect(&session_id, &broadcaster).await }
    });
    sleep(Duration::from_millis(100)).await;

    let count = timeout(Duration::from_secs(1), session.viewer_count()).await;
    assert_eq!(count, Ok(1));

    let toggled = timeout(Duration::from_secs(1), session.set_camera_enabled(false)).await;
    assert!(matches!(toggled, Ok(Ok(()))));
    wait_for_inbound(&healthy, |s| s.video().is_none()).await;

    // The hanging viewer never gets a stream and is dropped on both sides
    let stuck = stuck_join.await.unwrap();
    assert!(stuck.is_err());
    timeout(Duration::from_secs(30), async {
        while harness.network.endpoint_count() != 2 {
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("hanging viewer's connection was never dropped");
    assert_eq!(healthy.state(), ConnectionState::Connected);
    assert_eq!(session.viewer_count().await, 1);

    assert!(timeout(Duration::from_secs(1), session.stop()).await.is_ok());
    wait_for_state(&healthy, ConnectionState::Closed, Duration::from_secs(5)).await;
}

#[tokio::test(start_paused = true)]
async fn test_severed_viewer_recovers_when_healed() {
    let harness = harness();
    let session = start(&harness, BroadcastOptions::default()).await;
    let viewer = join(&harness, &session).await;
    wait_for_viewers(&session, 1).await;

    harness.network.sever(viewer.peer_id());
    wait_for_state(&viewer, ConnectionState::Reconnecting, Duration::from_secs(1)).await;

    sleep(Duration::from_secs(2)).await;
    harness.network.heal(viewer.peer_id());
    wait_for_state(&viewer, ConnectionState::Connected, Duration::from_secs(10)).await;

    assert!(viewer.connection().reconnect_attempts() >= 1);
    assert_eq!(session.viewer_count().await, 1);
    session.stop().await;
}

#[tokio::test]
async fn test_collaborator_sees_join_and_leave() {
    let harness = harness();
    let session = start(&harness, BroadcastOptions::default()).await;

    let viewer = join(&harness, &session).await;
    wait_for_viewers(&session, 1).await;
    wait_for_inbound(&viewer, |s| s.track_count() == 2).await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.collaborator.count(Notification::Join), 1);

    let stats = viewer.stats().await;
    assert_eq!(stats.viewer_count, Some(1));
    assert_eq!(stats.video_tracks, 1);

    viewer.disconnect().await;
    viewer.disconnect().await;
    wait_for_viewers(&session, 0).await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.collaborator.count(Notification::Leave), 1);

    session.stop().await;
}

#[tokio::test]
async fn test_failing_collaborator_does_not_affect_viewer() {
    let harness = harness();
    harness.collaborator.set_failing(true);
    let session = start(&harness, BroadcastOptions::default()).await;

    let viewer = join(&harness, &session).await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(viewer.state(), ConnectionState::Connected);

    session.stop().await;
}

#[tokio::test]
async fn test_start_from_session_record() {
    let harness = harness();
    harness.collaborator.insert_record(SessionRecord {
        session_id: SessionId::from("lecture"),
        quality: QualityTier::High,
        sources: SourceMix::Both,
    });

    let session =
        BroadcasterSession::start_from_record(harness.deps.clone(), SessionId::from("lecture"))
            .await
            .unwrap();
    let stream = session.composed_stream();
    let video = stream.video().unwrap();
    assert_eq!(video.source(), SourceKind::Screen);
    assert_eq!(video.settings().resolution, Some(Resolution::new(1920, 1080)));

    let stats = session.stats().await.unwrap();
    assert_eq!(stats.quality, "high");
    session.stop().await;
}

#[tokio::test]
async fn test_viewer_cannot_join_stopped_broadcast() {
    let harness = harness();
    let session = start(&harness, BroadcastOptions::default()).await;
    session.stop().await;

    let err = harness
        .connector
        .connect(session.session_id(), session.peer_id())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::ConnectionRefused { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_network_times_out() {
    let harness = harness();
    let session = start(&harness, BroadcastOptions::default()).await;
    harness.network.set_unreachable(true);

    let err = harness
        .connector
        .connect(session.session_id(), session.peer_id())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::ConnectionTimeout { .. }));

    // The broadcaster drops its half-open side too
    timeout(Duration::from_secs(30), async {
        while harness.network.endpoint_count() != 0 {
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("broadcaster kept a half-open connection");
    assert_eq!(session.viewer_count().await, 0);
    session.stop().await;
}
