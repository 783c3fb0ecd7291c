//! Viewer side of a broadcast
//!
//! [`ViewerConnector::connect`] joins a broadcaster by identity, negotiates
//! a receive connection and waits until media is actually flowing. The
//! returned [`ViewerConnection`] exposes the inbound stream as it changes
//! and keeps the collaborator informed while attached.

use crate::collaborator::{self, Notification, SessionCollaborator};
use crate::composer::ComposedStream;
use crate::error::{Error, Result};
use crate::logging::viewer_span;
use crate::monitor::{
    ConnectionEventKind, ConnectionEvents, ConnectionMonitor, ConnectionState, MonitorSettings,
};
use crate::peer::{PeerConnection, PeerConnectionFactory};
use crate::signaling::{SignalMailbox, SignalMessage, SignalingHub};
use crate::stats::{SessionClock, ViewerStats};
use crate::transport::SessionDescription;
use crate::types::{PeerId, SessionId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

/// Opens receive connections to broadcasters
#[derive(Clone)]
pub struct ViewerConnector {
    peers: Arc<PeerConnectionFactory>,
    hub: Arc<SignalingHub>,
    collaborator: Arc<dyn SessionCollaborator>,
}

impl ViewerConnector {
    pub fn new(
        peers: Arc<PeerConnectionFactory>,
        hub: Arc<SignalingHub>,
        collaborator: Arc<dyn SessionCollaborator>,
    ) -> Self {
        Self {
            peers,
            hub,
            collaborator,
        }
    }

    /// Connect to `broadcaster` and wait for the first media.
    ///
    /// Fails with [`Error::ConnectionRefused`] if the broadcaster is not
    /// live or declines, and with [`Error::ConnectionTimeout`] if no media
    /// arrives within the configured connection timeout.
    pub async fn connect(
        &self,
        session_id: &SessionId,
        broadcaster: &PeerId,
    ) -> Result<ViewerConnection> {
        if !self.hub.is_registered(broadcaster) {
            return Err(Error::ConnectionRefused {
                peer: broadcaster.clone(),
                reason: "broadcaster is not live".to_string(),
            });
        }

        let local = PeerId::generate();
        let mailbox = self.hub.register(&local)?;
        let connection = match self.peers.create(&local, broadcaster).await {
            Ok(connection) => connection,
            Err(e) => {
                self.hub.unregister(&local);
                return Err(e);
            }
        };

        let cancel = CancellationToken::new();
        match self
            .establish(session_id, broadcaster, &local, mailbox, &connection, &cancel)
            .await
        {
            Ok(link) => Ok(link),
            Err(e) => {
                warn!(
                    session_id = %session_id,
                    broadcaster = %broadcaster,
                    error = %e,
                    "Viewer connection failed"
                );
                cancel.cancel();
                if let Err(close_err) = connection.close().await {
                    debug!(error = %close_err, "Close after failed connect");
                }
                self.hub.unregister(&local);
                Err(e)
            }
        }
    }

    async fn establish(
        &self,
        session_id: &SessionId,
        broadcaster: &PeerId,
        local: &PeerId,
        mailbox: SignalMailbox,
        connection: &Arc<PeerConnection>,
        cancel: &CancellationToken,
    ) -> Result<ViewerConnection> {
        let config = self.peers.config();
        let events = connection.take_events().ok_or(Error::SessionClosed)?;
        connection.begin_connecting()?;
        let monitor = ConnectionMonitor::spawn(
            Arc::clone(connection),
            MonitorSettings::from_config(config),
            cancel.child_token(),
        );

        self.hub
            .send(
                local,
                broadcaster,
                SignalMessage::Join {
                    session_id: session_id.clone(),
                },
            )
            .await?;
        let offer = connection.create_offer().await?;
        self.hub
            .send(local, broadcaster, SignalMessage::from(offer))
            .await?;

        let (stream_tx, stream_rx) = watch::channel(ComposedStream::default());
        let shared = Arc::new(Shared {
            session_id: session_id.clone(),
            collaborator: Arc::clone(&self.collaborator),
            attached: AtomicBool::new(false),
            left: AtomicBool::new(false),
            heartbeat: cancel.child_token(),
        });
        let relay = Relay {
            local: local.clone(),
            broadcaster: broadcaster.clone(),
            session_id: session_id.clone(),
            hub: Arc::clone(&self.hub),
            connection: Arc::clone(connection),
            stream: stream_tx,
            shared: Arc::clone(&shared),
            heartbeat_interval: config.monitor.heartbeat_interval(),
        };
        let span = viewer_span(session_id, local, broadcaster);
        let task = tokio::spawn(
            relay
                .run(mailbox, events, monitor, cancel.clone())
                .instrument(span),
        );

        let timeout = config.negotiation.connection_timeout();
        wait_until_flowing(connection, stream_rx.clone(), broadcaster, timeout).await?;

        info!(
            session_id = %session_id,
            broadcaster = %broadcaster,
            connection_id = %connection.id(),
            tracks = stream_rx.borrow().track_count(),
            "Viewer connected"
        );

        shared.attached.store(true, Ordering::Release);
        collaborator::notify(
            Arc::clone(&self.collaborator),
            session_id.clone(),
            Notification::Join,
        );
        collaborator::spawn_heartbeat(
            Arc::clone(&self.collaborator),
            session_id.clone(),
            config.monitor.heartbeat_interval(),
            shared.heartbeat.clone(),
        );

        Ok(ViewerConnection {
            session_id: session_id.clone(),
            local: local.clone(),
            broadcaster: broadcaster.clone(),
            connection: Arc::clone(connection),
            stream: stream_rx,
            hub: Arc::clone(&self.hub),
            shared,
            cancel: cancel.clone(),
            clock: SessionClock::start(),
            task: tokio::sync::Mutex::new(Some(task)),
        })
    }
}

/// Resolves once the connection is up and carries at least one track
async fn wait_until_flowing(
    connection: &PeerConnection,
    mut stream: watch::Receiver<ComposedStream>,
    broadcaster: &PeerId,
    timeout: Duration,
) -> Result<()> {
    let mut state = connection.watch_state();
    let wait = async {
        loop {
            let current = *state.borrow_and_update();
            let flowing = !stream.borrow_and_update().is_empty();
            match current {
                ConnectionState::Connected if flowing => return Ok(()),
                ConnectionState::Failed | ConnectionState::Closed => {
                    return Err(connect_error(connection, broadcaster, timeout));
                }
                _ => {}
            }
            tokio::select! {
                changed = state.changed() => {
                    if changed.is_err() {
                        return Err(Error::SessionClosed);
                    }
                }
                changed = stream.changed() => {
                    if changed.is_err() {
                        return Err(Error::SessionClosed);
                    }
                }
            }
        }
    };

    match tokio::time::timeout(timeout, wait).await {
        Ok(result) => result,
        Err(_) => Err(Error::ConnectionTimeout {
            peer: broadcaster.clone(),
            after: timeout,
        }),
    }
}

fn connect_error(connection: &PeerConnection, broadcaster: &PeerId, timeout: Duration) -> Error {
    match connection.last_error() {
        Some(Error::NegotiationTimeout(_)) | None => Error::ConnectionTimeout {
            peer: broadcaster.clone(),
            after: timeout,
        },
        Some(e) => e,
    }
}

/// State shared between the handle and its relay task
struct Shared {
    session_id: SessionId,
    collaborator: Arc<dyn SessionCollaborator>,
    attached: AtomicBool,
    left: AtomicBool,
    heartbeat: CancellationToken,
}

impl Shared {
    /// Tell the collaborator this viewer is gone; at most once
    fn leave(&self) {
        self.heartbeat.cancel();
        if self.attached.load(Ordering::Acquire) && !self.left.swap(true, Ordering::AcqRel) {
            collaborator::notify(
                Arc::clone(&self.collaborator),
                self.session_id.clone(),
                Notification::Leave,
            );
        }
    }
}

/// Applies signals from the broadcaster and relays local events to it
struct Relay {
    local: PeerId,
    broadcaster: PeerId,
    session_id: SessionId,
    hub: Arc<SignalingHub>,
    connection: Arc<PeerConnection>,
    stream: watch::Sender<ComposedStream>,
    shared: Arc<Shared>,
    heartbeat_interval: Duration,
}

impl Relay {
    async fn run(
        self,
        mut mailbox: SignalMailbox,
        mut events: ConnectionEvents,
        monitor: ConnectionMonitor,
        cancel: CancellationToken,
    ) {
        let mut heartbeats = interval_at(
            Instant::now() + self.heartbeat_interval,
            self.heartbeat_interval,
        );
        heartbeats.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                envelope = mailbox.recv() => match envelope {
                    Some(envelope) if envelope.from == self.broadcaster => {
                        self.on_signal(envelope.message).await;
                    }
                    Some(envelope) => {
                        debug!(from = %envelope.from, "Ignoring signal from unexpected peer");
                    }
                    None => break,
                },
                event = events.recv() => match event.map(|e| e.kind) {
                    Some(ConnectionEventKind::LocalCandidate(candidate)) => {
                        if let Err(e) = self
                            .hub
                            .send(&self.local, &self.broadcaster, SignalMessage::Candidate { candidate })
                            .await
                        {
                            debug!(error = %e, "Could not relay candidate");
                        }
                    }
                    Some(ConnectionEventKind::RemoteTrack(track)) => {
                        debug!(kind = %track.kind(), track = %track.id(), "Inbound track");
                        self.stream.send_modify(|s| s.set_track(track.kind(), Some(track)));
                    }
                    Some(ConnectionEventKind::RemoteTrackRemoved(kind)) => {
                        self.stream.send_modify(|s| s.set_track(kind, None));
                    }
                    Some(ConnectionEventKind::StateChanged { to, .. }) => match to {
                        ConnectionState::Closed => break,
                        // Still inspectable, but no longer watching
                        ConnectionState::Failed => self.shared.leave(),
                        _ => {}
                    },
                    None => break,
                },
                _ = heartbeats.tick() => {
                    let heartbeat = SignalMessage::Heartbeat {
                        session_id: self.session_id.clone(),
                    };
                    if let Err(e) = self.hub.try_send(&self.local, &self.broadcaster, heartbeat) {
                        debug!(error = %e, "Heartbeat not delivered");
                    }
                }
            }
        }

        monitor.cancel();
        self.stream.send_modify(|s| *s = ComposedStream::default());
        self.shared.leave();
        cancel.cancel();
    }

    async fn on_signal(&self, message: SignalMessage) {
        match message {
            SignalMessage::Answer { sdp } => {
                let answer = SessionDescription::answer(sdp);
                if let Err(e) = self.connection.set_remote_description(answer).await {
                    warn!(broadcaster = %self.broadcaster, error = %e, "Answer rejected");
                    self.connection
                        .fail(Error::NegotiationFailed(e.to_string()));
                }
            }
            SignalMessage::Candidate { candidate } => {
                if let Err(e) = self.connection.add_candidate(candidate).await {
                    warn!(broadcaster = %self.broadcaster, error = %e, "Broadcaster candidate rejected");
                }
            }
            SignalMessage::Reject { reason } => {
                info!(broadcaster = %self.broadcaster, reason = %reason, "Broadcaster declined");
                self.connection.fail(Error::ConnectionRefused {
                    peer: self.broadcaster.clone(),
                    reason,
                });
            }
            SignalMessage::Bye => {
                info!(broadcaster = %self.broadcaster, "Broadcast ended");
                if let Err(e) = self.connection.close().await {
                    debug!(error = %e, "Close on bye failed");
                }
            }
            other => debug!(message = other.name(), "Unexpected signal"),
        }
    }
}

/// An attached viewer
pub struct ViewerConnection {
    session_id: SessionId,
    local: PeerId,
    broadcaster: PeerId,
    connection: Arc<PeerConnection>,
    stream: watch::Receiver<ComposedStream>,
    hub: Arc<SignalingHub>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    clock: SessionClock,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ViewerConnection {
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        &self.local
    }

    #[must_use]
    pub fn broadcaster(&self) -> &PeerId {
        &self.broadcaster
    }

    #[must_use]
    pub fn connection(&self) -> &Arc<PeerConnection> {
        &self.connection
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch_state()
    }

    /// What is being received right now
    #[must_use]
    pub fn inbound(&self) -> ComposedStream {
        self.stream.borrow().clone()
    }

    pub fn watch_inbound(&self) -> watch::Receiver<ComposedStream> {
        self.stream.clone()
    }

    pub async fn stats(&self) -> ViewerStats {
        let viewer_count = match self.shared.collaborator.viewer_count(&self.session_id).await {
            Ok(count) => count,
            Err(e) => {
                debug!(session_id = %self.session_id, error = %e, "Viewer count unavailable");
                None
            }
        };
        let inbound = self.inbound();
        ViewerStats {
            session_id: self.session_id.clone(),
            broadcaster: self.broadcaster.clone(),
            state: self.state(),
            started_at: self.clock.started_at(),
            duration_secs: self.clock.elapsed().as_secs(),
            viewer_count,
            video_tracks: usize::from(inbound.video().is_some()),
            audio_tracks: usize::from(inbound.audio().is_some()),
            reconnect_attempts: self.connection.reconnect_attempts(),
        }
    }

    /// Leave the broadcast. Idempotent.
    pub async fn disconnect(&self) {
        let Some(task) = self.task.lock().await.take() else {
            return;
        };

        let leave = SignalMessage::Leave {
            session_id: self.session_id.clone(),
        };
        if let Err(e) = self.hub.try_send(&self.local, &self.broadcaster, leave) {
            debug!(error = %e, "Leave not delivered");
        }
        self.cancel.cancel();
        if let Err(e) = self.connection.close().await {
            warn!(connection_id = %self.connection.id(), error = %e, "Close failed");
        }
        if let Err(e) = task.await {
            warn!(error = %e, "Viewer relay task panicked");
        }
        self.hub.unregister(&self.local);
        self.shared.leave();
        info!(session_id = %self.session_id, broadcaster = %self.broadcaster, "Viewer disconnected");
    }
}

impl Drop for ViewerConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborator::NoopCollaborator;
    use crate::config::BroadcastConfig;
    use crate::transport::LoopbackNetwork;

    fn connector() -> (ViewerConnector, Arc<SignalingHub>) {
        let config = BroadcastConfig::default();
        let hub = SignalingHub::from_config(&config);
        let peers = Arc::new(PeerConnectionFactory::new(LoopbackNetwork::new(), config));
        (
            ViewerConnector::new(peers, Arc::clone(&hub), Arc::new(NoopCollaborator)),
            hub,
        )
    }

    #[tokio::test]
    async fn test_unknown_broadcaster_is_refused() {
        let (connector, _hub) = connector();
        let err = connector
            .connect(&SessionId::from("s"), &PeerId::from("nobody"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::ConnectionRefused { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_broadcaster_times_out() {
        let (connector, hub) = connector();
        let broadcaster = PeerId::from("silent");
        // Registered but never answers
        let _mailbox = hub.register(&broadcaster).unwrap();

        let started = Instant::now();
        let err = connector
            .connect(&SessionId::from("s"), &broadcaster)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::ConnectionTimeout { .. }));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(10) && elapsed < Duration::from_secs(11));
    }

    #[tokio::test]
    async fn test_reject_is_refused() {
        let (connector, hub) = connector();
        let broadcaster = PeerId::from("picky");
        let mut mailbox = hub.register(&broadcaster).unwrap();

        let responder = {
            let hub = Arc::clone(&hub);
            let broadcaster = broadcaster.clone();
            tokio::spawn(async move {
                let envelope = mailbox.recv().await.unwrap();
                assert!(matches!(envelope.message, SignalMessage::Join { .. }));
                hub.send(
                    &broadcaster,
                    &envelope.from,
                    SignalMessage::Reject {
                        reason: "full".to_string(),
                    },
                )
                .await
                .unwrap();
                mailbox
            })
        };

        let err = connector
            .connect(&SessionId::from("s"), &broadcaster)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::ConnectionRefused { reason, .. } if reason == "full"));
        drop(responder.await.unwrap());
    }
}
