//! Broadcaster session
//!
//! A [`BroadcasterSession`] is a handle to one running broadcast. All state
//! (capture sources, the composer, the viewer registry) lives in a single
//! session task; the handle talks to it over a command channel, so every
//! mutation is serialized and recompositions never interleave.
//!
//! Each viewer gets its own link task that negotiates, relays candidates,
//! applies composition changes to its connection and reports back to the
//! session task. The session task never awaits a viewer's transport, so a
//! slow or failing viewer only ever blocks its own link. Every transport call
//! a link makes is bounded by the negotiation timeout; a connection that
//! misses it is failed and removed.

use crate::capture::{
    CaptureEvent, MediaCaptureService, MediaSource, MediaTrack, SourceKind, TrackKind,
};
use crate::collaborator::{SessionCollaborator, SessionRecord};
use crate::composer::{ComposedStream, StreamComposer};
use crate::error::{Error, Result};
use crate::logging::session_span;
use crate::monitor::{
    ConnectionEvent, ConnectionEventKind, ConnectionMonitor, ConnectionState, MonitorSettings,
};
use crate::peer::{PeerConnection, PeerConnectionFactory};
use crate::quality::QualityTier;
use crate::signaling::{SignalEnvelope, SignalMailbox, SignalMessage, SignalingHub};
use crate::stats::{SessionClock, SessionStats};
use crate::transport::SessionDescription;
use crate::types::{ConnectionId, PeerId, SessionId};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

const COMMAND_CHANNEL_CAPACITY: usize = 32;
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// What to capture when a broadcast starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastOptions {
    pub video: bool,
    pub audio: bool,
    pub screen: bool,
    pub quality: QualityTier,
}

impl Default for BroadcastOptions {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
            screen: false,
            quality: QualityTier::Medium,
        }
    }
}

impl BroadcastOptions {
    /// Initial toggles and tier declared by a session record
    #[must_use]
    pub fn from_record(record: &SessionRecord) -> Self {
        Self {
            video: record.sources.camera(),
            audio: record.sources.camera(),
            screen: record.sources.screen(),
            quality: record.quality,
        }
    }
}

/// Services a broadcast runs on
#[derive(Clone)]
pub struct BroadcastDeps {
    pub capture: Arc<MediaCaptureService>,
    pub peers: Arc<PeerConnectionFactory>,
    pub hub: Arc<SignalingHub>,
    pub collaborator: Arc<dyn SessionCollaborator>,
}

/// Session-level notifications
#[derive(Debug, Clone)]
pub enum SessionEvent {
    ViewerJoined {
        viewer: PeerId,
        connection: ConnectionId,
    },
    ViewerStateChanged {
        viewer: PeerId,
        connection: ConnectionId,
        from: ConnectionState,
        to: ConnectionState,
    },
    ViewerLeft {
        viewer: PeerId,
        connection: ConnectionId,
        state: ConnectionState,
        cause: Option<Error>,
    },
    Recomposed {
        generation: u64,
        stream: ComposedStream,
    },
    /// Screen sharing was ended outside the program
    ScreenShareEnded,
    Stopped {
        viewers_closed: usize,
    },
}

/// One entry of [`BroadcasterSession::viewers`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewerInfo {
    pub viewer: PeerId,
    pub connection: ConnectionId,
    pub state: ConnectionState,
    pub connected_secs: u64,
    pub last_heartbeat_secs_ago: Option<u64>,
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    SetCameraEnabled(bool, Reply<Result<()>>),
    SetMicrophoneEnabled(bool, Reply<Result<()>>),
    StartScreenShare(Reply<Result<()>>),
    StopScreenShare(Reply<Result<()>>),
    SwitchCamera(String, Reply<Result<()>>),
    ViewerCount(Reply<usize>),
    Viewers(Reply<Vec<ViewerInfo>>),
    Stats(Reply<SessionStats>),
    Stop(Reply<()>),
}

/// Handle to a running broadcast
pub struct BroadcasterSession {
    session_id: SessionId,
    peer_id: PeerId,
    commands: mpsc::Sender<Command>,
    stream: watch::Receiver<ComposedStream>,
    events: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl BroadcasterSession {
    /// Acquire the requested sources, publish the broadcaster identity and
    /// start accepting viewers. Capture errors are returned unchanged.
    pub async fn start(
        deps: BroadcastDeps,
        session_id: SessionId,
        options: BroadcastOptions,
    ) -> Result<Self> {
        if session_id.is_empty() {
            return Err(Error::Config("session id must not be empty".to_string()));
        }
        if !options.video && !options.audio && !options.screen {
            return Err(Error::Config("a broadcast needs at least one source".to_string()));
        }

        // Subscribe before acquiring so no termination is missed
        let capture_events = deps.capture.subscribe();

        let camera = if options.video || options.audio {
            let constraints = options.quality.constraints(options.video, options.audio);
            Some(deps.capture.acquire(SourceKind::Camera, &constraints).await?)
        } else {
            None
        };

        let screen = if options.screen {
            let constraints = options.quality.constraints(true, true);
            match deps.capture.acquire(SourceKind::Screen, &constraints).await {
                Ok(source) => Some(source),
                Err(e) => {
                    if let Some(camera) = &camera {
                        deps.capture.release(camera);
                    }
                    return Err(e);
                }
            }
        } else {
            None
        };

        let peer_id = PeerId::generate();
        let mailbox = match deps.hub.register(&peer_id) {
            Ok(mailbox) => mailbox,
            Err(e) => {
                for source in camera.iter().chain(screen.iter()) {
                    deps.capture.release(source);
                }
                return Err(e);
            }
        };

        let mut composer = StreamComposer::new();
        composer.recompose(camera.as_ref(), screen.as_ref());
        let initial = composer.current().clone();

        info!(
            session_id = %session_id,
            peer_id = %peer_id,
            quality = %options.quality,
            video = ?initial.video().and_then(|t| t.settings().resolution),
            tracks = initial.track_count(),
            "Broadcast started"
        );

        let (outgoing, _) = watch::channel(Outgoing {
            generation: composer.generation(),
            stream: initial.clone(),
        });
        let (stream_tx, stream_rx) = watch::channel(initial);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let settings = MonitorSettings::from_config(deps.peers.config());
        let actor = SessionActor {
            session_id: session_id.clone(),
            peer_id: peer_id.clone(),
            quality: options.quality,
            want_video: options.video,
            want_audio: options.audio,
            settings,
            deps,
            camera,
            screen,
            replaced: Vec::new(),
            retired: Vec::new(),
            composer,
            registry: ViewerRegistry::default(),
            pending: HashMap::new(),
            stream: stream_tx,
            outgoing,
            events: events.clone(),
            updates: updates_tx,
            links: cancel.child_token(),
            clock: SessionClock::start(),
        };

        let span = session_span(&session_id, &peer_id);
        let task = tokio::spawn(
            actor
                .run(commands_rx, mailbox, updates_rx, capture_events, cancel.clone())
                .instrument(span),
        );

        Ok(Self {
            session_id,
            peer_id,
            commands: commands_tx,
            stream: stream_rx,
            events,
            cancel,
            task: tokio::sync::Mutex::new(Some(task)),
        })
    }

    /// Start with the toggles and tier declared by the collaborator's
    /// session record, falling back to defaults if it cannot be read
    pub async fn start_from_record(deps: BroadcastDeps, session_id: SessionId) -> Result<Self> {
        let options = match deps.collaborator.session_record(&session_id).await {
            Ok(record) => BroadcastOptions::from_record(&record),
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Session record unavailable, using defaults");
                BroadcastOptions {
                    quality: deps.peers.config().capture.default_quality,
                    ..BroadcastOptions::default()
                }
            }
        };
        Self::start(deps, session_id, options).await
    }

    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Rendezvous identity viewers connect to; stable for the session
    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Current outgoing stream
    #[must_use]
    pub fn composed_stream(&self) -> ComposedStream {
        self.stream.borrow().clone()
    }

    pub fn watch_stream(&self) -> watch::Receiver<ComposedStream> {
        self.stream.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn set_camera_enabled(&self, enabled: bool) -> Result<()> {
        self.request(|reply| Command::SetCameraEnabled(enabled, reply))
            .await?
    }

    pub async fn set_microphone_enabled(&self, enabled: bool) -> Result<()> {
        self.request(|reply| Command::SetMicrophoneEnabled(enabled, reply))
            .await?
    }

    pub async fn start_screen_share(&self) -> Result<()> {
        self.request(Command::StartScreenShare).await?
    }

    pub async fn stop_screen_share(&self) -> Result<()> {
        self.request(Command::StopScreenShare).await?
    }

    /// Move the camera to another device without interrupting viewers
    pub async fn switch_camera(&self, device_id: impl Into<String>) -> Result<()> {
        let device_id = device_id.into();
        self.request(|reply| Command::SwitchCamera(device_id, reply))
            .await?
    }

    /// Live size of the viewer registry; 0 once stopped
    pub async fn viewer_count(&self) -> usize {
        self.request(Command::ViewerCount).await.unwrap_or(0)
    }

    pub async fn viewers(&self) -> Vec<ViewerInfo> {
        self.request(Command::Viewers).await.unwrap_or_default()
    }

    pub async fn stats(&self) -> Result<SessionStats> {
        self.request(Command::Stats).await
    }

    /// Stop the broadcast: close every viewer, release capture, release the
    /// identity. Idempotent.
    pub async fn stop(&self) {
        let _ = self.request(Command::Stop).await;
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(session_id = %self.session_id, error = %e, "Session task panicked");
            }
        }
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| Error::SessionClosed)?;
        response.await.map_err(|_| Error::SessionClosed)
    }
}

impl Drop for BroadcasterSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// A viewer's link as tracked by the session task
struct ViewerSlot {
    viewer: PeerId,
    inbox: mpsc::UnboundedSender<SignalMessage>,
    cancel: CancellationToken,
    connection: Option<Arc<PeerConnection>>,
    admitted_at: Option<Instant>,
    last_heartbeat: Option<Instant>,
    /// Latest composition the link has applied to its connection
    synced: u64,
}

impl ViewerSlot {
    fn info(&self) -> Option<ViewerInfo> {
        let connection = self.connection.as_ref()?;
        Some(ViewerInfo {
            viewer: self.viewer.clone(),
            connection: connection.id(),
            state: connection.state(),
            connected_secs: self.admitted_at.map_or(0, |at| at.elapsed().as_secs()),
            last_heartbeat_secs_ago: self.last_heartbeat.map(|at| at.elapsed().as_secs()),
        })
    }
}

/// Connected viewers, indexed by connection
#[derive(Default)]
pub(crate) struct ViewerRegistry {
    entries: HashMap<ConnectionId, ViewerSlot>,
    by_peer: HashMap<PeerId, ConnectionId>,
}

impl ViewerRegistry {
    fn insert(&mut self, id: ConnectionId, slot: ViewerSlot) {
        if let Some(previous) = self.by_peer.insert(slot.viewer.clone(), id) {
            self.entries.remove(&previous);
        }
        self.entries.insert(id, slot);
    }

    fn remove(&mut self, id: ConnectionId) -> Option<ViewerSlot> {
        let slot = self.entries.remove(&id)?;
        if self.by_peer.get(&slot.viewer) == Some(&id) {
            self.by_peer.remove(&slot.viewer);
        }
        Some(slot)
    }

    fn by_peer_mut(&mut self, peer: &PeerId) -> Option<&mut ViewerSlot> {
        let id = self.by_peer.get(peer)?;
        self.entries.get_mut(id)
    }

    fn contains_peer(&self, peer: &PeerId) -> bool {
        self.by_peer.contains_key(peer)
    }

    fn values(&self) -> impl Iterator<Item = &ViewerSlot> {
        self.entries.values()
    }

    fn drain(&mut self) -> Vec<ViewerSlot> {
        self.by_peer.clear();
        self.entries.drain().map(|(_, slot)| slot).collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Composition handed to viewer links
#[derive(Clone)]
struct Outgoing {
    generation: u64,
    stream: ComposedStream,
}

/// Reports from link tasks to the session task
enum LinkUpdate {
    Created {
        viewer: PeerId,
        connection: Arc<PeerConnection>,
    },
    /// The link's connection carries composition `generation`
    Synced {
        viewer: PeerId,
        generation: u64,
    },
    State {
        viewer: PeerId,
        connection: ConnectionId,
        from: ConnectionState,
        to: ConnectionState,
        cause: Option<Error>,
    },
    Ended {
        viewer: PeerId,
        connection: Option<ConnectionId>,
    },
}

struct SessionActor {
    session_id: SessionId,
    peer_id: PeerId,
    quality: QualityTier,
    want_video: bool,
    want_audio: bool,
    settings: MonitorSettings,
    deps: BroadcastDeps,
    camera: Option<MediaSource>,
    screen: Option<MediaSource>,
    /// Sources replaced since the last recomposition
    replaced: Vec<MediaSource>,
    /// Replaced sources, each held until every connection carries the
    /// composition that dropped it
    retired: Vec<(u64, MediaSource)>,
    composer: StreamComposer,
    registry: ViewerRegistry,
    /// Viewers still negotiating
    pending: HashMap<PeerId, ViewerSlot>,
    stream: watch::Sender<ComposedStream>,
    outgoing: watch::Sender<Outgoing>,
    events: broadcast::Sender<SessionEvent>,
    updates: mpsc::UnboundedSender<LinkUpdate>,
    links: CancellationToken,
    clock: SessionClock,
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut mailbox: SignalMailbox,
        mut updates: mpsc::UnboundedReceiver<LinkUpdate>,
        mut capture_events: broadcast::Receiver<CaptureEvent>,
        cancel: CancellationToken,
    ) {
        let mut stop_reply = None;
        let mut capture_open = true;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(Command::Stop(reply)) => {
                        stop_reply = Some(reply);
                        break;
                    }
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
                Some(update) = updates.recv() => self.on_link_update(update),
                event = capture_events.recv(), if capture_open => match event {
                    Ok(event) => self.on_capture_event(event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(session_id = %self.session_id, missed, "Capture events lagged, recomposing");
                        self.recompose();
                    }
                    Err(broadcast::error::RecvError::Closed) => capture_open = false,
                },
                Some(envelope) = mailbox.recv() => self.on_signal(envelope),
            }
        }

        self.shutdown().await;
        if let Some(reply) = stop_reply {
            let _ = reply.send(());
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::SetCameraEnabled(enabled, reply) => {
                let _ = reply.send(self.set_camera_enabled(enabled).await);
            }
            Command::SetMicrophoneEnabled(enabled, reply) => {
                let _ = reply.send(self.set_microphone_enabled(enabled).await);
            }
            Command::StartScreenShare(reply) => {
                let _ = reply.send(self.start_screen_share().await);
            }
            Command::StopScreenShare(reply) => {
                if let Some(screen) = self.screen.take() {
                    self.replaced.push(screen);
                    self.recompose();
                }
                let _ = reply.send(Ok(()));
            }
            Command::SwitchCamera(device_id, reply) => {
                let _ = reply.send(self.switch_camera(&device_id).await);
            }
            Command::ViewerCount(reply) => {
                let _ = reply.send(self.registry.len());
            }
            Command::Viewers(reply) => {
                let _ = reply.send(self.registry.values().filter_map(ViewerSlot::info).collect());
            }
            Command::Stats(reply) => {
                let _ = reply.send(SessionStats::collect(
                    &self.session_id,
                    &self.peer_id,
                    &self.clock,
                    self.quality,
                    self.composer.current(),
                    self.registry.len(),
                ));
            }
            Command::Stop(reply) => {
                let _ = reply.send(());
            }
        }
    }

    async fn set_camera_enabled(&mut self, enabled: bool) -> Result<()> {
        self.want_video = enabled;
        let has_live_video = self.camera.as_ref().and_then(MediaSource::live_video).is_some();
        if enabled && !has_live_video {
            self.reacquire_camera(None).await?;
        } else if let Some(camera) = &self.camera {
            camera.video_tracks().for_each(|t| t.set_enabled(enabled));
        }
        debug!(session_id = %self.session_id, enabled, "Camera toggled");
        self.recompose();
        Ok(())
    }

    async fn set_microphone_enabled(&mut self, enabled: bool) -> Result<()> {
        self.want_audio = enabled;
        let has_live_audio = self.camera.as_ref().and_then(MediaSource::live_audio).is_some();
        if enabled && !has_live_audio {
            self.reacquire_camera(None).await?;
        } else if let Some(camera) = &self.camera {
            camera.audio_tracks().for_each(|t| t.set_enabled(enabled));
        }
        debug!(session_id = %self.session_id, enabled, "Microphone toggled");
        self.recompose();
        Ok(())
    }

    async fn switch_camera(&mut self, device_id: &str) -> Result<()> {
        self.reacquire_camera(Some(device_id)).await?;
        info!(session_id = %self.session_id, device = device_id, "Switched camera");
        self.recompose();
        Ok(())
    }

    /// Open a fresh camera source; the old one is released after the swap
    async fn reacquire_camera(&mut self, device_id: Option<&str>) -> Result<()> {
        let constraints = self.quality.constraints(self.want_video, self.want_audio);
        let source = match device_id {
            Some(device) => {
                self.deps
                    .capture
                    .switch_device(SourceKind::Camera, device, &constraints)
                    .await?
            }
            None => self.deps.capture.acquire(SourceKind::Camera, &constraints).await?,
        };
        if let Some(old) = self.camera.replace(source) {
            self.replaced.push(old);
        }
        Ok(())
    }

    async fn start_screen_share(&mut self) -> Result<()> {
        if self.screen.as_ref().is_some_and(MediaSource::is_live) {
            return Ok(());
        }
        let constraints = self.quality.constraints(true, true);
        let screen = self
            .deps
            .capture
            .acquire(SourceKind::Screen, &constraints)
            .await?;
        if let Some(old) = self.screen.replace(screen) {
            self.replaced.push(old);
        }
        self.recompose();
        Ok(())
    }

    fn on_capture_event(&mut self, event: CaptureEvent) {
        match event {
            CaptureEvent::TrackEnded { source, kind, track } => {
                let ours = self.camera.iter().chain(self.screen.iter()).any(|s| s.contains(&track));
                if !ours {
                    return;
                }
                info!(
                    session_id = %self.session_id,
                    source = %source,
                    kind = %kind,
                    "Track ended externally"
                );
                if source == SourceKind::Screen && !self.screen.as_ref().is_some_and(MediaSource::is_live) {
                    if let Some(screen) = self.screen.take() {
                        self.replaced.push(screen);
                    }
                    let _ = self.events.send(SessionEvent::ScreenShareEnded);
                }
                self.recompose();
            }
            CaptureEvent::DevicesChanged(devices) => {
                debug!(session_id = %self.session_id, devices = devices.len(), "Devices changed");
            }
        }
    }

    /// Recompute the outgoing stream and hand it to every link. Replaced
    /// sources stay alive until each connection has swapped away from them.
    fn recompose(&mut self) {
        if let Some(recomposition) = self
            .composer
            .recompose(self.camera.as_ref(), self.screen.as_ref())
        {
            let stream = self.composer.current().clone();
            debug!(
                session_id = %self.session_id,
                generation = recomposition.generation,
                swaps = recomposition.swaps.len(),
                "Publishing composition"
            );
            self.outgoing.send_replace(Outgoing {
                generation: recomposition.generation,
                stream: stream.clone(),
            });
            self.stream.send_replace(stream.clone());
            let _ = self.events.send(SessionEvent::Recomposed {
                generation: recomposition.generation,
                stream,
            });
        }

        let generation = self.composer.generation();
        self.retired
            .extend(self.replaced.drain(..).map(|source| (generation, source)));
        self.release_settled();
    }

    /// Release retired sources no connection can still be carrying
    fn release_settled(&mut self) {
        let oldest = self
            .registry
            .values()
            .chain(self.pending.values())
            .filter(|slot| slot.connection.is_some())
            .map(|slot| slot.synced)
            .min();
        let (settled, waiting): (Vec<_>, Vec<_>) = self
            .retired
            .drain(..)
            .partition(|(generation, _)| oldest.is_none_or(|synced| synced >= *generation));
        self.retired = waiting;
        for (_, source) in settled {
            self.deps.capture.release(&source);
        }
    }

    fn on_signal(&mut self, envelope: SignalEnvelope) {
        let SignalEnvelope { from, message, .. } = envelope;
        match message {
            SignalMessage::Join { session_id } => self.on_join(from, &session_id),
            SignalMessage::Heartbeat { .. } => {
                if let Some(slot) = self.slot_mut(&from) {
                    slot.last_heartbeat = Some(Instant::now());
                }
            }
            message @ (SignalMessage::Offer { .. }
            | SignalMessage::Candidate { .. }
            | SignalMessage::Leave { .. }) => {
                let name = message.name();
                let delivered = self
                    .slot_mut(&from)
                    .is_some_and(|slot| slot.inbox.send(message).is_ok());
                if !delivered {
                    debug!(viewer = %from, message = name, "Signal from unknown viewer");
                    self.reject(&from, "join the session first");
                }
            }
            other => debug!(viewer = %from, message = other.name(), "Ignoring signal"),
        }
    }

    fn on_join(&mut self, viewer: PeerId, session_id: &SessionId) {
        if session_id != &self.session_id {
            self.reject(&viewer, "unknown session");
            return;
        }
        if self.pending.contains_key(&viewer) || self.registry.contains_peer(&viewer) {
            self.reject(&viewer, "already connected");
            return;
        }

        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let cancel = self.links.child_token();
        let link = ViewerLink {
            local: self.peer_id.clone(),
            viewer: viewer.clone(),
            peers: Arc::clone(&self.deps.peers),
            hub: Arc::clone(&self.deps.hub),
            settings: self.settings.clone(),
            updates: self.updates.clone(),
        };
        tokio::spawn(
            link.run(inbox_rx, self.outgoing.subscribe(), cancel.clone())
                .in_current_span(),
        );

        info!(session_id = %self.session_id, viewer = %viewer, "Viewer requested connection");
        self.pending.insert(
            viewer.clone(),
            ViewerSlot {
                viewer,
                inbox,
                cancel,
                connection: None,
                admitted_at: None,
                last_heartbeat: None,
                synced: 0,
            },
        );
    }

    fn slot_mut(&mut self, viewer: &PeerId) -> Option<&mut ViewerSlot> {
        if self.pending.contains_key(viewer) {
            return self.pending.get_mut(viewer);
        }
        self.registry.by_peer_mut(viewer)
    }

    fn reject(&self, viewer: &PeerId, reason: &str) {
        let message = SignalMessage::Reject {
            reason: reason.to_string(),
        };
        if let Err(e) = self.deps.hub.try_send(&self.peer_id, viewer, message) {
            debug!(viewer = %viewer, error = %e, "Could not deliver rejection");
        }
    }

    fn on_link_update(&mut self, update: LinkUpdate) {
        match update {
            LinkUpdate::Created { viewer, connection } => match self.pending.get_mut(&viewer) {
                Some(slot) => slot.connection = Some(connection),
                // Only after shutdown began; the cancelled link closes it
                None => debug!(
                    viewer = %viewer,
                    connection_id = %connection.id(),
                    "Connection created for a departed viewer"
                ),
            },
            LinkUpdate::Synced { viewer, generation } => {
                if let Some(slot) = self.slot_mut(&viewer) {
                    slot.synced = slot.synced.max(generation);
                }
                self.release_settled();
            }
            LinkUpdate::State {
                viewer,
                connection,
                from,
                to,
                cause,
            } => self.on_viewer_state(viewer, connection, from, to, cause),
            LinkUpdate::Ended { viewer, connection } => {
                let removed = connection
                    .and_then(|id| self.registry.remove(id))
                    .or_else(|| self.pending.remove(&viewer));
                if let Some(slot) = removed {
                    slot.cancel.cancel();
                    debug!(viewer = %viewer, viewers = self.registry.len(), "Viewer link ended");
                    self.release_settled();
                }
            }
        }
    }

    fn on_viewer_state(
        &mut self,
        viewer: PeerId,
        connection: ConnectionId,
        from: ConnectionState,
        to: ConnectionState,
        cause: Option<Error>,
    ) {
        match to {
            ConnectionState::Connected if self.pending.contains_key(&viewer) => {
                if let Some(mut slot) = self.pending.remove(&viewer) {
                    slot.admitted_at = Some(Instant::now());
                    self.registry.insert(connection, slot);
                    info!(
                        session_id = %self.session_id,
                        viewer = %viewer,
                        connection_id = %connection,
                        viewers = self.registry.len(),
                        "Viewer connected"
                    );
                    let _ = self.events.send(SessionEvent::ViewerJoined { viewer, connection });
                }
            }
            ConnectionState::Failed | ConnectionState::Closed => {
                let removed = self
                    .registry
                    .remove(connection)
                    .or_else(|| self.pending.remove(&viewer));
                if let Some(slot) = removed {
                    slot.cancel.cancel();
                    info!(
                        session_id = %self.session_id,
                        viewer = %viewer,
                        connection_id = %connection,
                        state = %to,
                        viewers = self.registry.len(),
                        "Viewer removed"
                    );
                    let _ = self.events.send(SessionEvent::ViewerLeft {
                        viewer,
                        connection,
                        state: to,
                        cause,
                    });
                    self.release_settled();
                }
            }
            _ => {
                let _ = self.events.send(SessionEvent::ViewerStateChanged {
                    viewer,
                    connection,
                    from,
                    to,
                });
            }
        }
    }

    async fn shutdown(&mut self) {
        self.links.cancel();

        let mut slots = self.registry.drain();
        slots.extend(self.pending.drain().map(|(_, slot)| slot));

        for slot in &slots {
            if let Err(e) = self.deps.hub.try_send(&self.peer_id, &slot.viewer, SignalMessage::Bye) {
                debug!(viewer = %slot.viewer, error = %e, "Could not deliver bye");
            }
        }

        let bound = self.settings.negotiation_timeout;
        let closing: Vec<(PeerId, Arc<PeerConnection>)> = slots
            .into_iter()
            .filter_map(|slot| slot.connection.map(|c| (slot.viewer, c)))
            .collect();
        let results = join_all(
            closing
                .iter()
                .map(|(_, connection)| bounded(bound, connection.close())),
        )
        .await;
        for ((viewer, connection), result) in closing.iter().zip(results) {
            if let Err(e) = result {
                warn!(connection_id = %connection.id(), error = %e, "Teardown failed");
            }
            let _ = self.events.send(SessionEvent::ViewerLeft {
                viewer: viewer.clone(),
                connection: connection.id(),
                state: connection.state(),
                cause: None,
            });
        }

        self.replaced.extend(self.camera.take());
        self.replaced.extend(self.screen.take());
        self.replaced
            .extend(self.retired.drain(..).map(|(_, source)| source));
        for source in self.replaced.drain(..) {
            self.deps.capture.release(&source);
        }
        self.stream.send_replace(ComposedStream::default());

        self.deps.hub.unregister(&self.peer_id);

        info!(
            session_id = %self.session_id,
            peer_id = %self.peer_id,
            viewers_closed = closing.len(),
            duration_secs = self.clock.elapsed().as_secs(),
            "Broadcast stopped"
        );
        let _ = self.events.send(SessionEvent::Stopped {
            viewers_closed: closing.len(),
        });
    }
}

/// Run a transport call, failing with `Transport` if it outlives `bound`
async fn bounded<T>(bound: Duration, call: impl Future<Output = Result<T>>) -> Result<T> {
    timeout(bound, call)
        .await
        .map_err(|_| Error::Transport(format!("no response within {bound:?}")))?
}

/// Per-viewer negotiation and relay task
struct ViewerLink {
    local: PeerId,
    viewer: PeerId,
    peers: Arc<PeerConnectionFactory>,
    hub: Arc<SignalingHub>,
    settings: MonitorSettings,
    updates: mpsc::UnboundedSender<LinkUpdate>,
}

impl ViewerLink {
    async fn run(
        self,
        mut inbox: mpsc::UnboundedReceiver<SignalMessage>,
        mut outgoing: watch::Receiver<Outgoing>,
        cancel: CancellationToken,
    ) {
        let created = tokio::select! {
            () = cancel.cancelled() => None,
            created = self.peers.create(&self.local, &self.viewer) => Some(created),
        };
        let connection = match created {
            None => return self.ended(None),
            Some(Err(e)) => {
                warn!(viewer = %self.viewer, error = %e, "Failed to create viewer connection");
                let _ = self.hub.try_send(
                    &self.local,
                    &self.viewer,
                    SignalMessage::Reject { reason: e.to_string() },
                );
                return self.ended(None);
            }
            Some(Ok(connection)) => connection,
        };

        let Some(mut events) = connection.take_events() else {
            return self.ended(None);
        };
        if let Err(e) = connection.begin_connecting() {
            warn!(viewer = %self.viewer, error = %e, "Viewer connection not startable");
        }
        let monitor = ConnectionMonitor::spawn(
            Arc::clone(&connection),
            self.settings.clone(),
            cancel.child_token(),
        );

        let created = LinkUpdate::Created {
            viewer: self.viewer.clone(),
            connection: Arc::clone(&connection),
        };
        if self.updates.send(created).is_err() {
            monitor.cancel();
            self.close(&connection).await;
            return self.ended(Some(connection.id()));
        }

        // Tracks go on before the offer is answered
        let mut attached = ComposedStream::default();
        tokio::select! {
            () = cancel.cancelled() => {}
            () = self.sync(&connection, &mut attached, &mut outgoing) => {}
        }

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                message = inbox.recv() => match message {
                    Some(message) => self.on_message(&connection, message).await,
                    None => break,
                },
                event = events.recv() => match event {
                    Some(event) => {
                        if !self.on_event(&connection, event).await {
                            break;
                        }
                    }
                    None => break,
                },
                changed = outgoing.changed() => match changed {
                    Ok(()) => self.sync(&connection, &mut attached, &mut outgoing).await,
                    Err(_) => break,
                },
            }
        }

        monitor.cancel();
        self.close(&connection).await;
        self.ended(Some(connection.id()));
    }

    /// Bring the connection's senders up to the latest composition and
    /// report the generation it now carries. A swap that fails or misses the
    /// bound fails the connection.
    async fn sync(
        &self,
        connection: &PeerConnection,
        attached: &mut ComposedStream,
        outgoing: &mut watch::Receiver<Outgoing>,
    ) {
        loop {
            let Outgoing { generation, stream } = outgoing.borrow_and_update().clone();
            for kind in [TrackKind::Video, TrackKind::Audio] {
                let next = stream.track(kind);
                if next.map(MediaTrack::id) == attached.track(kind).map(MediaTrack::id) {
                    continue;
                }
                let swap = connection.replace_track(kind, next.cloned());
                match bounded(self.settings.negotiation_timeout, swap).await {
                    Ok(()) => attached.set_track(kind, next.cloned()),
                    Err(e) if connection.state().is_terminal() => {
                        debug!(viewer = %self.viewer, kind = %kind, error = %e, "Swap on a finished connection");
                        return;
                    }
                    Err(e) => {
                        warn!(viewer = %self.viewer, kind = %kind, error = %e, "Track swap failed, dropping viewer");
                        connection.fail(e);
                        return;
                    }
                }
            }

            let _ = self.updates.send(LinkUpdate::Synced {
                viewer: self.viewer.clone(),
                generation,
            });
            if !outgoing.has_changed().unwrap_or(false) {
                return;
            }
        }
    }

    async fn on_message(&self, connection: &PeerConnection, message: SignalMessage) {
        let bound = self.settings.negotiation_timeout;
        match message {
            SignalMessage::Offer { sdp } => {
                if let Err(e) = bounded(bound, self.answer(connection, sdp)).await {
                    warn!(viewer = %self.viewer, error = %e, "Negotiation with viewer failed");
                    connection.fail(Error::NegotiationFailed(e.to_string()));
                    let _ = self.hub.try_send(
                        &self.local,
                        &self.viewer,
                        SignalMessage::Reject { reason: e.to_string() },
                    );
                }
            }
            SignalMessage::Candidate { candidate } => {
                if let Err(e) = bounded(bound, connection.add_candidate(candidate)).await {
                    warn!(viewer = %self.viewer, error = %e, "Viewer candidate rejected");
                }
            }
            SignalMessage::Leave { .. } => {
                info!(viewer = %self.viewer, "Viewer left");
                self.close(connection).await;
            }
            other => debug!(viewer = %self.viewer, message = other.name(), "Unexpected signal"),
        }
    }

    async fn answer(&self, connection: &PeerConnection, sdp: String) -> Result<()> {
        connection
            .set_remote_description(SessionDescription::offer(sdp))
            .await?;
        let answer = connection.create_answer().await?;
        self.hub
            .send(&self.local, &self.viewer, SignalMessage::from(answer))
            .await
    }

    /// Returns false once the connection is closed
    async fn on_event(&self, connection: &PeerConnection, event: ConnectionEvent) -> bool {
        match event.kind {
            ConnectionEventKind::LocalCandidate(candidate) => {
                let relay = self
                    .hub
                    .send(&self.local, &self.viewer, SignalMessage::Candidate { candidate });
                if let Err(e) = bounded(self.settings.negotiation_timeout, relay).await {
                    debug!(viewer = %self.viewer, error = %e, "Could not relay candidate");
                }
                true
            }
            ConnectionEventKind::StateChanged { from, to, cause } => {
                let _ = self.updates.send(LinkUpdate::State {
                    viewer: self.viewer.clone(),
                    connection: event.connection,
                    from,
                    to,
                    cause,
                });
                if to == ConnectionState::Failed {
                    self.close(connection).await;
                }
                to != ConnectionState::Closed
            }
            ConnectionEventKind::RemoteTrack(_) | ConnectionEventKind::RemoteTrackRemoved(_) => true,
        }
    }

    async fn close(&self, connection: &PeerConnection) {
        if let Err(e) = bounded(self.settings.negotiation_timeout, connection.close()).await {
            debug!(viewer = %self.viewer, error = %e, "Viewer connection close failed");
        }
    }

    fn ended(&self, connection: Option<ConnectionId>) {
        let _ = self.updates.send(LinkUpdate::Ended {
            viewer: self.viewer.clone(),
            connection,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{SyntheticBackend, TrackKind};
    use crate::collaborator::{NoopCollaborator, SourceMix};
    use crate::config::BroadcastConfig;
    use crate::transport::LoopbackNetwork;

    fn deps(backend: Arc<SyntheticBackend>) -> BroadcastDeps {
        let network = LoopbackNetwork::new();
        let config = BroadcastConfig::default();
        BroadcastDeps {
            capture: MediaCaptureService::new(backend),
            hub: SignalingHub::from_config(&config),
            peers: Arc::new(PeerConnectionFactory::new(network, config)),
            collaborator: Arc::new(NoopCollaborator),
        }
    }

    #[test]
    fn test_options_from_record() {
        let record = SessionRecord {
            session_id: SessionId::from("s"),
            quality: QualityTier::High,
            sources: SourceMix::Screen,
        };
        let options = BroadcastOptions::from_record(&record);
        assert!(!options.video && !options.audio && options.screen);
        assert_eq!(options.quality, QualityTier::High);
    }

    #[tokio::test]
    async fn test_permission_denied_surfaces_and_releases_nothing_held() {
        let backend = SyntheticBackend::new();
        backend.deny(SourceKind::Screen);
        let deps = deps(backend.clone());

        let err = BroadcasterSession::start(
            deps.clone(),
            SessionId::from("s"),
            BroadcastOptions {
                screen: true,
                ..BroadcastOptions::default()
            },
        )
        .await
        .err()
        .unwrap();
        assert_eq!(err, Error::PermissionDenied { kind: SourceKind::Screen });
        // The camera acquired first was released again
        assert!(backend.issued_tracks().iter().all(|t| !t.is_live()));
    }

    #[tokio::test]
    async fn test_toggles_recompose() {
        let backend = SyntheticBackend::new();
        let session = BroadcasterSession::start(
            deps(backend),
            SessionId::from("s"),
            BroadcastOptions::default(),
        )
        .await
        .unwrap();

        session.set_camera_enabled(false).await.unwrap();
        let stream = session.composed_stream();
        assert!(stream.video().is_none());
        assert!(stream.audio().is_some());

        session.set_microphone_enabled(false).await.unwrap();
        assert!(session.composed_stream().is_empty());

        session.set_camera_enabled(true).await.unwrap();
        assert_eq!(
            session.composed_stream().video().unwrap().source(),
            SourceKind::Camera
        );

        session.start_screen_share().await.unwrap();
        let stream = session.composed_stream();
        assert_eq!(stream.video().unwrap().source(), SourceKind::Screen);
        assert_eq!(stream.audio().unwrap().source(), SourceKind::Screen);

        session.stop_screen_share().await.unwrap();
        assert_eq!(
            session.composed_stream().video().unwrap().kind(),
            TrackKind::Video
        );
        assert_eq!(
            session.composed_stream().video().unwrap().source(),
            SourceKind::Camera
        );

        session.stop().await;
    }

    #[tokio::test]
    async fn test_switch_camera_releases_old_device_after_swap() {
        let backend = SyntheticBackend::new();
        backend.plug(crate::DeviceInfo::new(
            "usb-cam",
            "USB Camera",
            crate::DeviceKind::VideoInput,
        ));
        let session = BroadcasterSession::start(
            deps(backend.clone()),
            SessionId::from("s"),
            BroadcastOptions::default(),
        )
        .await
        .unwrap();
        let old_video = session.composed_stream().video().unwrap().clone();

        session.switch_camera("usb-cam").await.unwrap();

        let video = session.composed_stream().video().unwrap().clone();
        assert_eq!(video.settings().device_id.as_deref(), Some("usb-cam"));
        assert!(video.is_live());
        assert!(!old_video.is_live());

        session.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_releases_capture() {
        let backend = SyntheticBackend::new();
        let deps = deps(backend.clone());
        let hub = Arc::clone(&deps.hub);
        let session = BroadcasterSession::start(deps, SessionId::from("s"), BroadcastOptions::default())
            .await
            .unwrap();
        let peer = session.peer_id().clone();
        assert!(hub.is_registered(&peer));

        session.stop().await;
        session.stop().await;

        assert_eq!(session.viewer_count().await, 0);
        assert!(!hub.is_registered(&peer));
        assert!(session.composed_stream().is_empty());
        assert!(backend.issued_tracks().iter().all(|t| !t.is_live()));
        assert!(matches!(
            session.set_camera_enabled(true).await,
            Err(Error::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_join_for_wrong_session_is_rejected() {
        let deps = deps(SyntheticBackend::new());
        let hub = Arc::clone(&deps.hub);
        let session = BroadcasterSession::start(deps, SessionId::from("s"), BroadcastOptions::default())
            .await
            .unwrap();

        let viewer = PeerId::from("viewer");
        let mut mailbox = hub.register(&viewer).unwrap();
        hub.send(
            &viewer,
            session.peer_id(),
            SignalMessage::Join {
                session_id: SessionId::from("other"),
            },
        )
        .await
        .unwrap();

        let reply = mailbox.recv().await.unwrap();
        assert!(matches!(reply.message, SignalMessage::Reject { .. }));
        assert_eq!(session.viewer_count().await, 0);
        session.stop().await;
    }
}
