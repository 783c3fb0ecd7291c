//! `SyncTV` broadcast sessions
//!
//! One broadcaster publishes camera, microphone and screen media to any
//! number of viewers over peer-to-peer connections. This crate owns the
//! session: capture, stream composition, per-viewer connections, signaling
//! and connection health.
//!
//! ## Architecture
//!
//! - **`MediaCaptureService`**: Acquires and releases local capture sources
//! - **`StreamComposer`**: Chooses the outgoing video and audio tracks
//! - **`PeerConnectionFactory`**: Creates connections over a pluggable transport
//! - **`BroadcasterSession`**: Runs one broadcast and its viewer registry
//! - **`ViewerConnector`**: Joins a broadcast and receives its stream
//! - **`ConnectionMonitor`**: Probes health and reconnects with backoff
//!
//! ## Usage
//!
//! ```rust,ignore
//! use synctv_broadcast::{
//!     BroadcastConfig, BroadcastDeps, BroadcastOptions, BroadcasterSession, LoopbackNetwork,
//!     MediaCaptureService, NoopCollaborator, PeerConnectionFactory, SignalingHub,
//!     SyntheticBackend, ViewerConnector,
//! };
//!
//! let config = BroadcastConfig::load(None)?;
//! let hub = SignalingHub::from_config(&config);
//! let peers = Arc::new(PeerConnectionFactory::new(LoopbackNetwork::new(), config));
//! let deps = BroadcastDeps {
//!     capture: MediaCaptureService::new(SyntheticBackend::new()),
//!     peers: peers.clone(),
//!     hub: hub.clone(),
//!     collaborator: Arc::new(NoopCollaborator),
//! };
//!
//! let session = BroadcasterSession::start(deps, "session".into(), BroadcastOptions::default()).await?;
//! let viewer = ViewerConnector::new(peers, hub, Arc::new(NoopCollaborator))
//!     .connect(session.session_id(), session.peer_id())
//!     .await?;
//! ```

mod broadcaster;
mod capture;
mod collaborator;
mod composer;
mod config;
mod error;
mod logging;
mod monitor;
mod peer;
mod quality;
mod signaling;
mod stats;
mod transport;
mod types;
mod viewer;

pub use broadcaster::{
    BroadcastDeps, BroadcastOptions, BroadcasterSession, SessionEvent, ViewerInfo,
};
pub use capture::{
    CaptureBackend, CaptureEvent, DeviceInfo, DeviceKind, EndReason, MediaCaptureService,
    MediaSource, MediaTrack, SourceKind, SyntheticBackend, TrackKind, TrackSettings, TrackState,
};
pub use collaborator::{
    notify, spawn_heartbeat, NoopCollaborator, Notification, RecordingCollaborator,
    SessionCollaborator, SessionRecord, SourceMix,
};
pub use composer::{compose, ComposedStream, Recomposition, StreamComposer, TrackSwap};
pub use config::{
    BroadcastConfig, CaptureConfig, IceConfig, IceServer, LoggingConfig, MonitorConfig,
    NegotiationConfig,
};
pub use error::{Error, Result};
pub use logging::init_logging;
pub use monitor::{
    ConnectionEvent, ConnectionEventKind, ConnectionEvents, ConnectionMonitor, ConnectionState,
    MonitorSettings,
};
pub use peer::{PeerConnection, PeerConnectionFactory};
pub use quality::{CaptureConstraints, QualityTier, Resolution};
pub use signaling::{SignalEnvelope, SignalMailbox, SignalMessage, SignalingHub};
pub use stats::{SessionClock, SessionStats, ViewerStats};
pub use transport::{
    IceCandidate, LoopbackNetwork, LoopbackTransport, PeerTransport, SdpKind, SessionDescription,
    TransportEvent, TransportEventSender, TransportEvents, TransportFactory, TransportState,
    WebRtcTransport, WebRtcTransportFactory,
};
pub use types::{ConnectionId, PeerId, SessionId, TrackId};
pub use viewer::{ViewerConnection, ViewerConnector};
