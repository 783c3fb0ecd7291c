//! Local media capture
//!
//! This module provides:
//! - Camera/microphone and screen acquisition through a [`CaptureBackend`]
//! - Track liveness that is observable rather than polled
//! - Device enumeration with hot-plug re-query
//! - Synchronous notification when the environment ends a track

mod backend;

pub use backend::{CaptureBackend, SyntheticBackend};

use crate::error::{Error, Result};
use crate::quality::{CaptureConstraints, Resolution};
use crate::types::TrackId;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of the capture event channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Where a media source comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Camera video plus microphone audio
    Camera,
    /// Display capture, optionally with system audio
    Screen,
    /// Media received from the far end of a connection
    Remote,
}

impl SourceKind {
    /// Capitalised name used in user-facing messages
    #[must_use]
    pub const fn title(&self) -> &'static str {
        match self {
            Self::Camera => "Camera",
            Self::Screen => "Screen capture",
            Self::Remote => "Remote media",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Camera => "camera",
            Self::Screen => "screen",
            Self::Remote => "remote",
        })
    }
}

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl From<webrtc::rtp_transceiver::rtp_codec::RTPCodecType> for TrackKind {
    fn from(codec_type: webrtc::rtp_transceiver::rtp_codec::RTPCodecType) -> Self {
        match codec_type {
            webrtc::rtp_transceiver::rtp_codec::RTPCodecType::Audio => Self::Audio,
            _ => Self::Video,
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Audio => "audio",
            Self::Video => "video",
        })
    }
}

/// Why a track stopped producing media
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Stopped by this program
    Stopped,
    /// Ended by the device or the operating environment
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackState {
    Live,
    Ended(EndReason),
}

/// Settings a track was actually opened with
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackSettings {
    pub resolution: Option<Resolution>,
    pub frame_rate: Option<u32>,
    pub echo_cancellation: bool,
    pub device_id: Option<String>,
}

/// Capture-side notification
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    /// A track was ended by the environment, outside this program's control
    TrackEnded {
        source: SourceKind,
        kind: TrackKind,
        track: TrackId,
    },
    /// The device list changed; carries the re-queried list
    DevicesChanged(Vec<DeviceInfo>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    VideoInput,
    AudioInput,
    AudioOutput,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub label: String,
    pub kind: DeviceKind,
}

impl DeviceInfo {
    pub fn new(id: impl Into<String>, label: impl Into<String>, kind: DeviceKind) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            kind,
        }
    }
}

struct TrackInner {
    id: TrackId,
    kind: TrackKind,
    source: SourceKind,
    label: String,
    settings: TrackSettings,
    enabled: AtomicBool,
    state: watch::Sender<TrackState>,
    observer: Mutex<Option<broadcast::Sender<CaptureEvent>>>,
    notified: AtomicBool,
}

/// A single audio or video track.
///
/// Cheap to clone; clones share liveness and the enabled flag.
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    pub fn new(
        kind: TrackKind,
        source: SourceKind,
        label: impl Into<String>,
        settings: TrackSettings,
    ) -> Self {
        let (state, _) = watch::channel(TrackState::Live);
        Self {
            inner: Arc::new(TrackInner {
                id: TrackId::generate(),
                kind,
                source,
                label: label.into(),
                settings,
                enabled: AtomicBool::new(true),
                state,
                observer: Mutex::new(None),
                notified: AtomicBool::new(false),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> &TrackId {
        &self.inner.id
    }

    #[must_use]
    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    #[must_use]
    pub fn source(&self) -> SourceKind {
        self.inner.source
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    #[must_use]
    pub fn settings(&self) -> &TrackSettings {
        &self.inner.settings
    }

    #[must_use]
    pub fn state(&self) -> TrackState {
        *self.inner.state.borrow()
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.state() == TrackState::Live
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    /// Toggle whether the track is offered for composition. Does not stop it.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Release);
    }

    /// Stop the track. Idempotent; returns whether this call ended it.
    pub fn stop(&self) -> bool {
        self.finish(EndReason::Stopped)
    }

    /// End the track on behalf of the environment (device unplugged,
    /// sharing stopped from the OS). Subscribers are notified before this
    /// returns.
    pub fn end_externally(&self) -> bool {
        let ended = self.finish(EndReason::External);
        if ended {
            self.notify_observer();
        }
        ended
    }

    /// Wait until the track has ended
    pub async fn ended(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|state| *state != TrackState::Live).await;
    }

    fn finish(&self, reason: EndReason) -> bool {
        self.inner.state.send_if_modified(|state| {
            if *state == TrackState::Live {
                *state = TrackState::Ended(reason);
                true
            } else {
                false
            }
        })
    }

    /// Register the capture service's event channel as termination observer
    fn observe(&self, events: broadcast::Sender<CaptureEvent>) {
        *self.inner.observer.lock() = Some(events);
        // Ended between acquisition and registration
        if self.state() == TrackState::Ended(EndReason::External) {
            self.notify_observer();
        }
    }

    fn notify_observer(&self) {
        let Some(events) = self.inner.observer.lock().clone() else {
            return;
        };
        if self.inner.notified.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = events.send(CaptureEvent::TrackEnded {
            source: self.inner.source,
            kind: self.inner.kind,
            track: self.inner.id.clone(),
        });
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for MediaTrack {}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("source", &self.inner.source)
            .field("state", &self.state())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// A successfully acquired capture source and its tracks
#[derive(Debug, Clone)]
pub struct MediaSource {
    kind: SourceKind,
    tracks: Vec<MediaTrack>,
    device_id: Option<String>,
}

impl MediaSource {
    #[must_use]
    pub fn new(kind: SourceKind, tracks: Vec<MediaTrack>, device_id: Option<String>) -> Self {
        Self {
            kind,
            tracks,
            device_id,
        }
    }

    #[must_use]
    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    #[must_use]
    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    #[must_use]
    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Video)
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    /// First live video track, if any
    #[must_use]
    pub fn live_video(&self) -> Option<&MediaTrack> {
        self.video_tracks().find(|t| t.is_live())
    }

    #[must_use]
    pub fn live_audio(&self) -> Option<&MediaTrack> {
        self.audio_tracks().find(|t| t.is_live())
    }

    /// Whether any track is still live
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.tracks.iter().any(MediaTrack::is_live)
    }

    #[must_use]
    pub fn contains(&self, track: &TrackId) -> bool {
        self.tracks.iter().any(|t| t.id() == track)
    }

    /// Stop every track; returns how many were still live
    pub fn stop(&self) -> usize {
        self.tracks.iter().filter(|t| t.stop()).count()
    }
}

/// Acquires and releases local media through a platform backend
pub struct MediaCaptureService {
    backend: Arc<dyn CaptureBackend>,
    events: broadcast::Sender<CaptureEvent>,
    devices: Arc<RwLock<Vec<DeviceInfo>>>,
    cancel: CancellationToken,
}

impl MediaCaptureService {
    /// Create the service and start watching the backend for device changes
    pub fn new(backend: Arc<dyn CaptureBackend>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let service = Arc::new(Self {
            backend: Arc::clone(&backend),
            events: events.clone(),
            devices: Arc::new(RwLock::new(Vec::new())),
            cancel: CancellationToken::new(),
        });

        let changes = backend.device_changes();
        let devices = Arc::clone(&service.devices);
        let cancel = service.cancel.child_token();
        tokio::spawn(async move {
            watch_devices(backend, changes, devices, events, cancel).await;
        });

        service
    }

    /// Subscribe to track termination and device change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<CaptureEvent> {
        self.events.subscribe()
    }

    /// Acquire a capture source.
    ///
    /// Capture errors are returned as-is and never retried here.
    pub async fn acquire(
        &self,
        kind: SourceKind,
        constraints: &CaptureConstraints,
    ) -> Result<MediaSource> {
        if kind == SourceKind::Remote {
            return Err(Error::NotSupported { kind });
        }
        if !constraints.video && !constraints.audio {
            return Err(Error::Aborted {
                kind,
                reason: "neither audio nor video was requested".to_string(),
            });
        }

        let source = match self.backend.acquire(kind, constraints).await {
            Ok(source) => source,
            Err(e) => {
                warn!(source = %kind, error = %e, "Capture failed");
                return Err(e);
            }
        };

        for track in source.tracks() {
            track.observe(self.events.clone());
        }

        info!(
            source = %kind,
            device = ?source.device_id(),
            tracks = source.tracks().len(),
            resolution = ?constraints.resolution,
            "Acquired capture source"
        );

        Ok(source)
    }

    /// Stop every track of a source. Safe to call more than once.
    pub fn release(&self, source: &MediaSource) {
        let stopped = source.stop();
        debug!(source = %source.kind(), stopped, "Released capture source");
    }

    /// Query the backend for the current device list
    pub async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>> {
        let devices = self.backend.enumerate_devices().await?;
        self.devices.write().clone_from(&devices);
        Ok(devices)
    }

    /// Device list as of the last query or hot-plug notification
    #[must_use]
    pub fn cached_devices(&self) -> Vec<DeviceInfo> {
        self.devices.read().clone()
    }

    /// Open `kind` on a specific device.
    ///
    /// The caller keeps the previous source until the new one is in use.
    pub async fn switch_device(
        &self,
        kind: SourceKind,
        device_id: &str,
        constraints: &CaptureConstraints,
    ) -> Result<MediaSource> {
        let wanted = match kind {
            SourceKind::Camera if constraints.video => DeviceKind::VideoInput,
            SourceKind::Camera => DeviceKind::AudioInput,
            other => return Err(Error::NotSupported { kind: other }),
        };

        let devices = self.enumerate_devices().await?;
        if !devices.iter().any(|d| d.id == device_id && d.kind == wanted) {
            return Err(Error::DeviceNotFound {
                kind,
                device: Some(device_id.to_string()),
            });
        }

        let constraints = constraints.clone().with_device(device_id);
        self.acquire(kind, &constraints).await
    }
}

impl Drop for MediaCaptureService {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Re-query devices on every backend change notification
async fn watch_devices(
    backend: Arc<dyn CaptureBackend>,
    mut changes: broadcast::Receiver<()>,
    devices: Arc<RwLock<Vec<DeviceInfo>>>,
    events: broadcast::Sender<CaptureEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            change = changes.recv() => match change {
                Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }

        match backend.enumerate_devices().await {
            Ok(list) => {
                debug!(devices = list.len(), "Device list changed");
                devices.write().clone_from(&list);
                let _ = events.send(CaptureEvent::DevicesChanged(list));
            }
            Err(e) => warn!(error = %e, "Failed to re-query devices after change"),
        }
    }
}
