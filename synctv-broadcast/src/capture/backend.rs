//! Capture backends
//!
//! A backend is the boundary to the operating environment: it opens devices,
//! lists them, and reports hot-plug. [`SyntheticBackend`] simulates devices in
//! process and is what the tests drive.

use super::{DeviceInfo, DeviceKind, MediaSource, MediaTrack, SourceKind, TrackKind, TrackSettings};
use crate::error::{Error, Result};
use crate::quality::{CaptureConstraints, Resolution};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;

#[async_trait]
pub trait CaptureBackend: Send + Sync {
    /// Open a source with the given constraints
    async fn acquire(&self, kind: SourceKind, constraints: &CaptureConstraints)
        -> Result<MediaSource>;

    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>>;

    /// Notification fired whenever the device list may have changed
    fn device_changes(&self) -> broadcast::Receiver<()>;
}

const DEFAULT_CAMERA_RESOLUTION: Resolution = Resolution::new(1280, 720);
const DEFAULT_DISPLAY_RESOLUTION: Resolution = Resolution::new(1920, 1080);
const DEFAULT_FRAME_RATE: u32 = 30;

struct SyntheticState {
    devices: Vec<DeviceInfo>,
    denied: HashSet<SourceKind>,
    screen_supported: bool,
    abort_next: Option<String>,
    issued: Vec<MediaTrack>,
}

/// In-process simulated devices
pub struct SyntheticBackend {
    state: Mutex<SyntheticState>,
    changes: broadcast::Sender<()>,
}

impl SyntheticBackend {
    /// One camera and one microphone, screen capture supported
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_devices(vec![
            DeviceInfo::new("camera-0", "Integrated Camera", DeviceKind::VideoInput),
            DeviceInfo::new("microphone-0", "Built-in Microphone", DeviceKind::AudioInput),
        ])
    }

    #[must_use]
    pub fn with_devices(devices: Vec<DeviceInfo>) -> Arc<Self> {
        let (changes, _) = broadcast::channel(16);
        Arc::new(Self {
            state: Mutex::new(SyntheticState {
                devices,
                denied: HashSet::new(),
                screen_supported: true,
                abort_next: None,
                issued: Vec::new(),
            }),
            changes,
        })
    }

    /// Make the user decline access to `kind`
    pub fn deny(&self, kind: SourceKind) {
        self.state.lock().denied.insert(kind);
    }

    pub fn allow(&self, kind: SourceKind) {
        self.state.lock().denied.remove(&kind);
    }

    pub fn set_screen_supported(&self, supported: bool) {
        self.state.lock().screen_supported = supported;
    }

    /// Fail the next acquisition as aborted
    pub fn abort_next(&self, reason: impl Into<String>) {
        self.state.lock().abort_next = Some(reason.into());
    }

    pub fn plug(&self, device: DeviceInfo) {
        self.state.lock().devices.push(device);
        let _ = self.changes.send(());
    }

    /// Remove a device, ending every track opened on it
    pub fn unplug(&self, device_id: &str) {
        let ended: Vec<MediaTrack> = {
            let mut state = self.state.lock();
            state.devices.retain(|d| d.id != device_id);
            state
                .issued
                .iter()
                .filter(|t| t.settings().device_id.as_deref() == Some(device_id))
                .cloned()
                .collect()
        };
        for track in ended {
            track.end_externally();
        }
        let _ = self.changes.send(());
    }

    /// Simulate the user stopping sharing from the operating system.
    /// Returns the number of tracks ended.
    pub fn end_screen_share(&self) -> usize {
        let screen: Vec<MediaTrack> = self
            .state
            .lock()
            .issued
            .iter()
            .filter(|t| t.source() == SourceKind::Screen && t.is_live())
            .cloned()
            .collect();
        screen.iter().filter(|t| t.end_externally()).count()
    }

    /// Every track handed out so far
    #[must_use]
    pub fn issued_tracks(&self) -> Vec<MediaTrack> {
        self.state.lock().issued.clone()
    }

    fn open_camera(
        state: &SyntheticState,
        constraints: &CaptureConstraints,
    ) -> Result<(Vec<MediaTrack>, Option<String>)> {
        let kind = SourceKind::Camera;
        let mut tracks = Vec::new();
        let mut device_id = None;

        if constraints.video {
            let device = match constraints.device_id.as_deref() {
                Some(id) => state
                    .devices
                    .iter()
                    .find(|d| d.id == id && d.kind == DeviceKind::VideoInput),
                None => state
                    .devices
                    .iter()
                    .find(|d| d.kind == DeviceKind::VideoInput),
            }
            .ok_or_else(|| Error::DeviceNotFound {
                kind,
                device: constraints.device_id.clone(),
            })?;

            device_id = Some(device.id.clone());
            tracks.push(MediaTrack::new(
                TrackKind::Video,
                kind,
                device.label.clone(),
                TrackSettings {
                    resolution: Some(constraints.resolution.unwrap_or(DEFAULT_CAMERA_RESOLUTION)),
                    frame_rate: Some(constraints.frame_rate.unwrap_or(DEFAULT_FRAME_RATE)),
                    echo_cancellation: false,
                    device_id: Some(device.id.clone()),
                },
            ));
        }

        if constraints.audio {
            let wanted = (!constraints.video)
                .then_some(constraints.device_id.as_deref())
                .flatten();
            let mic = state
                .devices
                .iter()
                .find(|d| d.kind == DeviceKind::AudioInput && wanted.map_or(true, |id| d.id == id))
                .ok_or_else(|| Error::DeviceNotFound {
                    kind,
                    device: wanted.map(str::to_string),
                })?;

            if device_id.is_none() {
                device_id = Some(mic.id.clone());
            }
            tracks.push(MediaTrack::new(
                TrackKind::Audio,
                kind,
                mic.label.clone(),
                TrackSettings {
                    echo_cancellation: constraints.echo_cancellation,
                    device_id: Some(mic.id.clone()),
                    ..TrackSettings::default()
                },
            ));
        }

        Ok((tracks, device_id))
    }

    fn open_screen(constraints: &CaptureConstraints) -> Vec<MediaTrack> {
        let mut tracks = vec![MediaTrack::new(
            TrackKind::Video,
            SourceKind::Screen,
            "Screen 1",
            TrackSettings {
                resolution: Some(constraints.resolution.unwrap_or(DEFAULT_DISPLAY_RESOLUTION)),
                frame_rate: Some(constraints.frame_rate.unwrap_or(DEFAULT_FRAME_RATE)),
                ..TrackSettings::default()
            },
        )];
        if constraints.audio {
            tracks.push(MediaTrack::new(
                TrackKind::Audio,
                SourceKind::Screen,
                "System Audio",
                TrackSettings::default(),
            ));
        }
        tracks
    }
}

#[async_trait]
impl CaptureBackend for SyntheticBackend {
    async fn acquire(
        &self,
        kind: SourceKind,
        constraints: &CaptureConstraints,
    ) -> Result<MediaSource> {
        let mut state = self.state.lock();

        if let Some(reason) = state.abort_next.take() {
            return Err(Error::Aborted { kind, reason });
        }

        let (tracks, device_id) = match kind {
            SourceKind::Camera => {
                if state.denied.contains(&kind) {
                    return Err(Error::PermissionDenied { kind });
                }
                Self::open_camera(&state, constraints)?
            }
            SourceKind::Screen => {
                if !state.screen_supported {
                    return Err(Error::NotSupported { kind });
                }
                if state.denied.contains(&kind) {
                    return Err(Error::PermissionDenied { kind });
                }
                (Self::open_screen(constraints), None)
            }
            SourceKind::Remote => return Err(Error::NotSupported { kind }),
        };

        state.issued.extend(tracks.iter().cloned());
        Ok(MediaSource::new(kind, tracks, device_id))
    }

    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self.state.lock().devices.clone())
    }

    fn device_changes(&self) -> broadcast::Receiver<()> {
        self.changes.subscribe()
    }
}
