//! Session statistics
//!
//! Durations are recomputed from a monotonic start instant on every read;
//! the wall-clock start is kept only for reporting.

use crate::composer::ComposedStream;
use crate::monitor::ConnectionState;
use crate::quality::{QualityTier, Resolution};
use crate::types::{PeerId, SessionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Start of a session, on both clocks
#[derive(Debug, Clone, Copy)]
pub struct SessionClock {
    started_at: DateTime<Utc>,
    started: Instant,
}

impl SessionClock {
    #[must_use]
    pub fn start() -> Self {
        Self {
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Broadcaster-side snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    pub session_id: SessionId,
    pub peer_id: PeerId,
    pub started_at: DateTime<Utc>,
    pub duration_secs: u64,
    /// Live size of the viewer registry
    pub viewer_count: usize,
    /// Coarse quality label, e.g. "medium"
    pub quality: String,
    pub resolution: Option<Resolution>,
    pub frame_rate: Option<u32>,
    pub target_bitrate_kbps: Option<u32>,
    pub video_tracks: usize,
    pub audio_tracks: usize,
}

impl SessionStats {
    #[must_use]
    pub fn collect(
        session_id: &SessionId,
        peer_id: &PeerId,
        clock: &SessionClock,
        tier: QualityTier,
        stream: &ComposedStream,
        viewer_count: usize,
    ) -> Self {
        let settings = stream.video().map(|video| video.settings().clone());
        let resolution = settings.as_ref().and_then(|s| s.resolution);
        let effective = effective_tier(tier, resolution);

        Self {
            session_id: session_id.clone(),
            peer_id: peer_id.clone(),
            started_at: clock.started_at(),
            duration_secs: clock.elapsed().as_secs(),
            viewer_count,
            quality: effective.as_str().to_string(),
            resolution,
            frame_rate: settings.and_then(|s| s.frame_rate),
            target_bitrate_kbps: effective.target_bitrate_kbps(),
            video_tracks: usize::from(stream.video().is_some()),
            audio_tracks: usize::from(stream.audio().is_some()),
        }
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }
}

/// `auto` is reported as the fixed tier closest to what was captured
fn effective_tier(tier: QualityTier, resolution: Option<Resolution>) -> QualityTier {
    match (tier, resolution) {
        (QualityTier::Auto, Some(resolution)) => QualityTier::from_height(resolution.height),
        (tier, _) => tier,
    }
}

/// Viewer-side snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewerStats {
    pub session_id: SessionId,
    pub broadcaster: PeerId,
    pub state: ConnectionState,
    pub started_at: DateTime<Utc>,
    pub duration_secs: u64,
    /// Audience size reported by the collaborator; advisory only
    pub viewer_count: Option<u64>,
    pub video_tracks: usize,
    pub audio_tracks: usize,
    pub reconnect_attempts: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{MediaTrack, SourceKind, TrackKind, TrackSettings};

    #[tokio::test(start_paused = true)]
    async fn test_duration_is_recomputed_on_read() {
        let clock = SessionClock::start();
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(clock.elapsed(), Duration::from_secs(90));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(clock.elapsed(), Duration::from_secs(100));
    }

    #[test]
    fn test_auto_tier_is_labelled_from_capture() {
        let video = MediaTrack::new(
            TrackKind::Video,
            SourceKind::Screen,
            "screen",
            TrackSettings {
                resolution: Some(Resolution::new(1920, 1080)),
                frame_rate: Some(30),
                ..TrackSettings::default()
            },
        );
        let stream = ComposedStream::new(Some(video), None);
        let clock = SessionClock::start();

        let stats = SessionStats::collect(
            &SessionId::from("s"),
            &PeerId::from("p"),
            &clock,
            QualityTier::Auto,
            &stream,
            3,
        );
        assert_eq!(stats.quality, "high");
        assert_eq!(stats.target_bitrate_kbps, Some(4000));
        assert_eq!(stats.viewer_count, 3);
        assert_eq!(stats.video_tracks, 1);
        assert_eq!(stats.audio_tracks, 0);
    }
}
