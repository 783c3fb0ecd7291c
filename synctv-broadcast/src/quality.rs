//! Quality tiers and the capture constraint presets derived from them
//!
//! | tier   | resolution | fps | target bitrate |
//! |--------|------------|-----|----------------|
//! | low    | 640x360    | 15  | 500 kbps       |
//! | medium | 1280x720   | 30  | 2 Mbps         |
//! | high   | 1920x1080  | 60  | 4 Mbps         |
//! | auto   | adaptive   |     |                |

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Video resolution in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Declared quality of a broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Low,
    #[default]
    Medium,
    High,
    Auto,
}

impl QualityTier {
    /// Fixed resolution of the tier, `None` for `auto`
    #[must_use]
    pub const fn resolution(&self) -> Option<Resolution> {
        match self {
            Self::Low => Some(Resolution::new(640, 360)),
            Self::Medium => Some(Resolution::new(1280, 720)),
            Self::High => Some(Resolution::new(1920, 1080)),
            Self::Auto => None,
        }
    }

    #[must_use]
    pub const fn frame_rate(&self) -> Option<u32> {
        match self {
            Self::Low => Some(15),
            Self::Medium => Some(30),
            Self::High => Some(60),
            Self::Auto => None,
        }
    }

    /// Target bitrate in kbps
    #[must_use]
    pub const fn target_bitrate_kbps(&self) -> Option<u32> {
        match self {
            Self::Low => Some(500),
            Self::Medium => Some(2000),
            Self::High => Some(4000),
            Self::Auto => None,
        }
    }

    /// Select a fixed tier for an estimated bandwidth in kbps
    #[must_use]
    pub const fn from_bandwidth(bandwidth_kbps: u32) -> Self {
        if bandwidth_kbps >= 4000 {
            Self::High
        } else if bandwidth_kbps >= 2000 {
            Self::Medium
        } else {
            Self::Low
        }
    }

    /// Classify a captured frame height into the closest fixed tier
    #[must_use]
    pub const fn from_height(height: u32) -> Self {
        if height >= 1080 {
            Self::High
        } else if height >= 720 {
            Self::Medium
        } else {
            Self::Low
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Auto => "auto",
        }
    }

    /// Build capture constraints for this tier
    #[must_use]
    pub fn constraints(&self, video: bool, audio: bool) -> CaptureConstraints {
        CaptureConstraints {
            video,
            audio,
            resolution: if video { self.resolution() } else { None },
            frame_rate: if video { self.frame_rate() } else { None },
            echo_cancellation: audio,
            device_id: None,
        }
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QualityTier {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "auto" => Ok(Self::Auto),
            other => Err(crate::Error::Config(format!("unknown quality tier: {other}"))),
        }
    }
}

/// Constraints handed to a capture backend
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CaptureConstraints {
    pub video: bool,
    pub audio: bool,
    /// Exact resolution, or `None` to let the device pick
    pub resolution: Option<Resolution>,
    pub frame_rate: Option<u32>,
    pub echo_cancellation: bool,
    /// Specific device to open instead of the default one
    pub device_id: Option<String>,
}

impl CaptureConstraints {
    #[must_use]
    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_presets() {
        assert_eq!(QualityTier::Low.resolution(), Some(Resolution::new(640, 360)));
        assert_eq!(QualityTier::Low.frame_rate(), Some(15));
        assert_eq!(QualityTier::Medium.resolution(), Some(Resolution::new(1280, 720)));
        assert_eq!(QualityTier::Medium.target_bitrate_kbps(), Some(2000));
        assert_eq!(QualityTier::High.frame_rate(), Some(60));
        assert_eq!(QualityTier::High.target_bitrate_kbps(), Some(4000));
        assert_eq!(QualityTier::Auto.resolution(), None);
    }

    #[test]
    fn test_from_bandwidth() {
        assert_eq!(QualityTier::from_bandwidth(300), QualityTier::Low);
        assert_eq!(QualityTier::from_bandwidth(2500), QualityTier::Medium);
        assert_eq!(QualityTier::from_bandwidth(8000), QualityTier::High);
    }

    #[test]
    fn test_audio_only_constraints_carry_no_video_settings() {
        let constraints = QualityTier::High.constraints(false, true);
        assert!(!constraints.video);
        assert!(constraints.echo_cancellation);
        assert_eq!(constraints.resolution, None);
        assert_eq!(constraints.frame_rate, None);
    }

    #[test]
    fn test_parse_tier() {
        assert_eq!("Medium".parse::<QualityTier>().unwrap(), QualityTier::Medium);
        assert!("ultra".parse::<QualityTier>().is_err());
        assert_eq!(QualityTier::Auto.to_string(), "auto");
    }
}
