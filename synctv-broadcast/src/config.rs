use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::quality::QualityTier;

/// Environment prefix, e.g. `SYNCTV_BROADCAST__MONITOR__PROBE_INTERVAL_MS`
pub const ENV_PREFIX: &str = "SYNCTV_BROADCAST";

/// Broadcast session configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    pub monitor: MonitorConfig,
    pub negotiation: NegotiationConfig,
    pub capture: CaptureConfig,
    pub ice: IceConfig,
    pub logging: LoggingConfig,
}

/// Connection health supervision
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Health probe period
    pub probe_interval_ms: u64,
    /// Consecutive missed probes before a connection is considered lost
    pub missed_probe_threshold: u32,
    /// Liveness heartbeat cadence towards the session collaborator
    pub heartbeat_interval_ms: u64,
    /// First reconnection delay; later delays grow by `reconnect_factor`
    pub reconnect_base_delay_ms: u64,
    pub reconnect_factor: f32,
    pub max_reconnect_attempts: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: 5_000,
            missed_probe_threshold: 2,
            heartbeat_interval_ms: 30_000,
            reconnect_base_delay_ms: 1_000,
            reconnect_factor: 2.0,
            max_reconnect_attempts: 5,
        }
    }
}

impl MonitorConfig {
    #[must_use]
    pub const fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    #[must_use]
    pub const fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    /// Offer/answer/candidate exchange must reach `connected` within this
    pub timeout_ms: u64,
    /// Viewer side: time from `connecting` until a stream must arrive
    pub connection_timeout_ms: u64,
    /// Mailbox size of each signaling endpoint
    pub signal_buffer: usize,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            connection_timeout_ms: 10_000,
            signal_buffer: 64,
        }
    }
}

impl NegotiationConfig {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    #[must_use]
    pub const fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Tier used when a session record declares none
    pub default_quality: QualityTier,
}

/// ICE servers handed to the WebRTC transport
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    pub servers: Vec<IceServer>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            servers: vec![IceServer {
                urls: vec!["stun:stun.l.google.com:19302".to_string()],
                username: None,
                credential: None,
            }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Level for the WebRTC stack's own targets
    pub transport_level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            transport_level: "warn".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl BroadcastConfig {
    /// Load configuration from an optional file, then environment overrides,
    /// and validate the result
    pub fn load(config_file: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Reject settings the monitor cannot run with
    pub fn validate(&self) -> Result<()> {
        let monitor = &self.monitor;
        if monitor.probe_interval_ms == 0 {
            return Err(Error::Config("monitor.probe_interval_ms must be positive".into()));
        }
        if monitor.heartbeat_interval_ms == 0 {
            return Err(Error::Config("monitor.heartbeat_interval_ms must be positive".into()));
        }
        if monitor.missed_probe_threshold == 0 {
            return Err(Error::Config("monitor.missed_probe_threshold must be positive".into()));
        }
        if monitor.reconnect_base_delay_ms == 0 {
            return Err(Error::Config("monitor.reconnect_base_delay_ms must be positive".into()));
        }
        if monitor.reconnect_factor < 1.0 {
            return Err(Error::Config("monitor.reconnect_factor must be at least 1".into()));
        }
        if monitor.max_reconnect_attempts == 0 {
            return Err(Error::Config("monitor.max_reconnect_attempts must be positive".into()));
        }
        if self.negotiation.timeout_ms == 0 || self.negotiation.connection_timeout_ms == 0 {
            return Err(Error::Config("negotiation timeouts must be positive".into()));
        }
        if self.negotiation.signal_buffer == 0 {
            return Err(Error::Config("negotiation.signal_buffer must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = BroadcastConfig::default();
        assert_eq!(config.monitor.probe_interval(), Duration::from_secs(5));
        assert_eq!(config.monitor.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.monitor.reconnect_base_delay(), Duration::from_secs(1));
        assert_eq!(config.monitor.missed_probe_threshold, 2);
        assert_eq!(config.monitor.max_reconnect_attempts, 5);
        assert_eq!(config.negotiation.timeout(), Duration::from_secs(10));
        assert_eq!(config.capture.default_quality, QualityTier::Medium);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[monitor]\nprobe_interval_ms = 1000\nmax_reconnect_attempts = 3\n\n[capture]\ndefault_quality = \"high\"\n"
        )
        .unwrap();

        let config = BroadcastConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.monitor.probe_interval(), Duration::from_secs(1));
        assert_eq!(config.monitor.max_reconnect_attempts, 3);
        // Untouched fields keep their defaults
        assert_eq!(config.monitor.missed_probe_threshold, 2);
        assert_eq!(config.capture.default_quality, QualityTier::High);
    }

    #[test]
    fn test_load_rejects_zero_intervals() {
        for key in ["probe_interval_ms", "heartbeat_interval_ms"] {
            let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
            writeln!(file, "[monitor]\n{key} = 0\n").unwrap();

            let err = BroadcastConfig::load(file.path().to_str()).unwrap_err();
            assert!(
                matches!(&err, Error::Config(message) if message.contains(key)),
                "{key}: {err}"
            );
        }
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config = BroadcastConfig::default();
        config.monitor.max_reconnect_attempts = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
