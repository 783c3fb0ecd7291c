use std::time::Duration;

use thiserror::Error;

use crate::capture::SourceKind;
use crate::monitor::ConnectionState;
use crate::types::PeerId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("{kind} access was denied")]
    PermissionDenied { kind: SourceKind },

    #[error("No {kind} device found{}", requested_suffix(.device))]
    DeviceNotFound {
        kind: SourceKind,
        device: Option<String>,
    },

    #[error("{kind} capture is not supported here")]
    NotSupported { kind: SourceKind },

    #[error("{kind} capture was aborted: {reason}")]
    Aborted { kind: SourceKind, reason: String },

    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("Negotiation did not complete within {0:?}")]
    NegotiationTimeout(Duration),

    #[error("No stream from {peer} within {after:?}")]
    ConnectionTimeout { peer: PeerId, after: Duration },

    #[error("Connection to {peer} refused: {reason}")]
    ConnectionRefused { peer: PeerId, reason: String },

    #[error("Transport lost: {0}")]
    TransportLost(String),

    #[error("Gave up after {attempts} reconnection attempts")]
    MaxReconnectExceeded { attempts: u32 },

    #[error("Composition conflict: {0}")]
    CompositionConflict(String),

    #[error("Invalid connection state transition {from} -> {to}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("Invalid signaling message: {0}")]
    InvalidSignal(String),

    #[error("Peer identity already registered: {0}")]
    IdentityInUse(PeerId),

    #[error("Session is closed")]
    SessionClosed,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether the reconnection policy may retry after this error.
    ///
    /// Capture errors are never retried automatically.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::NegotiationTimeout(_) | Self::TransportLost(_))
    }

    /// Whether this is a transient network condition that should render as
    /// a "reconnecting" indicator rather than an error
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        self.is_retryable()
    }

    /// Text suitable for showing to the person operating the broadcast
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::PermissionDenied { kind } => format!(
                "{} access was denied. Allow access and start again; this will not be retried automatically.",
                kind.title()
            ),
            Self::DeviceNotFound { kind, .. } => format!(
                "No {kind} device is available. Connect one and start again; this will not be retried automatically."
            ),
            Self::NotSupported { kind } => format!(
                "{} is not supported on this system and will not be retried.",
                kind.title()
            ),
            Self::Aborted { kind, .. } => format!(
                "{} was interrupted. Start it again to continue.",
                kind.title()
            ),
            Self::NegotiationTimeout(_) | Self::TransportLost(_) => "Reconnecting…".to_string(),
            Self::MaxReconnectExceeded { attempts } => {
                format!("Connection lost after {attempts} reconnection attempts.")
            }
            Self::ConnectionTimeout { .. } => {
                "The broadcast did not start streaming in time. Try joining again.".to_string()
            }
            Self::ConnectionRefused { .. } => "The broadcast is not available.".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<webrtc::Error> for Error {
    fn from(err: webrtc::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidSignal(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

fn requested_suffix(device: &Option<String>) -> String {
    device
        .as_deref()
        .map(|d| format!(" (requested {d})"))
        .unwrap_or_default()
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(Error::TransportLost("ice".into()).is_retryable());
        assert!(Error::NegotiationTimeout(Duration::from_secs(10)).is_retryable());
        assert!(!Error::PermissionDenied { kind: SourceKind::Camera }.is_retryable());
        assert!(!Error::MaxReconnectExceeded { attempts: 5 }.is_retryable());
    }

    #[test]
    fn test_capture_errors_are_actionable() {
        let msg = Error::PermissionDenied { kind: SourceKind::Screen }.user_message();
        assert!(msg.starts_with("Screen capture access was denied"));
        assert!(msg.contains("not be retried"));

        let msg = Error::DeviceNotFound {
            kind: SourceKind::Camera,
            device: None,
        }
        .user_message();
        assert!(msg.contains("camera"));
        assert!(msg.contains("not be retried"));
    }

    #[test]
    fn test_transient_errors_render_as_reconnecting() {
        assert_eq!(Error::TransportLost("x".into()).user_message(), "Reconnecting…");
    }

    #[test]
    fn test_device_not_found_display() {
        let err = Error::DeviceNotFound {
            kind: SourceKind::Camera,
            device: Some("usb-2".into()),
        };
        assert_eq!(err.to_string(), "No camera device found (requested usb-2)");
    }
}
