use std::sync::Arc;

use tracing::{info_span, Level, Span};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    layer::{Layered, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::config::LoggingConfig;
use crate::types::{PeerId, SessionId};

/// Targets of the `webrtc` stack; noisy at `info` and below
const TRANSPORT_TARGETS: &[&str] = &[
    "webrtc",
    "webrtc_ice",
    "webrtc_dtls",
    "webrtc_srtp",
    "webrtc_sctp",
    "webrtc_mdns",
    "interceptor",
];

type Filtered = Layered<EnvFilter, Registry>;

/// Install the global tracing subscriber for a broadcast process
///
/// `RUST_LOG` takes precedence over the configured levels. Transport crates
/// log at `transport_level` so per-packet chatter stays out of session logs.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let directives = filter_directives(config)?;
    let env_filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&directives))?;

    let writer = match &config.file_path {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            BoxMakeWriter::new(Arc::new(file))
        }
        None => BoxMakeWriter::new(std::io::stdout),
    };

    let layer: Box<dyn Layer<Filtered> + Send + Sync> = if config.format == "json" {
        fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_writer(writer)
            .boxed()
    } else {
        fmt::layer()
            .pretty()
            .with_span_events(FmtSpan::CLOSE)
            .with_target(true)
            .with_line_number(true)
            .with_file(false)
            .with_writer(writer)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layer)
        .try_init()?;
    Ok(())
}

/// Filter for the configured levels: everything at `level`, the transport
/// stack at `transport_level`
fn filter_directives(config: &LoggingConfig) -> anyhow::Result<String> {
    let level = parse_log_level(&config.level)?;
    let transport = parse_log_level(&config.transport_level)?;

    let mut directives = vec![level.to_string().to_lowercase()];
    directives.extend(
        TRANSPORT_TARGETS
            .iter()
            .map(|target| format!("{target}={}", transport.to_string().to_lowercase())),
    );
    Ok(directives.join(","))
}

fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(anyhow::anyhow!("Invalid log level: {level}")),
    }
}

/// Span carried by a broadcaster's session task and its viewer links
pub(crate) fn session_span(session_id: &SessionId, peer_id: &PeerId) -> Span {
    info_span!("broadcast", session_id = %session_id, peer_id = %peer_id)
}

/// Span carried by a viewer's relay task
pub(crate) fn viewer_span(session_id: &SessionId, peer_id: &PeerId, broadcaster: &PeerId) -> Span {
    info_span!(
        "viewer",
        session_id = %session_id,
        peer_id = %peer_id,
        broadcaster = %broadcaster
    )
}
