//! Peer transport seam
//!
//! A [`PeerTransport`] is one negotiated media path to one remote peer. It
//! reports everything asynchronous (gathered candidates, inbound tracks,
//! connectivity) as [`TransportEvent`]s on the channel it was created with;
//! nothing is delivered through callbacks.
//!
//! Implementations:
//! - [`LoopbackNetwork`]: in-process transport used by tests and demos
//! - [`WebRtcTransportFactory`]: `webrtc-rs` peer connections

mod loopback;
mod rtc;

pub use self::loopback::{LoopbackNetwork, LoopbackTransport};
pub use self::rtc::{WebRtcTransport, WebRtcTransportFactory};

use crate::capture::{MediaTrack, TrackKind};
use crate::error::Result;
use crate::types::PeerId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Offer or answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A connectivity candidate, in the shape browsers exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// Connectivity as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    /// Media path interrupted; may recover on its own
    Disconnected,
    Failed,
    /// Closed locally or hung up by the far end
    Closed,
}

impl From<webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState>
    for TransportState
{
    fn from(state: webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState) -> Self {
        use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState as S;
        match state {
            S::New | S::Unspecified => Self::New,
            S::Connecting => Self::Connecting,
            S::Connected => Self::Connected,
            S::Disconnected => Self::Disconnected,
            S::Failed => Self::Failed,
            S::Closed => Self::Closed,
        }
    }
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A local candidate was gathered and must reach the far end
    LocalCandidate(IceCandidate),
    /// The far end attached a track
    RemoteTrack(MediaTrack),
    /// The far end detached its track of this kind
    RemoteTrackRemoved(TrackKind),
    StateChanged(TransportState),
}

/// Transport events are produced from transport callbacks, which cannot be
/// back-pressured, so the channel is unbounded.
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;
pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// Negotiation and media primitives of one peer connection
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Create an offer and apply it as the local description
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Create an answer to the applied remote offer and apply it locally
    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Apply a remote candidate. Only valid once a remote description is set.
    async fn add_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Swap the outgoing track of `kind` in place. `None` detaches it.
    async fn replace_track(&self, kind: TrackKind, track: Option<MediaTrack>) -> Result<()>;

    /// Check that the media path is alive
    async fn probe(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Creates transports for the [`PeerConnectionFactory`](crate::PeerConnectionFactory)
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        local: &PeerId,
        remote: &PeerId,
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerTransport>>;
}
