//! Signaling between a broadcaster and its viewers
//!
//! Messages are a tagged JSON enum validated at the boundary. The
//! [`SignalingHub`] is the in-process rendezvous: every peer identity owns a
//! bounded mailbox, and sending to an identity with no mailbox is a refused
//! connection.

use crate::config::BroadcastConfig;
use crate::error::{Error, Result};
use crate::transport::{IceCandidate, SdpKind, SessionDescription};
use crate::types::{PeerId, SessionId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Signaling message types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    /// Viewer asks to watch the broadcast of `session_id`
    Join { session_id: SessionId },
    /// Viewer is leaving
    Leave { session_id: SessionId },
    /// Viewer liveness
    Heartbeat { session_id: SessionId },
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: IceCandidate },
    /// Broadcaster declines the request
    Reject { reason: String },
    /// Broadcaster ended the session
    Bye,
}

impl SignalMessage {
    /// Parse and validate a JSON message
    pub fn parse(json: &str) -> Result<Self> {
        let message: Self = serde_json::from_str(json)?;
        message.validate()?;
        Ok(message)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Join { session_id } | Self::Leave { session_id } | Self::Heartbeat { session_id }
                if session_id.is_empty() =>
            {
                Err(Error::InvalidSignal(format!("{} without session id", self.name())))
            }
            Self::Offer { sdp } | Self::Answer { sdp } if sdp.trim().is_empty() => {
                Err(Error::InvalidSignal(format!("{} with empty sdp", self.name())))
            }
            Self::Candidate { candidate } if candidate.candidate.trim().is_empty() => {
                Err(Error::InvalidSignal("empty candidate".to_string()))
            }
            _ => Ok(()),
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Leave { .. } => "leave",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate { .. } => "candidate",
            Self::Reject { .. } => "reject",
            Self::Bye => "bye",
        }
    }

    /// The session description carried by an offer or answer
    #[must_use]
    pub fn description(&self) -> Option<SessionDescription> {
        match self {
            Self::Offer { sdp } => Some(SessionDescription::offer(sdp.clone())),
            Self::Answer { sdp } => Some(SessionDescription::answer(sdp.clone())),
            _ => None,
        }
    }
}

impl From<SessionDescription> for SignalMessage {
    fn from(description: SessionDescription) -> Self {
        match description.kind {
            SdpKind::Offer => Self::Offer { sdp: description.sdp },
            SdpKind::Answer => Self::Answer { sdp: description.sdp },
        }
    }
}

/// A message in flight between two identities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub from: PeerId,
    pub to: PeerId,
    #[serde(flatten)]
    pub message: SignalMessage,
}

pub type SignalMailbox = mpsc::Receiver<SignalEnvelope>;

/// In-process rendezvous of peer identities
pub struct SignalingHub {
    mailboxes: DashMap<PeerId, mpsc::Sender<SignalEnvelope>>,
    buffer: usize,
}

impl SignalingHub {
    #[must_use]
    pub fn new(buffer: usize) -> Arc<Self> {
        Arc::new(Self {
            mailboxes: DashMap::new(),
            buffer: buffer.max(1),
        })
    }

    /// Hub whose mailboxes hold `negotiation.signal_buffer` messages
    #[must_use]
    pub fn from_config(config: &BroadcastConfig) -> Arc<Self> {
        Self::new(config.negotiation.signal_buffer)
    }

    /// Claim `peer` and receive everything sent to it
    pub fn register(&self, peer: &PeerId) -> Result<SignalMailbox> {
        if peer.is_empty() {
            return Err(Error::InvalidSignal("empty peer identity".to_string()));
        }
        let (tx, rx) = mpsc::channel(self.buffer);
        match self.mailboxes.entry(peer.clone()) {
            // Mailbox dropped without unregistering; the identity is free again
            Entry::Occupied(mut entry) if entry.get().is_closed() => {
                entry.insert(tx);
            }
            Entry::Occupied(_) => return Err(Error::IdentityInUse(peer.clone())),
            Entry::Vacant(entry) => {
                entry.insert(tx);
            }
        }
        debug!(peer_id = %peer, "Registered signaling identity");
        Ok(rx)
    }

    /// Release `peer`. Safe to call more than once.
    pub fn unregister(&self, peer: &PeerId) {
        if self.mailboxes.remove(peer).is_some() {
            debug!(peer_id = %peer, "Released signaling identity");
        }
    }

    #[must_use]
    pub fn is_registered(&self, peer: &PeerId) -> bool {
        self.mailboxes
            .get(peer)
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Deliver a message, waiting for mailbox capacity
    pub async fn send(&self, from: &PeerId, to: &PeerId, message: SignalMessage) -> Result<()> {
        message.validate()?;
        let tx = self.mailbox(to)?;
        trace!(from = %from, to = %to, message = message.name(), "Signal");
        tx.send(SignalEnvelope {
            from: from.clone(),
            to: to.clone(),
            message,
        })
        .await
        .map_err(|_| refused(to, "peer has gone away"))
    }

    /// Deliver a message without waiting; fails if the mailbox is full
    pub fn try_send(&self, from: &PeerId, to: &PeerId, message: SignalMessage) -> Result<()> {
        message.validate()?;
        let tx = self.mailbox(to)?;
        tx.try_send(SignalEnvelope {
            from: from.clone(),
            to: to.clone(),
            message,
        })
        .map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => refused(to, "mailbox full"),
            mpsc::error::TrySendError::Closed(_) => refused(to, "peer has gone away"),
        })
    }

    fn mailbox(&self, peer: &PeerId) -> Result<mpsc::Sender<SignalEnvelope>> {
        self.mailboxes
            .get(peer)
            .map(|tx| tx.value().clone())
            .ok_or_else(|| refused(peer, "no such peer"))
    }
}

fn refused(peer: &PeerId, reason: &str) -> Error {
    Error::ConnectionRefused {
        peer: peer.clone(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_wire_format() {
        let message = SignalMessage::Join {
            session_id: SessionId::from("s-1"),
        };
        assert_eq!(message.to_json().unwrap(), r#"{"type":"join","session_id":"s-1"}"#);

        let parsed = SignalMessage::parse(
            r#"{"type":"candidate","candidate":{"candidate":"candidate:1 1 udp 1 10.0.0.1 9 typ host","sdp_mid":"0"}}"#,
        )
        .unwrap();
        let SignalMessage::Candidate { candidate } = parsed else {
            panic!("expected candidate");
        };
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, None);
    }

    #[test]
    fn test_invalid_messages_are_rejected() {
        assert!(matches!(
            SignalMessage::parse(r#"{"type":"offer","sdp":"  "}"#),
            Err(Error::InvalidSignal(_))
        ));
        assert!(matches!(
            SignalMessage::parse(r#"{"type":"heartbeat","session_id":""}"#),
            Err(Error::InvalidSignal(_))
        ));
        assert!(matches!(
            SignalMessage::parse(r#"{"type":"shout"}"#),
            Err(Error::InvalidSignal(_))
        ));
        assert!(SignalMessage::parse(r#"{"type":"bye"}"#).is_ok());
    }

    #[test]
    fn test_envelope_flattens_message() {
        let envelope = SignalEnvelope {
            from: PeerId::from("v"),
            to: PeerId::from("b"),
            message: SignalMessage::Bye,
        };
        let json = serde_json::to_string(&envelope).unwrap();
        assert_eq!(json, r#"{"from":"v","to":"b","type":"bye"}"#);
    }

    #[tokio::test]
    async fn test_identity_is_exclusive_until_released() {
        let hub = SignalingHub::new(8);
        let peer = PeerId::from("broadcaster");

        let _mailbox = hub.register(&peer).unwrap();
        assert!(matches!(hub.register(&peer), Err(Error::IdentityInUse(_))));

        hub.unregister(&peer);
        assert!(hub.register(&peer).is_ok());
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_is_refused() {
        let hub = SignalingHub::new(8);
        let err = hub
            .send(&"v".into(), &"nobody".into(), SignalMessage::Bye)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionRefused { .. }));
    }

    #[tokio::test]
    async fn test_mailbox_size_follows_config() {
        let mut config = BroadcastConfig::default();
        config.negotiation.signal_buffer = 1;
        let hub = SignalingHub::from_config(&config);
        let _mailbox = hub.register(&"b".into()).unwrap();

        hub.try_send(&"v".into(), &"b".into(), SignalMessage::Bye).unwrap();
        let err = hub
            .try_send(&"v".into(), &"b".into(), SignalMessage::Bye)
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionRefused { reason, .. } if reason == "mailbox full"));
    }

    #[tokio::test]
    async fn test_delivery() {
        let hub = SignalingHub::new(8);
        let mut mailbox = hub.register(&"b".into()).unwrap();

        hub.send(&"v".into(), &"b".into(), SignalMessage::Offer { sdp: "v=0".into() })
            .await
            .unwrap();
        let envelope = mailbox.recv().await.unwrap();
        assert_eq!(envelope.from, PeerId::from("v"));
        assert_eq!(envelope.message.description().unwrap().kind, SdpKind::Offer);
    }
}
