//! In-process transport
//!
//! Two endpoints link once each side has a local description, knows the
//! other through its remote description, and has applied at least one
//! remote candidate. Linked endpoints hand each other their outgoing
//! tracks directly. The network can be made unreachable, stalled (probes
//! fail silently) or severed (transport reports a disconnect) per peer.

use super::{
    IceCandidate, PeerTransport, SdpKind, SessionDescription, TransportEvent, TransportEventSender,
    TransportFactory, TransportState,
};
use crate::capture::{MediaTrack, TrackKind};
use crate::error::{Error, Result};
use crate::types::PeerId;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

const ENDPOINT_ATTRIBUTE: &str = "a=loopback-endpoint:";

#[derive(Default)]
struct EndpointState {
    offered: bool,
    local_description: bool,
    remote_endpoint: Option<String>,
    remote_offer_applied: bool,
    /// Remote candidates in the order they were applied
    candidates: Vec<IceCandidate>,
    linked: bool,
    stalled: bool,
    severed: bool,
    closed: bool,
    outgoing: HashMap<TrackKind, MediaTrack>,
}

struct Endpoint {
    id: String,
    local: PeerId,
    remote: PeerId,
    events: TransportEventSender,
    state: Mutex<EndpointState>,
}

impl Endpoint {
    fn emit(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            trace!(endpoint = %self.id, "Transport event receiver gone");
        }
    }

    /// Remote endpoint id if this side is ready to link
    fn ready_for(&self) -> Option<String> {
        let state = self.state.lock();
        if state.closed || state.linked || !state.local_description || state.candidates.is_empty() {
            return None;
        }
        state.remote_endpoint.clone()
    }

    fn mark_linked(&self) -> Vec<MediaTrack> {
        let mut state = self.state.lock();
        state.linked = true;
        state.outgoing.values().cloned().collect()
    }

    fn involves(&self, peer: &PeerId) -> bool {
        &self.local == peer || &self.remote == peer
    }

    fn hang_up(&self) {
        let was_linked = {
            let mut state = self.state.lock();
            std::mem::replace(&mut state.linked, false)
        };
        if was_linked {
            self.emit(TransportEvent::StateChanged(TransportState::Closed));
        }
    }
}

/// Shared in-process "network" that loopback transports connect through
pub struct LoopbackNetwork {
    this: Weak<LoopbackNetwork>,
    endpoints: DashMap<String, Arc<Endpoint>>,
    unreachable: AtomicBool,
    link_lock: Mutex<()>,
    sequence: AtomicU64,
}

impl LoopbackNetwork {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            endpoints: DashMap::new(),
            unreachable: AtomicBool::new(false),
            link_lock: Mutex::new(()),
            sequence: AtomicU64::new(1),
        })
    }

    /// While unreachable, endpoints negotiate but never link
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::Release);
    }

    /// Make probes on every path of `peer` fail without any transport signal
    pub fn stall(&self, peer: &PeerId) {
        for endpoint in self.endpoints_of(peer) {
            endpoint.state.lock().stalled = true;
        }
        debug!(peer_id = %peer, "Stalled loopback paths");
    }

    /// Cut every path of `peer`; linked endpoints report a disconnect
    pub fn sever(&self, peer: &PeerId) {
        for endpoint in self.endpoints_of(peer) {
            let linked = {
                let mut state = endpoint.state.lock();
                state.severed = true;
                state.linked
            };
            if linked {
                endpoint.emit(TransportEvent::StateChanged(TransportState::Disconnected));
            }
        }
        debug!(peer_id = %peer, "Severed loopback paths");
    }

    /// Undo [`stall`](Self::stall) and [`sever`](Self::sever)
    pub fn heal(&self, peer: &PeerId) {
        for endpoint in self.endpoints_of(peer) {
            let reconnected = {
                let mut state = endpoint.state.lock();
                let was_severed = std::mem::replace(&mut state.severed, false);
                state.stalled = false;
                was_severed && state.linked
            };
            if reconnected {
                endpoint.emit(TransportEvent::StateChanged(TransportState::Connected));
            }
        }
        debug!(peer_id = %peer, "Healed loopback paths");
    }

    /// Number of endpoints not yet closed
    #[must_use]
    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    /// Remote candidates applied on the `local` -> `remote` endpoint, in order
    #[must_use]
    pub fn applied_candidates(&self, local: &PeerId, remote: &PeerId) -> Vec<IceCandidate> {
        self.endpoints
            .iter()
            .find(|e| &e.local == local && &e.remote == remote)
            .map(|e| e.state.lock().candidates.clone())
            .unwrap_or_default()
    }

    fn endpoints_of(&self, peer: &PeerId) -> Vec<Arc<Endpoint>> {
        self.endpoints
            .iter()
            .filter(|e| e.involves(peer))
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    fn endpoint(&self, id: &str) -> Option<Arc<Endpoint>> {
        self.endpoints.get(id).map(|e| Arc::clone(e.value()))
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Link `endpoint` with its remote if both sides are ready
    fn try_link(&self, endpoint: &Arc<Endpoint>) {
        if self.unreachable.load(Ordering::Acquire) {
            return;
        }
        let _guard = self.link_lock.lock();

        let Some(remote_id) = endpoint.ready_for() else {
            return;
        };
        let Some(remote) = self.endpoint(&remote_id) else {
            return;
        };
        if remote.ready_for().as_deref() != Some(endpoint.id.as_str()) {
            return;
        }

        let ours = endpoint.mark_linked();
        let theirs = remote.mark_linked();
        for track in ours {
            remote.emit(TransportEvent::RemoteTrack(track));
        }
        for track in theirs {
            endpoint.emit(TransportEvent::RemoteTrack(track));
        }
        endpoint.emit(TransportEvent::StateChanged(TransportState::Connected));
        remote.emit(TransportEvent::StateChanged(TransportState::Connected));

        debug!(
            local = %endpoint.local,
            remote = %endpoint.remote,
            "Loopback endpoints linked"
        );
    }
}

#[async_trait]
impl TransportFactory for LoopbackNetwork {
    async fn create(
        &self,
        local: &PeerId,
        remote: &PeerId,
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerTransport>> {
        let network = self
            .this
            .upgrade()
            .ok_or_else(|| Error::Transport("loopback network dropped".to_string()))?;

        let endpoint = Arc::new(Endpoint {
            id: uuid::Uuid::new_v4().to_string(),
            local: local.clone(),
            remote: remote.clone(),
            events,
            state: Mutex::new(EndpointState::default()),
        });
        self.endpoints.insert(endpoint.id.clone(), Arc::clone(&endpoint));

        Ok(Arc::new(LoopbackTransport { endpoint, network }))
    }
}

/// One endpoint of the loopback network
pub struct LoopbackTransport {
    endpoint: Arc<Endpoint>,
    network: Arc<LoopbackNetwork>,
}

impl LoopbackTransport {
    #[must_use]
    pub fn endpoint_id(&self) -> &str {
        &self.endpoint.id
    }

    fn describe(&self) -> String {
        format!(
            "v=0\r\no=- {} 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n{}{}\r\n",
            self.network.next_sequence(),
            ENDPOINT_ATTRIBUTE,
            self.endpoint.id
        )
    }

    fn gather(&self) {
        let port = 40_000 + (self.network.next_sequence() % 20_000);
        let candidate = IceCandidate {
            candidate: format!("candidate:1 1 udp 2130706431 127.0.0.1 {port} typ host"),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };
        self.endpoint.emit(TransportEvent::LocalCandidate(candidate));
    }

    fn ensure_open(&self) -> Result<()> {
        if self.endpoint.state.lock().closed {
            return Err(Error::Transport("transport is closed".to_string()));
        }
        Ok(())
    }
}

fn parse_endpoint(sdp: &str) -> Option<&str> {
    sdp.lines()
        .find_map(|line| line.strip_prefix(ENDPOINT_ATTRIBUTE))
        .map(str::trim)
        .filter(|id| !id.is_empty())
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        {
            let mut state = self.endpoint.state.lock();
            state.offered = true;
            state.local_description = true;
        }
        let offer = SessionDescription::offer(self.describe());
        self.gather();
        self.network.try_link(&self.endpoint);
        Ok(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        {
            let mut state = self.endpoint.state.lock();
            if !state.remote_offer_applied {
                return Err(Error::NegotiationFailed(
                    "cannot answer without a remote offer".to_string(),
                ));
            }
            state.local_description = true;
        }
        let answer = SessionDescription::answer(self.describe());
        self.gather();
        self.network.try_link(&self.endpoint);
        Ok(answer)
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.ensure_open()?;
        let remote_id = parse_endpoint(&description.sdp)
            .ok_or_else(|| Error::NegotiationFailed("description has no endpoint".to_string()))?
            .to_string();
        if self.network.endpoint(&remote_id).is_none() {
            return Err(Error::NegotiationFailed(format!(
                "unknown remote endpoint {remote_id}"
            )));
        }

        {
            let mut state = self.endpoint.state.lock();
            match description.kind {
                SdpKind::Offer if state.offered => {
                    return Err(Error::NegotiationFailed("offer collision".to_string()));
                }
                SdpKind::Answer if !state.offered => {
                    return Err(Error::NegotiationFailed(
                        "answer without a local offer".to_string(),
                    ));
                }
                SdpKind::Offer => state.remote_offer_applied = true,
                SdpKind::Answer => {}
            }
            state.remote_endpoint = Some(remote_id);
        }

        self.network.try_link(&self.endpoint);
        Ok(())
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.ensure_open()?;
        if !candidate.candidate.starts_with("candidate:") {
            return Err(Error::NegotiationFailed(format!(
                "malformed candidate {:?}",
                candidate.candidate
            )));
        }
        {
            let mut state = self.endpoint.state.lock();
            if state.remote_endpoint.is_none() {
                return Err(Error::NegotiationFailed(
                    "candidate applied before remote description".to_string(),
                ));
            }
            state.candidates.push(candidate);
        }
        self.network.try_link(&self.endpoint);
        Ok(())
    }

    async fn replace_track(&self, kind: TrackKind, track: Option<MediaTrack>) -> Result<()> {
        let remote = {
            let mut state = self.endpoint.state.lock();
            if state.closed {
                return Err(Error::Transport("transport is closed".to_string()));
            }
            match &track {
                Some(t) => {
                    state.outgoing.insert(kind, t.clone());
                }
                None => {
                    state.outgoing.remove(&kind);
                }
            }
            if state.linked && !state.severed {
                state.remote_endpoint.clone()
            } else {
                None
            }
        };

        if let Some(remote) = remote.and_then(|id| self.network.endpoint(&id)) {
            remote.emit(match track {
                Some(t) => TransportEvent::RemoteTrack(t),
                None => TransportEvent::RemoteTrackRemoved(kind),
            });
        }
        Ok(())
    }

    async fn probe(&self) -> Result<()> {
        let state = self.endpoint.state.lock();
        if state.closed {
            return Err(Error::TransportLost("transport is closed".to_string()));
        }
        if !state.linked {
            return Err(Error::TransportLost("not connected".to_string()));
        }
        if state.stalled || state.severed {
            return Err(Error::TransportLost("probe unanswered".to_string()));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let (was_linked, remote) = {
            let mut state = self.endpoint.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.outgoing.clear();
            (
                std::mem::replace(&mut state.linked, false),
                state.remote_endpoint.clone(),
            )
        };

        self.network.endpoints.remove(&self.endpoint.id);
        self.endpoint
            .emit(TransportEvent::StateChanged(TransportState::Closed));

        if was_linked {
            if let Some(remote) = remote.and_then(|id| self.network.endpoint(&id)) {
                remote.hang_up();
            }
        }
        Ok(())
    }
}
