//! Peer connections
//!
//! This module handles:
//! - Creating one transport per remote peer through a [`TransportFactory`]
//! - Offer/answer negotiation with candidate buffering
//! - The validated connection state and its health record
//! - The per-connection event channel

use crate::capture::{MediaTrack, TrackKind};
use crate::config::BroadcastConfig;
use crate::error::{Error, Result};
use crate::monitor::{ConnectionEvent, ConnectionEventKind, ConnectionEvents, ConnectionState};
use crate::transport::{
    IceCandidate, PeerTransport, SessionDescription, TransportEvents, TransportFactory,
};
use crate::types::{ConnectionId, PeerId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Creates [`PeerConnection`]s over a shared transport implementation
pub struct PeerConnectionFactory {
    transports: Arc<dyn TransportFactory>,
    config: Arc<BroadcastConfig>,
    next_id: AtomicU64,
}

impl PeerConnectionFactory {
    pub fn new(transports: Arc<dyn TransportFactory>, config: BroadcastConfig) -> Self {
        Self {
            transports,
            config: Arc::new(config),
            next_id: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn config(&self) -> &Arc<BroadcastConfig> {
        &self.config
    }

    /// Create a connection from `local` to `remote`, in state `new`
    pub async fn create(&self, local: &PeerId, remote: &PeerId) -> Result<Arc<PeerConnection>> {
        let id = ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let transport = self.transports.create(local, remote, transport_tx).await?;

        debug!(connection_id = %id, local = %local, remote = %remote, "Created peer connection");

        Ok(Arc::new(PeerConnection::new(
            id,
            local.clone(),
            remote.clone(),
            transport,
            transport_rx,
        )))
    }
}

#[derive(Default)]
struct Negotiation {
    remote_description_set: bool,
    /// Candidates that arrived before the remote description, in arrival order
    pending: Vec<IceCandidate>,
}

#[derive(Default)]
struct Health {
    connecting_since: Option<Instant>,
    last_health_check: Option<Instant>,
    missed_probes: u32,
    reconnect_attempts: u32,
    last_error: Option<Error>,
}

/// One bidirectional connection to one remote peer.
///
/// Owned by the side that created it. State changes go through
/// [`transition_with_cause`](Self::transition_with_cause), which rejects
/// anything outside the state machine and publishes a
/// [`ConnectionEventKind::StateChanged`].
pub struct PeerConnection {
    id: ConnectionId,
    local: PeerId,
    remote: PeerId,
    transport: Arc<dyn PeerTransport>,
    state: watch::Sender<ConnectionState>,
    negotiation: tokio::sync::Mutex<Negotiation>,
    health: Mutex<Health>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    events_rx: Mutex<Option<ConnectionEvents>>,
    transport_events: Mutex<Option<TransportEvents>>,
    transport_closed: AtomicBool,
    created_at: Instant,
}

impl PeerConnection {
    fn new(
        id: ConnectionId,
        local: PeerId,
        remote: PeerId,
        transport: Arc<dyn PeerTransport>,
        transport_events: TransportEvents,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::New);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            id,
            local,
            remote,
            transport,
            state,
            negotiation: tokio::sync::Mutex::new(Negotiation::default()),
            health: Mutex::new(Health::default()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            transport_events: Mutex::new(Some(transport_events)),
            transport_closed: AtomicBool::new(false),
            created_at: Instant::now(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    #[must_use]
    pub fn local(&self) -> &PeerId {
        &self.local
    }

    /// Identity of the far end
    #[must_use]
    pub fn remote(&self) -> &PeerId {
        &self.remote
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    #[must_use]
    pub const fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Take the connection event receiver (can only be called once)
    pub fn take_events(&self) -> Option<ConnectionEvents> {
        self.events_rx.lock().take()
    }

    /// Taken by the connection's monitor
    pub(crate) fn take_transport_events(&self) -> Option<TransportEvents> {
        self.transport_events.lock().take()
    }

    pub(crate) fn emit(&self, kind: ConnectionEventKind) {
        let event = ConnectionEvent {
            connection: self.id,
            remote: self.remote.clone(),
            kind,
        };
        if self.events_tx.send(event).is_err() {
            debug!(connection_id = %self.id, "Connection event dropped, no receiver");
        }
    }

    /// `new -> connecting`
    pub fn begin_connecting(&self) -> Result<()> {
        self.transition(ConnectionState::Connecting).map(|_| ())
    }

    pub fn transition(&self, next: ConnectionState) -> Result<ConnectionState> {
        self.transition_with_cause(next, None)
    }

    /// Validated state change. Returns the previous state.
    pub fn transition_with_cause(
        &self,
        next: ConnectionState,
        cause: Option<Error>,
    ) -> Result<ConnectionState> {
        let mut previous = None;
        let mut rejected = None;
        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                previous = Some(*current);
                *current = next;
                true
            } else {
                rejected = Some(*current);
                false
            }
        });

        let Some(from) = previous else {
            return Err(Error::InvalidTransition {
                from: rejected.unwrap_or(next),
                to: next,
            });
        };

        {
            let mut health = self.health.lock();
            if next == ConnectionState::Connecting {
                health.connecting_since = Some(Instant::now());
            }
            if next == ConnectionState::Connected {
                health.missed_probes = 0;
            }
            if let Some(cause) = &cause {
                health.last_error = Some(cause.clone());
            }
        }

        match &cause {
            Some(e) => info!(
                connection_id = %self.id,
                remote = %self.remote,
                from = %from,
                to = %next,
                cause = %e,
                "Connection state changed"
            ),
            None => info!(
                connection_id = %self.id,
                remote = %self.remote,
                from = %from,
                to = %next,
                "Connection state changed"
            ),
        }

        self.emit(ConnectionEventKind::StateChanged {
            from,
            to: next,
            cause,
        });
        Ok(from)
    }

    /// Mark the connection failed, unless it already reached a terminal state
    pub fn fail(&self, cause: Error) {
        let state = self.state();
        if state.is_terminal() {
            return;
        }
        let next = if state.can_transition_to(ConnectionState::Failed) {
            ConnectionState::Failed
        } else {
            ConnectionState::Closed
        };
        if let Err(e) = self.transition_with_cause(next, Some(cause)) {
            debug!(connection_id = %self.id, error = %e, "Failure raced with another transition");
        }
    }

    pub async fn create_offer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        self.transport.create_offer().await
    }

    pub async fn create_answer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        self.transport.create_answer().await
    }

    /// Apply the remote description, then flush buffered candidates in the
    /// order they arrived
    pub async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.ensure_open()?;
        let mut negotiation = self.negotiation.lock().await;
        self.transport.set_remote_description(description).await?;
        negotiation.remote_description_set = true;

        let pending = std::mem::take(&mut negotiation.pending);
        if !pending.is_empty() {
            debug!(
                connection_id = %self.id,
                count = pending.len(),
                "Flushing buffered candidates"
            );
        }
        for candidate in pending {
            if let Err(e) = self.transport.add_candidate(candidate).await {
                warn!(connection_id = %self.id, error = %e, "Buffered candidate rejected");
            }
        }
        Ok(())
    }

    /// Apply a remote candidate, or buffer it until the remote description
    /// is set
    pub async fn add_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.ensure_open()?;
        let mut negotiation = self.negotiation.lock().await;
        if negotiation.remote_description_set {
            drop(negotiation);
            return self.transport.add_candidate(candidate).await;
        }
        negotiation.pending.push(candidate);
        debug!(
            connection_id = %self.id,
            buffered = negotiation.pending.len(),
            "Buffered candidate until remote description"
        );
        Ok(())
    }

    /// Number of candidates waiting for the remote description
    pub async fn pending_candidates(&self) -> usize {
        self.negotiation.lock().await.pending.len()
    }

    /// Swap the outgoing track of `kind` in place
    pub async fn replace_track(&self, kind: TrackKind, track: Option<MediaTrack>) -> Result<()> {
        self.ensure_open()?;
        self.transport.replace_track(kind, track).await
    }

    pub async fn probe(&self) -> Result<()> {
        self.transport.probe().await
    }

    /// Close the connection. Idempotent; the transport is closed once.
    pub async fn close(&self) -> Result<()> {
        if self.state() != ConnectionState::Closed {
            if let Err(e) = self.transition(ConnectionState::Closed) {
                debug!(connection_id = %self.id, error = %e, "Already closed");
            }
        }
        if self.transport_closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.transport.close().await
    }

    pub(crate) fn record_probe_success(&self) {
        let mut health = self.health.lock();
        health.last_health_check = Some(Instant::now());
        health.missed_probes = 0;
    }

    /// Returns consecutive misses including this one
    pub(crate) fn record_probe_miss(&self, error: &Error) -> u32 {
        let mut health = self.health.lock();
        health.missed_probes += 1;
        health.last_error = Some(error.clone());
        health.missed_probes
    }

    pub(crate) fn record_reconnect_attempt(&self) {
        self.health.lock().reconnect_attempts += 1;
    }

    /// Time of the last successful probe
    #[must_use]
    pub fn last_health_check(&self) -> Option<Instant> {
        self.health.lock().last_health_check
    }

    #[must_use]
    pub fn connecting_since(&self) -> Option<Instant> {
        self.health.lock().connecting_since
    }

    /// Reconnection attempts over the connection's lifetime
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.health.lock().reconnect_attempts
    }

    #[must_use]
    pub fn last_error(&self) -> Option<Error> {
        self.health.lock().last_error.clone()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state() == ConnectionState::Closed {
            return Err(Error::SessionClosed);
        }
        Ok(())
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
