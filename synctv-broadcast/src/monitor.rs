//! Connection state machine and health supervision
//!
//! ```text
//! new -> connecting            attempt initiated
//! connecting -> connected      negotiated and media path up
//! connecting -> failed         timeout or negotiation error
//! connected -> reconnecting    missed probes or transport signal lost
//! reconnecting -> connected    probe succeeds again
//! reconnecting -> failed       reconnect attempts exhausted
//! any non-closed -> closed     explicit stop by either side
//! ```
//!
//! One [`ConnectionMonitor`] task runs per [`PeerConnection`]. It is the only
//! consumer of the transport's events: it drives the state machine from them,
//! probes the media path periodically, schedules reconnection with
//! exponential backoff, and forwards everything else as [`ConnectionEvent`]s.

use crate::capture::{MediaTrack, TrackKind};
use crate::config::BroadcastConfig;
use crate::error::Error;
use crate::peer::PeerConnection;
use crate::transport::{IceCandidate, TransportEvent, TransportEvents, TransportState};
use crate::types::{ConnectionId, PeerId};
use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
    Closed,
}

impl ConnectionState {
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::{Closed, Connected, Connecting, Failed, New, Reconnecting};
        matches!(
            (self, next),
            (New, Connecting)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connected, Reconnecting)
                | (Reconnecting, Connected)
                | (Reconnecting, Failed)
                | (New | Connecting | Connected | Reconnecting | Failed, Closed)
        )
    }

    /// No further transitions except an explicit close
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum ConnectionEventKind {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
        cause: Option<Error>,
    },
    /// Gathered locally; must be signaled to the far end
    LocalCandidate(IceCandidate),
    RemoteTrack(MediaTrack),
    RemoteTrackRemoved(TrackKind),
}

/// Something that happened on one connection
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    pub connection: ConnectionId,
    pub remote: PeerId,
    pub kind: ConnectionEventKind,
}

pub type ConnectionEvents = mpsc::UnboundedReceiver<ConnectionEvent>;

/// Timing knobs of one monitor task
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub probe_interval: Duration,
    pub missed_probe_threshold: u32,
    pub negotiation_timeout: Duration,
    pub reconnect_base_delay: Duration,
    pub reconnect_factor: f32,
    pub max_reconnect_attempts: u32,
}

impl MonitorSettings {
    #[must_use]
    pub fn from_config(config: &BroadcastConfig) -> Self {
        Self {
            probe_interval: config.monitor.probe_interval(),
            missed_probe_threshold: config.monitor.missed_probe_threshold,
            negotiation_timeout: config.negotiation.timeout(),
            reconnect_base_delay: config.monitor.reconnect_base_delay(),
            reconnect_factor: config.monitor.reconnect_factor,
            max_reconnect_attempts: config.monitor.max_reconnect_attempts,
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBuilder::default()
            .with_min_delay(self.reconnect_base_delay)
            .with_factor(self.reconnect_factor)
            .with_max_delay(Duration::from_secs(3600))
            .with_max_times(self.max_reconnect_attempts as usize)
            .build()
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self::from_config(&BroadcastConfig::default())
    }
}

/// Handle to a running monitor task
pub struct ConnectionMonitor {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ConnectionMonitor {
    /// Start supervising `peer`. Takes the peer's transport event stream, so
    /// it can be spawned once per connection.
    #[must_use]
    pub fn spawn(
        peer: Arc<PeerConnection>,
        settings: MonitorSettings,
        cancel: CancellationToken,
    ) -> Self {
        let events = peer.take_transport_events();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            MonitorTask::new(peer, settings).run(events, task_cancel).await;
        });
        Self { cancel, task }
    }

    /// Stop supervising without touching the connection
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the task to exit
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!(error = %e, "Connection monitor task panicked");
        }
    }
}

struct Reconnect {
    backoff: ExponentialBackoff,
    attempts: u32,
    next_attempt: Instant,
}

struct MonitorTask {
    peer: Arc<PeerConnection>,
    settings: MonitorSettings,
    negotiation_deadline: Option<Instant>,
    reconnect: Option<Reconnect>,
}

impl MonitorTask {
    fn new(peer: Arc<PeerConnection>, settings: MonitorSettings) -> Self {
        Self {
            peer,
            settings,
            negotiation_deadline: None,
            reconnect: None,
        }
    }

    async fn run(mut self, events: Option<TransportEvents>, cancel: CancellationToken) {
        let Some(mut events) = events else {
            warn!(connection_id = %self.peer.id(), "Transport events already taken, not monitoring");
            return;
        };
        let mut state_rx = self.peer.watch_state();
        let mut transport_open = true;

        let period = self.settings.probe_interval;
        let mut probes = interval_at(Instant::now() + period, period);
        probes.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.on_state(*state_rx.borrow_and_update());

        loop {
            if self.peer.state().is_terminal() {
                break;
            }
            let negotiation_deadline = self.negotiation_deadline;
            let reconnect_at = self.reconnect.as_ref().map(|r| r.next_attempt);

            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                event = events.recv(), if transport_open => match event {
                    Some(event) => self.on_transport_event(event).await,
                    None => {
                        debug!(connection_id = %self.peer.id(), "Transport event stream ended");
                        transport_open = false;
                    }
                },
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *state_rx.borrow_and_update();
                    self.on_state(state);
                }
                () = sleep_until_opt(negotiation_deadline) => self.on_negotiation_deadline(),
                () = sleep_until_opt(reconnect_at) => self.on_reconnect_attempt().await,
                _ = probes.tick() => self.on_probe_tick().await,
            }
        }

        debug!(
            connection_id = %self.peer.id(),
            state = %self.peer.state(),
            "Connection monitor stopped"
        );
    }

    fn on_state(&mut self, state: ConnectionState) {
        match state {
            ConnectionState::Connecting => {
                let since = self.peer.connecting_since().unwrap_or_else(Instant::now);
                self.negotiation_deadline = Some(since + self.settings.negotiation_timeout);
            }
            ConnectionState::Connected => {
                self.negotiation_deadline = None;
                self.reconnect = None;
            }
            ConnectionState::Reconnecting => {
                if self.reconnect.is_none() {
                    self.start_reconnect();
                }
            }
            ConnectionState::New | ConnectionState::Failed | ConnectionState::Closed => {
                self.negotiation_deadline = None;
                self.reconnect = None;
            }
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                self.peer.emit(ConnectionEventKind::LocalCandidate(candidate));
            }
            TransportEvent::RemoteTrack(track) => {
                self.peer.emit(ConnectionEventKind::RemoteTrack(track));
            }
            TransportEvent::RemoteTrackRemoved(kind) => {
                self.peer.emit(ConnectionEventKind::RemoteTrackRemoved(kind));
            }
            TransportEvent::StateChanged(transport) => self.on_transport_state(transport).await,
        }
    }

    async fn on_transport_state(&mut self, transport: TransportState) {
        let state = self.peer.state();
        match (state, transport) {
            (ConnectionState::Connecting | ConnectionState::Reconnecting, TransportState::Connected) => {
                self.peer.record_probe_success();
                self.move_to(ConnectionState::Connected, None);
            }
            (ConnectionState::Connected, TransportState::Disconnected | TransportState::Failed) => {
                self.move_to(
                    ConnectionState::Reconnecting,
                    Some(Error::TransportLost(format!("transport reported {transport:?}"))),
                );
            }
            (ConnectionState::Connecting, TransportState::Failed) => {
                self.move_to(
                    ConnectionState::Failed,
                    Some(Error::NegotiationFailed("transport failed during setup".to_string())),
                );
            }
            (_, TransportState::Closed) if !state.is_terminal() => {
                info!(
                    connection_id = %self.peer.id(),
                    remote = %self.peer.remote(),
                    "Far end closed the connection"
                );
                if let Err(e) = self.peer.close().await {
                    warn!(connection_id = %self.peer.id(), error = %e, "Failed to close transport");
                }
            }
            _ => {}
        }
    }

    fn on_negotiation_deadline(&mut self) {
        self.negotiation_deadline = None;
        if self.peer.state() == ConnectionState::Connecting {
            let timeout = self.settings.negotiation_timeout;
            warn!(
                connection_id = %self.peer.id(),
                remote = %self.peer.remote(),
                ?timeout,
                "Negotiation timed out"
            );
            self.move_to(ConnectionState::Failed, Some(Error::NegotiationTimeout(timeout)));
        }
    }

    async fn on_probe_tick(&mut self) {
        if self.peer.state() != ConnectionState::Connected {
            return;
        }
        match self.peer.probe().await {
            Ok(()) => self.peer.record_probe_success(),
            Err(e) => {
                let missed = self.peer.record_probe_miss(&e);
                debug!(connection_id = %self.peer.id(), missed, error = %e, "Health probe missed");
                if missed >= self.settings.missed_probe_threshold {
                    self.move_to(ConnectionState::Reconnecting, Some(e));
                }
            }
        }
    }

    fn start_reconnect(&mut self) {
        let mut backoff = self.settings.backoff();
        match backoff.next() {
            Some(delay) => {
                self.reconnect = Some(Reconnect {
                    backoff,
                    attempts: 0,
                    next_attempt: Instant::now() + delay,
                });
            }
            None => self.give_up(0),
        }
    }

    async fn on_reconnect_attempt(&mut self) {
        let Some(mut reconnect) = self.reconnect.take() else {
            return;
        };
        if self.peer.state() != ConnectionState::Reconnecting {
            return;
        }

        reconnect.attempts += 1;
        self.peer.record_reconnect_attempt();

        match self.peer.probe().await {
            Ok(()) => {
                info!(
                    connection_id = %self.peer.id(),
                    attempt = reconnect.attempts,
                    "Reconnected"
                );
                self.peer.record_probe_success();
                self.move_to(ConnectionState::Connected, None);
            }
            Err(e) => match reconnect.backoff.next() {
                Some(delay) => {
                    debug!(
                        connection_id = %self.peer.id(),
                        attempt = reconnect.attempts,
                        retry_in = ?delay,
                        error = %e,
                        "Reconnection attempt failed"
                    );
                    reconnect.next_attempt = Instant::now() + delay;
                    self.reconnect = Some(reconnect);
                }
                None => self.give_up(reconnect.attempts),
            },
        }
    }

    fn give_up(&mut self, attempts: u32) {
        warn!(
            connection_id = %self.peer.id(),
            remote = %self.peer.remote(),
            attempts,
            "Reconnection attempts exhausted"
        );
        self.move_to(ConnectionState::Failed, Some(Error::MaxReconnectExceeded { attempts }));
    }

    fn move_to(&mut self, next: ConnectionState, cause: Option<Error>) {
        match self.peer.transition_with_cause(next, cause) {
            Ok(_) => self.on_state(next),
            // Closed concurrently by the owner
            Err(e) => debug!(connection_id = %self.peer.id(), error = %e, "Skipped transition"),
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerConnectionFactory;
    use crate::transport::LoopbackNetwork;

    #[test]
    fn test_transition_table() {
        use ConnectionState::*;
        assert!(New.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Reconnecting));
        assert!(Reconnecting.can_transition_to(Connected));
        assert!(Reconnecting.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Closed));

        assert!(!Connected.can_transition_to(Connecting));
        assert!(!Failed.can_transition_to(Connecting));
        assert!(!Closed.can_transition_to(Closed));
        assert!(!New.can_transition_to(Connected));
    }

    async fn connected_pair(
        network: &Arc<LoopbackNetwork>,
    ) -> (Arc<PeerConnection>, Arc<PeerConnection>, ConnectionMonitor, ConnectionMonitor) {
        let factory = PeerConnectionFactory::new(network.clone(), BroadcastConfig::default());
        let a = factory.create(&PeerId::from("a"), &PeerId::from("b")).await.unwrap();
        let b = factory.create(&PeerId::from("b"), &PeerId::from("a")).await.unwrap();
        a.begin_connecting().unwrap();
        b.begin_connecting().unwrap();
        let ma = ConnectionMonitor::spawn(a.clone(), MonitorSettings::default(), CancellationToken::new());
        let mb = ConnectionMonitor::spawn(b.clone(), MonitorSettings::default(), CancellationToken::new());

        let mut a_events = a.take_events().unwrap();
        let mut b_events = b.take_events().unwrap();

        let offer = a.create_offer().await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        // Exchange one candidate each way
        let a_candidate = next_candidate(&mut a_events).await;
        let b_candidate = next_candidate(&mut b_events).await;
        a.add_candidate(b_candidate).await.unwrap();
        b.add_candidate(a_candidate).await.unwrap();

        let mut a_state = a.watch_state();
        a_state.wait_for(|s| *s == ConnectionState::Connected).await.unwrap();
        let mut b_state = b.watch_state();
        b_state.wait_for(|s| *s == ConnectionState::Connected).await.unwrap();
        (a, b, ma, mb)
    }

    async fn next_candidate(events: &mut ConnectionEvents) -> IceCandidate {
        loop {
            let event = events.recv().await.unwrap();
            if let ConnectionEventKind::LocalCandidate(c) = event.kind {
                return c;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_missed_probes_then_reconnecting() {
        let network = LoopbackNetwork::new();
        let (a, _b, _ma, _mb) = connected_pair(&network).await;
        let connected_at = Instant::now();

        network.stall(&PeerId::from("a"));

        let mut state = a.watch_state();
        state
            .wait_for(|s| *s == ConnectionState::Reconnecting)
            .await
            .unwrap();
        // First miss at one period, second at two
        assert!(Instant::now() - connected_at >= Duration::from_secs(10));
        assert!(Instant::now() - connected_at < Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let network = LoopbackNetwork::new();
        let (a, _b, _ma, _mb) = connected_pair(&network).await;

        network.stall(&PeerId::from("a"));
        let mut state = a.watch_state();
        state
            .wait_for(|s| *s == ConnectionState::Reconnecting)
            .await
            .unwrap();
        let reconnecting_at = Instant::now();

        state.wait_for(|s| *s == ConnectionState::Failed).await.unwrap();
        // 1 + 2 + 4 + 8 + 16 seconds of backoff
        assert_eq!(Instant::now() - reconnecting_at, Duration::from_secs(31));
        assert_eq!(a.reconnect_attempts(), 5);
        assert!(matches!(
            a.last_error(),
            Some(Error::MaxReconnectExceeded { attempts: 5 })
        ));

        // No sixth attempt
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(a.reconnect_attempts(), 5);
        assert_eq!(a.state(), ConnectionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_when_path_heals() {
        let network = LoopbackNetwork::new();
        let (a, _b, _ma, _mb) = connected_pair(&network).await;
        let peer = PeerId::from("a");

        network.stall(&peer);
        let mut state = a.watch_state();
        state
            .wait_for(|s| *s == ConnectionState::Reconnecting)
            .await
            .unwrap();

        network.heal(&peer);
        state.wait_for(|s| *s == ConnectionState::Connected).await.unwrap();
        assert_eq!(a.reconnect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_loss_reconnects_immediately() {
        let network = LoopbackNetwork::new();
        let (a, _b, _ma, _mb) = connected_pair(&network).await;
        let peer = PeerId::from("a");

        network.sever(&peer);
        let mut state = a.watch_state();
        state
            .wait_for(|s| *s == ConnectionState::Reconnecting)
            .await
            .unwrap();
        assert!(matches!(a.last_error(), Some(Error::TransportLost(_))));

        network.heal(&peer);
        state.wait_for(|s| *s == ConnectionState::Connected).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_negotiation_timeout_fails_connection() {
        let network = LoopbackNetwork::new();
        network.set_unreachable(true);
        let factory = PeerConnectionFactory::new(network.clone(), BroadcastConfig::default());
        let a = factory.create(&PeerId::from("a"), &PeerId::from("b")).await.unwrap();
        a.begin_connecting().unwrap();
        let started = Instant::now();
        let monitor = ConnectionMonitor::spawn(a.clone(), MonitorSettings::default(), CancellationToken::new());

        a.create_offer().await.unwrap();
        let mut state = a.watch_state();
        state.wait_for(|s| *s == ConnectionState::Failed).await.unwrap();
        assert_eq!(Instant::now() - started, Duration::from_secs(10));
        assert!(matches!(a.last_error(), Some(Error::NegotiationTimeout(_))));

        monitor.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_far_end_close_closes_connection() {
        let network = LoopbackNetwork::new();
        let (a, b, ma, _mb) = connected_pair(&network).await;

        b.close().await.unwrap();
        let mut state = a.watch_state();
        state.wait_for(|s| *s == ConnectionState::Closed).await.unwrap();
        ma.join().await;
        assert_eq!(network.endpoint_count(), 0);
    }
}
