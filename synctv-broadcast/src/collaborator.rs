//! The session collaborator: whatever owns the persisted session record
//!
//! The core only reads the declared quality and source mix, and sends
//! join/leave/heartbeat notifications. Notifications are fire-and-forget;
//! failures are logged and never affect connection state.

use crate::quality::QualityTier;
use crate::types::SessionId;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Which capture sources a session declares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMix {
    #[default]
    Camera,
    Screen,
    Both,
}

impl SourceMix {
    #[must_use]
    pub const fn camera(self) -> bool {
        matches!(self, Self::Camera | Self::Both)
    }

    #[must_use]
    pub const fn screen(self) -> bool {
        matches!(self, Self::Screen | Self::Both)
    }
}

/// Declared configuration of a session, as stored by the collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    #[serde(default)]
    pub quality: QualityTier,
    #[serde(default)]
    pub sources: SourceMix,
}

impl SessionRecord {
    pub fn new(session_id: impl Into<SessionId>) -> Self {
        Self {
            session_id: session_id.into(),
            quality: QualityTier::default(),
            sources: SourceMix::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Notification {
    Join,
    Leave,
    Heartbeat,
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Join => "join",
            Self::Leave => "leave",
            Self::Heartbeat => "heartbeat",
        })
    }
}

#[async_trait]
pub trait SessionCollaborator: Send + Sync {
    async fn session_record(&self, session: &SessionId) -> anyhow::Result<SessionRecord>;

    async fn join(&self, session: &SessionId) -> anyhow::Result<()>;

    async fn leave(&self, session: &SessionId) -> anyhow::Result<()>;

    async fn heartbeat(&self, session: &SessionId) -> anyhow::Result<()>;

    /// Advisory audience size, if the collaborator tracks one
    async fn viewer_count(&self, _session: &SessionId) -> anyhow::Result<Option<u64>> {
        Ok(None)
    }
}

async fn deliver(
    collaborator: &dyn SessionCollaborator,
    session: &SessionId,
    notification: Notification,
) {
    let result = match notification {
        Notification::Join => collaborator.join(session).await,
        Notification::Leave => collaborator.leave(session).await,
        Notification::Heartbeat => collaborator.heartbeat(session).await,
    };
    match result {
        Ok(()) => debug!(session_id = %session, %notification, "Notified collaborator"),
        Err(e) => warn!(
            session_id = %session,
            %notification,
            error = %e,
            "Collaborator notification failed"
        ),
    }
}

/// Send a notification in the background
pub fn notify(
    collaborator: Arc<dyn SessionCollaborator>,
    session: SessionId,
    notification: Notification,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        deliver(collaborator.as_ref(), &session, notification).await;
    })
}

/// Send a heartbeat every `period` until cancelled
pub fn spawn_heartbeat(
    collaborator: Arc<dyn SessionCollaborator>,
    session: SessionId,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = interval_at(Instant::now() + period, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticks.tick() => {
                    deliver(collaborator.as_ref(), &session, Notification::Heartbeat).await;
                }
            }
        }
    })
}

/// Collaborator that accepts everything and stores nothing
#[derive(Debug, Default)]
pub struct NoopCollaborator;

#[async_trait]
impl SessionCollaborator for NoopCollaborator {
    async fn session_record(&self, session: &SessionId) -> anyhow::Result<SessionRecord> {
        Ok(SessionRecord::new(session.clone()))
    }

    async fn join(&self, _session: &SessionId) -> anyhow::Result<()> {
        Ok(())
    }

    async fn leave(&self, _session: &SessionId) -> anyhow::Result<()> {
        Ok(())
    }

    async fn heartbeat(&self, _session: &SessionId) -> anyhow::Result<()> {
        Ok(())
    }
}

/// In-memory collaborator that records every notification
#[derive(Default)]
pub struct RecordingCollaborator {
    records: Mutex<HashMap<SessionId, SessionRecord>>,
    calls: Mutex<Vec<(Notification, SessionId)>>,
    failing: AtomicBool,
}

impl RecordingCollaborator {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert_record(&self, record: SessionRecord) {
        self.records.lock().insert(record.session_id.clone(), record);
    }

    /// Make every notification fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    #[must_use]
    pub fn calls(&self) -> Vec<(Notification, SessionId)> {
        self.calls.lock().clone()
    }

    #[must_use]
    pub fn count(&self, notification: Notification) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|(n, _)| *n == notification)
            .count()
    }

    fn record_call(&self, notification: Notification, session: &SessionId) -> anyhow::Result<()> {
        self.calls.lock().push((notification, session.clone()));
        if self.failing.load(Ordering::Acquire) {
            anyhow::bail!("collaborator unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl SessionCollaborator for RecordingCollaborator {
    async fn session_record(&self, session: &SessionId) -> anyhow::Result<SessionRecord> {
        self.records
            .lock()
            .get(session)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no record for session {session}"))
    }

    async fn join(&self, session: &SessionId) -> anyhow::Result<()> {
        self.record_call(Notification::Join, session)
    }

    async fn leave(&self, session: &SessionId) -> anyhow::Result<()> {
        self.record_call(Notification::Leave, session)
    }

    async fn heartbeat(&self, session: &SessionId) -> anyhow::Result<()> {
        self.record_call(Notification::Heartbeat, session)
    }

    async fn viewer_count(&self, session: &SessionId) -> anyhow::Result<Option<u64>> {
        let calls = self.calls.lock();
        let count = |n: Notification| {
            calls
                .iter()
                .filter(|(c, s)| *c == n && s == session)
                .count() as u64
        };
        Ok(Some(
            count(Notification::Join).saturating_sub(count(Notification::Leave)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_cadence() {
        let collaborator = RecordingCollaborator::new();
        let cancel = CancellationToken::new();
        let task = spawn_heartbeat(
            collaborator.clone(),
            SessionId::from("s"),
            Duration::from_secs(30),
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(collaborator.count(Notification::Heartbeat), 0);
        tokio::time::sleep(Duration::from_secs(62)).await;
        assert_eq!(collaborator.count(Notification::Heartbeat), 3);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_failures_are_swallowed() {
        let collaborator = RecordingCollaborator::new();
        collaborator.set_failing(true);

        notify(collaborator.clone(), SessionId::from("s"), Notification::Join)
            .await
            .unwrap();
        assert_eq!(collaborator.count(Notification::Join), 1);
    }

    #[tokio::test]
    async fn test_advisory_viewer_count() {
        let collaborator = RecordingCollaborator::new();
        let session = SessionId::from("s");
        collaborator.join(&session).await.unwrap();
        collaborator.join(&session).await.unwrap();
        collaborator.leave(&session).await.unwrap();
        collaborator.join(&SessionId::from("other")).await.unwrap();

        assert_eq!(collaborator.viewer_count(&session).await.unwrap(), Some(1));
    }

    #[test]
    fn test_source_mix() {
        assert!(SourceMix::Both.camera() && SourceMix::Both.screen());
        assert!(!SourceMix::Screen.camera());
        let record: SessionRecord =
            serde_json::from_str(r#"{"session_id":"s","quality":"high","sources":"both"}"#).unwrap();
        assert_eq!(record.quality, QualityTier::High);
        assert_eq!(record.sources, SourceMix::Both);
    }
}
