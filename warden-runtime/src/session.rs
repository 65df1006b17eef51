//! Session lifecycle for one supervisor run
//!
//! A session is opened once at startup, touched on every watchdog tick and
//! closed exactly once on shutdown. A session still open at startup belongs
//! to a crashed predecessor and is closed with reason `crash`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;
use warden_resilience::{RetryExecutor, RetryPolicy, Retryable};
use warden_storage::{NewSession, SessionEnd, SessionRecord, SessionStats, SessionStore};

use crate::error::SessionError;

pub const CRASH_REASON: &str = "crash";

/// Position in the external stream: a monotonically increasing slot and its time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Anchor {
    pub slot: u64,
    /// Unix seconds
    pub block_time: Option<i64>,
}

#[async_trait]
pub trait LivenessAnchorSource: Send + Sync {
    async fn fetch_anchor(&self) -> anyhow::Result<Anchor>;
}

/// Local stand-in: wall-clock seconds, forced to increase on every fetch
#[derive(Debug, Default)]
pub struct SystemAnchorSource {
    last_slot: AtomicU64,
}

impl SystemAnchorSource {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LivenessAnchorSource for SystemAnchorSource {
    async fn fetch_anchor(&self) -> anyhow::Result<Anchor> {
        let now = Utc::now().timestamp();
        let candidate = u64::try_from(now).unwrap_or(0);
        let previous = self
            .last_slot
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(candidate.max(last + 1))
            })
            .unwrap_or_default();
        Ok(Anchor {
            slot: candidate.max(previous + 1),
            block_time: Some(now),
        })
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Service instance id the sessions are recorded under
    pub service_name: String,
    pub anchor_max_attempts: u32,
    pub anchor_retry_delay: Duration,
    pub anchor_retry_cap: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            service_name: "warden".to_string(),
            anchor_max_attempts: 5,
            anchor_retry_delay: Duration::from_millis(500),
            anchor_retry_cap: Duration::from_secs(5),
        }
    }
}

/// Explicit values for closing a session; unset fields use the last anchor
#[derive(Debug, Clone, Default)]
pub struct FinalizeOverrides {
    pub slot: Option<u64>,
    pub block_time: Option<i64>,
    pub ended_at: Option<DateTime<Utc>>,
}

struct AnchorFetchError(anyhow::Error);

impl fmt::Display for AnchorFetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.0)
    }
}

impl Retryable for AnchorFetchError {
    fn is_retryable(&self) -> bool {
        true
    }
}

pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    anchors: Arc<dyn LivenessAnchorSource>,
    options: SessionOptions,
    current: Mutex<Option<Uuid>>,
    last_anchor: parking_lot::Mutex<Option<Anchor>>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        anchors: Arc<dyn LivenessAnchorSource>,
        options: SessionOptions,
    ) -> Self {
        Self {
            store,
            anchors,
            options,
            current: Mutex::new(None),
            last_anchor: parking_lot::Mutex::new(None),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.options.service_name
    }

    pub async fn current_session_id(&self) -> Option<Uuid> {
        *self.current.lock().await
    }

    pub fn last_anchor(&self) -> Option<Anchor> {
        *self.last_anchor.lock()
    }

    /// Open a session unless one is already open for this manager
    pub async fn ensure_session_started(&self) -> Result<Uuid, SessionError> {
        let mut current = self.current.lock().await;
        if let Some(id) = *current {
            return Ok(id);
        }

        let anchor = self.fetch_anchor_with_retry().await?;
        let record = self
            .store
            .start_session(NewSession {
                service_instance_id: self.options.service_name.clone(),
                start_slot: anchor.slot,
                start_block_time: anchor.block_time,
                started_at: Utc::now(),
            })
            .await?;

        *self.last_anchor.lock() = Some(anchor);
        *current = Some(record.id);
        info!(
            service = %self.options.service_name,
            session_id = %record.id,
            slot = anchor.slot,
            "Session started"
        );
        Ok(record.id)
    }

    /// Close a session left open by a crashed previous run
    pub async fn close_stale_session(&self) -> Result<Option<SessionRecord>, SessionError> {
        let current = *self.current.lock().await;
        let Some(stale) = self
            .store
            .find_open_session(&self.options.service_name)
            .await?
        else {
            debug!(service = %self.options.service_name, "No stale session");
            return Ok(None);
        };
        if Some(stale.id) == current {
            return Ok(None);
        }

        let closed = self
            .store
            .end_session(
                stale.id,
                SessionEnd {
                    reason: CRASH_REASON.to_string(),
                    ended_at: stale.last_heartbeat_at.unwrap_or_else(Utc::now),
                    slot: stale.last_heartbeat_slot,
                    block_time: stale.last_heartbeat_block_time,
                },
            )
            .await?;

        warn!(
            service = %self.options.service_name,
            session_id = %closed.id,
            started_at = %closed.started_at,
            "Closed session left open by a previous run"
        );
        Ok(Some(closed))
    }

    /// Touch the open session; fetches a fresh anchor when none is given
    pub async fn record_heartbeat(&self, anchor: Option<Anchor>) -> Result<(), SessionError> {
        let Some(id) = *self.current.lock().await else {
            return Ok(());
        };

        let anchor = match anchor {
            Some(anchor) => Some(anchor),
            None => match self.anchors.fetch_anchor().await {
                Ok(anchor) => Some(anchor),
                Err(e) => {
                    debug!(error = %e, "Anchor unavailable for session heartbeat");
                    None
                }
            },
        };
        if let Some(anchor) = anchor {
            *self.last_anchor.lock() = Some(anchor);
        }

        self.store
            .update_session_stats(
                id,
                SessionStats {
                    heartbeat_at: Some(Utc::now()),
                    slot: anchor.map(|a| a.slot),
                    block_time: anchor.and_then(|a| a.block_time),
                },
            )
            .await?;
        Ok(())
    }

    /// Close the open session; later calls are no-ops
    pub async fn finalize_session(
        &self,
        reason: &str,
        overrides: FinalizeOverrides,
    ) -> Result<Option<SessionRecord>, SessionError> {
        let mut current = self.current.lock().await;
        let Some(id) = *current else {
            return Ok(None);
        };

        let anchor = self.last_anchor();
        let end = SessionEnd {
            reason: reason.to_string(),
            ended_at: overrides.ended_at.unwrap_or_else(Utc::now),
            slot: overrides.slot.or(anchor.map(|a| a.slot)),
            block_time: overrides
                .block_time
                .or(anchor.and_then(|a| a.block_time)),
        };

        match self.store.end_session(id, end).await {
            Ok(record) => {
                *current = None;
                info!(session_id = %id, reason, "Session finalized");
                Ok(Some(record))
            }
            Err(e) if e.is_not_found() => {
                *current = None;
                warn!(session_id = %id, "Session was already closed");
                Ok(None)
            }
            // Keep the id so finalizing can be retried
            Err(e) => Err(e.into()),
        }
    }

    async fn fetch_anchor_with_retry(&self) -> Result<Anchor, SessionError> {
        let policy = RetryPolicy::linear_capped(
            self.options.anchor_max_attempts,
            self.options.anchor_retry_delay,
            self.options.anchor_retry_cap,
        );
        RetryExecutor::new(policy)
            .named("fetch liveness anchor")
            .execute(|| async { self.anchors.fetch_anchor().await.map_err(AnchorFetchError) })
            .await
            .map_err(|e| SessionError::AnchorUnavailable {
                attempts: e.attempts(),
                message: e.into_inner().to_string(),
            })
    }
}
