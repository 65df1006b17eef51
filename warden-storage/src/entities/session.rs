//! Session markers bracketing one continuous supervisor run

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One supervisor run, open until `ended_at` is set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: Uuid,
    pub service_instance_id: String,
    pub start_slot: u64,
    pub start_block_time: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub last_heartbeat_slot: Option<u64>,
    pub last_heartbeat_block_time: Option<i64>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_reason: Option<String>,
}

impl SessionRecord {
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// Data needed to open a session
#[derive(Debug, Clone)]
pub struct NewSession {
    pub service_instance_id: String,
    pub start_slot: u64,
    pub start_block_time: Option<i64>,
    pub started_at: DateTime<Utc>,
}

impl NewSession {
    pub fn into_record(self) -> SessionRecord {
        SessionRecord {
            id: Uuid::new_v4(),
            service_instance_id: self.service_instance_id,
            start_slot: self.start_slot,
            start_block_time: self.start_block_time,
            started_at: self.started_at,
            last_heartbeat_at: None,
            last_heartbeat_slot: None,
            last_heartbeat_block_time: None,
            ended_at: None,
            end_reason: None,
        }
    }
}

/// Heartbeat update for an open session
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub slot: Option<u64>,
    pub block_time: Option<i64>,
}

/// How a session was closed
#[derive(Debug, Clone)]
pub struct SessionEnd {
    pub reason: String,
    pub ended_at: DateTime<Utc>,
    pub slot: Option<u64>,
    pub block_time: Option<i64>,
}

impl SessionRecord {
    pub(crate) fn apply_stats(&mut self, stats: &SessionStats) {
        if let Some(at) = stats.heartbeat_at {
            self.last_heartbeat_at = Some(at);
        }
        if let Some(slot) = stats.slot {
            // Slots only move forward
            self.last_heartbeat_slot = Some(self.last_heartbeat_slot.map_or(slot, |s| s.max(slot)));
        }
        if let Some(block_time) = stats.block_time {
            self.last_heartbeat_block_time = Some(block_time);
        }
    }

    pub(crate) fn apply_end(&mut self, end: &SessionEnd) {
        self.apply_stats(&SessionStats {
            heartbeat_at: None,
            slot: end.slot,
            block_time: end.block_time,
        });
        self.ended_at = Some(end.ended_at);
        self.end_reason = Some(end.reason.clone());
    }
}
