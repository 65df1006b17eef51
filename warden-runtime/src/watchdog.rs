//! Heartbeat watchdog
//!
//! Tracks heartbeat times per supervised unit and decides which units have
//! gone quiet long enough to be restarted.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

/// Restart decision inputs, all in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub stale_after_ms: i64,
    pub restart_cooldown_ms: i64,
    pub startup_grace_ms: i64,
}

impl RestartPolicy {
    pub fn new(stale_after: Duration, restart_cooldown: Duration, startup_grace: Duration) -> Self {
        Self {
            stale_after_ms: duration_ms(stale_after),
            restart_cooldown_ms: duration_ms(restart_cooldown),
            startup_grace_ms: duration_ms(startup_grace),
        }
    }

    /// Unit is quiet, not freshly restarted and past its startup grace
    ///
    /// A unit that never reported is measured from its start time; a unit
    /// that never restarted counts as cooled.
    pub fn should_restart(&self, now_ms: i64, times: &UnitTimes) -> bool {
        let last_seen = times.last_heartbeat_at_ms.unwrap_or(times.started_at_ms);
        let stale = now_ms - last_seen >= self.stale_after_ms;
        let cooled = times
            .last_restart_at_ms
            .map_or(true, |at| now_ms - at >= self.restart_cooldown_ms);
        let grace_over = now_ms - times.started_at_ms >= self.startup_grace_ms;

        stale && cooled && grace_over
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(60),
            Duration::from_secs(30),
            Duration::from_secs(20),
        )
    }
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Bookkeeping for one unit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnitTimes {
    pub started_at_ms: i64,
    pub last_heartbeat_at_ms: Option<i64>,
    pub last_restart_at_ms: Option<i64>,
}

/// A category, or one wallet of a per-wallet category
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitKey {
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet: Option<String>,
}

impl UnitKey {
    pub fn category(category: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            wallet: None,
        }
    }

    pub fn wallet(category: impl Into<String>, wallet: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            wallet: Some(wallet.into()),
        }
    }
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.wallet {
            Some(wallet) => write!(f, "{}[{}]", self.category, wallet),
            None => f.write_str(&self.category),
        }
    }
}

/// Last heartbeat content seen for a unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRecord {
    pub ts: i64,
    pub status: String,
    pub counters_by_domain: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Default)]
struct UnitState {
    times: UnitTimes,
    last: Option<HeartbeatRecord>,
}

/// Per-unit heartbeat bookkeeping plus the restart decision
#[derive(Debug)]
pub struct HeartbeatWatchdog {
    policy: RestartPolicy,
    units: Mutex<HashMap<UnitKey, UnitState>>,
}

impl HeartbeatWatchdog {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            units: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }

    /// Start tracking a (re)spawned unit; heartbeat bookkeeping starts empty
    pub fn register(&self, key: UnitKey, started_at_ms: i64) {
        let mut units = self.units.lock();
        let state = units.entry(key).or_default();
        state.times.started_at_ms = started_at_ms;
        state.times.last_heartbeat_at_ms = None;
        state.last = None;
    }

    /// Record a heartbeat; returns false if it was older than the last one
    pub fn record_heartbeat(&self, key: &UnitKey, record: HeartbeatRecord) -> bool {
        let mut units = self.units.lock();
        let Some(state) = units.get_mut(key) else {
            debug!(unit = %key, "Heartbeat for an unknown unit");
            return false;
        };

        if let Some(last) = &state.last {
            if record.ts < last.ts {
                debug!(unit = %key, ts = record.ts, last = last.ts, "Ignoring out-of-order heartbeat");
                return false;
            }
        }

        state.times.last_heartbeat_at_ms = Some(record.ts);
        state.last = Some(record);
        true
    }

    /// Note a restart; the replacement starts with fresh bookkeeping
    pub fn mark_restarted(&self, key: &UnitKey, now_ms: i64) {
        let mut units = self.units.lock();
        let state = units.entry(key.clone()).or_default();
        state.times = UnitTimes {
            started_at_ms: now_ms,
            last_heartbeat_at_ms: None,
            last_restart_at_ms: Some(now_ms),
        };
        state.last = None;
    }

    pub fn remove(&self, key: &UnitKey) -> bool {
        self.units.lock().remove(key).is_some()
    }

    pub fn times(&self, key: &UnitKey) -> Option<UnitTimes> {
        self.units.lock().get(key).map(|state| state.times)
    }

    pub fn last_heartbeat(&self, key: &UnitKey) -> Option<HeartbeatRecord> {
        self.units.lock().get(key).and_then(|state| state.last.clone())
    }

    pub fn units(&self) -> Vec<UnitKey> {
        let mut keys: Vec<_> = self.units.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Units due for a restart at `now_ms`, in key order
    pub fn tick(&self, now_ms: i64) -> Vec<UnitKey> {
        let units = self.units.lock();
        let mut due: Vec<UnitKey> = units
            .iter()
            .filter(|(_, state)| self.policy.should_restart(now_ms, &state.times))
            .map(|(key, _)| key.clone())
            .collect();
        due.sort();

        for key in &due {
            if let Some(state) = units.get(key) {
                let since = state.times.last_heartbeat_at_ms.unwrap_or(state.times.started_at_ms);
                info!(
                    unit = %key,
                    quiet_ms = now_ms - since,
                    reported = state.times.last_heartbeat_at_ms.is_some(),
                    "Unit is stale"
                );
            }
        }
        due
    }
}
