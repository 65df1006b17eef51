//! Reconnect supervision for one long-lived streaming connection
//!
//! Workers share a single streaming connection for liveness signals. The
//! supervisor watches the last time the connection showed life and swaps it
//! for a fresh one when it goes quiet, re-creating every subscription.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::backoff::{Backoff, BackoffCalculator};
use crate::shutdown::ShutdownSignal;

/// Identifier handed out by the streaming client for one subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// An open streaming connection
#[async_trait]
pub trait StreamConnection: Send + Sync {
    async fn subscribe(&self, topic: &str) -> anyhow::Result<SubscriptionId>;

    async fn unsubscribe(&self, id: SubscriptionId) -> anyhow::Result<()>;

    async fn close(&self) -> anyhow::Result<()>;
}

/// Factory for streaming connections
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self) -> anyhow::Result<Arc<dyn StreamConnection>>;
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Resubscribe to {topic} failed: {message}")]
    Subscribe { topic: String, message: String },
}

/// Timing knobs for the supervisor
#[derive(Debug, Clone)]
pub struct ConnectionPolicy {
    pub stale_after: Duration,
    pub check_interval: Duration,
    pub min_restart_gap: Duration,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub unsubscribe_timeout: Duration,
}

impl Default for ConnectionPolicy {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(30),
            check_interval: Duration::from_secs(5),
            min_restart_gap: Duration::from_secs(5),
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            unsubscribe_timeout: Duration::from_secs(2),
        }
    }
}

/// Proof that the caller holds the restart gate; hand it back to `end_restart`
#[derive(Debug)]
#[must_use]
pub struct RestartPermit {
    attempt: u32,
}

impl RestartPermit {
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

struct State {
    connection: Option<Arc<dyn StreamConnection>>,
    topics: Vec<String>,
    active: Vec<(String, SubscriptionId)>,
    last_liveness: Option<Instant>,
    error_count: u64,
    restarting: bool,
    attempts: u32,
    next_allowed: Option<Instant>,
    backoff: Backoff,
}

pub struct ConnectionSupervisor {
    connector: Arc<dyn StreamConnector>,
    policy: ConnectionPolicy,
    state: Mutex<State>,
}

impl ConnectionSupervisor {
    pub fn new(connector: Arc<dyn StreamConnector>, policy: ConnectionPolicy) -> Self {
        let backoff = Backoff::new(BackoffCalculator::doubling(
            policy.base_backoff,
            policy.max_backoff,
        ));

        Self {
            connector,
            policy,
            state: Mutex::new(State {
                connection: None,
                topics: Vec::new(),
                active: Vec::new(),
                last_liveness: None,
                error_count: 0,
                restarting: false,
                attempts: 0,
                next_allowed: None,
                backoff,
            }),
        }
    }

    pub fn policy(&self) -> &ConnectionPolicy {
        &self.policy
    }

    /// Record that the connection delivered something
    pub fn note_liveness(&self, now: Instant) {
        let mut state = self.state.lock();
        if state.last_liveness.map_or(true, |last| now > last) {
            state.last_liveness = Some(now);
        }
    }

    pub fn last_liveness(&self) -> Option<Instant> {
        self.state.lock().last_liveness
    }

    /// Count one connection error; returns the new total
    pub fn record_error(&self) -> u64 {
        let mut state = self.state.lock();
        state.error_count += 1;
        state.error_count
    }

    pub fn error_count(&self) -> u64 {
        self.state.lock().error_count
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connection.is_some()
    }

    pub fn is_restarting(&self) -> bool {
        self.state.lock().restarting
    }

    /// True once the silence since `last_liveness` exceeds `stale_after`
    pub fn should_restart_for_stale(&self, last_liveness: Instant, now: Instant) -> bool {
        now.saturating_duration_since(last_liveness) > self.policy.stale_after
    }

    /// Whether the monitor loop should attempt a restart at `now`
    pub fn needs_restart(&self, now: Instant) -> bool {
        let state = self.state.lock();
        match (&state.connection, state.last_liveness) {
            (None, _) => true,
            (Some(_), Some(last)) => self.should_restart_for_stale(last, now),
            (Some(_), None) => false,
        }
    }

    /// Earliest instant the next restart attempt is allowed
    pub fn next_allowed_at(&self) -> Option<Instant> {
        self.state.lock().next_allowed
    }

    /// Take the restart gate
    ///
    /// Returns `None` while another restart is running or while the minimum
    /// gap plus backoff since the previous attempt has not elapsed.
    pub fn begin_restart(&self, now: Instant) -> Option<RestartPermit> {
        let mut state = self.state.lock();
        if state.restarting {
            return None;
        }
        if state.next_allowed.is_some_and(|allowed| now < allowed) {
            return None;
        }

        state.restarting = true;
        state.attempts += 1;
        Some(RestartPermit {
            attempt: state.attempts,
        })
    }

    /// Release the restart gate and schedule the next allowed attempt
    pub fn end_restart(&self, permit: RestartPermit, success: bool, now: Instant) {
        let mut state = self.state.lock();
        state.restarting = false;

        let wait = if success {
            state.backoff.reset();
            state.error_count = 0;
            self.policy.min_restart_gap
        } else {
            self.policy.min_restart_gap + state.backoff.next_delay()
        };
        state.next_allowed = Some(now + wait);

        debug!(
            attempt = permit.attempt,
            success,
            next_in_ms = wait.as_millis() as u64,
            "Restart finished"
        );
    }

    /// Add a topic; it is subscribed now if connected and after every reconnect
    pub async fn subscribe(&self, topic: &str) -> Result<(), ConnectionError> {
        let connection = {
            let mut state = self.state.lock();
            if !state.topics.iter().any(|t| t == topic) {
                state.topics.push(topic.to_string());
            }
            state.connection.clone()
        };

        if let Some(connection) = connection {
            let id = connection
                .subscribe(topic)
                .await
                .map_err(|e| ConnectionError::Subscribe {
                    topic: topic.to_string(),
                    message: e.to_string(),
                })?;
            self.state.lock().active.push((topic.to_string(), id));
        }
        Ok(())
    }

    pub fn active_subscriptions(&self) -> usize {
        self.state.lock().active.len()
    }

    /// Replace the connection if the gate allows it
    ///
    /// Returns `Ok(false)` when the gate was closed and nothing happened.
    pub async fn restart(&self, now: Instant) -> Result<bool, ConnectionError> {
        let Some(permit) = self.begin_restart(now) else {
            return Ok(false);
        };

        info!(attempt = permit.attempt(), "Restarting streaming connection");
        let result = self.swap_connection().await;
        let finished = Instant::now().max(now);

        match result {
            Ok(()) => {
                self.note_liveness(finished);
                self.end_restart(permit, true, finished);
                Ok(true)
            }
            Err(e) => {
                let errors = self.record_error();
                warn!(error = %e, errors, "Streaming connection restart failed");
                self.end_restart(permit, false, finished);
                Err(e)
            }
        }
    }

    async fn swap_connection(&self) -> Result<(), ConnectionError> {
        let (old, active, topics) = {
            let mut state = self.state.lock();
            (
                state.connection.take(),
                std::mem::take(&mut state.active),
                state.topics.clone(),
            )
        };

        if let Some(old) = old {
            for (topic, id) in active {
                match timeout(self.policy.unsubscribe_timeout, old.unsubscribe(id)).await {
                    Ok(Ok(())) => debug!(%topic, "Unsubscribed"),
                    Ok(Err(e)) => warn!(%topic, error = %e, "Unsubscribe failed, skipping"),
                    Err(_) => warn!(%topic, "Unsubscribe timed out, skipping"),
                }
            }
            match timeout(self.policy.unsubscribe_timeout, old.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Closing old connection failed"),
                Err(_) => warn!("Closing old connection timed out"),
            }
        }

        let connection = self
            .connector
            .connect()
            .await
            .map_err(|e| ConnectionError::Connect(e.to_string()))?;

        let mut resubscribed = Vec::with_capacity(topics.len());
        for topic in topics {
            match connection.subscribe(&topic).await {
                Ok(id) => resubscribed.push((topic, id)),
                Err(e) => {
                    let _ = connection.close().await;
                    return Err(ConnectionError::Subscribe {
                        topic,
                        message: e.to_string(),
                    });
                }
            }
        }

        let mut state = self.state.lock();
        state.connection = Some(connection);
        state.active = resubscribed;
        Ok(())
    }

    /// Monitor loop: connect, then check staleness every `check_interval`
    pub async fn run(&self, mut shutdown: broadcast::Receiver<ShutdownSignal>) {
        loop {
            let now = Instant::now();
            if self.needs_restart(now) {
                // Failures are logged and retried on a later tick
                let _ = self.restart(now).await;
            }

            tokio::select! {
                _ = sleep(self.policy.check_interval) => {}
                _ = shutdown.recv() => break,
            }
        }

        self.close().await;
    }

    /// Unsubscribe everything and close the current connection
    pub async fn close(&self) {
        let (connection, active) = {
            let mut state = self.state.lock();
            (state.connection.take(), std::mem::take(&mut state.active))
        };

        if let Some(connection) = connection {
            for (topic, id) in active {
                if timeout(self.policy.unsubscribe_timeout, connection.unsubscribe(id))
                    .await
                    .is_err()
                {
                    warn!(%topic, "Unsubscribe timed out during close");
                }
            }
            match timeout(self.policy.unsubscribe_timeout, connection.close()).await {
                Ok(Ok(())) => info!("Streaming connection closed"),
                Ok(Err(e)) => warn!(error = %e, "Closing streaming connection failed"),
                Err(_) => warn!("Closing streaming connection timed out"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

    #[derive(Default)]
    struct Counters {
        connects: AtomicU32,
        subscribes: AtomicU32,
        unsubscribes: AtomicU32,
        closes: AtomicU32,
        hang_close: AtomicBool,
    }

    struct FakeConnection {
        counters: Arc<Counters>,
        next_id: AtomicU64,
        hang_unsubscribe: bool,
    }

    #[async_trait]
    impl StreamConnection for FakeConnection {
        async fn subscribe(&self, _topic: &str) -> anyhow::Result<SubscriptionId> {
            self.counters.subscribes.fetch_add(1, Ordering::SeqCst);
            Ok(SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst)))
        }

        async fn unsubscribe(&self, _id: SubscriptionId) -> anyhow::Result<()> {
            if self.hang_unsubscribe {
                std::future::pending::<()>().await;
            }
            self.counters.unsubscribes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self) -> anyhow::Result<()> {
            if self.counters.hang_close.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakeConnector {
        counters: Arc<Counters>,
        fail: AtomicBool,
        hang_unsubscribe: bool,
    }

    impl FakeConnector {
        fn new(hang_unsubscribe: bool) -> Arc<Self> {
            Arc::new(Self {
                counters: Arc::new(Counters::default()),
                fail: AtomicBool::new(false),
                hang_unsubscribe,
            })
        }
    }

    #[async_trait]
    impl StreamConnector for FakeConnector {
        async fn connect(&self) -> anyhow::Result<Arc<dyn StreamConnection>> {
            self.counters.connects.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("connection refused");
            }
            Ok(Arc::new(FakeConnection {
                counters: self.counters.clone(),
                next_id: AtomicU64::new(1),
                hang_unsubscribe: self.hang_unsubscribe,
            }))
        }
    }

    fn policy() -> ConnectionPolicy {
        ConnectionPolicy {
            stale_after: Duration::from_secs(30),
            check_interval: Duration::from_secs(5),
            min_restart_gap: Duration::from_secs(5),
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(4),
            unsubscribe_timeout: Duration::from_secs(2),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_predicate() {
        let supervisor = ConnectionSupervisor::new(FakeConnector::new(false), policy());
        let t0 = Instant::now();

        assert!(!supervisor.should_restart_for_stale(t0, t0 + Duration::from_secs(30)));
        assert!(supervisor.should_restart_for_stale(t0, t0 + Duration::from_millis(30_001)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_gate_is_exclusive() {
        let supervisor = ConnectionSupervisor::new(FakeConnector::new(false), policy());
        let now = Instant::now();

        let permit = supervisor.begin_restart(now).unwrap();
        assert!(supervisor.begin_restart(now).is_none());
        assert!(supervisor.is_restarting());

        supervisor.end_restart(permit, true, now);
        // Minimum gap applies even after success
        assert!(supervisor.begin_restart(now + Duration::from_secs(4)).is_none());
        assert!(supervisor.begin_restart(now + Duration::from_secs(5)).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_restarts_back_off_and_reset() {
        let connector = FakeConnector::new(false);
        connector.fail.store(true, Ordering::SeqCst);
        let supervisor = ConnectionSupervisor::new(connector.clone(), policy());

        let t0 = Instant::now();
        assert!(supervisor.restart(t0).await.is_err());
        // gap 5s + backoff 1s
        assert_eq!(supervisor.next_allowed_at(), Some(t0 + Duration::from_secs(6)));
        assert_eq!(supervisor.restart(t0 + Duration::from_secs(5)).await.unwrap(), false);

        let t1 = t0 + Duration::from_secs(6);
        assert!(supervisor.restart(t1).await.is_err());
        assert_eq!(supervisor.next_allowed_at(), Some(t1 + Duration::from_secs(7)));

        let t2 = t1 + Duration::from_secs(7);
        assert!(supervisor.restart(t2).await.is_err());
        let t3 = t2 + Duration::from_secs(9);
        assert!(supervisor.restart(t3).await.is_err());
        // Backoff capped at 4s
        assert_eq!(supervisor.next_allowed_at(), Some(t3 + Duration::from_secs(9)));
        assert_eq!(supervisor.error_count(), 4);

        connector.fail.store(false, Ordering::SeqCst);
        let t4 = t3 + Duration::from_secs(9);
        assert!(supervisor.restart(t4).await.unwrap());
        assert_eq!(supervisor.error_count(), 0);
        assert_eq!(supervisor.next_allowed_at(), Some(t4 + Duration::from_secs(5)));

        // Back to the base delay after a success
        connector.fail.store(true, Ordering::SeqCst);
        let t5 = t4 + Duration::from_secs(5);
        assert!(supervisor.restart(t5).await.is_err());
        assert_eq!(supervisor.next_allowed_at(), Some(t5 + Duration::from_secs(6)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_resubscribes() {
        let connector = FakeConnector::new(false);
        let supervisor = ConnectionSupervisor::new(connector.clone(), policy());
        let now = Instant::now();

        supervisor.subscribe("slots").await.unwrap();
        supervisor.subscribe("accounts").await.unwrap();
        assert_eq!(supervisor.active_subscriptions(), 0);

        assert!(supervisor.restart(now).await.unwrap());
        assert_eq!(supervisor.active_subscriptions(), 2);

        assert!(supervisor.restart(now + Duration::from_secs(5)).await.unwrap());
        let counters = &connector.counters;
        assert_eq!(counters.connects.load(Ordering::SeqCst), 2);
        assert_eq!(counters.subscribes.load(Ordering::SeqCst), 4);
        assert_eq!(counters.unsubscribes.load(Ordering::SeqCst), 2);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_unsubscribe_is_skipped() {
        let connector = FakeConnector::new(true);
        let supervisor = ConnectionSupervisor::new(connector.clone(), policy());
        let now = Instant::now();

        supervisor.subscribe("slots").await.unwrap();
        assert!(supervisor.restart(now).await.unwrap());

        let started = Instant::now();
        assert!(supervisor.restart(now + Duration::from_secs(5)).await.unwrap());
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(connector.counters.connects.load(Ordering::SeqCst), 2);
        assert_eq!(connector.counters.unsubscribes.load(Ordering::SeqCst), 0);
        assert!(supervisor.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_close_is_bounded() {
        let connector = FakeConnector::new(false);
        let supervisor = ConnectionSupervisor::new(connector.clone(), policy());

        supervisor.subscribe("slots").await.unwrap();
        assert!(supervisor.restart(Instant::now()).await.unwrap());
        connector.counters.hang_close.store(true, Ordering::SeqCst);

        let started = Instant::now();
        supervisor.close().await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(2) && elapsed < Duration::from_secs(3));
        assert_eq!(connector.counters.unsubscribes.load(Ordering::SeqCst), 1);
        assert_eq!(connector.counters.closes.load(Ordering::SeqCst), 0);
        assert!(!supervisor.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_reconnects_when_stale() {
        let connector = FakeConnector::new(false);
        let supervisor = Arc::new(ConnectionSupervisor::new(connector.clone(), policy()));
        let (tx, rx) = broadcast::channel(1);

        let runner = supervisor.clone();
        let task = tokio::spawn(async move { runner.run(rx).await });

        // Initial connect happens on the first iteration
        sleep(Duration::from_secs(1)).await;
        assert_eq!(connector.counters.connects.load(Ordering::SeqCst), 1);

        // No liveness for longer than stale_after
        sleep(Duration::from_secs(40)).await;
        assert_eq!(connector.counters.connects.load(Ordering::SeqCst), 2);

        tx.send(ShutdownSignal::Graceful).unwrap();
        task.await.unwrap();
        assert!(!supervisor.is_connected());
    }
}
