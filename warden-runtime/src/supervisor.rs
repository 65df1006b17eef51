//! Supervisor for long-running worker categories
//!
//! One [`Supervisor`] per service instance. It owns the category table, the
//! live worker handles, the heartbeat watchdog, the alert log, the shutdown
//! coordinator and (optionally) the session manager. Progress from every
//! worker funnels into a single dispatch loop; a tick loop restarts units whose
//! heartbeats went stale.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use warden_ipc::{AlertLevel, ProgressEvent};
use warden_resilience::{
    ShutdownCoordinator, ShutdownOptions, ShutdownReport, Signal, TrackingId,
};

use crate::alerts::{AlertLog, AlertSink, DEFAULT_ALERT_CAPACITY};
use crate::clock::{Clock, TokioClock};
use crate::env::ConnectionHints;
use crate::error::SupervisorError;
use crate::fork::{ForkClient, SpawnOptions};
use crate::handle::{CallOptions, ProgressCallback, WorkerHandle, WorkerStatus};
use crate::pid_tag::PidTag;
use crate::session::{FinalizeOverrides, SessionManager};
use crate::watchdog::{HeartbeatRecord, HeartbeatWatchdog, RestartPolicy, UnitKey};

const EVENT_CAPACITY: usize = 1024;

/// One kind of long-running worker
#[derive(Debug, Clone, Default)]
pub struct CategorySpec {
    pub name: String,
    pub path: PathBuf,
    pub args: Vec<String>,
    /// Non-empty: one unit per wallet, each with its own pid tag
    pub wallets: Vec<String>,
    /// Lock held while a unit runs; `<tag>-<wallet>` for wallet units
    pub pid_tag: Option<String>,
    /// Sent as an invocation once the worker is up
    pub payload: Option<Value>,
    /// Whether the watchdog may restart stale units
    pub restart: bool,
    pub hints: ConnectionHints,
}

impl CategorySpec {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            restart: true,
            ..Self::default()
        }
    }

    fn unit_keys(&self) -> Vec<UnitKey> {
        if self.wallets.is_empty() {
            vec![UnitKey::category(&self.name)]
        } else {
            self.wallets
                .iter()
                .map(|wallet| UnitKey::wallet(&self.name, wallet))
                .collect()
        }
    }

    fn tag_for(&self, key: &UnitKey) -> Option<String> {
        let tag = self.pid_tag.as_ref()?;
        Some(match &key.wallet {
            Some(wallet) => format!("{}-{}", tag, wallet),
            None => tag.clone(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub tick_interval: Duration,
    pub restart_policy: RestartPolicy,
    pub lock_dir: PathBuf,
    /// Grace between `stop` and SIGTERM when restarting a unit
    pub stop_grace: Duration,
    pub shutdown: ShutdownOptions,
    pub alert_capacity: usize,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            restart_policy: RestartPolicy::default(),
            lock_dir: std::env::temp_dir().join("warden-locks"),
            stop_grace: Duration::from_secs(2),
            shutdown: ShutdownOptions::default(),
            alert_capacity: DEFAULT_ALERT_CAPACITY,
        }
    }
}

/// Evaluation or domain event republished to listeners
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitEvent {
    pub unit: UnitKey,
    pub event: ProgressEvent,
}

/// Point-in-time view of one unit
#[derive(Debug, Clone, Serialize)]
pub struct UnitSnapshot {
    pub unit: UnitKey,
    pub pid: Option<u32>,
    pub status: WorkerStatus,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: Option<HeartbeatRecord>,
    pub last_restart_at_ms: Option<i64>,
    pub restarts: u32,
    pub last_evaluation: Option<Map<String, Value>>,
}

struct Unit {
    handle: WorkerHandle,
    generation: u64,
    lock: Option<PidTag>,
    tracking: TrackingId,
    last_evaluation: Option<Map<String, Value>>,
}

type ProgressMessage = (UnitKey, u64, ProgressEvent);

struct Inner {
    options: SupervisorOptions,
    fork: ForkClient,
    clock: Arc<dyn Clock>,
    categories: Mutex<BTreeMap<String, CategorySpec>>,
    units: Mutex<HashMap<UnitKey, Unit>>,
    restarts: Mutex<HashMap<UnitKey, u32>>,
    restarting: Mutex<HashSet<UnitKey>>,
    watchdog: HeartbeatWatchdog,
    alerts: AlertLog,
    coordinator: ShutdownCoordinator,
    session: Option<SessionManager>,
    events: broadcast::Sender<UnitEvent>,
    progress_tx: mpsc::UnboundedSender<ProgressMessage>,
    progress_rx: Mutex<Option<mpsc::UnboundedReceiver<ProgressMessage>>>,
    next_generation: AtomicU64,
    started: AtomicBool,
    shutdown_reason: Mutex<Option<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Builds a [`Supervisor`]
pub struct SupervisorBuilder {
    options: SupervisorOptions,
    fork: ForkClient,
    clock: Arc<dyn Clock>,
    session: Option<SessionManager>,
    alert_sink: Option<Arc<dyn AlertSink>>,
    categories: Vec<CategorySpec>,
}

impl SupervisorBuilder {
    pub fn new(options: SupervisorOptions) -> Self {
        Self {
            options,
            fork: ForkClient::default(),
            clock: Arc::new(TokioClock::new()),
            session: None,
            alert_sink: None,
            categories: Vec::new(),
        }
    }

    pub fn fork_client(mut self, fork: ForkClient) -> Self {
        self.fork = fork;
        self
    }

    /// Defaults to [`TokioClock`], so watchdog times follow paused test time
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn session(mut self, session: SessionManager) -> Self {
        self.session = Some(session);
        self
    }

    pub fn alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alert_sink = Some(sink);
        self
    }

    pub fn category(mut self, spec: CategorySpec) -> Self {
        self.categories.push(spec);
        self
    }

    pub fn build(self) -> Result<Supervisor, SupervisorError> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let mut alerts = AlertLog::new(self.options.alert_capacity);
        if let Some(sink) = self.alert_sink {
            alerts = alerts.with_sink(sink);
        }

        let supervisor = Supervisor {
            inner: Arc::new(Inner {
                watchdog: HeartbeatWatchdog::new(self.options.restart_policy),
                options: self.options,
                fork: self.fork,
                clock: self.clock,
                categories: Mutex::new(BTreeMap::new()),
                units: Mutex::new(HashMap::new()),
                restarts: Mutex::new(HashMap::new()),
                restarting: Mutex::new(HashSet::new()),
                alerts,
                coordinator: ShutdownCoordinator::new(),
                session: self.session,
                events,
                progress_tx,
                progress_rx: Mutex::new(Some(progress_rx)),
                next_generation: AtomicU64::new(1),
                started: AtomicBool::new(false),
                shutdown_reason: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        };

        for spec in self.categories {
            supervisor.add_category(spec)?;
        }
        Ok(supervisor)
    }
}

/// Cheap to clone; all clones drive the same service instance
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn builder(options: SupervisorOptions) -> SupervisorBuilder {
        SupervisorBuilder::new(options)
    }

    pub fn add_category(&self, spec: CategorySpec) -> Result<(), SupervisorError> {
        if spec.name.trim().is_empty() {
            return Err(SupervisorError::UnknownCategory(spec.name));
        }
        let mut categories = self.inner.categories.lock();
        if categories.contains_key(&spec.name) {
            return Err(SupervisorError::DuplicateCategory(spec.name));
        }
        debug!(category = %spec.name, wallets = spec.wallets.len(), "Category registered");
        categories.insert(spec.name.clone(), spec);
        Ok(())
    }

    pub fn categories(&self) -> Vec<String> {
        self.inner.categories.lock().keys().cloned().collect()
    }

    /// Close any crashed session, open ours, start loops and every category
    pub async fn start(&self) -> Result<(), SupervisorError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.inner.coordinator.is_shutting_down() {
            return Err(SupervisorError::ShuttingDown);
        }

        if let Some(session) = &self.inner.session {
            session.close_stale_session().await?;
            session.ensure_session_started().await?;
        }
        self.register_cleanups();

        let receiver = self.inner.progress_rx.lock().take();
        if let Some(receiver) = receiver {
            let dispatch = tokio::spawn(dispatch_loop(self.inner.clone(), receiver));
            self.inner.tasks.lock().push(dispatch);
        }
        let ticker = tokio::spawn(tick_loop(self.inner.clone()));
        self.inner.tasks.lock().push(ticker);

        for name in self.categories() {
            if let Err(e) = self.start_category(&name).await {
                error!(category = %name, error = %e, "Category failed to start");
            }
        }

        info!(units = self.inner.units.lock().len(), "Supervisor started");
        Ok(())
    }

    /// Spawn every unit of a category; failures become alerts
    ///
    /// Returns how many units are running.
    pub async fn start_category(&self, name: &str) -> Result<usize, SupervisorError> {
        let spec = self
            .inner
            .categories
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| SupervisorError::UnknownCategory(name.to_string()))?;

        let mut running = 0;
        for key in spec.unit_keys() {
            if self.inner.restarting.lock().contains(&key) {
                running += 1;
                continue;
            }
            let exited = {
                let mut units = self.inner.units.lock();
                match units.get(&key) {
                    Some(unit) if unit.handle.is_alive() => {
                        running += 1;
                        continue;
                    }
                    Some(_) => units.remove(&key),
                    None => None,
                }
            };
            if let Some(old) = exited {
                debug!(unit = %key, "Replacing exited unit");
                discard_unit(&self.inner, &key, old).await;
            }
            match spawn_unit(&self.inner, &spec, key.clone()).await {
                Ok(()) => running += 1,
                Err(SupervisorError::ShuttingDown) => return Err(SupervisorError::ShuttingDown),
                Err(e) => {
                    self.inner
                        .alerts
                        .push(AlertLevel::Error, format!("{} failed to start: {}", key, e));
                }
            }
        }
        Ok(running)
    }

    /// Stop a unit and spawn its replacement
    pub async fn restart_unit(&self, key: &UnitKey, reason: &str) -> Result<(), SupervisorError> {
        restart_unit(&self.inner, key, reason).await
    }

    pub fn handle(&self, key: &UnitKey) -> Option<WorkerHandle> {
        self.inner.units.lock().get(key).map(|unit| unit.handle.clone())
    }

    pub fn snapshot(&self) -> Vec<UnitSnapshot> {
        let units = self.inner.units.lock();
        let restarts = self.inner.restarts.lock();
        let mut snapshot: Vec<UnitSnapshot> = units
            .iter()
            .map(|(key, unit)| UnitSnapshot {
                unit: key.clone(),
                pid: unit.handle.pid(),
                status: unit.handle.status(),
                started_at: unit.handle.started_at(),
                last_heartbeat: self.inner.watchdog.last_heartbeat(key),
                last_restart_at_ms: self
                    .inner
                    .watchdog
                    .times(key)
                    .and_then(|times| times.last_restart_at_ms),
                restarts: restarts.get(key).copied().unwrap_or(0),
                last_evaluation: unit.last_evaluation.clone(),
            })
            .collect();
        snapshot.sort_by(|a, b| a.unit.cmp(&b.unit));
        snapshot
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<UnitEvent> {
        self.inner.events.subscribe()
    }

    pub fn alerts(&self) -> &AlertLog {
        &self.inner.alerts
    }

    pub fn watchdog(&self) -> &HeartbeatWatchdog {
        &self.inner.watchdog
    }

    pub fn coordinator(&self) -> &ShutdownCoordinator {
        &self.inner.coordinator
    }

    pub fn session(&self) -> Option<&SessionManager> {
        self.inner.session.as_ref()
    }

    /// Stop every worker, release pid tags and finalize the session
    ///
    /// Repeated calls return the first run's report.
    pub async fn shutdown(&self, reason: &str) -> ShutdownReport {
        self.inner
            .shutdown_reason
            .lock()
            .get_or_insert_with(|| reason.to_string());
        let report = self
            .inner
            .coordinator
            .shutdown(reason, self.inner.options.shutdown.clone())
            .await;

        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        report
    }

    fn register_cleanups(&self) {
        let inner = self.inner.clone();
        self.inner.coordinator.track_cleanup("pid-tags", move || async move {
            let mut locks = Vec::new();
            for unit in inner.units.lock().values_mut() {
                // A worker that survived the force phase still guards its resource
                if unit.handle.is_alive() {
                    if let Some(lock) = unit.lock.take() {
                        lock.keep();
                    }
                } else if let Some(lock) = unit.lock.take() {
                    locks.push(lock);
                }
            }
            let mut failed = Vec::new();
            for lock in locks {
                let tag = lock.tag().to_string();
                if let Err(e) = lock.release().await {
                    warn!(%tag, error = %e, "Failed to release pid tag");
                    failed.push(tag);
                }
            }
            if failed.is_empty() {
                Ok(())
            } else {
                Err(anyhow::anyhow!("could not release pid tags: {}", failed.join(", ")))
            }
        });

        if self.inner.session.is_some() {
            let inner = self.inner.clone();
            self.inner.coordinator.track_cleanup("session", move || async move {
                if let Some(session) = &inner.session {
                    let reason = inner
                        .shutdown_reason
                        .lock()
                        .clone()
                        .unwrap_or_else(|| "shutdown".to_string());
                    session
                        .finalize_session(&reason, FinalizeOverrides::default())
                        .await?;
                }
                Ok(())
            });
        }
    }
}

async fn spawn_unit(
    inner: &Arc<Inner>,
    spec: &CategorySpec,
    key: UnitKey,
) -> Result<(), SupervisorError> {
    if inner.coordinator.is_shutting_down() {
        return Err(SupervisorError::ShuttingDown);
    }

    let lock = match spec.tag_for(&key) {
        Some(tag) => Some(PidTag::acquire(&tag, &inner.options.lock_dir).await?),
        None => None,
    };

    let generation = inner.next_generation.fetch_add(1, Ordering::SeqCst);
    let progress_tx = inner.progress_tx.clone();
    let callback_key = key.clone();
    let on_progress: ProgressCallback = Arc::new(move |event| {
        let _ = progress_tx.send((callback_key.clone(), generation, event));
    });

    let mut hints = spec.hints.clone();
    if let Some(wallet) = &key.wallet {
        hints.wallet_ids = vec![wallet.clone()];
    }
    let options = SpawnOptions {
        name: Some(key.to_string()),
        args: spec.args.clone(),
        hints,
        on_progress: Some(on_progress),
        current_dir: None,
    };

    let handle = match inner.fork.spawn(&spec.path, options).await {
        Ok(handle) => handle,
        Err(e) => {
            if let Some(lock) = lock {
                release_lock(&key, lock).await;
            }
            return Err(e.into());
        }
    };

    let tracking = inner.coordinator.track_worker(Arc::new(handle.clone()));
    inner.units.lock().insert(
        key.clone(),
        Unit {
            handle: handle.clone(),
            generation,
            lock,
            tracking,
            last_evaluation: None,
        },
    );

    // Shutdown may have drained the tracked workers while we were spawning
    if inner.coordinator.is_shutting_down() {
        let unit = {
            let mut units = inner.units.lock();
            match units.get(&key) {
                Some(unit) if unit.generation == generation => units.remove(&key),
                _ => None,
            }
        };
        handle.stop("shutting down", inner.options.stop_grace).await;
        if handle.is_alive() {
            handle.kill(Signal::SIGKILL);
            handle.wait_exit_timeout(inner.options.stop_grace).await;
        }
        if let Some(unit) = unit {
            discard_unit(inner, &key, unit).await;
        }
        info!(unit = %key, "Unit spawned during shutdown was stopped");
        return Err(SupervisorError::ShuttingDown);
    }

    inner.watchdog.register(key.clone(), inner.clock.now_ms());
    info!(unit = %key, pid = ?handle.pid(), generation, "Unit started");

    tokio::spawn(watch_exit(inner.clone(), key.clone(), generation, spec.restart));

    if let Some(payload) = spec.payload.clone() {
        let handle = handle.clone();
        let inner = inner.clone();
        tokio::spawn(async move {
            match handle.call(payload, CallOptions::new()).await {
                Ok(result) => info!(unit = %key, %result, "Unit invocation finished"),
                Err(e) if e.is_remote() => {
                    inner
                        .alerts
                        .push(AlertLevel::Error, format!("{} failed: {}", key, e));
                }
                Err(e) => debug!(unit = %key, error = %e, "Unit invocation ended"),
            }
        });
    }

    Ok(())
}

async fn restart_unit(
    inner: &Arc<Inner>,
    key: &UnitKey,
    reason: &str,
) -> Result<(), SupervisorError> {
    if inner.coordinator.is_shutting_down() {
        return Err(SupervisorError::ShuttingDown);
    }
    let spec = inner
        .categories
        .lock()
        .get(&key.category)
        .cloned()
        .ok_or_else(|| SupervisorError::UnknownCategory(key.category.clone()))?;

    if !inner.restarting.lock().insert(key.clone()) {
        debug!(unit = %key, "Restart already in progress");
        return Ok(());
    }

    let old = inner.units.lock().remove(key);
    if let Some(old) = old {
        inner.coordinator.untrack(old.tracking);
        let grace = inner.options.stop_grace;
        old.handle.stop(reason, grace).await;
        if old.handle.is_alive() {
            old.handle.kill(Signal::SIGKILL);
            old.handle.wait_exit_timeout(grace).await;
        }
        // The lock outlives the worker it guards
        if let Some(lock) = old.lock {
            release_lock(key, lock).await;
        }
    }

    inner.watchdog.mark_restarted(key, inner.clock.now_ms());
    *inner.restarts.lock().entry(key.clone()).or_insert(0) += 1;

    let result = spawn_unit(inner, &spec, key.clone()).await;
    inner.restarting.lock().remove(key);

    match result {
        Ok(()) => {
            inner
                .alerts
                .push(AlertLevel::Warn, format!("Restarted {}: {}", key, reason));
            Ok(())
        }
        Err(e) => {
            inner
                .alerts
                .push(AlertLevel::Error, format!("Restart of {} failed: {}", key, e));
            Err(e)
        }
    }
}

async fn watch_exit(inner: Arc<Inner>, key: UnitKey, generation: u64, restartable: bool) {
    let handle = match inner.units.lock().get(&key) {
        Some(unit) if unit.generation == generation => unit.handle.clone(),
        _ => return,
    };
    let exit = handle.wait_exit().await;
    if handle.stop_requested() {
        return;
    }

    // Restartable units stay for the watchdog; the rest leave the table
    let (lock, removed) = {
        let mut units = inner.units.lock();
        let current = units
            .get(&key)
            .is_some_and(|unit| unit.generation == generation);
        if !current {
            return;
        }
        if restartable {
            (units.get_mut(&key).and_then(|unit| unit.lock.take()), None)
        } else {
            (None, units.remove(&key))
        }
    };

    if let Some(lock) = lock {
        release_lock(&key, lock).await;
    }
    if let Some(unit) = removed {
        discard_unit(&inner, &key, unit).await;
        inner.watchdog.remove(&key);
    }
    inner
        .alerts
        .push(AlertLevel::Error, format!("{} exited unexpectedly ({})", key, exit));
}

/// Forget a unit that is no longer running
async fn discard_unit(inner: &Inner, key: &UnitKey, unit: Unit) {
    inner.coordinator.untrack(unit.tracking);
    if let Some(lock) = unit.lock {
        release_lock(key, lock).await;
    }
}

async fn release_lock(key: &UnitKey, lock: PidTag) {
    if let Err(e) = lock.release().await {
        warn!(unit = %key, error = %e, "Failed to release pid tag");
    }
}

async fn dispatch_loop(inner: Arc<Inner>, mut receiver: mpsc::UnboundedReceiver<ProgressMessage>) {
    let mut shutdown = inner.coordinator.subscribe();

    loop {
        tokio::select! {
            message = receiver.recv() => match message {
                Some((key, generation, event)) => dispatch(&inner, key, generation, event),
                None => break,
            },
            _ = shutdown.recv() => break,
        }
    }
    debug!("Dispatch loop stopped");
}

fn dispatch(inner: &Inner, key: UnitKey, generation: u64, event: ProgressEvent) {
    let current = inner
        .units
        .lock()
        .get(&key)
        .is_some_and(|unit| unit.generation == generation);
    if !current {
        debug!(unit = %key, kind = event.kind(), "Dropping progress from a replaced worker");
        return;
    }

    match event {
        ProgressEvent::Heartbeat {
            status,
            counters,
            note,
            ..
        } => {
            inner.watchdog.record_heartbeat(
                &key,
                HeartbeatRecord {
                    ts: inner.clock.now_ms(),
                    status,
                    counters_by_domain: counters,
                    note,
                },
            );
        }
        ProgressEvent::Alert { level, message } => {
            inner.alerts.push(level, format!("{}: {}", key, message));
        }
        ProgressEvent::Evaluation {
            subject,
            outcome,
            details,
        } => {
            let mut summary = details.clone();
            summary.insert("subject".to_string(), Value::String(subject.clone()));
            summary.insert("outcome".to_string(), Value::String(outcome.clone()));
            if let Some(unit) = inner.units.lock().get_mut(&key) {
                unit.last_evaluation = Some(summary);
            }
            let event = ProgressEvent::Evaluation {
                subject,
                outcome,
                details,
            };
            let _ = inner.events.send(UnitEvent { unit: key, event });
        }
        event @ ProgressEvent::DomainEvent { .. } => {
            let _ = inner.events.send(UnitEvent { unit: key, event });
        }
    }
}

async fn tick_loop(inner: Arc<Inner>) {
    let mut shutdown = inner.coordinator.subscribe();
    let mut interval = tokio::time::interval(inner.options.tick_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.recv() => break,
        }
        if inner.coordinator.is_shutting_down() {
            break;
        }

        let now = inner.clock.now_ms();
        for key in inner.watchdog.tick(now) {
            let restartable = inner
                .categories
                .lock()
                .get(&key.category)
                .is_some_and(|spec| spec.restart);
            if !restartable {
                continue;
            }
            let quiet_ms = inner
                .watchdog
                .times(&key)
                .map(|t| now - t.last_heartbeat_at_ms.unwrap_or(t.started_at_ms))
                .unwrap_or_default();
            let reason = format!("no heartbeat for {}ms", quiet_ms);
            if let Err(e) = restart_unit(&inner, &key, &reason).await {
                warn!(unit = %key, error = %e, "Restart failed");
            }
        }

        if let Some(session) = &inner.session {
            if let Err(e) = session.record_heartbeat(None).await {
                warn!(error = %e, "Session heartbeat failed");
            }
        }
    }
    debug!("Watchdog loop stopped");
}
