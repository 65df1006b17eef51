//! Graceful shutdown coordination
//!
//! A single [`ShutdownCoordinator`] holds every worker, raw process id and
//! cleanup callback registered during a supervisor run and tears them down in
//! a fixed order: stop request, wait, forced signal, cleanups.

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, OnceCell};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Shutdown phases broadcast to in-process loops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Stop accepting work and wind down
    Graceful,
    /// Survivors are being killed
    Forced,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Graceful => write!(f, "graceful"),
            ShutdownSignal::Forced => write!(f, "forced"),
        }
    }
}

/// A worker the coordinator can stop
#[async_trait]
pub trait TrackedWorker: Send + Sync {
    fn name(&self) -> String;

    fn pid(&self) -> Option<u32>;

    fn is_alive(&self) -> bool;

    /// Ask the worker to stop. Must not wait for the exit itself.
    async fn request_stop(&self, reason: &str, grace: Duration);

    /// Resolves once the worker process has exited
    async fn wait_exit(&self);
}

/// Timing of one shutdown run
#[derive(Debug, Clone)]
pub struct ShutdownOptions {
    /// Passed to each worker's stop request
    pub grace: Duration,
    /// How long to wait for natural exits
    pub wait: Duration,
    /// How long to wait after sending `force_signal`
    pub force_wait: Duration,
    pub force_signal: Signal,
}

impl Default for ShutdownOptions {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(2),
            wait: Duration::from_secs(5),
            force_wait: Duration::from_secs(2),
            force_signal: Signal::SIGKILL,
        }
    }
}

/// Outcome of a shutdown run
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShutdownReport {
    pub reason: String,
    /// Workers and pids that exited on their own
    pub stopped: Vec<String>,
    /// Workers and pids that needed the force signal
    pub forced: Vec<String>,
    /// Still alive after the force wait
    pub survivors: Vec<String>,
    /// Cleanup name -> error message
    pub cleanup_failures: BTreeMap<String, String>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.forced.is_empty() && self.survivors.is_empty() && self.cleanup_failures.is_empty()
    }
}

/// Handle returned by the `track_*` methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TrackingId(u64);

type CleanupFn = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

struct Cleanup {
    id: TrackingId,
    name: String,
    run: CleanupFn,
}

#[derive(Default)]
struct Registry {
    workers: Vec<(TrackingId, Arc<dyn TrackedWorker>)>,
    pids: Vec<(TrackingId, String, u32)>,
    cleanups: Vec<Cleanup>,
}

/// Coordinates teardown of everything registered against it
pub struct ShutdownCoordinator {
    sender: broadcast::Sender<ShutdownSignal>,
    registry: Mutex<Registry>,
    next_id: AtomicU64,
    shutting_down: AtomicBool,
    report: OnceCell<ShutdownReport>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(16);

        Self {
            sender,
            registry: Mutex::new(Registry::default()),
            next_id: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
            report: OnceCell::new(),
        }
    }

    /// Subscribe to shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.sender.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// The finished report, if a shutdown already completed
    pub fn report(&self) -> Option<&ShutdownReport> {
        self.report.get()
    }

    fn allocate_id(&self) -> TrackingId {
        TrackingId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn track_worker(&self, worker: Arc<dyn TrackedWorker>) -> TrackingId {
        let id = self.allocate_id();
        debug!(worker = %worker.name(), "Tracking worker");
        self.registry.lock().workers.push((id, worker));
        id
    }

    /// Track a bare process id (detached workers)
    pub fn track_pid(&self, name: impl Into<String>, pid: u32) -> TrackingId {
        let id = self.allocate_id();
        let name = name.into();
        debug!(%name, pid, "Tracking pid");
        self.registry.lock().pids.push((id, name, pid));
        id
    }

    /// Register a cleanup; cleanups run in registration order after all workers are gone
    pub fn track_cleanup<F, Fut>(&self, name: impl Into<String>, cleanup: F) -> TrackingId
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = self.allocate_id();
        self.registry.lock().cleanups.push(Cleanup {
            id,
            name: name.into(),
            run: Box::new(move || Box::pin(cleanup())),
        });
        id
    }

    /// Forget a tracked item, for example a worker that was replaced on restart
    pub fn untrack(&self, id: TrackingId) -> bool {
        let mut registry = self.registry.lock();
        let before = registry.workers.len() + registry.pids.len() + registry.cleanups.len();
        registry.workers.retain(|(tracked, _)| *tracked != id);
        registry.pids.retain(|(tracked, _, _)| *tracked != id);
        registry.cleanups.retain(|cleanup| cleanup.id != id);
        before != registry.workers.len() + registry.pids.len() + registry.cleanups.len()
    }

    pub fn tracked_count(&self) -> usize {
        let registry = self.registry.lock();
        registry.workers.len() + registry.pids.len() + registry.cleanups.len()
    }

    /// Run the shutdown sequence once
    ///
    /// Concurrent and later calls wait for and return the first call's report.
    pub async fn shutdown(&self, reason: &str, options: ShutdownOptions) -> ShutdownReport {
        self.report
            .get_or_init(|| self.run_shutdown(reason.to_string(), options))
            .await
            .clone()
    }

    async fn run_shutdown(&self, reason: String, options: ShutdownOptions) -> ShutdownReport {
        self.shutting_down.store(true, Ordering::SeqCst);
        info!(%reason, "Starting shutdown");

        // No receivers is fine
        let _ = self.sender.send(ShutdownSignal::Graceful);

        let (workers, pids, cleanups) = {
            let mut registry = self.registry.lock();
            (
                std::mem::take(&mut registry.workers),
                std::mem::take(&mut registry.pids),
                std::mem::take(&mut registry.cleanups),
            )
        };

        let mut report = ShutdownReport {
            reason: reason.clone(),
            ..Default::default()
        };

        // Phase 1: stop requests
        join_all(
            workers
                .iter()
                .map(|(_, worker)| worker.request_stop(&reason, options.grace)),
        )
        .await;
        for (_, name, pid) in &pids {
            if !send_signal(*pid, Signal::SIGTERM) {
                debug!(%name, pid, "Pid already gone");
            }
        }

        // Phase 2: wait for natural exit
        let deadline = Instant::now() + options.wait;
        let _ = timeout(
            options.wait,
            join_all(workers.iter().map(|(_, worker)| worker.wait_exit())),
        )
        .await;
        wait_pids_until(&pids, deadline).await;

        let mut worker_survivors = Vec::new();
        for (_, worker) in &workers {
            if worker.is_alive() {
                worker_survivors.push(worker.clone());
            } else {
                report.stopped.push(worker.name());
            }
        }
        let mut pid_survivors = Vec::new();
        for (id, name, pid) in &pids {
            if pid_alive(*pid) {
                pid_survivors.push((*id, name.clone(), *pid));
            } else {
                report.stopped.push(name.clone());
            }
        }

        // Phase 3: force
        if !worker_survivors.is_empty() || !pid_survivors.is_empty() {
            let _ = self.sender.send(ShutdownSignal::Forced);
            warn!(
                workers = worker_survivors.len(),
                pids = pid_survivors.len(),
                signal = %options.force_signal,
                "Forcing survivors"
            );

            for worker in &worker_survivors {
                if let Some(pid) = worker.pid() {
                    send_signal(pid, options.force_signal);
                }
            }
            for (_, _, pid) in &pid_survivors {
                send_signal(*pid, options.force_signal);
            }

            let deadline = Instant::now() + options.force_wait;
            let _ = timeout(
                options.force_wait,
                join_all(worker_survivors.iter().map(|worker| worker.wait_exit())),
            )
            .await;
            wait_pids_until(&pid_survivors, deadline).await;

            for worker in &worker_survivors {
                if worker.is_alive() {
                    report.survivors.push(worker.name());
                } else {
                    report.forced.push(worker.name());
                }
            }
            for (_, name, pid) in &pid_survivors {
                if pid_alive(*pid) {
                    report.survivors.push(name.clone());
                } else {
                    report.forced.push(name.clone());
                }
            }
        }

        // Phase 4: cleanups; one failure never blocks the rest
        for cleanup in cleanups {
            let name = cleanup.name;
            match (cleanup.run)().await {
                Ok(()) => debug!(cleanup = %name, "Cleanup finished"),
                Err(e) => {
                    error!(cleanup = %name, error = %e, "Cleanup failed");
                    report.cleanup_failures.insert(name, format!("{:#}", e));
                }
            }
        }

        if report.survivors.is_empty() {
            info!(
                %reason,
                stopped = report.stopped.len(),
                forced = report.forced.len(),
                "Shutdown completed"
            );
        } else {
            error!(%reason, survivors = ?report.survivors, "Shutdown left processes running");
        }

        report
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

async fn wait_pids_until(pids: &[(TrackingId, String, u32)], deadline: Instant) {
    while pids.iter().any(|(_, _, pid)| pid_alive(*pid)) && Instant::now() < deadline {
        sleep(EXIT_POLL_INTERVAL).await;
    }
}

fn to_pid(pid: u32) -> Option<Pid> {
    i32::try_from(pid).ok().filter(|raw| *raw > 0).map(Pid::from_raw)
}

/// Send `sig` to `pid`; false if the process does not exist or the signal failed
pub fn send_signal(pid: u32, sig: Signal) -> bool {
    let Some(target) = to_pid(pid) else {
        return false;
    };

    match signal::kill(target, sig) {
        Ok(()) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        Err(e) => {
            warn!(pid, signal = %sig, error = %e, "Failed to send signal");
            false
        }
    }
}

/// Whether a process with this id currently exists
pub fn pid_alive(pid: u32) -> bool {
    match to_pid(pid) {
        Some(target) => signal::kill(target, None::<Signal>).is_ok(),
        None => false,
    }
}

/// Shutdown error types
#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    #[error("Unknown signal name: {0}")]
    UnknownSignal(String),
}

/// Parse a signal name such as `SIGKILL` or `TERM`
pub fn parse_signal(name: &str) -> Result<Signal, ShutdownError> {
    let upper = name.trim().to_ascii_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{}", upper)
    };
    full.parse::<Signal>()
        .map_err(|_| ShutdownError::UnknownSignal(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::watch;

    /// In-process stand-in for a worker
    struct FakeWorker {
        name: String,
        obeys_stop: bool,
        stops: AtomicU32,
        alive: watch::Sender<bool>,
    }

    impl FakeWorker {
        fn new(name: &str, obeys_stop: bool) -> Arc<Self> {
            let (alive, _) = watch::channel(true);
            Arc::new(Self {
                name: name.to_string(),
                obeys_stop,
                stops: AtomicU32::new(0),
                alive,
            })
        }
    }

    #[async_trait]
    impl TrackedWorker for FakeWorker {
        fn name(&self) -> String {
            self.name.clone()
        }

        fn pid(&self) -> Option<u32> {
            None
        }

        fn is_alive(&self) -> bool {
            *self.alive.borrow()
        }

        async fn request_stop(&self, _reason: &str, _grace: Duration) {
            self.stops.fetch_add(1, Ordering::SeqCst);
            if self.obeys_stop {
                self.alive.send_replace(false);
            }
        }

        async fn wait_exit(&self) {
            let mut rx = self.alive.subscribe();
            let _ = rx.wait_for(|alive| !*alive).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_workers_and_runs_cleanups() {
        let coordinator = ShutdownCoordinator::new();
        let mut signals = coordinator.subscribe();
        let good = FakeWorker::new("good", true);
        let stuck = FakeWorker::new("stuck", false);
        coordinator.track_worker(good.clone());
        coordinator.track_worker(stuck.clone());

        let order = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "broken", "last"] {
            let order = order.clone();
            coordinator.track_cleanup(name, move || async move {
                order.lock().push(name);
                if name == "broken" {
                    anyhow::bail!("socket already closed");
                }
                Ok(())
            });
        }

        let report = coordinator
            .shutdown("test", ShutdownOptions::default())
            .await;

        assert_eq!(report.stopped, vec!["good".to_string()]);
        assert_eq!(report.survivors, vec!["stuck".to_string()]);
        assert_eq!(*order.lock(), vec!["first", "broken", "last"]);
        assert!(report.cleanup_failures["broken"].contains("already closed"));
        assert_eq!(good.stops.load(Ordering::SeqCst), 1);
        assert_eq!(signals.recv().await.unwrap(), ShutdownSignal::Graceful);
        assert_eq!(signals.recv().await.unwrap(), ShutdownSignal::Forced);
        assert!(coordinator.is_shutting_down());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_shutdown_runs_once() {
        let coordinator = Arc::new(ShutdownCoordinator::new());
        let worker = FakeWorker::new("w", true);
        coordinator.track_worker(worker.clone());

        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        coordinator.track_cleanup("count", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let a = coordinator.clone();
        let b = coordinator.clone();
        let (first, second) = tokio::join!(
            a.shutdown("signal", ShutdownOptions::default()),
            b.shutdown("other", ShutdownOptions::default()),
        );
        let third = coordinator
            .shutdown("again", ShutdownOptions::default())
            .await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(worker.stops.load(Ordering::SeqCst), 1);
        assert_eq!(first.reason, second.reason);
        assert_eq!(first.reason, third.reason);
        assert!(first.is_clean());
    }

    #[tokio::test]
    async fn test_untrack_removes_worker() {
        let coordinator = ShutdownCoordinator::new();
        let id = coordinator.track_worker(FakeWorker::new("old", true));
        coordinator.track_pid("detached", 999_999);
        assert_eq!(coordinator.tracked_count(), 2);

        assert!(coordinator.untrack(id));
        assert!(!coordinator.untrack(id));
        assert_eq!(coordinator.tracked_count(), 1);
    }

    #[test]
    fn test_parse_signal() {
        assert_eq!(parse_signal("SIGKILL").unwrap(), Signal::SIGKILL);
        assert_eq!(parse_signal("term").unwrap(), Signal::SIGTERM);
        assert!(parse_signal("SIGNOPE").is_err());
    }

    #[test]
    fn test_invalid_pid_is_not_alive() {
        assert!(!pid_alive(0));
        assert!(!send_signal(0, Signal::SIGTERM));
    }
}
