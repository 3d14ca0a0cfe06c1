//! Worker lifecycle management for agora services.
//!
//! Every long-running component (relay loop, queue consumers, timers)
//! registers a cleanup function with a shared [`LifecycleManager`]. On
//! shutdown, `stop_all` runs every cleanup concurrently, collects failures
//! without letting one worker block the others, and races the whole
//! operation against a fixed timeout so a stuck worker never wedges process
//! exit. Loops poll [`LifecycleManager::is_shutting_down`] between
//! iterations for cooperative cancellation.

use futures_util::future::BoxFuture;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, OnceCell};
use tracing::{error, info, warn};

/// Default time budget for a full shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from lifecycle management.
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Cannot register worker '{0}': shutdown already in progress")]
    ShuttingDown(String),
}

/// Cleanup function for a registered worker.
///
/// Runs once, during shutdown. Failures are collected and logged; they never
/// abort other workers' cleanup.
pub type CleanupFn = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

struct Worker {
    name: String,
    cleanup: CleanupFn,
}

/// Outcome of a `stop_all` call.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSummary {
    /// Workers whose cleanup completed successfully.
    pub completed: Vec<String>,
    /// Workers whose cleanup returned an error, with the error message.
    pub failed: Vec<(String, String)>,
    /// Workers whose cleanup had not finished when the timeout fired.
    pub unfinished: Vec<String>,
    /// Whether the overall timeout fired before all cleanups finished.
    pub timed_out: bool,
}

impl ShutdownSummary {
    /// True if every registered cleanup completed without error.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.unfinished.is_empty() && !self.timed_out
    }
}

/// Process-wide registry of running workers with coordinated shutdown.
///
/// One instance is constructed at startup and injected into each subsystem;
/// there is deliberately no global singleton, so shutdown ordering stays
/// explicit and tests can run managers side by side.
pub struct LifecycleManager {
    timeout: Duration,
    shutting_down: AtomicBool,
    workers: Mutex<Vec<Worker>>,
    summary: OnceCell<ShutdownSummary>,
}

impl LifecycleManager {
    /// Create a manager with the default 30s shutdown timeout.
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_SHUTDOWN_TIMEOUT)
    }

    /// Create a manager with a custom shutdown timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            shutting_down: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
            summary: OnceCell::new(),
        }
    }

    /// Register a worker's cleanup function.
    ///
    /// Fails if shutdown has already begun; the caller should not start new
    /// work at that point.
    pub fn register(
        &self,
        name: impl Into<String>,
        cleanup: CleanupFn,
    ) -> Result<(), LifecycleError> {
        let name = name.into();
        if self.is_shutting_down() {
            warn!(worker = %name, "Rejected registration during shutdown");
            return Err(LifecycleError::ShuttingDown(name));
        }
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        workers.push(Worker {
            name,
            cleanup,
        });
        Ok(())
    }

    /// Number of currently registered workers.
    pub fn worker_count(&self) -> usize {
        self.workers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Cooperative cancellation flag for long-running loops.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Stop all registered workers.
    ///
    /// Idempotent: repeated and concurrent calls all await the same
    /// in-flight shutdown and receive the same summary; each cleanup runs
    /// exactly once. Cleanups run concurrently, each isolated in its own
    /// task, and the whole operation is bounded by the configured timeout.
    pub async fn stop_all(&self) -> ShutdownSummary {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.summary
            .get_or_init(|| async {
                let workers: Vec<Worker> = self
                    .workers
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .drain(..)
                    .collect();
                run_cleanups(workers, self.timeout).await
            })
            .await
            .clone()
    }
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_cleanups(workers: Vec<Worker>, timeout: Duration) -> ShutdownSummary {
    let total = workers.len();
    info!(workers = total, timeout_secs = timeout.as_secs(), "Stopping workers");

    let mut pending: HashSet<String> = workers.iter().map(|w| w.name.clone()).collect();
    let (tx, mut rx) = mpsc::unbounded_channel::<(String, Result<(), String>)>();

    for worker in workers {
        let tx = tx.clone();
        // Spawned so a panicking cleanup cannot take down the others.
        tokio::spawn(async move {
            let result = (worker.cleanup)().await.map_err(|e| e.to_string());
            let _ = tx.send((worker.name, result));
        });
    }
    drop(tx);

    let mut summary = ShutdownSummary::default();
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    while !pending.is_empty() {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some((name, Ok(()))) => {
                    pending.remove(&name);
                    summary.completed.push(name);
                }
                Some((name, Err(e))) => {
                    error!(worker = %name, error = %e, "Worker cleanup failed");
                    pending.remove(&name);
                    summary.failed.push((name, e));
                }
                // All senders gone without reporting: the remaining
                // cleanups panicked.
                None => break,
            },
            _ = &mut deadline => {
                summary.timed_out = true;
                break;
            }
        }
    }

    if !pending.is_empty() {
        let mut unfinished: Vec<String> = pending.into_iter().collect();
        unfinished.sort();
        error!(
            workers = ?unfinished,
            timed_out = summary.timed_out,
            "Proceeding with shutdown before all cleanups finished"
        );
        summary.unfinished = unfinished;
    } else {
        info!(
            completed = summary.completed.len(),
            failed = summary.failed.len(),
            "All workers stopped"
        );
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn noop_cleanup() -> CleanupFn {
        Box::new(|| Box::pin(async { Ok(()) }))
    }

    fn counting_cleanup(counter: Arc<AtomicUsize>) -> CleanupFn {
        Box::new(move || {
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn stop_all_runs_registered_cleanups() {
        let manager = LifecycleManager::new();
        let counter = Arc::new(AtomicUsize::new(0));

        manager.register("a", counting_cleanup(counter.clone())).unwrap();
        manager.register("b", counting_cleanup(counter.clone())).unwrap();
        assert_eq!(manager.worker_count(), 2);

        let summary = manager.stop_all().await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(summary.completed.len(), 2);
        assert!(summary.is_clean());
    }

    #[tokio::test]
    async fn stop_all_is_idempotent() {
        let manager = LifecycleManager::new();
        let counter = Arc::new(AtomicUsize::new(0));
        manager.register("worker", counting_cleanup(counter.clone())).unwrap();

        let first = manager.stop_all().await;
        let second = manager.stop_all().await;

        // Cleanup ran exactly once; both calls observe the same summary.
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(first.completed, second.completed);
    }

    #[tokio::test]
    async fn failing_cleanup_does_not_block_others() {
        let manager = LifecycleManager::new();
        let counter = Arc::new(AtomicUsize::new(0));

        manager
            .register("bad", Box::new(|| Box::pin(async { anyhow::bail!("boom") })))
            .unwrap();
        manager.register("good", counting_cleanup(counter.clone())).unwrap();

        let summary = manager.stop_all().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(summary.completed, vec!["good".to_string()]);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].0, "bad");
        assert!(summary.failed[0].1.contains("boom"));
        assert!(!summary.timed_out);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_all_returns_within_timeout_with_stuck_cleanup() {
        let manager = LifecycleManager::with_timeout(Duration::from_secs(5));

        manager
            .register(
                "stuck",
                Box::new(|| {
                    Box::pin(async {
                        std::future::pending::<()>().await;
                        Ok(())
                    })
                }),
            )
            .unwrap();
        manager.register("quick", noop_cleanup()).unwrap();

        let summary = manager.stop_all().await;
        assert!(summary.timed_out);
        assert_eq!(summary.completed, vec!["quick".to_string()]);
        assert_eq!(summary.unfinished, vec!["stuck".to_string()]);
        assert!(!summary.is_clean());
    }

    #[tokio::test]
    async fn panicking_cleanup_is_isolated() {
        let manager = LifecycleManager::with_timeout(Duration::from_secs(5));
        let counter = Arc::new(AtomicUsize::new(0));

        manager
            .register("panics", Box::new(|| Box::pin(async { panic!("oops") })))
            .unwrap();
        manager.register("survives", counting_cleanup(counter.clone())).unwrap();

        let summary = manager.stop_all().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(summary.completed.contains(&"survives".to_string()));
        assert_eq!(summary.unfinished, vec!["panics".to_string()]);
    }

    #[tokio::test]
    async fn register_after_shutdown_fails() {
        let manager = LifecycleManager::new();
        manager.stop_all().await;

        assert!(manager.is_shutting_down());
        let result = manager.register("late", noop_cleanup());
        assert!(matches!(result, Err(LifecycleError::ShuttingDown(_))));
    }

    #[tokio::test]
    async fn shutdown_flag_visible_during_cleanup() {
        let manager = Arc::new(LifecycleManager::new());
        let seen = Arc::new(AtomicBool::new(false));

        let manager_ref = manager.clone();
        let seen_ref = seen.clone();
        manager
            .register(
                "observer",
                Box::new(move || {
                    Box::pin(async move {
                        seen_ref.store(manager_ref.is_shutting_down(), Ordering::SeqCst);
                        Ok(())
                    })
                }),
            )
            .unwrap();

        manager.stop_all().await;
        assert!(seen.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn concurrent_stop_all_runs_cleanups_once() {
        let manager = Arc::new(LifecycleManager::new());
        let counter = Arc::new(AtomicUsize::new(0));
        manager.register("w", counting_cleanup(counter.clone())).unwrap();

        let a = tokio::spawn({
            let m = manager.clone();
            async move { m.stop_all().await }
        });
        let b = tokio::spawn({
            let m = manager.clone();
            async move { m.stop_all().await }
        });

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(a.completed, b.completed);
    }

    #[tokio::test]
    async fn stop_all_with_no_workers() {
        let manager = LifecycleManager::new();
        let summary = manager.stop_all().await;
        assert!(summary.is_clean());
        assert!(summary.completed.is_empty());
    }
}
