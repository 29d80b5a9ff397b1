//! ---
//! cbx_section: "02-fault-injection"
//! cbx_subsection: "module"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Fault-injection execution engine."
//! cbx_version: "v0.0.0-prealpha"
//! cbx_owner: "tbd"
//! ---
//! Pools of load-generating workers sharing one broadcast stop signal.

use std::future::Future;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use rand::Rng;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};

/// Default time workers get to observe the stop signal before being aborted.
pub const DEFAULT_WORKER_GRACE: Duration = Duration::from_secs(5);

/// How long an aborted worker gets to unwind before shutdown moves on.
const ABORT_SETTLE: Duration = Duration::from_millis(250);

/// What a worker does after one invocation of its work function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStep {
    /// Invoke the work function again.
    Continue,
    /// Park until the pool is stopped.
    Hold,
    /// Exit without waiting for the stop signal.
    Done,
}

/// Reaction to a work function returning an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnWorkerError {
    /// The failing worker exits; the rest keep running.
    Retire,
    /// The failing worker pauses for a jittered backoff and tries again.
    Continue { backoff: Duration },
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub label: String,
    pub workers: usize,
    pub grace: Duration,
    pub on_error: OnWorkerError,
}

impl WorkerPoolConfig {
    pub fn new(label: impl Into<String>, workers: usize) -> Self {
        Self {
            label: label.into(),
            workers,
            grace: DEFAULT_WORKER_GRACE,
            on_error: OnWorkerError::Retire,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_on_error(mut self, on_error: OnWorkerError) -> Self {
        self.on_error = on_error;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerExit {
    Stopped,
    Finished,
    Retired,
}

/// Summary of a pool after [`WorkerPool::shutdown`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolReport {
    pub label: String,
    pub workers: usize,
    /// Workers that exited after observing the stop signal.
    pub stopped: usize,
    /// Workers whose work function returned [`WorkerStep::Done`].
    pub finished: usize,
    /// Workers that exited after an error under [`OnWorkerError::Retire`].
    pub retired: usize,
    /// Work function errors observed across all workers.
    pub failures: usize,
    /// Workers still running at the grace deadline; these were aborted.
    pub stragglers: Vec<usize>,
    pub panicked: Vec<usize>,
}

impl PoolReport {
    /// True when every worker exited on its own within the grace period.
    pub fn is_clean(&self) -> bool {
        self.stragglers.is_empty() && self.panicked.is_empty()
    }

    pub fn into_result(self) -> anyhow::Result<()> {
        if self.is_clean() {
            return Ok(());
        }
        bail!(
            "{} pool did not stop cleanly: {} straggler(s) {:?}, {} panicked {:?}",
            self.label,
            self.stragglers.len(),
            self.stragglers,
            self.panicked.len(),
            self.panicked
        )
    }
}

/// Observes how many workers have completed their first invocation.
#[derive(Debug, Clone)]
pub struct Readiness {
    rx: watch::Receiver<usize>,
    expected: usize,
}

impl Readiness {
    pub fn ready(&self) -> usize {
        *self.rx.borrow()
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn is_ready(&self) -> bool {
        self.ready() >= self.expected
    }

    /// Wait until every worker is ready or `limit` elapses, returning the ready count.
    pub async fn wait(mut self, limit: Duration) -> usize {
        let expected = self.expected;
        let reached = match timeout(limit, self.rx.wait_for(|ready| *ready >= expected)).await {
            Ok(Ok(ready)) => Some(*ready),
            _ => None,
        };
        reached.unwrap_or_else(|| *self.rx.borrow())
    }
}

/// Handle over a set of spawned workers.
///
/// Dropping the pool broadcasts stop but does not wait; call [`WorkerPool::shutdown`]
/// to join the workers and collect a [`PoolReport`].
pub struct WorkerPool {
    label: Arc<str>,
    workers: usize,
    grace: Duration,
    stop: watch::Sender<bool>,
    ready: watch::Receiver<usize>,
    failures: Arc<AtomicUsize>,
    handles: Vec<(usize, JoinHandle<WorkerExit>)>,
}

impl WorkerPool {
    /// Spawn `config.workers` tasks, each calling `work(worker_id)` until stopped.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<W, Fut>(config: WorkerPoolConfig, work: W) -> Self
    where
        W: Fn(usize) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<WorkerStep>> + Send + 'static,
    {
        let label: Arc<str> = Arc::from(config.label.as_str());
        let (stop, stop_rx) = watch::channel(false);
        let (ready_tx, ready) = watch::channel(0usize);
        let ready_tx = Arc::new(ready_tx);
        let failures = Arc::new(AtomicUsize::new(0));
        let work = Arc::new(work);

        let handles = (0..config.workers)
            .map(|id| {
                let worker = Worker {
                    id,
                    label: label.clone(),
                    stop: stop_rx.clone(),
                    ready: ReadyMark::new(ready_tx.clone()),
                    failures: failures.clone(),
                    on_error: config.on_error,
                };
                (id, tokio::spawn(worker.run(work.clone())))
            })
            .collect();

        info!(pool = %label, workers = config.workers, "worker pool started");
        Self {
            label,
            workers: config.workers,
            grace: config.grace,
            stop,
            ready,
            failures,
            handles,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Work function errors observed so far.
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn readiness(&self) -> Readiness {
        Readiness {
            rx: self.ready.clone(),
            expected: self.workers,
        }
    }

    /// Wait until every worker finished its first invocation, bounded by `limit`.
    pub async fn wait_ready(&self, limit: Duration) -> usize {
        self.readiness().wait(limit).await
    }

    /// Broadcast the stop signal to every worker. Idempotent.
    pub fn stop(&self) {
        if !self.stop.send_replace(true) {
            info!(pool = %self.label, "stop broadcast to workers");
        }
    }

    /// Stop every worker and wait for them until the grace deadline.
    pub async fn shutdown(mut self) -> PoolReport {
        self.stop();
        let deadline = Instant::now() + self.grace;
        let mut report = PoolReport {
            label: self.label.to_string(),
            workers: self.workers,
            ..PoolReport::default()
        };

        for (id, mut handle) in mem::take(&mut self.handles) {
            match timeout_at(deadline, &mut handle).await {
                Ok(Ok(WorkerExit::Stopped)) => report.stopped += 1,
                Ok(Ok(WorkerExit::Finished)) => report.finished += 1,
                Ok(Ok(WorkerExit::Retired)) => report.retired += 1,
                Ok(Err(err)) if err.is_panic() => {
                    error!(pool = %self.label, worker = id, error = %err, "worker panicked");
                    report.panicked.push(id);
                }
                Ok(Err(err)) => {
                    warn!(pool = %self.label, worker = id, error = %err, "worker join error");
                    report.stragglers.push(id);
                }
                Err(_) => {
                    handle.abort();
                    warn!(pool = %self.label, worker = id, grace = ?self.grace, "worker missed grace deadline; aborted");
                    if timeout(ABORT_SETTLE, &mut handle).await.is_err() {
                        error!(pool = %self.label, worker = id, settle = ?ABORT_SETTLE, "aborted worker still running");
                    }
                    report.stragglers.push(id);
                }
            }
        }

        report.failures = self.failures();
        info!(
            pool = %self.label,
            stopped = report.stopped,
            finished = report.finished,
            retired = report.retired,
            failures = report.failures,
            stragglers = report.stragglers.len(),
            "worker pool shut down"
        );
        report
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop.send_replace(true);
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("label", &self.label)
            .field("workers", &self.workers)
            .field("grace", &self.grace)
            .field("stopped", &*self.stop.borrow())
            .field("ready", &*self.ready.borrow())
            .finish()
    }
}

struct ReadyMark {
    tx: Arc<watch::Sender<usize>>,
    marked: bool,
}

impl ReadyMark {
    fn new(tx: Arc<watch::Sender<usize>>) -> Self {
        Self { tx, marked: false }
    }

    fn mark(&mut self) {
        if !self.marked {
            self.marked = true;
            self.tx.send_modify(|ready| *ready += 1);
        }
    }
}

/// A worker that panics or is aborted still counts as ready.
impl Drop for ReadyMark {
    fn drop(&mut self) {
        self.mark();
    }
}

struct Worker {
    id: usize,
    label: Arc<str>,
    stop: watch::Receiver<bool>,
    ready: ReadyMark,
    failures: Arc<AtomicUsize>,
    on_error: OnWorkerError,
}

impl Worker {
    async fn run<W, Fut>(mut self, work: Arc<W>) -> WorkerExit
    where
        W: Fn(usize) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<WorkerStep>> + Send + 'static,
    {
        let exit = self.work_loop(work).await;
        self.ready.mark();
        debug!(pool = %self.label, worker = self.id, exit = ?exit, "worker exited");
        exit
    }

    async fn work_loop<W, Fut>(&mut self, work: Arc<W>) -> WorkerExit
    where
        W: Fn(usize) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<WorkerStep>> + Send + 'static,
    {
        loop {
            if *self.stop.borrow() {
                return WorkerExit::Stopped;
            }

            let result = tokio::select! {
                biased;
                _ = self.stop.wait_for(|stopped| *stopped) => return WorkerExit::Stopped,
                result = work(self.id) => result,
            };
            self.ready.mark();

            match result {
                Ok(WorkerStep::Continue) => {}
                Ok(WorkerStep::Hold) => {
                    let _ = self.stop.wait_for(|stopped| *stopped).await;
                    return WorkerExit::Stopped;
                }
                Ok(WorkerStep::Done) => return WorkerExit::Finished,
                Err(err) => {
                    let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
                    match self.on_error {
                        OnWorkerError::Retire => {
                            warn!(pool = %self.label, worker = self.id, error = %format!("{err:#}"), "worker failed; retiring");
                            return WorkerExit::Retired;
                        }
                        OnWorkerError::Continue { backoff } => {
                            let pause = jittered(backoff);
                            debug!(pool = %self.label, worker = self.id, failures, pause = ?pause, error = %format!("{err:#}"), "worker failed; backing off");
                            tokio::select! {
                                biased;
                                _ = self.stop.wait_for(|stopped| *stopped) => return WorkerExit::Stopped,
                                _ = sleep(pause) => {}
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Backoff plus up to 50% random jitter.
fn jittered(backoff: Duration) -> Duration {
    let base = backoff.as_millis() as u64;
    if base == 0 {
        return backoff;
    }
    let jitter = rand::thread_rng().gen_range(0..=base / 2);
    Duration::from_millis(base + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    use anyhow::anyhow;

    fn config(workers: usize) -> WorkerPoolConfig {
        WorkerPoolConfig::new("test", workers).with_grace(Duration::from_millis(500))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn broadcast_stop_reaches_every_worker() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let counter = invocations.clone();
        let pool = WorkerPool::start(config(16), move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::Relaxed);
                sleep(Duration::from_millis(5)).await;
                Ok(WorkerStep::Continue)
            }
        });

        assert_eq!(pool.wait_ready(Duration::from_secs(2)).await, 16);
        let started = std::time::Instant::now();
        let report = pool.shutdown().await;

        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(report.stopped, 16);
        assert!(report.is_clean());
        assert!(invocations.load(Ordering::Relaxed) >= 16);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn held_workers_park_until_stopped() {
        let pool = WorkerPool::start(config(8), |_| async { Ok(WorkerStep::Hold) });
        let readiness = pool.readiness();
        assert_eq!(readiness.clone().wait(Duration::from_secs(2)).await, 8);
        assert!(readiness.is_ready());

        let report = pool.shutdown().await;
        assert_eq!(report.stopped, 8);
        assert_eq!(report.failures, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn retire_policy_only_removes_failing_workers() {
        let pool = WorkerPool::start(config(10), |id| async move {
            if id < 3 {
                Err(anyhow!("connection refused"))
            } else {
                Ok(WorkerStep::Hold)
            }
        });

        assert_eq!(pool.wait_ready(Duration::from_secs(2)).await, 10);
        assert_eq!(pool.failures(), 3);

        let report = pool.shutdown().await;
        assert_eq!(report.retired, 3);
        assert_eq!(report.stopped, 7);
        assert_eq!(report.failures, 3);
        assert!(report.into_result().is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn continue_policy_keeps_failing_worker_alive() {
        let pool = WorkerPool::start(
            config(2).with_on_error(OnWorkerError::Continue {
                backoff: Duration::from_millis(5),
            }),
            |id| async move {
                if id == 0 {
                    Err(anyhow!("lock wait timeout"))
                } else {
                    sleep(Duration::from_millis(5)).await;
                    Ok(WorkerStep::Continue)
                }
            },
        );

        sleep(Duration::from_millis(150)).await;
        assert!(pool.failures() > 1);

        let report = pool.shutdown().await;
        assert_eq!(report.stopped, 2);
        assert_eq!(report.retired, 0);
        assert!(report.is_clean());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn done_workers_are_reported_as_finished() {
        let pool = WorkerPool::start(config(4), |_| async { Ok(WorkerStep::Done) });
        assert_eq!(pool.wait_ready(Duration::from_secs(2)).await, 4);
        let report = pool.shutdown().await;
        assert_eq!(report.finished, 4);
        assert_eq!(report.stopped, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn readiness_wait_returns_partial_count_on_timeout() {
        let pool = WorkerPool::start(config(3), |id| async move {
            if id == 2 {
                sleep(Duration::from_secs(30)).await;
            }
            Ok(WorkerStep::Hold)
        });

        assert_eq!(pool.wait_ready(Duration::from_millis(100)).await, 2);
        let report = pool.shutdown().await;
        assert_eq!(report.stopped, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn blocked_worker_is_aborted_as_straggler() {
        let entered = Arc::new(AtomicBool::new(false));
        let flag = entered.clone();
        let pool = WorkerPool::start(
            WorkerPoolConfig::new("stuck", 2).with_grace(Duration::from_millis(100)),
            move |id| {
                let flag = flag.clone();
                async move {
                    if id == 0 {
                        flag.store(true, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(600));
                    } else {
                        sleep(Duration::from_millis(5)).await;
                    }
                    Ok(WorkerStep::Continue)
                }
            },
        );

        while !entered.load(Ordering::SeqCst) {
            sleep(Duration::from_millis(5)).await;
        }
        let report = pool.shutdown().await;

        assert_eq!(report.stragglers, vec![0]);
        assert_eq!(report.stopped, 1);
        assert!(!report.is_clean());
        let err = report.into_result().unwrap_err();
        assert!(err.to_string().contains("stuck pool did not stop cleanly"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn aborted_worker_is_awaited_before_shutdown_returns() {
        let entered = Arc::new(AtomicBool::new(false));
        let unblocked = Arc::new(AtomicBool::new(false));
        let (enter_flag, unblock_flag) = (entered.clone(), unblocked.clone());
        let pool = WorkerPool::start(
            WorkerPoolConfig::new("slow", 1).with_grace(Duration::from_millis(50)),
            move |_| {
                let enter_flag = enter_flag.clone();
                let unblock_flag = unblock_flag.clone();
                async move {
                    enter_flag.store(true, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(150));
                    unblock_flag.store(true, Ordering::SeqCst);
                    Ok(WorkerStep::Continue)
                }
            },
        );

        while !entered.load(Ordering::SeqCst) {
            sleep(Duration::from_millis(5)).await;
        }
        let report = pool.shutdown().await;

        assert_eq!(report.stragglers, vec![0]);
        assert!(unblocked.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn panicking_worker_still_counts_as_ready() {
        let pool = WorkerPool::start(config(3), |id| async move {
            if id == 0 {
                panic!("worker exploded before holding");
            }
            Ok(WorkerStep::Hold)
        });

        let started = std::time::Instant::now();
        assert_eq!(pool.wait_ready(Duration::from_secs(5)).await, 3);
        assert!(started.elapsed() < Duration::from_secs(1));

        let report = pool.shutdown().await;
        assert_eq!(report.panicked, vec![0]);
        assert_eq!(report.stopped, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn panicking_worker_does_not_take_down_the_pool() {
        let pool = WorkerPool::start(config(3), |id| async move {
            if id == 1 {
                panic!("worker exploded");
            }
            Ok(WorkerStep::Hold)
        });

        sleep(Duration::from_millis(50)).await;
        let report = pool.shutdown().await;
        assert_eq!(report.panicked, vec![1]);
        assert_eq!(report.stopped, 2);
    }

    #[test]
    fn jitter_stays_within_half_the_backoff() {
        for _ in 0..100 {
            let pause = jittered(Duration::from_millis(100));
            assert!(pause >= Duration::from_millis(100));
            assert!(pause <= Duration::from_millis(150));
        }
        assert_eq!(jittered(Duration::ZERO), Duration::ZERO);
    }
}
