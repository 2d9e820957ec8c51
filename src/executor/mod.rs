//! Bounded concurrent task execution
//!
//! Two fixed-size pools built on tokio semaphores: an I/O pool for async
//! work (`spawn`) and an optional, smaller CPU pool for blocking work
//! (`spawn_blocking`), the latter sized to half of available parallelism by
//! default. Every call carries a deadline; a timeout gives up the *wait* and
//! flips an advisory cancellation token, but cannot forcibly stop work that
//! is already running; the abandoned task releases its pool slot whenever it
//! actually finishes.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// A unit of submitted async work: the callable with its arguments bound,
/// returning an opaque result or error
pub type Work<T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send>>;

/// Box a future into a [`Work`] item
pub fn work<T, F>(fut: F) -> Work<T>
where
    F: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    Box::pin(fut)
}

/// Wrap a blocking closure as a [`Work`] item via `spawn_blocking`, for use
/// in batches of CPU-bound computations
pub fn blocking_work<T, F>(f: F) -> Work<T>
where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    Box::pin(async move {
        match tokio::task::spawn_blocking(f).await {
            Ok(result) => result,
            Err(join_err) => Err(anyhow!("blocking task failed: {join_err}")),
        }
    })
}

/// Errors surfaced by the executor
///
/// `Timeout` is deliberately distinct from `Computation` so callers can
/// retry the former without re-running work that failed on its own.
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("execution timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("executor is shutting down")]
    ShuttingDown,

    #[error("computation failed: {0}")]
    Computation(#[source] anyhow::Error),
}

/// Executor configuration
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Concurrent slots for I/O-bound work
    pub io_workers: usize,
    /// Concurrent slots for CPU-bound work
    pub cpu_workers: usize,
    /// Whether blocking work gets its own pool; when false it shares the
    /// I/O pool's slots
    pub enable_cpu_pool: bool,
}

impl ExecutorConfig {
    /// Half of available parallelism, the default CPU pool size
    pub fn default_cpu_workers() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get() / 2)
            .unwrap_or(1)
            .max(1)
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            io_workers: 8,
            cpu_workers: Self::default_cpu_workers(),
            enable_cpu_pool: true,
        }
    }
}

/// Pool sizes and current utilization
#[derive(Debug, Clone, Serialize)]
pub struct ExecutorStats {
    pub io_workers: usize,
    pub cpu_workers: usize,
    pub cpu_pool_enabled: bool,
    pub io_in_flight: usize,
    pub cpu_in_flight: usize,
}

/// Decrements an in-flight counter when the owning task ends, however it ends
struct InFlightGuard {
    counter: Arc<AtomicUsize>,
    drained: Arc<Notify>,
}

impl InFlightGuard {
    fn enter(counter: &Arc<AtomicUsize>, drained: &Arc<Notify>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self {
            counter: counter.clone(),
            drained: drained.clone(),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.counter.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }
}

/// Fixed-size worker pools with per-call timeouts and bounded batches
pub struct BoundedExecutor {
    config: ExecutorConfig,
    io_permits: Arc<Semaphore>,
    cpu_permits: Option<Arc<Semaphore>>,
    io_in_flight: Arc<AtomicUsize>,
    cpu_in_flight: Arc<AtomicUsize>,
    cancel: CancellationToken,
    accepting: AtomicBool,
    drained: Arc<Notify>,
}

impl BoundedExecutor {
    /// Create an executor with the given pool configuration
    pub fn new(config: ExecutorConfig) -> Self {
        let cpu_permits = config
            .enable_cpu_pool
            .then(|| Arc::new(Semaphore::new(config.cpu_workers.max(1))));

        Self {
            io_permits: Arc::new(Semaphore::new(config.io_workers.max(1))),
            cpu_permits,
            io_in_flight: Arc::new(AtomicUsize::new(0)),
            cpu_in_flight: Arc::new(AtomicUsize::new(0)),
            cancel: CancellationToken::new(),
            accepting: AtomicBool::new(true),
            drained: Arc::new(Notify::new()),
            config,
        }
    }

    /// Run one async work item on the I/O pool
    ///
    /// The timeout covers queueing for a pool slot as well as execution. On
    /// timeout the dispatched work is cancelled best-effort and its eventual
    /// result discarded.
    pub async fn execute<T: Send + 'static>(
        &self,
        work: Work<T>,
        timeout: Duration,
    ) -> Result<T, ExecError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(ExecError::ShuttingDown);
        }

        let token = self.cancel.child_token();
        let call_token = token.clone();
        let sem = self.io_permits.clone();
        let guard_counter = self.io_in_flight.clone();
        let drained = self.drained.clone();

        let waited = tokio::time::timeout(timeout, async move {
            let permit = sem
                .acquire_owned()
                .await
                .map_err(|_| ExecError::ShuttingDown)?;

            let task_token = token.clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                let _guard = InFlightGuard::enter(&guard_counter, &drained);
                tokio::select! {
                    _ = task_token.cancelled() => Err(anyhow!("work cancelled")),
                    result = work => result,
                }
            });

            match handle.await {
                Ok(result) => result.map_err(ExecError::Computation),
                Err(join_err) => Err(ExecError::Computation(anyhow!(
                    "worker task failed: {join_err}"
                ))),
            }
        })
        .await;

        match waited {
            Ok(result) => result,
            Err(_) => {
                // Give up the wait; the task itself stops at its next
                // cancellation point (or runs to completion, discarded).
                self.cancel_call(call_token, timeout)
            }
        }
    }

    /// Run one blocking work item on the CPU pool
    ///
    /// Falls back to the I/O pool when the CPU pool is disabled. Cancellation
    /// is advisory only: a closure already running cannot be interrupted.
    pub async fn execute_blocking<T, F>(&self, f: F, timeout: Duration) -> Result<T, ExecError>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(ExecError::ShuttingDown);
        }

        let (sem, counter) = match &self.cpu_permits {
            Some(cpu) => (cpu.clone(), self.cpu_in_flight.clone()),
            None => (self.io_permits.clone(), self.io_in_flight.clone()),
        };
        let token = self.cancel.child_token();
        let call_token = token.clone();
        let drained = self.drained.clone();

        let waited = tokio::time::timeout(timeout, async move {
            let permit = sem
                .acquire_owned()
                .await
                .map_err(|_| ExecError::ShuttingDown)?;

            let task_token = token.clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                let _guard = InFlightGuard::enter(&counter, &drained);
                let blocking = tokio::task::spawn_blocking(move || {
                    if task_token.is_cancelled() {
                        return Err(anyhow!("work cancelled before start"));
                    }
                    f()
                });
                match blocking.await {
                    Ok(result) => result,
                    Err(join_err) => Err(anyhow!("blocking task failed: {join_err}")),
                }
            });

            match handle.await {
                Ok(result) => result.map_err(ExecError::Computation),
                Err(join_err) => Err(ExecError::Computation(anyhow!(
                    "worker task failed: {join_err}"
                ))),
            }
        })
        .await;

        match waited {
            Ok(result) => result,
            Err(_) => self.cancel_call(call_token, timeout),
        }
    }

    fn cancel_call<T>(&self, token: CancellationToken, timeout: Duration) -> Result<T, ExecError> {
        token.cancel();
        trace!(timeout_ms = timeout.as_millis() as u64, "execution wait timed out");
        Err(ExecError::Timeout { timeout })
    }

    /// Run a batch of async work items, never more than `max_concurrent` at
    /// once
    ///
    /// Concurrency is bounded by a counting semaphore independent of the
    /// pool size (clamped to the I/O pool size, so items queue here rather
    /// than inside the pool). Output order equals input order regardless of
    /// completion order, and each item's error is captured independently:
    /// one failure or timeout never aborts the rest of the batch.
    pub async fn execute_batch<T: Send + 'static>(
        &self,
        items: Vec<Work<T>>,
        max_concurrent: usize,
        timeout: Duration,
    ) -> Vec<Result<T, ExecError>> {
        let bound = max_concurrent.clamp(1, self.config.io_workers.max(1));
        let gate = Arc::new(Semaphore::new(bound));

        let slots = items.into_iter().map(|item| {
            let gate = gate.clone();
            async move {
                let _slot = match gate.acquire_owned().await {
                    Ok(slot) => slot,
                    Err(_) => return Err(ExecError::ShuttingDown),
                };
                // The slot is released whether the item succeeds, errors or
                // times out, so a stuck item only ever costs its own slot.
                self.execute(item, timeout).await
            }
        });

        futures::future::join_all(slots).await
    }

    /// Stop accepting work and wait for in-flight work to drain
    ///
    /// Callers already past the intake gate keep running and still receive
    /// their results; only new submissions and queued-but-unstarted waiters
    /// are turned away. Idempotent; later calls just wait for the drain to
    /// finish.
    pub async fn shutdown(&self) {
        if self.accepting.swap(false, Ordering::SeqCst) {
            debug!("executor shutting down");
            self.io_permits.close();
            if let Some(cpu) = &self.cpu_permits {
                cpu.close();
            }
        }

        loop {
            let drained = self.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            let in_flight =
                self.io_in_flight.load(Ordering::SeqCst) + self.cpu_in_flight.load(Ordering::SeqCst);
            if in_flight == 0 {
                break;
            }
            debug!(in_flight, "waiting for in-flight work to drain");
            drained.await;
        }
    }

    /// Pool sizes and utilization
    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            io_workers: self.config.io_workers,
            cpu_workers: self.config.cpu_workers,
            cpu_pool_enabled: self.cpu_permits.is_some(),
            io_in_flight: self.io_in_flight.load(Ordering::SeqCst),
            cpu_in_flight: self.cpu_in_flight.load(Ordering::SeqCst),
        }
    }
}
