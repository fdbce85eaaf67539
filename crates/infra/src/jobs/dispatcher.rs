//! Concurrency-bounded dispatcher: drains a bus subscription into executor runs.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use jobrelay_bus::{BusError, MessageBus, Subscription};
use jobrelay_core::{JobMessage, JobStatus};

use super::executor::{ExecutionError, Executor};
use super::store::{JobStore, JobStoreError};

/// Largest pool a dispatcher will run. `join` drains by taking every permit
/// in one `acquire_many`, which counts in `u32`.
pub const MAX_CONCURRENCY: usize = if Semaphore::MAX_PERMITS < u32::MAX as usize {
    Semaphore::MAX_PERMITS
} else {
    u32::MAX as usize
};

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum number of executor runs in flight
    pub max_concurrency: usize,
    /// Name for logging
    pub name: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            name: "dispatcher".to_string(),
        }
    }
}

impl DispatcherConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }
}

/// Dispatcher runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct DispatcherStats {
    /// Jobs that reached a terminal state through this dispatcher
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    /// Messages discarded: unknown job, or job no longer pending
    pub jobs_dropped: u64,
    pub current_running: usize,
}

/// Consumes job messages and runs them through the executor, never more than
/// `max_concurrency` at a time.
///
/// Each message becomes its own task holding a semaphore permit for its whole
/// life. When every permit is taken the loop stops pulling from the
/// subscription, which is what pushes back on the bus.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    executor: Arc<dyn Executor>,
    config: DispatcherConfig,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        executor: Arc<dyn Executor>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            executor,
            config,
        }
    }

    /// Subscribe to `bus` and start dispatching.
    ///
    /// A failed subscription is returned to the caller: a dispatcher that
    /// cannot consume is a startup error, not something to log and ignore.
    pub async fn start<B>(self, bus: &B) -> Result<DispatcherHandle, BusError>
    where
        B: MessageBus + ?Sized,
    {
        let subscription = bus.subscribe().await?;
        Ok(self.spawn(subscription))
    }

    /// Start dispatching from an existing subscription.
    ///
    /// `max_concurrency` is clamped to `1..=MAX_CONCURRENCY`.
    pub fn spawn(self, subscription: Subscription) -> DispatcherHandle {
        let capacity = self.config.max_concurrency.clamp(1, MAX_CONCURRENCY);
        if capacity != self.config.max_concurrency {
            warn!(
                dispatcher = %self.config.name,
                requested = self.config.max_concurrency,
                capacity,
                "max_concurrency out of range, clamped"
            );
        }
        let semaphore = Arc::new(Semaphore::new(capacity));
        let stats = Arc::new(Mutex::new(DispatcherStats::default()));

        let worker = Arc::new(Worker {
            store: self.store,
            executor: self.executor,
            stats: stats.clone(),
            name: self.config.name.clone(),
        });

        let task = tokio::spawn(dispatch_loop(
            worker,
            subscription,
            semaphore.clone(),
            capacity,
        ));

        DispatcherHandle {
            task,
            semaphore,
            capacity,
            stats,
            name: self.config.name,
        }
    }
}

/// Handle to a running dispatcher.
#[derive(Debug)]
pub struct DispatcherHandle {
    task: JoinHandle<()>,
    semaphore: Arc<Semaphore>,
    capacity: usize,
    stats: Arc<Mutex<DispatcherStats>>,
    name: String,
}

impl DispatcherHandle {
    pub fn stats(&self) -> DispatcherStats {
        lock(&self.stats).clone()
    }

    /// Executions currently holding a slot.
    pub fn active(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Wait for the subscription to end, then for every in-flight execution
    /// to finish.
    pub async fn join(self) -> DispatcherStats {
        if let Err(e) = self.task.await {
            error!(dispatcher = %self.name, error = %e, "dispatch loop aborted");
        }

        // The loop is gone, so nobody else acquires; getting every permit
        // means every execution has released its own.
        let all = u32::try_from(self.capacity).unwrap_or(u32::MAX);
        match self.semaphore.acquire_many(all).await {
            Ok(_all) => {}
            Err(_) => warn!(dispatcher = %self.name, "semaphore closed while draining"),
        }

        let stats = lock(&self.stats).clone();
        info!(
            dispatcher = %self.name,
            processed = stats.jobs_processed,
            succeeded = stats.jobs_succeeded,
            failed = stats.jobs_failed,
            dropped = stats.jobs_dropped,
            "dispatcher drained"
        );
        stats
    }

    /// Close the bus and drain.
    pub async fn shutdown<B>(self, bus: &B) -> DispatcherStats
    where
        B: MessageBus + ?Sized,
    {
        info!(dispatcher = %self.name, active = self.active(), "dispatcher shutting down");
        bus.close();
        self.join().await
    }
}

fn lock(stats: &Mutex<DispatcherStats>) -> MutexGuard<'_, DispatcherStats> {
    stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Worker {
    store: Arc<dyn JobStore>,
    executor: Arc<dyn Executor>,
    stats: Arc<Mutex<DispatcherStats>>,
    name: String,
}

async fn dispatch_loop(
    worker: Arc<Worker>,
    mut subscription: Subscription,
    semaphore: Arc<Semaphore>,
    capacity: usize,
) {
    info!(dispatcher = %worker.name, capacity, "dispatcher started");

    while let Some(message) = subscription.recv().await {
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        debug!(
            dispatcher = %worker.name,
            job_id = %message.job_id,
            active = capacity - semaphore.available_permits(),
            capacity,
            "dispatching job"
        );

        let worker = worker.clone();
        tokio::spawn(async move {
            let _permit = permit;
            worker.process(message).await;
        });
    }

    info!(dispatcher = %worker.name, "subscription ended, dispatch loop stopped");
}

impl Worker {
    async fn process(&self, message: JobMessage) {
        let job_id = message.job_id;

        let mut job = match self.store.get(job_id).await {
            Ok(job) => job,
            Err(e) => {
                warn!(dispatcher = %self.name, job_id = %job_id, error = %e, "dropping message for unreadable job");
                lock(&self.stats).jobs_dropped += 1;
                return;
            }
        };

        // Duplicate deliveries land here: only a pending job may start.
        if let Err(e) = job.start(Utc::now()) {
            warn!(
                dispatcher = %self.name,
                job_id = %job_id,
                status = %job.status(),
                error = %e,
                "skipping job that is not pending"
            );
            lock(&self.stats).jobs_dropped += 1;
            return;
        }

        // The copy above may be stale. Claiming is a compare-and-set, so when
        // several workers see the same message only one of them runs it.
        match self.store.update_if(&job, JobStatus::Pending).await {
            Ok(()) => {}
            Err(JobStoreError::StatusChanged { found, .. }) => {
                debug!(dispatcher = %self.name, job_id = %job_id, status = %found, "job claimed elsewhere");
                lock(&self.stats).jobs_dropped += 1;
                return;
            }
            Err(e) => {
                error!(dispatcher = %self.name, job_id = %job_id, error = %e, "could not claim job, dropping message");
                lock(&self.stats).jobs_dropped += 1;
                return;
            }
        }

        lock(&self.stats).current_running += 1;

        let executor = self.executor.clone();
        let locator = job.source_locator().to_string();
        let outcome = tokio::spawn(async move { executor.execute(&locator).await })
            .await
            .unwrap_or_else(|e| Err(fault(e)));

        let succeeded = outcome.is_ok();
        let finished = match outcome {
            Ok(output) => job.complete(output, Utc::now()),
            Err(e) => {
                warn!(dispatcher = %self.name, job_id = %job_id, error = %e, "job failed");
                job.fail(e.0, Utc::now())
            }
        };
        if let Err(e) = finished {
            error!(dispatcher = %self.name, job_id = %job_id, error = %e, "could not finish job");
        }

        if let Err(e) = self.store.update(&job).await {
            error!(dispatcher = %self.name, job_id = %job_id, error = %e, "failed to record job result");
        }

        {
            let mut stats = lock(&self.stats);
            stats.current_running = stats.current_running.saturating_sub(1);
            stats.jobs_processed += 1;
            if succeeded {
                stats.jobs_succeeded += 1;
            } else {
                stats.jobs_failed += 1;
            }
        }

        debug!(dispatcher = %self.name, job_id = %job_id, status = %job.status(), "job finished");
    }
}

fn fault(err: JoinError) -> ExecutionError {
    if !err.is_panic() {
        return ExecutionError::new("executor task cancelled");
    }
    let payload = err.into_panic();
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    ExecutionError(format!("executor panicked: {detail}"))
}
