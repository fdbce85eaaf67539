//! Worker process wiring: backends from settings, dispatcher lifecycle.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use jobrelay_bus::{InMemoryMessageBus, MessageBus};
use jobrelay_infra::config::{ExecutorSettings, RedisSettings};
use jobrelay_infra::event_bus::RedisStreamsBus;
use jobrelay_infra::jobs::{
    CommandExecutor, Dispatcher, DispatcherConfig, DispatcherHandle, DispatcherStats, Executor,
    InMemoryJobStore, JobStore, RedisJobStore,
};
use jobrelay_infra::rate_limit::{
    DurableRateLimiter, InMemoryRateLimiter, RateLimiter, RedisWindowCounter,
};
use jobrelay_infra::{BackendKind, JobService, RedisConnection, Settings};

/// The shared collaborators, built once at startup and injected everywhere.
#[derive(Clone)]
pub struct Backends {
    pub kind: BackendKind,
    pub store: Arc<dyn JobStore>,
    pub bus: Arc<dyn MessageBus>,
    pub limiter: Arc<dyn RateLimiter>,
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl Backends {
    /// Process-local store, bus and limiter.
    pub fn volatile(settings: &Settings) -> Self {
        Self {
            kind: BackendKind::Volatile,
            store: InMemoryJobStore::arc(),
            bus: Arc::new(InMemoryMessageBus::new(settings.queue.buffer_size)),
            limiter: Arc::new(InMemoryRateLimiter::new(
                settings.rate_limit.quota,
                settings.rate_limit.window,
            )),
        }
    }

    /// Redis-backed store, stream bus and limiter. Fails if Redis does not
    /// answer.
    pub async fn durable(redis: &RedisSettings, settings: &Settings) -> anyhow::Result<Self> {
        let conn = RedisConnection::connect(redis)
            .await
            .with_context(|| format!("connecting to redis at {}", redis.addr))?;

        let bus = RedisStreamsBus::new(&conn, Some(settings.queue.name.clone()))
            .with_max_length(settings.queue.max_length);
        let limiter = DurableRateLimiter::new(
            RedisWindowCounter::new(&conn),
            settings.rate_limit.quota,
            settings.rate_limit.window,
        );

        Ok(Self {
            kind: BackendKind::Durable,
            store: Arc::new(RedisJobStore::new(&conn)),
            bus: Arc::new(bus),
            limiter: Arc::new(limiter),
        })
    }

    pub async fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        match &settings.redis {
            Some(redis) => Self::durable(redis, settings).await,
            None => {
                warn!(
                    "REDIS_ADDR not set; using in-memory backends, which only work when submission and dispatch share this process"
                );
                Ok(Self::volatile(settings))
            }
        }
    }

    /// The submission/poll facade over these backends.
    pub fn service(&self) -> JobService {
        JobService::new(self.store.clone(), self.bus.clone(), self.limiter.clone())
    }
}

pub fn command_executor(settings: &ExecutorSettings) -> anyhow::Result<CommandExecutor> {
    let program = settings
        .program
        .as_deref()
        .context("EXECUTOR_PATH must name the program that runs jobs")?;
    Ok(CommandExecutor::new(program).with_args(settings.args.iter().cloned()))
}

/// Point-in-time worker health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Health {
    pub backend: BackendKind,
    pub active: usize,
    pub capacity: usize,
}

/// A running dispatcher bound to its bus.
pub struct WorkerRuntime {
    kind: BackendKind,
    bus: Arc<dyn MessageBus>,
    handle: DispatcherHandle,
}

impl std::fmt::Debug for WorkerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRuntime")
            .field("kind", &self.kind)
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl WorkerRuntime {
    /// Subscribe the dispatcher to the bus and start consuming.
    pub async fn start(
        backends: &Backends,
        executor: Arc<dyn Executor>,
        max_workers: usize,
    ) -> anyhow::Result<Self> {
        let config = DispatcherConfig::default()
            .with_name("worker")
            .with_max_concurrency(max_workers);
        let handle = Dispatcher::new(backends.store.clone(), executor, config)
            .start(backends.bus.as_ref())
            .await
            .context("subscribing to the job bus")?;

        info!(backend = ?backends.kind, capacity = handle.capacity(), "worker started");
        Ok(Self {
            kind: backends.kind,
            bus: backends.bus.clone(),
            handle,
        })
    }

    pub fn health(&self) -> Health {
        Health {
            backend: self.kind,
            active: self.handle.active(),
            capacity: self.handle.capacity(),
        }
    }

    pub fn stats(&self) -> DispatcherStats {
        self.handle.stats()
    }

    /// Close the bus and wait for in-flight jobs.
    pub async fn shutdown(self) -> DispatcherStats {
        self.handle.shutdown(self.bus.as_ref()).await
    }
}
