//! Job records, their storage, and their execution.
//!
//! ## Components
//!
//! - `JobStore`: record storage (in-memory or Redis)
//! - `Executor`: the pluggable unit of work
//! - `Dispatcher`: drains a bus subscription with bounded concurrency
//!
//! Status only ever moves Pending → Processing → Completed | Failed. There are
//! no retries: a failed job stays failed.

pub mod dispatcher;
pub mod executor;
pub mod redis_store;
pub mod store;

pub use dispatcher::{
    Dispatcher, DispatcherConfig, DispatcherHandle, DispatcherStats, MAX_CONCURRENCY,
};
pub use executor::{CommandExecutor, ExecutionError, Executor, FnExecutor};
pub use redis_store::RedisJobStore;
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
