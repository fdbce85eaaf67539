//! Infrastructure layer: job storage, Redis backends, dispatching, rate
//! limiting, configuration.

pub mod config;
pub mod connection;
pub mod event_bus;
pub mod jobs;
pub mod rate_limit;
pub mod service;

#[cfg(test)]
mod integration_tests;

pub use config::{BackendKind, Settings};
pub use connection::{ConnectError, RedisConnection};
pub use service::{JobService, ServiceError, Submission};
