//! Infrastructure message bus implementations.
//!
//! The bus abstraction lives in `jobrelay-bus` as pure mechanics.
//! This module provides the Redis-backed implementation.

pub mod redis_streams;

pub use redis_streams::RedisStreamsBus;
