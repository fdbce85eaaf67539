//! `jobrelay-core`: job lifecycle data model.
//!
//! This crate contains the records shared by every backend (no IO): the job
//! identifier, the job record with its status state machine, the public view
//! exposed to pollers, and the envelope carried by the message bus.

pub mod error;
pub mod id;
pub mod job;
pub mod message;

pub use error::{DomainError, DomainResult};
pub use id::JobId;
pub use job::{ExecutionOutput, Job, JobStatus, JobView};
pub use message::JobMessage;
