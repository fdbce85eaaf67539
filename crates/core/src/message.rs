//! Bus envelope.

use serde::{Deserialize, Serialize};

use crate::id::JobId;
use crate::job::Job;

/// What crosses the message bus for one job.
///
/// Carries no status: the job store is the only source of truth for
/// lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
    pub job_id: JobId,
    pub source_locator: String,
}

impl JobMessage {
    pub fn new(job_id: JobId, source_locator: impl Into<String>) -> Self {
        Self {
            job_id,
            source_locator: source_locator.into(),
        }
    }
}

impl From<&Job> for JobMessage {
    fn from(job: &Job) -> Self {
        Self::new(job.id(), job.source_locator())
    }
}
