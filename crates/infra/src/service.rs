//! Submission, polling and admin operations over the store, bus and limiter.
//!
//! This is the surface a request layer calls. Client identity is already
//! resolved into an opaque `client_key` by the time it gets here.

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use jobrelay_bus::{BusError, MessageBus};
use jobrelay_core::{Job, JobId, JobMessage, JobStatus, JobView};

use crate::jobs::store::{JobStore, JobStoreError};
use crate::rate_limit::RateLimiter;

/// Acknowledgement of an accepted submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Submission {
    pub job_id: JobId,
    pub status: JobStatus,
    /// Submissions left in this window; `None` when limiting is disabled.
    pub remaining_quota: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("rate limit exceeded")]
    RateLimited { remaining: u64 },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("job not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(JobStoreError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

impl From<JobStoreError> for ServiceError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::NotFound(id) => ServiceError::NotFound(id.to_string()),
            other => ServiceError::Store(other),
        }
    }
}

/// Entry point for submitting and inspecting jobs.
#[derive(Clone)]
pub struct JobService {
    store: Arc<dyn JobStore>,
    bus: Arc<dyn MessageBus>,
    limiter: Arc<dyn RateLimiter>,
}

impl std::fmt::Debug for JobService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobService").finish_non_exhaustive()
    }
}

impl JobService {
    pub fn new(
        store: Arc<dyn JobStore>,
        bus: Arc<dyn MessageBus>,
        limiter: Arc<dyn RateLimiter>,
    ) -> Self {
        Self {
            store,
            bus,
            limiter,
        }
    }

    /// Accept a job for `source_locator` on behalf of `client_key`.
    ///
    /// The record is created before the message is published, so a dispatcher
    /// never sees an id it cannot load. If publishing fails the record is
    /// removed again and the bus error is returned.
    pub async fn submit(
        &self,
        client_key: &str,
        source_locator: &str,
    ) -> Result<Submission, ServiceError> {
        let decision = self.limiter.allow(client_key).await;
        if !decision.allowed {
            info!(client = client_key, "submission rate limited");
            return Err(ServiceError::RateLimited {
                remaining: decision.remaining.unwrap_or(0),
            });
        }

        let job =
            Job::submit(source_locator).map_err(|e| ServiceError::InvalidInput(e.to_string()))?;
        self.store.create(&job).await?;

        if let Err(e) = self.bus.publish(JobMessage::from(&job)).await {
            warn!(job_id = %job.id(), error = %e, "publish failed, withdrawing job");
            if let Err(cleanup) = self.store.delete(job.id()).await {
                error!(job_id = %job.id(), error = %cleanup, "failed to withdraw unpublished job");
            }
            return Err(e.into());
        }

        info!(job_id = %job.id(), client = client_key, "job submitted");
        Ok(Submission {
            job_id: job.id(),
            status: job.status(),
            remaining_quota: decision.remaining,
        })
    }

    /// Poll a job by its textual id.
    pub async fn status(&self, job_id: &str) -> Result<JobView, ServiceError> {
        let id = parse_id(job_id)?;
        Ok(self.store.get(id).await?.view())
    }

    pub async fn get_job(&self, job_id: &str) -> Result<JobView, ServiceError> {
        self.status(job_id).await
    }

    pub async fn list_jobs(&self) -> Result<Vec<JobView>, ServiceError> {
        Ok(self.store.list().await?.iter().map(Job::view).collect())
    }

    /// Remove a job and hand back the full record, including its
    /// `result_locator`, so the caller can dispose of the artifact.
    pub async fn delete_job(&self, job_id: &str) -> Result<Job, ServiceError> {
        let id = parse_id(job_id)?;
        let job = self.store.get(id).await?;
        self.store.delete(id).await?;
        info!(job_id = %id, status = %job.status(), "job deleted");
        Ok(job)
    }
}

fn parse_id(raw: &str) -> Result<JobId, ServiceError> {
    raw.parse()
        .map_err(|_| ServiceError::NotFound(raw.trim().to_string()))
}
