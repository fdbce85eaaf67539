//! Job record and its status lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted, waiting for a worker slot
    Pending,
    /// Handed to the executor
    Processing,
    /// Executor returned a result
    Completed,
    /// Executor returned an error or faulted
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether `next` is the immediate successor of `self`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Successful result of an executor run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    /// Artifact metadata, opaque to the orchestrator.
    pub metadata: serde_json::Value,
    /// Where the artifact was stored. Never exposed to pollers.
    pub result_locator: String,
}

/// A submitted unit of work and its lifecycle record.
///
/// The record is owned by a job store; everyone else works on copies and
/// writes back through the store's `update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    id: JobId,
    source_locator: String,
    status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result_metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result_locator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new pending job with a fresh id.
    pub fn new(source_locator: impl Into<String>) -> Self {
        Self::with_id(JobId::new(), source_locator, Utc::now())
    }

    /// Like [`Job::new`], but rejects a blank locator. The locator is
    /// otherwise stored exactly as given.
    pub fn submit(source_locator: &str) -> DomainResult<Self> {
        if source_locator.trim().is_empty() {
            return Err(DomainError::validation("source locator must not be empty"));
        }
        Ok(Self::new(source_locator))
    }

    pub fn with_id(id: JobId, source_locator: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            source_locator: source_locator.into(),
            status: JobStatus::Pending,
            result_metadata: None,
            result_locator: None,
            error_message: None,
            created_at,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn source_locator(&self) -> &str {
        &self.source_locator
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn result_metadata(&self) -> Option<&serde_json::Value> {
        self.result_metadata.as_ref()
    }

    pub fn result_locator(&self) -> Option<&str> {
        self.result_locator.as_deref()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Pending → Processing.
    pub fn start(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        self.transition(JobStatus::Processing)?;
        self.started_at = Some(at.max(self.created_at));
        Ok(())
    }

    /// Processing → Completed.
    pub fn complete(&mut self, output: ExecutionOutput, at: DateTime<Utc>) -> DomainResult<()> {
        self.transition(JobStatus::Completed)?;
        self.result_metadata = Some(output.metadata);
        self.result_locator = Some(output.result_locator);
        self.completed_at = Some(self.clamp_finish(at));
        Ok(())
    }

    /// Processing → Failed.
    pub fn fail(&mut self, message: impl Into<String>, at: DateTime<Utc>) -> DomainResult<()> {
        self.transition(JobStatus::Failed)?;
        self.error_message = Some(message.into());
        self.completed_at = Some(self.clamp_finish(at));
        Ok(())
    }

    /// The externally visible projection of this record.
    pub fn view(&self) -> JobView {
        JobView {
            id: self.id,
            source_locator: self.source_locator.clone(),
            status: self.status,
            result_metadata: self.result_metadata.clone(),
            error_message: self.error_message.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }

    fn transition(&mut self, next: JobStatus) -> DomainResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::invalid_transition(self.status, next));
        }
        self.status = next;
        Ok(())
    }

    // Wall clocks can step backwards; timestamps must not.
    fn clamp_finish(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        at.max(self.started_at.unwrap_or(self.created_at))
    }
}

/// What a poller is allowed to see: the job record minus `result_locator`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    pub id: JobId,
    pub source_locator: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        job.view()
    }
}
