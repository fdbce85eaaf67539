//! Job record storage.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use jobrelay_core::{Job, JobId, JobStatus};

/// Job store abstraction.
///
/// The store exclusively owns job records. Readers get owned copies; the only
/// way to change a record is to hand a whole new version to
/// [`JobStore::update`] or [`JobStore::update_if`].
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new record. Fails with `AlreadyExists` if the id is taken.
    async fn create(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Get a copy of a record.
    async fn get(&self, job_id: JobId) -> Result<Job, JobStoreError>;

    /// Replace an existing record wholesale.
    async fn update(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Replace a record only if its stored status is still `expected`.
    ///
    /// The check and the write are one atomic step, so of several workers
    /// racing to claim the same pending job exactly one wins; the others get
    /// `StatusChanged`.
    async fn update_if(&self, job: &Job, expected: JobStatus) -> Result<(), JobStoreError>;

    /// Remove a record.
    async fn delete(&self, job_id: JobId) -> Result<(), JobStoreError>;

    /// All records. Ordering is backend specific.
    async fn list(&self) -> Result<Vec<Job>, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job {id} is already {found}")]
    StatusChanged { id: JobId, found: JobStatus },
    #[error("storage backend unavailable: {0}")]
    Backend(String),
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn create(&self, job: &Job) -> Result<(), JobStoreError> {
        (**self).create(job).await
    }

    async fn get(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        (**self).get(job_id).await
    }

    async fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        (**self).update(job).await
    }

    async fn update_if(&self, job: &Job, expected: JobStatus) -> Result<(), JobStoreError> {
        (**self).update_if(job, expected).await
    }

    async fn delete(&self, job_id: JobId) -> Result<(), JobStoreError> {
        (**self).delete(job_id).await
    }

    async fn list(&self) -> Result<Vec<Job>, JobStoreError> {
        (**self).list().await
    }
}

/// In-memory job store.
///
/// One lock around one map; records are lost on restart and invisible to
/// other processes. `list` returns records in arbitrary (hash) order.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.jobs.read().map(|jobs| jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> JobStoreError {
    JobStoreError::Backend("lock poisoned".to_string())
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        if jobs.contains_key(&job.id()) {
            return Err(JobStoreError::AlreadyExists(job.id()));
        }
        jobs.insert(job.id(), job.clone());
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        jobs.get(&job_id)
            .cloned()
            .ok_or(JobStoreError::NotFound(job_id))
    }

    async fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        match jobs.get_mut(&job.id()) {
            Some(slot) => {
                *slot = job.clone();
                Ok(())
            }
            None => Err(JobStoreError::NotFound(job.id())),
        }
    }

    async fn update_if(&self, job: &Job, expected: JobStatus) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let slot = jobs
            .get_mut(&job.id())
            .ok_or(JobStoreError::NotFound(job.id()))?;
        if slot.status() != expected {
            return Err(JobStoreError::StatusChanged {
                id: job.id(),
                found: slot.status(),
            });
        }
        *slot = job.clone();
        Ok(())
    }

    async fn delete(&self, job_id: JobId) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        jobs.remove(&job_id)
            .map(|_| ())
            .ok_or(JobStoreError::NotFound(job_id))
    }

    async fn list(&self) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        Ok(jobs.values().cloned().collect())
    }
}
