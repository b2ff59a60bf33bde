use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::WorkerError;
use crate::job::state::{Job, JobId};

/// Thread-safe map of job id to record.
///
/// Records are inserted at start and kept after termination so query and
/// stream work on completed jobs. Nothing here removes entries; memory
/// is bounded by the number of jobs ever started.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, Arc<Job>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, job: Arc<Job>) -> Result<(), WorkerError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            // Ids are v4 uuids; a collision means something is deeply wrong.
            return Err(WorkerError::Internal(format!(
                "duplicate job id {}",
                job.id
            )));
        }
        jobs.insert(job.id, job);
        Ok(())
    }

    pub async fn get(&self, id: &JobId) -> Result<Arc<Job>, WorkerError> {
        self.jobs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| WorkerError::NotFound(id.to_string()))
    }

    /// Snapshot of every record, for shutdown drains.
    pub async fn all_jobs(&self) -> Vec<Arc<Job>> {
        self.jobs.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}
