use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::job::launcher::Launcher;
use crate::job::logbuf::LogLag;
use crate::job::registry::JobRegistry;
use crate::job::state::{JobId, JobSpec, JobStatus};

/// Point-in-time view of a job, as returned by [`JobManager::query`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSnapshot {
    pub id: JobId,
    pub status: JobStatus,
    /// Meaningful only while `status` is `Running`.
    pub pid: u32,
}

/// Facade over the launcher, registry, and per-job log buffers.
#[derive(Debug)]
pub struct JobManager {
    registry: JobRegistry,
    launcher: Launcher,
}

impl JobManager {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            registry: JobRegistry::new(),
            launcher: Launcher::new(config),
        }
    }

    /// Start a job. On success the id is registered and the process is
    /// running inside its cgroup (or already recorded as `Failed` if the
    /// OS refused the exec).
    pub async fn start(&self, spec: JobSpec) -> Result<JobId, WorkerError> {
        if spec.program.trim().is_empty() {
            return Err(WorkerError::InvalidSpec(
                "program must not be empty".to_string(),
            ));
        }

        let job = match self.launcher.start(spec).await {
            Ok(job) => job,
            Err(err @ WorkerError::StartFailed(_)) => return Err(err),
            Err(err) => return Err(WorkerError::StartFailed(err.to_string())),
        };
        let id = job.id;
        self.registry.insert(job).await?;
        Ok(id)
    }

    /// Stop a job. Success whenever the job ends up terminal, no matter
    /// how it got there.
    pub async fn stop(&self, id: &JobId) -> Result<(), WorkerError> {
        let job = self.registry.get(id).await?;
        self.launcher.stop(&job).await
    }

    /// Read the job's current status. No side effects.
    pub async fn query(&self, id: &JobId) -> Result<JobSnapshot, WorkerError> {
        let job = self.registry.get(id).await?;
        Ok(JobSnapshot {
            id: job.id,
            status: job.status().await,
            pid: job.pid(),
        })
    }

    /// Subscribe to a job's output from byte zero. The channel closes
    /// after the job's full output has been delivered, or early on
    /// cancellation or lag.
    pub async fn stream(
        &self,
        id: &JobId,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Result<Bytes, LogLag>>, WorkerError> {
        let job = self.registry.get(id).await?;
        Ok(job.logs().subscribe(cancel))
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Terminate and await every non-terminal job. Called on service
    /// shutdown so no cgroup or child process outlives the worker.
    pub async fn shutdown_all(&self) {
        let jobs = self.registry.all_jobs().await;
        let live = jobs.len();
        tracing::info!(jobs = live, "draining jobs for shutdown");
        for job in jobs {
            if let Err(e) = self.launcher.stop(&job).await {
                tracing::warn!(job_id = %job.id, error = %e, "failed to stop job during drain");
            }
        }
    }
}
