use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cgroup::ResourceLimits;
use crate::job::logbuf::LogBuffer;

pub type JobId = Uuid;

/// What to run and under which limits.
#[derive(Debug, Clone, Default)]
pub struct JobSpec {
    pub program: String,
    pub args: Vec<String>,
    pub limits: ResourceLimits,
}

impl JobSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Exited { code: i32 },
    Signaled { signal: i32 },
    Failed { reason: String },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Running => write!(f, "running"),
            JobStatus::Exited { code } => write!(f, "exited({code})"),
            JobStatus::Signaled { signal } => write!(f, "signaled({signal})"),
            JobStatus::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Debug)]
struct StatusCell {
    status: JobStatus,
    completed_at: Option<DateTime<Utc>>,
}

/// One job's record. Owned by the registry; shared with the reaper and
/// with every in-flight query or stream through an `Arc`.
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub spec: JobSpec,
    pub created_at: DateTime<Utc>,
    pid: u32,
    cell: RwLock<StatusCell>,
    logs: Arc<LogBuffer>,
    /// Fired exactly once, after the process has been reaped and its
    /// cgroup destroyed.
    pub(crate) done: CancellationToken,
}

impl Job {
    pub fn new(id: JobId, spec: JobSpec, pid: u32, logs: Arc<LogBuffer>) -> Self {
        Self {
            id,
            spec,
            created_at: Utc::now(),
            pid,
            cell: RwLock::new(StatusCell {
                status: JobStatus::Running,
                completed_at: None,
            }),
            logs,
            done: CancellationToken::new(),
        }
    }

    /// Process id. Meaningful only while the status is `Running`.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn logs(&self) -> &Arc<LogBuffer> {
        &self.logs
    }

    pub async fn status(&self) -> JobStatus {
        self.cell.read().await.status.clone()
    }

    pub async fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.cell.read().await.completed_at
    }

    /// Resolves once the reaper has fully finalized the job.
    pub async fn finished(&self) {
        self.done.cancelled().await
    }

    pub fn is_finished(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Record the terminal status. Called once, by the reaper (or by the
    /// launcher for processes that never started). Status never moves
    /// out of a terminal state.
    pub(crate) async fn set_terminal(&self, status: JobStatus) {
        debug_assert!(status.is_terminal());
        let mut cell = self.cell.write().await;
        if cell.status.is_terminal() {
            tracing::error!(
                job_id = %self.id,
                current = %cell.status,
                rejected = %status,
                "attempted second terminal status transition"
            );
            return;
        }
        cell.status = status;
        cell.completed_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_job(status: JobStatus) -> Job {
        let job = Job::new(
            Uuid::new_v4(),
            JobSpec::new("/bin/true"),
            1234,
            Arc::new(LogBuffer::new(4, 1024)),
        );
        job.set_terminal(status).await;
        job
    }

    #[tokio::test]
    async fn test_new_job_is_running() {
        let job = Job::new(
            Uuid::new_v4(),
            JobSpec::new("/bin/sleep").with_args(["10"]),
            42,
            Arc::new(LogBuffer::new(4, 1024)),
        );
        assert_eq!(job.status().await, JobStatus::Running);
        assert_eq!(job.pid(), 42);
        assert!(!job.is_finished());
        assert!(job.completed_at().await.is_none());
    }

    #[tokio::test]
    async fn test_terminal_status_sticks() {
        let job = test_job(JobStatus::Exited { code: 0 }).await;
        assert_eq!(job.status().await, JobStatus::Exited { code: 0 });

        // A second transition is rejected, the first one wins.
        job.set_terminal(JobStatus::Signaled { signal: 9 }).await;
        assert_eq!(job.status().await, JobStatus::Exited { code: 0 });
    }

    #[tokio::test]
    async fn test_terminal_status_stamps_completion() {
        let job = test_job(JobStatus::Signaled { signal: 15 }).await;
        assert!(job.completed_at().await.is_some());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(JobStatus::Running.to_string(), "running");
        assert_eq!(JobStatus::Exited { code: 2 }.to_string(), "exited(2)");
        assert_eq!(JobStatus::Signaled { signal: 9 }.to_string(), "signaled(9)");
    }

    #[test]
    fn test_terminality() {
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Exited { code: 0 }.is_terminal());
        assert!(JobStatus::Signaled { signal: 15 }.is_terminal());
        assert!(JobStatus::Failed { reason: "x".into() }.is_terminal());
    }
}
