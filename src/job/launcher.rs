//! Process launch, confinement, and reaping.
//!
//! The launch protocol guarantees that no user code runs outside the
//! job's cgroup: the cgroup's `cgroup.procs` file is opened in the
//! parent, and the child writes its own pid into it from a `pre_exec`
//! hook, after fork but before exec. The hook performs only
//! async-signal-safe work (`getpid` and `write` on an already-open fd).
//!
//! Each spawned job gets three tasks: one reader per output pipe feeding
//! the job's [`LogBuffer`], and a reaper that waits for the process,
//! finalizes the record, and destroys the cgroup.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cgroup::Cgroup;
use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::job::logbuf::LogBuffer;
use crate::job::state::{Job, JobSpec, JobStatus};

const PIPE_CHUNK: usize = 8 * 1024;

/// Spawns confined processes and owns their cleanup.
#[derive(Debug, Clone)]
pub struct Launcher {
    cgroup_root: PathBuf,
    stop_grace: Duration,
    subscriber_buffer: usize,
    lag_threshold: u64,
}

impl Launcher {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            cgroup_root: config.cgroup_root.clone(),
            stop_grace: config.stop_grace,
            subscriber_buffer: config.subscriber_buffer,
            lag_threshold: config.lag_threshold,
        }
    }

    /// Launch a process confined to a fresh cgroup.
    ///
    /// A spawn refused by the OS (missing binary, exec permission, or a
    /// self-attach rejected in the pre-exec hook) still produces a job
    /// record, in terminal `Failed` status with the error text in its
    /// log, so the caller can query what happened. Failures before the
    /// spawn leave no residue and surface as errors.
    pub async fn start(&self, spec: JobSpec) -> Result<Arc<Job>, WorkerError> {
        let id = Uuid::new_v4();
        let cgroup = Cgroup::create(&self.cgroup_root, id, &spec.limits)?;

        let procs_file = match cgroup.open_procs() {
            Ok(file) => file,
            Err(e) => {
                self.destroy_logged(&cgroup).await;
                return Err(WorkerError::CgroupAttach(e));
            }
        };

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        // SAFETY: the hook runs in the forked child before exec and only
        // calls getpid and write on the inherited fd, both
        // async-signal-safe; nothing allocates.
        unsafe {
            cmd.pre_exec(move || attach_self(&procs_file));
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                // Lands here for a failed exec and for a failed pre-exec
                // self-attach alike: the OS reports both as one io::Error
                // and the child is guaranteed dead. Record the job as
                // Failed so the caller can query what happened.
                self.destroy_logged(&cgroup).await;
                return self.failed_job(id, spec, e).await;
            }
        };

        let Some(pid) = child.id() else {
            let _ = child.kill().await;
            self.destroy_logged(&cgroup).await;
            return Err(WorkerError::Internal("spawned child reported no pid".into()));
        };
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let _ = child.kill().await;
            self.destroy_logged(&cgroup).await;
            return Err(WorkerError::Internal("child pipes were not captured".into()));
        };

        let logs = Arc::new(LogBuffer::new(self.subscriber_buffer, self.lag_threshold));
        let job = Arc::new(Job::new(id, spec, pid, logs.clone()));

        let stdout_reader = tokio::spawn(pump_pipe(stdout, logs.clone()));
        let stderr_reader = tokio::spawn(pump_pipe(stderr, logs));
        tokio::spawn(reap(
            job.clone(),
            child,
            cgroup,
            stdout_reader,
            stderr_reader,
        ));

        tracing::info!(job_id = %id, pid, program = %job.spec.program, "job started");
        Ok(job)
    }

    /// Terminate a job: SIGTERM, then SIGKILL after the grace interval.
    ///
    /// Idempotent; a job that is already terminal (whatever ended it)
    /// reports success. Returns once the reaper has finalized the job.
    pub async fn stop(&self, job: &Job) -> Result<(), WorkerError> {
        if job.status().await.is_terminal() {
            return Ok(());
        }

        let pid = Pid::from_raw(job.pid() as i32);
        // ESRCH means the process beat us to exiting; the reaper will
        // still finalize the record below.
        if let Err(e) = kill(pid, Signal::SIGTERM) {
            tracing::debug!(job_id = %job.id, error = %e, "SIGTERM not delivered");
        }

        if tokio::time::timeout(self.stop_grace, job.finished())
            .await
            .is_err()
        {
            tracing::warn!(job_id = %job.id, grace = ?self.stop_grace,
                "job survived SIGTERM grace period, killing");
            if let Err(e) = kill(pid, Signal::SIGKILL) {
                tracing::debug!(job_id = %job.id, error = %e, "SIGKILL not delivered");
            }
            job.finished().await;
        }
        Ok(())
    }

    /// Build the terminal record for a process that never ran.
    async fn failed_job(
        &self,
        id: Uuid,
        spec: JobSpec,
        err: io::Error,
    ) -> Result<Arc<Job>, WorkerError> {
        let logs = Arc::new(LogBuffer::new(self.subscriber_buffer, self.lag_threshold));
        logs.append(format!("{}: {}\n", spec.program, err).as_bytes())
            .await;
        logs.close().await;

        tracing::warn!(job_id = %id, program = %spec.program, error = %err,
            "process failed to start");

        let job = Arc::new(Job::new(id, spec, 0, logs));
        job.set_terminal(JobStatus::Failed {
            reason: err.to_string(),
        })
        .await;
        job.done.cancel();
        Ok(job)
    }

    async fn destroy_logged(&self, cgroup: &Cgroup) {
        if let Err(e) = cgroup.destroy().await {
            tracing::warn!(path = %cgroup.path().display(), error = %e,
                "failed to destroy cgroup");
        }
    }
}

/// Write the calling process's pid into an already-open `cgroup.procs`
/// fd. Runs between fork and exec; must stay async-signal-safe.
fn attach_self(procs_file: &File) -> io::Result<()> {
    let pid = unsafe { libc::getpid() };
    let mut digits = [0u8; 16];
    let len = format_pid(pid, &mut digits);
    let written = unsafe {
        libc::write(
            procs_file.as_raw_fd(),
            digits.as_ptr() as *const libc::c_void,
            len,
        )
    };
    if written == len as isize {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Format a pid as decimal without allocating.
fn format_pid(pid: i32, buf: &mut [u8; 16]) -> usize {
    let mut value = pid as u32;
    let mut i = buf.len();
    loop {
        i -= 1;
        buf[i] = b'0' + (value % 10) as u8;
        value /= 10;
        if value == 0 {
            break;
        }
    }
    let len = buf.len() - i;
    buf.copy_within(i.., 0);
    len
}

/// Copy one output pipe into the log until EOF.
async fn pump_pipe<R>(mut pipe: R, logs: Arc<LogBuffer>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut chunk = [0u8; PIPE_CHUNK];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => logs.append(&chunk[..n]).await,
            Err(e) => {
                tracing::warn!(error = %e, "output pipe read failed");
                break;
            }
        }
    }
}

/// Wait for the child, then finalize: flush readers, close the log,
/// record the terminal status, destroy the cgroup, and fire the job's
/// completion signal.
async fn reap(
    job: Arc<Job>,
    mut child: Child,
    cgroup: Cgroup,
    stdout_reader: JoinHandle<()>,
    stderr_reader: JoinHandle<()>,
) {
    let wait_result = child.wait().await;

    // Both pipes must reach EOF and flush before end-of-stream is set.
    let _ = stdout_reader.await;
    let _ = stderr_reader.await;
    job.logs().close().await;

    let status = match wait_result {
        Ok(exit) => match exit.code() {
            Some(code) => JobStatus::Exited { code },
            None => JobStatus::Signaled {
                signal: exit.signal().unwrap_or_default(),
            },
        },
        Err(e) => JobStatus::Failed {
            reason: format!("wait failed: {e}"),
        },
    };
    let status_text = status.to_string();
    job.set_terminal(status).await;

    if let Err(e) = cgroup.destroy().await {
        tracing::warn!(job_id = %job.id, path = %cgroup.path().display(), error = %e,
            "failed to destroy cgroup after reap");
    }
    job.done.cancel();

    tracing::info!(
        job_id = %job.id,
        status = %status_text,
        output_bytes = job.logs().len(),
        "job reaped"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_pid_single_digit() {
        let mut buf = [0u8; 16];
        let len = format_pid(7, &mut buf);
        assert_eq!(&buf[..len], b"7");
    }

    #[test]
    fn test_format_pid_multi_digit() {
        let mut buf = [0u8; 16];
        let len = format_pid(123_456, &mut buf);
        assert_eq!(&buf[..len], b"123456");
    }

    #[test]
    fn test_format_pid_max() {
        let mut buf = [0u8; 16];
        let len = format_pid(i32::MAX, &mut buf);
        assert_eq!(&buf[..len], b"2147483647");
    }
}
