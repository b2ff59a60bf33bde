//! Cgroup v2 resource confinement.
//!
//! One cgroup directory is created per job under a configurable root
//! (default `/sys/fs/cgroup/jobworker`). Limits are written directly to
//! the kernel interface files:
//!
//! | File | Content |
//! |------|---------|
//! | `cpu.max` | `"<quota_us> <period_us>"` |
//! | `memory.max` | limit in bytes |
//! | `io.max` | `"MAJ:MIN rbps=N wbps=N ..."` |
//! | `cgroup.procs` | pid to attach |
//!
//! The job's cgroup is never reused: the directory name embeds the job id,
//! and destruction removes it permanently.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use uuid::Uuid;

use crate::error::WorkerError;

const CPU_PERIOD_US: u64 = 100_000;
/// Kernel minimum for the cpu.max quota.
const CPU_QUOTA_MIN_US: u64 = 1_000;
const DESTROY_RETRY_ROUNDS: u32 = 20;
const DESTROY_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Declarative resource limits for one job. All fields optional; `None`
/// leaves the corresponding controller at its default.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceLimits {
    /// Fractional CPU cores (0.5 = half a core).
    pub cpu: Option<f64>,
    /// Memory ceiling in bytes.
    pub memory: Option<u64>,
    /// Raw `io.max` line, passed through verbatim.
    pub io: Option<String>,
}

impl ResourceLimits {
    /// Parse the wire representation. Empty strings mean "no limit".
    pub fn parse(cpu: &str, memory: &str, io: &str) -> Result<Self, WorkerError> {
        let cpu = match cpu.trim() {
            "" => None,
            s => {
                let cores: f64 = s
                    .parse()
                    .map_err(|_| WorkerError::InvalidSpec(format!("invalid cpu limit {s:?}")))?;
                if !cores.is_finite() || cores <= 0.0 {
                    return Err(WorkerError::InvalidSpec(format!(
                        "cpu limit must be positive, got {s:?}"
                    )));
                }
                Some(cores)
            }
        };
        let memory = match memory.trim() {
            "" => None,
            s => Some(parse_memory(s)?),
        };
        let io = match io.trim() {
            "" => None,
            s => Some(s.to_string()),
        };
        Ok(Self { cpu, memory, io })
    }

    pub fn is_unlimited(&self) -> bool {
        self.cpu.is_none() && self.memory.is_none() && self.io.is_none()
    }

    /// Value for cpu.max: "quota period" in microseconds.
    fn cpu_max(&self) -> Option<String> {
        self.cpu.map(|cores| {
            let quota = ((cores * CPU_PERIOD_US as f64) as u64).max(CPU_QUOTA_MIN_US);
            format!("{quota} {CPU_PERIOD_US}")
        })
    }
}

/// Parse a memory size: plain bytes or a K/M/G suffixed value.
pub fn parse_memory(s: &str) -> Result<u64, WorkerError> {
    let s = s.trim();
    let invalid = || WorkerError::InvalidSpec(format!("invalid memory limit {s:?}"));
    let (digits, multiplier) = match s.chars().last() {
        Some('k') | Some('K') => (&s[..s.len() - 1], 1024u64),
        Some('m') | Some('M') => (&s[..s.len() - 1], 1024 * 1024),
        Some('g') | Some('G') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        Some(c) if c.is_ascii_digit() => (s, 1),
        _ => return Err(invalid()),
    };
    let value: u64 = digits.parse().map_err(|_| invalid())?;
    value.checked_mul(multiplier).ok_or_else(invalid)
}

/// Handle to one job's cgroup directory. Owns removal.
#[derive(Debug)]
pub struct Cgroup {
    path: PathBuf,
}

impl Cgroup {
    /// Derive the cgroup directory for a job id under `root`.
    pub fn path_for(root: &Path, id: Uuid) -> PathBuf {
        root.join(format!("job-{id}"))
    }

    /// Create the cgroup and apply `limits`.
    ///
    /// The root directory is created on first use and its
    /// `cgroup.subtree_control` is populated so the cpu/memory/io
    /// controllers are available to the per-job children. On any partial
    /// failure the job directory is removed before the error is returned.
    pub fn create(root: &Path, id: Uuid, limits: &ResourceLimits) -> Result<Self, WorkerError> {
        fs::create_dir_all(root).map_err(|e| WorkerError::CgroupCreate {
            path: root.to_path_buf(),
            source: e,
        })?;
        enable_controllers(root);

        let path = Self::path_for(root, id);
        fs::create_dir(&path).map_err(|e| WorkerError::CgroupCreate {
            path: path.clone(),
            source: e,
        })?;

        let cgroup = Self { path };
        if let Err(err) = cgroup.apply_limits(limits) {
            if let Err(e) = fs::remove_dir(&cgroup.path) {
                tracing::warn!(path = %cgroup.path.display(), error = %e,
                    "failed to remove cgroup after limit error");
            }
            return Err(err);
        }
        Ok(cgroup)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn apply_limits(&self, limits: &ResourceLimits) -> Result<(), WorkerError> {
        if let Some(cpu_max) = limits.cpu_max() {
            self.write_limit("cpu.max", &cpu_max)?;
        }
        if let Some(memory) = limits.memory {
            self.write_limit("memory.max", &memory.to_string())?;
        }
        if let Some(io_max) = &limits.io {
            self.write_limit("io.max", io_max)?;
        }
        Ok(())
    }

    fn write_limit(&self, file: &str, value: &str) -> Result<(), WorkerError> {
        let path = self.path.join(file);
        OpenOptions::new()
            .write(true)
            .open(&path)
            .and_then(|mut f| f.write_all(value.as_bytes()))
            .map_err(|e| WorkerError::CgroupLimit {
                file: file.to_string(),
                value: value.to_string(),
                source: e,
            })
    }

    /// Open `cgroup.procs` for writing. The launcher hands this file to
    /// the child so it can attach itself between fork and exec.
    pub fn open_procs(&self) -> io::Result<File> {
        OpenOptions::new().write(true).open(self.path.join("cgroup.procs"))
    }

    /// Attach a process by pid.
    pub fn attach(&self, pid: u32) -> Result<(), WorkerError> {
        self.open_procs()
            .and_then(|mut f| f.write_all(pid.to_string().as_bytes()))
            .map_err(WorkerError::CgroupAttach)
    }

    /// Pids currently in the cgroup.
    pub fn procs(&self) -> io::Result<Vec<i32>> {
        let content = fs::read_to_string(self.path.join("cgroup.procs"))?;
        Ok(content
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect())
    }

    /// Remove the cgroup directory. Idempotent.
    ///
    /// A cgroup with live processes cannot be removed, so on failure any
    /// residual processes are killed (via `cgroup.kill` where available,
    /// SIGKILL per pid otherwise) and removal is retried until they drain.
    pub async fn destroy(&self) -> io::Result<()> {
        for _ in 0..DESTROY_RETRY_ROUNDS {
            match fs::remove_dir(&self.path) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                Err(_) => {
                    self.kill_residual();
                    tokio::time::sleep(DESTROY_RETRY_DELAY).await;
                }
            }
        }
        match fs::remove_dir(&self.path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn kill_residual(&self) {
        let kill_file = self.path.join("cgroup.kill");
        if kill_file.exists() {
            let _ = fs::write(kill_file, "1");
            return;
        }
        if let Ok(pids) = self.procs() {
            for pid in pids {
                let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
            }
        }
    }
}

/// Make the cpu/memory/io controllers available to child cgroups.
///
/// Best effort: on kernels where a controller is absent the combined
/// write fails and each controller is retried on its own. Missing
/// controllers surface later as limit-write errors, which carry more
/// context than a failure here would.
fn enable_controllers(root: &Path) {
    let subtree_control = root.join("cgroup.subtree_control");
    if !subtree_control.exists() {
        return;
    }
    if fs::write(&subtree_control, "+cpu +memory +io").is_err() {
        for controller in ["+cpu", "+memory", "+io"] {
            if let Err(e) = fs::write(&subtree_control, controller) {
                tracing::debug!(controller, error = %e, "controller not enabled");
            }
        }
    }
}
