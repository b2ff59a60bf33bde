use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::grpc::auth::Role;

/// Default root of the per-job cgroup subtree.
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup/jobworker";

/// Top-level configuration for a worker instance.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub listen_addr: SocketAddr,
    /// Directory under which one cgroup per job is created.
    pub cgroup_root: PathBuf,
    /// How long a stopped job gets to exit on SIGTERM before SIGKILL.
    pub stop_grace: Duration,
    /// Per-subscriber output channel capacity, in chunks.
    pub subscriber_buffer: usize,
    /// Bytes a subscriber may fall behind the log before it is dropped.
    pub lag_threshold: u64,
    pub tls: TlsConfig,
    pub auth: AuthConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 50051)),
            cgroup_root: PathBuf::from(DEFAULT_CGROUP_ROOT),
            stop_grace: Duration::from_secs(5),
            subscriber_buffer: 32,
            lag_threshold: 8 * 1024 * 1024,
            tls: TlsConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn with_cgroup_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cgroup_root = root.into();
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }
}

/// mTLS material locations. The server refuses plaintext unless
/// `allow_insecure` is set explicitly.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub ca_cert_path: Option<PathBuf>,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub allow_insecure: bool,
}

impl TlsConfig {
    /// True when TLS is enabled and every required path is present.
    pub fn is_complete(&self) -> bool {
        self.enabled
            && self.ca_cert_path.is_some()
            && self.cert_path.is_some()
            && self.key_path.is_some()
    }
}

/// Client-certificate based authorization.
///
/// Fingerprints are lowercase hex SHA-256 digests of the client's leaf
/// certificate in DER form. A connection whose certificate matches no
/// list falls back to `default_role`, or is rejected when that is unset.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub writer_fingerprints: Vec<String>,
    pub reader_fingerprints: Vec<String>,
    pub default_role: Option<Role>,
}
