//! Coordinated service shutdown.
//!
//! Stopping the worker is a two-phase sequence: the gRPC server first
//! stops accepting requests, then every job still running is terminated
//! and reaped so no cgroup or child process outlives the service.
//! [`Shutdown`] owns that sequence end to end: it traps SIGTERM/SIGINT,
//! exposes the token the server's graceful-exit future watches, and
//! runs the job drain once the server has returned.

use std::io;
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::job::JobManager;

pub struct Shutdown {
    stop: CancellationToken,
    manager: Arc<JobManager>,
}

impl Shutdown {
    /// Trap SIGTERM and SIGINT; either cancels the stop token.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal handlers cannot be installed.
    pub fn arm(manager: Arc<JobManager>) -> io::Result<Self> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        let stop = CancellationToken::new();
        let trap = stop.clone();
        tokio::spawn(async move {
            let caught = tokio::select! {
                _ = sigterm.recv() => "SIGTERM",
                _ = sigint.recv() => "SIGINT",
            };
            tracing::info!(signal = caught, "termination signal received, stopping server");
            trap.cancel();
        });

        Ok(Self { stop, manager })
    }

    /// Token the gRPC server watches; cancelled when a termination
    /// signal arrives.
    pub fn token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Phase two, after the server has stopped accepting requests:
    /// terminate and reap every job that is still running.
    pub async fn drain(self) {
        self.manager.shutdown_all().await;
    }
}
