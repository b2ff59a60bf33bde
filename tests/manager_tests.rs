//! End-to-end tests for the job manager.
//!
//! Spec validation and not-found handling run anywhere. The tests that
//! spawn real confined processes need root and a writable cgroup v2
//! hierarchy, so they are `#[ignore]`-gated; run them with
//! `sudo -E cargo test -- --ignored`.

use std::time::Duration;

use bytes::Bytes;
use jobworker::cgroup::{Cgroup, ResourceLimits};
use jobworker::config::WorkerConfig;
use jobworker::error::WorkerError;
use jobworker::job::{JobId, JobManager, JobSnapshot, JobSpec, JobStatus, LogLag};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const E2E_CGROUP_ROOT: &str = "/sys/fs/cgroup/jobworker-test";

fn e2e_config() -> WorkerConfig {
    WorkerConfig::default()
        .with_cgroup_root(E2E_CGROUP_ROOT)
        .with_stop_grace(Duration::from_secs(2))
}

fn sh(script: &str) -> JobSpec {
    JobSpec::new("/bin/sh").with_args(["-c", script])
}

/// Poll until the job reports a terminal status.
async fn wait_terminal(manager: &JobManager, id: &JobId, timeout: Duration) -> JobSnapshot {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let snapshot = manager.query(id).await.unwrap();
        if snapshot.status.is_terminal() {
            return snapshot;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {id} did not reach a terminal status within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn collect(mut rx: mpsc::Receiver<Result<Bytes, LogLag>>) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(item) = rx.recv().await {
        out.extend_from_slice(&item.expect("unexpected lag error"));
    }
    out
}

// ============================================================================
// Validation and lookup tests (no root required)
// ============================================================================

#[tokio::test]
async fn test_start_rejects_empty_program() {
    let manager = JobManager::new(&WorkerConfig::default());

    let err = manager.start(JobSpec::new("")).await.unwrap_err();
    assert!(matches!(err, WorkerError::InvalidSpec(_)));

    let err = manager.start(JobSpec::new("   ")).await.unwrap_err();
    assert!(matches!(err, WorkerError::InvalidSpec(_)));
}

#[tokio::test]
async fn test_operations_on_unknown_job_return_not_found() {
    let manager = JobManager::new(&WorkerConfig::default());
    let missing = Uuid::new_v4();

    assert!(matches!(
        manager.query(&missing).await.unwrap_err(),
        WorkerError::NotFound(_)
    ));
    assert!(matches!(
        manager.stop(&missing).await.unwrap_err(),
        WorkerError::NotFound(_)
    ));
    assert!(matches!(
        manager
            .stream(&missing, CancellationToken::new())
            .await
            .unwrap_err(),
        WorkerError::NotFound(_)
    ));
}

// ============================================================================
// Confined-process end-to-end tests (root + cgroup v2 required)
// ============================================================================

#[tokio::test]
#[ignore = "requires root and a writable cgroup v2 hierarchy"]
async fn test_start_query_stop_lifecycle() {
    let manager = JobManager::new(&e2e_config());

    let id = manager.start(sh("sleep 10")).await.unwrap();

    let snapshot = manager.query(&id).await.unwrap();
    assert_eq!(snapshot.status, JobStatus::Running);
    assert!(snapshot.pid > 0);

    manager.stop(&id).await.unwrap();

    let snapshot = wait_terminal(&manager, &id, Duration::from_secs(5)).await;
    assert_eq!(snapshot.status, JobStatus::Signaled { signal: 15 });

    // Stop on a terminal job is a no-op that reports success.
    manager.stop(&id).await.unwrap();
    let again = manager.query(&id).await.unwrap();
    assert_eq!(again.status, JobStatus::Signaled { signal: 15 });
}

#[tokio::test]
#[ignore = "requires root and a writable cgroup v2 hierarchy"]
async fn test_late_subscriber_sees_full_output() {
    let manager = JobManager::new(&e2e_config());

    let id = manager
        .start(sh("echo line-1; sleep 0.5; echo line-2"))
        .await
        .unwrap();

    // Subscribe only after the job has finished.
    wait_terminal(&manager, &id, Duration::from_secs(5)).await;
    let rx = manager.stream(&id, CancellationToken::new()).await.unwrap();

    assert_eq!(collect(rx).await, b"line-1\nline-2\n");
}

#[tokio::test]
#[ignore = "requires root and a writable cgroup v2 hierarchy"]
async fn test_concurrent_subscribers_receive_identical_output() {
    let manager = JobManager::new(&e2e_config());

    let id = manager
        .start(sh(
            "i=1; while [ $i -le 10000 ]; do echo \"hello $i\"; i=$((i+1)); done",
        ))
        .await
        .unwrap();

    let rx_a = manager.stream(&id, CancellationToken::new()).await.unwrap();
    let rx_b = manager.stream(&id, CancellationToken::new()).await.unwrap();
    let (bytes_a, bytes_b) = tokio::join!(collect(rx_a), collect(rx_b));

    assert_eq!(bytes_a, bytes_b);
    let text = String::from_utf8(bytes_a).unwrap();
    assert_eq!(text.lines().count(), 10_000);
    assert!(text.ends_with("hello 10000\n"));
}

#[tokio::test]
#[ignore = "requires root and a writable cgroup v2 hierarchy"]
async fn test_missing_binary_yields_failed_job_without_residue() {
    let config = e2e_config();
    let manager = JobManager::new(&config);

    // Start succeeds and hands back an id even though the exec failed.
    let id = manager.start(JobSpec::new("/does/not/exist")).await.unwrap();

    let snapshot = manager.query(&id).await.unwrap();
    assert!(matches!(snapshot.status, JobStatus::Failed { .. }));

    // The cgroup is gone and the stream closes after the error text.
    assert!(!Cgroup::path_for(&config.cgroup_root, id).exists());
    let rx = manager.stream(&id, CancellationToken::new()).await.unwrap();
    let output = tokio::time::timeout(Duration::from_secs(1), collect(rx))
        .await
        .expect("failed job's stream should close immediately");
    assert!(String::from_utf8_lossy(&output).contains("/does/not/exist"));
}

#[tokio::test]
#[ignore = "requires root and a writable cgroup v2 hierarchy"]
async fn test_memory_limit_kills_runaway_process() {
    let config = e2e_config();
    let manager = JobManager::new(&config);

    let limits = ResourceLimits {
        memory: Some(16 * 1024 * 1024),
        ..Default::default()
    };
    // tail buffers stdin without bound, tripping memory.max quickly.
    let id = manager
        .start(sh("tail /dev/zero").with_limits(limits))
        .await
        .unwrap();

    let snapshot = wait_terminal(&manager, &id, Duration::from_secs(30)).await;
    assert_eq!(snapshot.status, JobStatus::Signaled { signal: 9 });
    assert!(!Cgroup::path_for(&config.cgroup_root, id).exists());
}

#[tokio::test]
#[ignore = "requires root and a writable cgroup v2 hierarchy"]
async fn test_stream_cancellation_leaves_job_and_peers_intact() {
    let manager = JobManager::new(&e2e_config());

    let id = manager
        .start(sh("i=0; while [ $i -lt 60 ]; do echo tick; sleep 1; i=$((i+1)); done"))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let mut cancelled_rx = manager.stream(&id, cancel.clone()).await.unwrap();
    let keeper_rx = manager.stream(&id, CancellationToken::new()).await.unwrap();

    // Let some output flow, then cancel one subscriber.
    tokio::time::sleep(Duration::from_secs(2)).await;
    cancel.cancel();
    let closed = tokio::time::timeout(Duration::from_secs(1), async {
        while cancelled_rx.recv().await.is_some() {}
    })
    .await;
    assert!(closed.is_ok(), "cancelled stream did not close");

    // The job is still running and still stoppable; the other
    // subscriber keeps receiving until end-of-stream.
    let snapshot = manager.query(&id).await.unwrap();
    assert_eq!(snapshot.status, JobStatus::Running);
    manager.stop(&id).await.unwrap();

    let kept = collect(keeper_rx).await;
    assert!(kept.starts_with(b"tick\n"));

    let final_snapshot = wait_terminal(&manager, &id, Duration::from_secs(5)).await;
    assert!(final_snapshot.status.is_terminal());
}

#[tokio::test]
#[ignore = "requires root and a writable cgroup v2 hierarchy"]
async fn test_shutdown_all_drains_running_jobs() {
    let config = e2e_config();
    let manager = JobManager::new(&config);

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(manager.start(sh("sleep 60")).await.unwrap());
    }

    manager.shutdown_all().await;

    for id in ids {
        let snapshot = manager.query(&id).await.unwrap();
        assert!(snapshot.status.is_terminal());
        assert!(!Cgroup::path_for(&config.cgroup_root, id).exists());
    }
}
