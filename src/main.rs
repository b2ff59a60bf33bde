use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use jobworker::config::{AuthConfig, TlsConfig, WorkerConfig, DEFAULT_CGROUP_ROOT};
use jobworker::grpc::auth::{Authorizer, Role};
use jobworker::grpc::GrpcServer;
use jobworker::job::JobManager;
use jobworker::shutdown::Shutdown;
use jobworker::tls::ServerTls;

#[derive(Parser, Debug)]
#[command(name = "jobworkerd")]
#[command(about = "A resource-confined job execution service with streaming output")]
struct Args {
    /// Address to listen on for gRPC
    #[arg(long, default_value = "127.0.0.1:50051")]
    listen: SocketAddr,

    /// Root of the per-job cgroup subtree
    #[arg(long, default_value = DEFAULT_CGROUP_ROOT)]
    cgroup_root: PathBuf,

    /// Seconds a stopped job gets to exit on SIGTERM before SIGKILL
    #[arg(long, default_value = "5")]
    stop_grace_secs: u64,

    /// Per-subscriber output channel capacity, in chunks
    #[arg(long, default_value = "32")]
    subscriber_buffer: usize,

    /// Bytes a subscriber may fall behind the log before it is dropped
    #[arg(long, default_value = "8388608")]
    lag_threshold: u64,

    /// CA certificate used to verify client certificates
    #[arg(long)]
    tls_ca: Option<PathBuf>,

    /// Server certificate
    #[arg(long)]
    tls_cert: Option<PathBuf>,

    /// Server private key
    #[arg(long)]
    tls_key: Option<PathBuf>,

    /// Serve plaintext. Only for local development; every client gets
    /// the writer role.
    #[arg(long)]
    allow_insecure: bool,

    /// SHA-256 fingerprint of a client certificate granted the writer
    /// role (repeatable)
    #[arg(long = "writer-cert")]
    writer_certs: Vec<String>,

    /// SHA-256 fingerprint of a client certificate granted the reader
    /// role (repeatable)
    #[arg(long = "reader-cert")]
    reader_certs: Vec<String>,

    /// Role for authenticated clients whose certificate is in neither
    /// list (reader or writer); unmatched clients are rejected if unset
    #[arg(long)]
    default_role: Option<Role>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let tls_enabled = args.tls_ca.is_some() || args.tls_cert.is_some() || args.tls_key.is_some();
    if !tls_enabled && !args.allow_insecure {
        return Err("refusing to serve plaintext; pass --tls-ca/--tls-cert/--tls-key \
                    or --allow-insecure"
            .into());
    }

    let default_role = if tls_enabled {
        args.default_role
    } else {
        tracing::warn!("TLS disabled; all clients are granted the writer role");
        Some(args.default_role.unwrap_or(Role::Writer))
    };

    let config = WorkerConfig {
        listen_addr: args.listen,
        cgroup_root: args.cgroup_root,
        stop_grace: Duration::from_secs(args.stop_grace_secs),
        subscriber_buffer: args.subscriber_buffer,
        lag_threshold: args.lag_threshold,
        tls: TlsConfig {
            enabled: tls_enabled,
            ca_cert_path: args.tls_ca,
            cert_path: args.tls_cert,
            key_path: args.tls_key,
            allow_insecure: args.allow_insecure,
        },
        auth: AuthConfig {
            writer_fingerprints: args.writer_certs,
            reader_fingerprints: args.reader_certs,
            default_role,
        },
    };

    tracing::info!(
        listen_addr = %config.listen_addr,
        cgroup_root = %config.cgroup_root.display(),
        stop_grace = ?config.stop_grace,
        tls = config.tls.enabled,
        "starting jobworkerd"
    );

    let tls = if config.tls.enabled {
        Some(ServerTls::load(&config.tls).await?)
    } else {
        None
    };
    let authorizer = Arc::new(Authorizer::from_config(&config.auth));
    let manager = Arc::new(JobManager::new(&config));

    let shutdown = Shutdown::arm(manager.clone())?;
    let server = GrpcServer::new(config.listen_addr, manager, tls, authorizer);
    server.run(shutdown.token()).await?;

    // Server stopped accepting requests; terminate whatever is still running.
    shutdown.drain().await;
    tracing::info!("shutdown complete");

    Ok(())
}
