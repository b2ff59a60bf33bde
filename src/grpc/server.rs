use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::grpc::auth::{AuthInterceptor, Authorizer};
use crate::grpc::job_service::JobService;
use crate::job::JobManager;
use crate::proto::job_worker_server::JobWorkerServer;
use crate::tls::ServerTls;

pub struct GrpcServer {
    addr: SocketAddr,
    manager: Arc<JobManager>,
    tls: Option<ServerTls>,
    authorizer: Arc<Authorizer>,
}

impl GrpcServer {
    pub fn new(
        addr: SocketAddr,
        manager: Arc<JobManager>,
        tls: Option<ServerTls>,
        authorizer: Arc<Authorizer>,
    ) -> Self {
        Self {
            addr,
            manager,
            tls,
            authorizer,
        }
    }

    /// Serve until the shutdown token fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), tonic::transport::Error> {
        let service = JobWorkerServer::with_interceptor(
            JobService::new(self.manager),
            AuthInterceptor::new(self.authorizer),
        );

        let mut builder = Server::builder();
        if let Some(tls) = &self.tls {
            builder = builder.tls_config(tls.server_config())?;
            tracing::info!(addr = %self.addr, "starting gRPC server with mTLS");
        } else {
            tracing::warn!(addr = %self.addr, "starting gRPC server WITHOUT TLS");
        }

        builder
            .add_service(service)
            .serve_with_shutdown(self.addr, shutdown.cancelled())
            .await
    }
}
