use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use uuid::Uuid;

use crate::cgroup::ResourceLimits;
use crate::error::WorkerError;
use crate::grpc::auth::{require_role, Role};
use crate::job::{JobManager, JobSpec, JobStatus};
use crate::proto::job_worker_server::JobWorker;
use crate::proto::{
    QueryRequest, QueryResponse, StartRequest, StartResponse, StopRequest, StopResponse,
    StreamRequest, StreamResponse,
};

/// Buffered proto messages per open stream, on top of the per-subscriber
/// log channel.
const STREAM_CHANNEL: usize = 16;

/// gRPC front-end over the [`JobManager`].
pub struct JobService {
    manager: Arc<JobManager>,
}

impl JobService {
    pub fn new(manager: Arc<JobManager>) -> Self {
        Self { manager }
    }
}

#[tonic::async_trait]
impl JobWorker for JobService {
    async fn start(
        &self,
        request: Request<StartRequest>,
    ) -> Result<Response<StartResponse>, Status> {
        require_role(&request, Role::Writer)?;
        let req = request.into_inner();

        if req.program.trim().is_empty() {
            return Err(Status::invalid_argument("program must not be empty"));
        }
        let limits = match &req.limits {
            Some(l) => ResourceLimits::parse(&l.cpu, &l.memory, &l.io)
                .map_err(|e| Status::invalid_argument(e.to_string()))?,
            None => ResourceLimits::default(),
        };
        let spec = JobSpec::new(req.program)
            .with_args(req.args)
            .with_limits(limits);

        let job_id = self.manager.start(spec).await.map_err(error_to_status)?;
        Ok(Response::new(StartResponse {
            job_id: job_id.to_string(),
        }))
    }

    async fn stop(&self, request: Request<StopRequest>) -> Result<Response<StopResponse>, Status> {
        require_role(&request, Role::Writer)?;
        let id = parse_job_id(&request.into_inner().job_id)?;

        self.manager.stop(&id).await.map_err(error_to_status)?;
        Ok(Response::new(StopResponse {}))
    }

    async fn query(
        &self,
        request: Request<QueryRequest>,
    ) -> Result<Response<QueryResponse>, Status> {
        require_role(&request, Role::Reader)?;
        let id = parse_job_id(&request.into_inner().job_id)?;

        let snapshot = self.manager.query(&id).await.map_err(error_to_status)?;
        let (pid, exit_code, exited) = match &snapshot.status {
            JobStatus::Running => (snapshot.pid as i32, -1, false),
            JobStatus::Exited { code } => (0, *code, true),
            JobStatus::Signaled { signal } => (0, -signal, true),
            JobStatus::Failed { .. } => (0, -1, true),
        };
        Ok(Response::new(QueryResponse {
            pid,
            exit_code,
            exited,
        }))
    }

    type StreamStream = ReceiverStream<Result<StreamResponse, Status>>;

    async fn stream(
        &self,
        request: Request<StreamRequest>,
    ) -> Result<Response<Self::StreamStream>, Status> {
        require_role(&request, Role::Reader)?;
        let id = parse_job_id(&request.into_inner().job_id)?;

        let cancel = CancellationToken::new();
        let mut chunks = self
            .manager
            .stream(&id, cancel.clone())
            .await
            .map_err(error_to_status)?;

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL);
        tokio::spawn(async move {
            while let Some(item) = chunks.recv().await {
                let message = match item {
                    Ok(bytes) => Ok(StreamResponse {
                        output: bytes.to_vec(),
                    }),
                    Err(lag) => Err(Status::resource_exhausted(lag.to_string())),
                };
                if tx.send(message).await.is_err() {
                    // Client went away; unsubscribe promptly.
                    cancel.cancel();
                    break;
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

fn parse_job_id(raw: &str) -> Result<Uuid, Status> {
    Uuid::parse_str(raw).map_err(|_| Status::invalid_argument("invalid job id"))
}

fn error_to_status(err: WorkerError) -> Status {
    match err {
        WorkerError::NotFound(id) => Status::not_found(format!("job not found: {id}")),
        WorkerError::InvalidSpec(msg) => Status::invalid_argument(msg),
        other => Status::internal(other.to_string()),
    }
}
