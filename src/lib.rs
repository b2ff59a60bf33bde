pub mod cgroup;
pub mod config;
pub mod error;
pub mod grpc;
pub mod job;
pub mod shutdown;
pub mod tls;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("jobworker");
}
