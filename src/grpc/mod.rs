//! gRPC surface: service implementation, mTLS-backed authorization, and
//! server wiring.

pub mod auth;
pub mod job_service;
pub mod server;

pub use server::GrpcServer;
