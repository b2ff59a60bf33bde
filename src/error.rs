use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("job start failed: {0}")]
    StartFailed(String),

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("failed to create cgroup at {path}: {source}")]
    CgroupCreate {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cgroup file {file} rejected value {value:?}: {source}")]
    CgroupLimit {
        file: String,
        value: String,
        source: std::io::Error,
    },

    #[error("failed to attach process to cgroup: {0}")]
    CgroupAttach(#[source] std::io::Error),

    #[error("invalid job spec: {0}")]
    InvalidSpec(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, WorkerError>;
