//! Application-level error type shared across the binary and services.

use std::path::PathBuf;

use thiserror::Error;

use crate::config;
use crate::paths::PathError;
use crate::services::{
    BarrierError, BlobError, LifecycleError, PipelineError, PreemptionError, ProviderError,
    ReassembleError, RepoError, ReportError, RunnerError, SaveError, SegmentError, WorkerError,
};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    ConfigLoad(#[from] config::AppConfigError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Paths(#[from] PathError),
    #[error("state repository error: {0}")]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Save(#[from] SaveError),
    #[error("blob store error: {0}")]
    BlobStore(#[from] BlobError),
    #[error(transparent)]
    Server(#[from] cloudburst_server::ServerError),
    #[error(transparent)]
    Segment(#[from] SegmentError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error(transparent)]
    Barrier(#[from] BarrierError),
    #[error(transparent)]
    Reassemble(#[from] ReassembleError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error(transparent)]
    Preemption(#[from] PreemptionError),
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to resolve current working directory: {0}")]
    WorkingDir(#[source] std::io::Error),
}
