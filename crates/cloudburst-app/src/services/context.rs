use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::config::{AppConfig, PipelineConfig, StorageBackend};
use crate::error::AppError;
use crate::paths::AppPaths;
use crate::services::barrier::{SleepWaiter, Waiter};
use crate::services::blob_store::{BlobStore, FsBlobStore};
use crate::services::retry::ConflictRetry;
use crate::services::store::{FsRepository, StateRepository};
use crate::services::worker::{PassThroughAnalyzer, SegmentAnalyzer};

/// Shared handles every pipeline component receives. Built once per process.
#[derive(Clone)]
pub struct PipelineContext {
    pub repo: Arc<dyn StateRepository>,
    pub blobs: Arc<dyn BlobStore>,
    pub retry: ConflictRetry,
    pub pipeline: PipelineConfig,
    pub analyzer: Arc<dyn SegmentAnalyzer>,
    pub waiter: Arc<dyn Waiter>,
}

impl PipelineContext {
    pub fn new(
        repo: Arc<dyn StateRepository>,
        blobs: Arc<dyn BlobStore>,
        pipeline: PipelineConfig,
    ) -> Self {
        debug_assert!(!pipeline.phase.is_empty());
        let retry = ConflictRetry::new(pipeline.conflict_retries);
        let waiter = SleepWaiter::uncancellable(Duration::from_secs(pipeline.barrier_poll_secs));
        Self {
            repo,
            blobs,
            retry,
            pipeline,
            analyzer: Arc::new(PassThroughAnalyzer),
            waiter: Arc::new(waiter),
        }
    }

    #[must_use]
    pub fn with_analyzer(mut self, analyzer: impl SegmentAnalyzer + 'static) -> Self {
        self.analyzer = Arc::new(analyzer);
        self
    }

    #[must_use]
    pub fn with_waiter(mut self, waiter: impl Waiter + 'static) -> Self {
        self.waiter = Arc::new(waiter);
        self
    }

    pub fn phase(&self) -> &str {
        &self.pipeline.phase
    }
}

/// Open the configured repository and blob backend.
///
/// Barrier waits are interrupted when `shutdown` flips to `true`.
pub async fn build_pipeline_context(
    config: &AppConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<PipelineContext, AppError> {
    let paths = AppPaths::new(&config.storage.path)?;
    let repo: Arc<dyn StateRepository> = Arc::new(FsRepository::open(&paths)?);
    let blobs = build_blob_store(config, &paths).await?;
    let waiter = SleepWaiter::new(
        Duration::from_secs(config.pipeline.barrier_poll_secs),
        shutdown,
    );
    Ok(PipelineContext::new(repo, blobs, config.pipeline.clone()).with_waiter(waiter))
}

async fn build_blob_store(
    config: &AppConfig,
    paths: &AppPaths,
) -> Result<Arc<dyn BlobStore>, AppError> {
    match config.storage.backend {
        StorageBackend::Fs => Ok(Arc::new(
            FsBlobStore::builder()
                .paths(paths.clone())
                .durability(config.storage.durability)
                .build(),
        )),
        #[cfg(feature = "s3")]
        StorageBackend::S3 => Ok(Arc::new(
            crate::services::blob_store::S3BlobStore::connect(&config.storage.s3).await,
        )),
        #[cfg(not(feature = "s3"))]
        StorageBackend::S3 => Err(AppError::Config(
            "storage.backend = \"s3\" requires building with the `s3` feature".to_string(),
        )),
    }
}
