//! Per-segment worker: download, analyze, upload, mark complete.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::services::blob_store::BlobError;
use crate::services::context::PipelineContext;
use crate::services::records::{SegmentDocument, segment_output_key};
use crate::services::retry::{Rejected, SaveError};
use crate::services::store::{RepoError, load};

#[derive(Debug, Error)]
#[error("{0}")]
pub struct AnalyzeError(pub String);

/// The analysis applied to each segment. Must be a pure function of the
/// segment descriptor and its input bytes.
#[async_trait]
pub trait SegmentAnalyzer: Send + Sync {
    async fn analyze(&self, segment: &SegmentDocument, input: Bytes)
    -> Result<Bytes, AnalyzeError>;
}

/// Emits each segment's input unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThroughAnalyzer;

#[async_trait]
impl SegmentAnalyzer for PassThroughAnalyzer {
    async fn analyze(
        &self,
        _segment: &SegmentDocument,
        input: Bytes,
    ) -> Result<Bytes, AnalyzeError> {
        Ok(input)
    }
}

#[async_trait]
impl<T: SegmentAnalyzer + ?Sized> SegmentAnalyzer for Arc<T> {
    async fn analyze(
        &self,
        segment: &SegmentDocument,
        input: Bytes,
    ) -> Result<Bytes, AnalyzeError> {
        (**self).analyze(segment, input).await
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("segment `{segment_id}` of job `{job_id}`: failed to load document: {source}")]
    Load {
        job_id: String,
        segment_id: String,
        #[source]
        source: RepoError,
    },
    #[error("segment `{segment_id}` of job `{job_id}`: blob transfer failed: {source}")]
    Blob {
        job_id: String,
        segment_id: String,
        #[source]
        source: BlobError,
    },
    #[error("segment `{segment_id}` of job `{job_id}`: analysis failed: {source}")]
    Analyze {
        job_id: String,
        segment_id: String,
        #[source]
        source: AnalyzeError,
    },
    #[error("segment `{segment_id}` of job `{job_id}`: {source}")]
    Save {
        job_id: String,
        segment_id: String,
        #[source]
        source: SaveError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The segment belongs to a different job type than this worker handles.
    PhaseMismatch,
    /// `compute_end` was already set; redelivered trigger.
    AlreadyComplete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    Processed(SegmentDocument),
    Skipped {
        reason: SkipReason,
        segment: SegmentDocument,
    },
}

impl WorkerOutcome {
    pub fn segment(&self) -> &SegmentDocument {
        match self {
            WorkerOutcome::Processed(segment) => segment,
            WorkerOutcome::Skipped { segment, .. } => segment,
        }
    }

    pub fn is_processed(&self) -> bool {
        matches!(self, WorkerOutcome::Processed(_))
    }
}

/// Process one segment. Re-running on a completed segment is a no-op.
pub async fn process_segment(
    ctx: &PipelineContext,
    segment_id: &str,
) -> Result<WorkerOutcome, WorkerError> {
    let repo = ctx.repo.as_ref();
    let mut segment: SegmentDocument = load(repo, segment_id).await.map_err(|source| {
        WorkerError::Load {
            job_id: job_id_of(segment_id).to_string(),
            segment_id: segment_id.to_string(),
            source,
        }
    })?;

    if segment.phase != ctx.pipeline.phase {
        debug!(
            segment_id,
            phase = %segment.phase,
            expected = %ctx.pipeline.phase,
            "segment type does not match worker; skipping"
        );
        return Ok(WorkerOutcome::Skipped {
            reason: SkipReason::PhaseMismatch,
            segment,
        });
    }
    if segment.is_complete() {
        debug!(segment_id, "segment already complete; skipping");
        return Ok(WorkerOutcome::Skipped {
            reason: SkipReason::AlreadyComplete,
            segment,
        });
    }

    let job_id = segment.raw_id.clone();
    let blob_err = |source: BlobError| WorkerError::Blob {
        job_id: job_id.clone(),
        segment_id: segment_id.to_string(),
        source,
    };

    let output_key = segment_output_key(
        &segment.raw_id,
        &segment.phase,
        segment.ordinal,
        &ctx.pipeline.output_ext,
    );
    segment.sw_version = Some(ctx.pipeline.sw_version.clone());
    segment.compute_target = Some(ctx.pipeline.compute_target.clone());
    segment.output_key = Some(output_key.clone());
    segment.compute_start = Some(Utc::now());

    let input = ctx
        .blobs
        .get(&segment.raw_bucket, &segment.input_key)
        .await
        .map_err(blob_err)?;
    let output = ctx
        .analyzer
        .analyze(&segment, input)
        .await
        .map_err(|source| WorkerError::Analyze {
            job_id: job_id.clone(),
            segment_id: segment_id.to_string(),
            source,
        })?;
    ctx.blobs
        .put(&segment.raw_bucket, &output_key, output)
        .await
        .map_err(blob_err)?;
    segment.compute_end = Some(Utc::now());

    let stamped = segment.clone();
    let saved = ctx
        .retry
        .save(repo, segment, move |fresh: &mut SegmentDocument| {
            if fresh.is_complete() {
                return Err(Rejected::new("segment completed by another invocation"));
            }
            fresh.sw_version = stamped.sw_version.clone();
            fresh.compute_target = stamped.compute_target.clone();
            fresh.output_key = stamped.output_key.clone();
            fresh.compute_start = stamped.compute_start;
            fresh.compute_end = stamped.compute_end;
            Ok(())
        })
        .await;

    let saved = match saved {
        Ok(saved) => saved,
        Err(err) if err.is_rejected() => {
            info!(segment_id, job_id = %job_id, "segment completed concurrently; skipping");
            let current = load(repo, segment_id)
                .await
                .map_err(|source| WorkerError::Load {
                    job_id: job_id.clone(),
                    segment_id: segment_id.to_string(),
                    source,
                })?;
            return Ok(WorkerOutcome::Skipped {
                reason: SkipReason::AlreadyComplete,
                segment: current,
            });
        }
        Err(source) => {
            return Err(WorkerError::Save {
                job_id,
                segment_id: segment_id.to_string(),
                source,
            });
        }
    };

    // Ordinal 0's raw slice stays until reassembly applies the raw debug flag.
    if saved.ordinal != 0
        && let Err(err) = ctx.blobs.delete(&saved.raw_bucket, &saved.input_key).await
    {
        warn!(segment_id, error = %err, "failed to delete raw segment input");
    }

    info!(
        segment_id,
        job_id = %saved.raw_id,
        ordinal = saved.ordinal,
        last_seg = saved.last_seg,
        "segment processed"
    );
    Ok(WorkerOutcome::Processed(saved))
}

fn job_id_of(segment_id: &str) -> &str {
    segment_id
        .rsplitn(3, '.')
        .nth(2)
        .unwrap_or(segment_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::services::blob_store::{BlobStore, MemoryBlobStore};
    use crate::services::records::{raw_segment_key, segment_doc_id};
    use crate::services::store::{MemoryRepository, StateRepository, create_typed};

    struct Upper;

    #[async_trait]
    impl SegmentAnalyzer for Upper {
        async fn analyze(
            &self,
            _segment: &SegmentDocument,
            input: Bytes,
        ) -> Result<Bytes, AnalyzeError> {
            Ok(Bytes::from(input.to_ascii_uppercase()))
        }
    }

    fn segment(ordinal: u64) -> SegmentDocument {
        SegmentDocument {
            id: segment_doc_id("job", "analysis", ordinal),
            rev: None,
            raw_id: "job".into(),
            raw_bucket: "bucket".into(),
            phase: "analysis".into(),
            ordinal,
            segment_start: 0,
            segment_end: 3,
            segment_size: 3,
            input_key: raw_segment_key("job", ordinal),
            last_seg: false,
            sw_version: None,
            compute_target: None,
            output_key: None,
            compute_start: None,
            compute_end: None,
            error: None,
        }
    }

    async fn fixture() -> (PipelineContext, Arc<MemoryRepository>, Arc<MemoryBlobStore>) {
        let repo = Arc::new(MemoryRepository::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let ctx = PipelineContext::new(repo.clone(), blobs.clone(), PipelineConfig::default())
            .with_analyzer(Upper);
        for ordinal in [0, 1] {
            blobs
                .put("bucket", &raw_segment_key("job", ordinal), Bytes::from_static(b"abc"))
                .await
                .expect("seed blob");
            create_typed(repo.as_ref(), segment(ordinal))
                .await
                .expect("seed segment");
        }
        (ctx, repo, blobs)
    }

    #[tokio::test]
    async fn processes_once_then_noops() {
        let (ctx, _repo, blobs) = fixture().await;

        let first = process_segment(&ctx, "job.analysis.S1").await.expect("process");
        assert!(first.is_processed());
        let done = first.segment();
        assert_eq!(done.output_key.as_deref(), Some("job/analysis/S1.out"));
        assert!(done.compute_start.is_some() && done.compute_end.is_some());
        assert_eq!(
            blobs.get("bucket", "job/analysis/S1.out").await.expect("output"),
            Bytes::from_static(b"ABC")
        );
        assert!(!blobs.exists("bucket", "job/raw/S1.seg").await.expect("exists"));

        let puts = blobs.put_count();
        let second = process_segment(&ctx, "job.analysis.S1").await.expect("redelivery");
        assert!(matches!(
            second,
            WorkerOutcome::Skipped {
                reason: SkipReason::AlreadyComplete,
                ..
            }
        ));
        assert_eq!(blobs.put_count(), puts);
        assert_eq!(second.segment().rev, done.rev);
    }

    #[tokio::test]
    async fn keeps_ordinal_zero_raw_input() {
        let (ctx, _repo, blobs) = fixture().await;
        process_segment(&ctx, "job.analysis.S0").await.expect("process");
        assert!(blobs.exists("bucket", "job/raw/S0.seg").await.expect("exists"));
    }

    #[tokio::test]
    async fn skips_other_job_types() {
        let (mut ctx, _repo, blobs) = fixture().await;
        ctx.pipeline.phase = "spectrogram".into();
        let outcome = process_segment(&ctx, "job.analysis.S1").await.expect("skip");
        assert!(matches!(
            outcome,
            WorkerOutcome::Skipped {
                reason: SkipReason::PhaseMismatch,
                ..
            }
        ));
        assert_eq!(blobs.put_count(), 2);
    }

    #[tokio::test]
    async fn missing_input_leaves_segment_untouched() {
        let (ctx, repo, blobs) = fixture().await;
        blobs.delete("bucket", "job/raw/S1.seg").await.expect("delete");
        let err = process_segment(&ctx, "job.analysis.S1")
            .await
            .expect_err("input missing");
        assert!(matches!(err, WorkerError::Blob { ref job_id, .. } if job_id == "job"));

        let stored: SegmentDocument = load(repo.as_ref() as &dyn StateRepository, "job.analysis.S1")
            .await
            .expect("load");
        assert!(stored.compute_start.is_none());
        assert!(stored.rev.as_deref().is_some_and(|rev| rev.starts_with("1-")));
    }

    #[test]
    fn job_id_from_segment_id() {
        assert_eq!(job_id_of("run.2024.analysis.S3"), "run.2024");
        assert_eq!(job_id_of("odd"), "odd");
    }
}
