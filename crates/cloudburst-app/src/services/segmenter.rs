//! Splits a job's raw artifact into fixed-size segments.

use std::ops::Range;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use crate::services::blob_store::BlobError;
use crate::services::context::PipelineContext;
use crate::services::records::{
    JobDocument, JobStatus, SegmentDocument, raw_segment_key, segment_doc_id,
};
use crate::services::retry::{Rejected, SaveError};
use crate::services::store::{RepoError, SegmentIndex, StateRepository, create_typed, load};

#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("job `{job_id}`: {source}")]
    Repo {
        job_id: String,
        #[source]
        source: RepoError,
    },
    #[error("job `{job_id}` is invalid: {reason}")]
    Invalid { job_id: String, reason: String },
    #[error("job `{job_id}`: raw artifact unavailable: {source}")]
    RawArtifact {
        job_id: String,
        #[source]
        source: BlobError,
    },
    #[error("job `{job_id}`: terminal segment S{ordinal} could not be written: {reason}")]
    TerminalSegment {
        job_id: String,
        ordinal: u64,
        reason: String,
    },
    #[error("job `{job_id}`: failed to record segmentation: {source}")]
    Save {
        job_id: String,
        #[source]
        source: SaveError,
    },
}

/// A segment that could not be written during segmentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentFailure {
    pub ordinal: u64,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentReport {
    pub job_id: String,
    /// Every attempted segment, including failed ones.
    pub segment_count: u64,
    /// Ids of the segment documents that were created.
    pub segment_ids: Vec<String>,
    pub failures: Vec<SegmentFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segmentation {
    /// The phase already left `pending`.
    Skipped { job_id: String, status: JobStatus },
    Done(SegmentReport),
}

/// Half-open ranges covering `[0, size)` in `segment_size` steps; the last one
/// holds the remainder.
pub fn plan_segments(size: u64, segment_size: u64) -> Vec<Range<u64>> {
    debug_assert!(segment_size > 0);
    if segment_size == 0 {
        return Vec::new();
    }
    let count = size.div_ceil(segment_size);
    (0..count)
        .map(|ordinal| {
            let start = ordinal * segment_size;
            start..(start + segment_size).min(size)
        })
        .collect()
}

pub async fn segment_job(
    ctx: &PipelineContext,
    job_id: &str,
) -> Result<Segmentation, SegmentError> {
    let repo = ctx.repo.as_ref();
    let phase = ctx.phase();
    let repo_err = |source| SegmentError::Repo {
        job_id: job_id.to_string(),
        source,
    };

    let job: JobDocument = load(repo, job_id).await.map_err(repo_err)?;
    let Some(state) = job.phase(phase) else {
        return Err(record_invalid(ctx, job_id, format!("job has no `{phase}` phase")).await);
    };
    if state.status != JobStatus::Pending {
        info!(job_id, status = %state.status, "segmentation already done; skipping");
        return Ok(Segmentation::Skipped {
            job_id: job_id.to_string(),
            status: state.status,
        });
    }
    let segment_size = state.segment_size;
    let (Some(bucket), Some(raw)) = (job.bucket.clone(), job.raw.clone()) else {
        return Err(record_invalid(ctx, job_id, "job has no bucket or raw artifact").await);
    };
    if segment_size == 0 {
        return Err(record_invalid(ctx, job_id, "segment_size must be positive").await);
    }

    let data = match ctx.blobs.get(&bucket, &raw.key).await {
        Ok(data) => data,
        Err(source) => {
            let reason = format!("raw artifact `{}` unavailable: {source}", raw.key);
            record_error(ctx, job_id, reason).await;
            return Err(SegmentError::RawArtifact {
                job_id: job_id.to_string(),
                source,
            });
        }
    };
    let size = data.len() as u64;
    if size == 0 {
        return Err(record_invalid(ctx, job_id, "raw artifact is empty").await);
    }

    repo.define_index(&SegmentIndex::new(phase, job_id))
        .await
        .map_err(repo_err)?;

    let ranges = plan_segments(size, segment_size);
    let last_ordinal = ranges.len() as u64 - 1;
    let mut segment_ids = Vec::with_capacity(ranges.len());
    let mut failures = Vec::new();

    for (ordinal, range) in (0u64..).zip(ranges.iter().cloned()) {
        let input_key = raw_segment_key(job_id, ordinal);
        // usize conversion is lossless: the range lies inside `data`.
        let slice = data.slice(range.start as usize..range.end as usize);
        if let Err(err) = ctx.blobs.put(&bucket, &input_key, slice).await {
            warn!(job_id, ordinal, error = %err, "failed to upload segment input");
            failures.push(SegmentFailure {
                ordinal,
                error: err.to_string(),
            });
            continue;
        }

        let segment = SegmentDocument {
            id: segment_doc_id(job_id, phase, ordinal),
            rev: None,
            raw_id: job_id.to_string(),
            raw_bucket: bucket.clone(),
            phase: phase.to_string(),
            ordinal,
            segment_start: range.start,
            segment_end: range.end,
            segment_size,
            input_key,
            last_seg: ordinal == last_ordinal,
            sw_version: None,
            compute_target: None,
            output_key: None,
            compute_start: None,
            compute_end: None,
            error: None,
        };
        match create_segment(repo, segment).await {
            Ok(id) => segment_ids.push(id),
            Err(err) => {
                warn!(job_id, ordinal, error = %err, "failed to create segment document");
                failures.push(SegmentFailure {
                    ordinal,
                    error: err.to_string(),
                });
            }
        }
    }

    // Without the `last_seg` document the barrier could never fire.
    if let Some(failure) = failures.iter().find(|f| f.ordinal == last_ordinal) {
        let reason = format!(
            "terminal segment S{last_ordinal} could not be written: {}",
            failure.error
        );
        record_error(ctx, job_id, reason).await;
        return Err(SegmentError::TerminalSegment {
            job_id: job_id.to_string(),
            ordinal: last_ordinal,
            reason: failure.error.clone(),
        });
    }

    let segment_count = ranges.len() as u64;
    let sw_version = ctx.pipeline.sw_version.clone();
    ctx.retry
        .update(repo, job_id, |job: &mut JobDocument| {
            let state = job
                .phase_mut(phase)
                .ok_or_else(|| Rejected::new("phase removed during segmentation"))?;
            if !state.status.can_advance_to(JobStatus::Segmented) {
                return Err(Rejected::new(format!("status moved to {}", state.status)));
            }
            state.status = JobStatus::Segmented;
            state.segment_count = Some(segment_count);
            state.sw_version = Some(sw_version.clone());
            state.started_at.get_or_insert_with(Utc::now);
            if let Some(raw) = job.raw.as_mut() {
                raw.size_bytes = Some(size);
            }
            job.error = None;
            job.touch();
            Ok(())
        })
        .await
        .map_err(|source| SegmentError::Save {
            job_id: job_id.to_string(),
            source,
        })?;

    info!(
        job_id,
        segment_count,
        failed = failures.len(),
        size_bytes = size,
        "job segmented"
    );
    Ok(Segmentation::Done(SegmentReport {
        job_id: job_id.to_string(),
        segment_count,
        segment_ids,
        failures,
    }))
}

/// Create a segment document, accepting the same segment left by an earlier
/// interrupted run.
async fn create_segment(
    repo: &dyn StateRepository,
    segment: SegmentDocument,
) -> Result<String, RepoError> {
    let id = segment.id.clone();
    match create_typed(repo, segment.clone()).await {
        Ok(created) => Ok(created.id),
        Err(RepoError::Duplicate(_)) => {
            let existing: SegmentDocument = load(repo, &id).await?;
            let same = existing.raw_id == segment.raw_id
                && existing.phase == segment.phase
                && existing.segment_start == segment.segment_start
                && existing.segment_end == segment.segment_end;
            if same {
                Ok(id)
            } else {
                Err(RepoError::Duplicate(id))
            }
        }
        Err(err) => Err(err),
    }
}

/// Write `error` onto the job and build the matching validation error.
async fn record_invalid(
    ctx: &PipelineContext,
    job_id: &str,
    reason: impl Into<String>,
) -> SegmentError {
    let reason = reason.into();
    record_error(ctx, job_id, reason.clone()).await;
    SegmentError::Invalid {
        job_id: job_id.to_string(),
        reason,
    }
}

async fn record_error(ctx: &PipelineContext, job_id: &str, reason: String) {
    let saved = ctx
        .retry
        .update(ctx.repo.as_ref(), job_id, |job: &mut JobDocument| {
            job.error = Some(reason.clone());
            job.touch();
            Ok(())
        })
        .await;
    if let Err(err) = saved {
        warn!(job_id, error = %err, "failed to record job error");
    }
}
