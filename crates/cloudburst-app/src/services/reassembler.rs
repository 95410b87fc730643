//! Folds completed segment outputs into the merged artifact and applies
//! retention cleanup. Runs only in the detector that claimed the barrier.

use std::collections::BTreeSet;

use bytes::BytesMut;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::services::blob_store::BlobError;
use crate::services::context::PipelineContext;
use crate::services::records::{
    JobDocument, SegmentSummary, merged_output_key, raw_segment_key, segment_local_id,
};

const MISSING_SEGMENT_ERROR: &str = "segment never completed";
use crate::services::retry::{Rejected, SaveError};
use crate::services::store::{RepoError, SegmentIndex, SegmentView};

#[derive(Debug, Error)]
pub enum ReassembleError {
    #[error("job `{job_id}` is missing `{field}`")]
    Invalid { job_id: String, field: &'static str },
    #[error("job `{job_id}`: complete-segment query failed: {source}")]
    Query {
        job_id: String,
        #[source]
        source: RepoError,
    },
    #[error("job `{job_id}`: failed to upload merged output `{key}`: {source}")]
    Upload {
        job_id: String,
        key: String,
        #[source]
        source: BlobError,
    },
    #[error("job `{job_id}`: failed to persist reassembly: {source}")]
    Save {
        job_id: String,
        #[source]
        source: SaveError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassemblyReport {
    pub job_id: String,
    pub output_key: String,
    pub size_bytes: u64,
    /// Summaries in ordinal order, with per-segment fold errors recorded.
    pub segments: Vec<SegmentSummary>,
}

impl ReassemblyReport {
    pub fn failed_segments(&self) -> usize {
        self.segments.iter().filter(|s| s.error.is_some()).count()
    }
}

pub async fn reassemble(
    ctx: &PipelineContext,
    job: &JobDocument,
) -> Result<ReassemblyReport, ReassembleError> {
    let job_id = job.id.as_str();
    let phase = ctx.phase();
    let bucket = job.bucket.clone().ok_or_else(|| ReassembleError::Invalid {
        job_id: job_id.to_string(),
        field: "bucket",
    })?;
    let state = job.phase(phase).ok_or_else(|| ReassembleError::Invalid {
        job_id: job_id.to_string(),
        field: "phase",
    })?;
    let keep_segment_debug = state.retain_debug.is_keep();
    let index = SegmentIndex::new(phase, job_id);

    let mut rows = ctx
        .repo
        .query(&index, SegmentView::Complete, false)
        .await
        .map_err(|source| ReassembleError::Query {
            job_id: job_id.to_string(),
            source,
        })?;
    // View order is by id string, which puts S10 before S2.
    rows.sort_by_key(|row| row.summary.ordinal);

    let mut merged = BytesMut::new();
    let mut segments = Vec::with_capacity(rows.len());
    for row in rows {
        let mut summary = row.summary;
        let retained = summary.ordinal == 0 && keep_segment_debug;
        let Some(output_key) = summary.output_key.clone() else {
            warn!(job_id, segment_id = %row.id, "complete segment has no output key");
            summary.error = Some("segment has no output key".to_string());
            segments.push(summary);
            continue;
        };

        match ctx.blobs.get(&bucket, &output_key).await {
            Ok(bytes) => merged.extend_from_slice(&bytes),
            Err(err) => {
                warn!(job_id, segment_id = %row.id, error = %err, "failed to fetch segment output");
                summary.error = Some(err.to_string());
                segments.push(summary);
                continue;
            }
        }

        if !retained {
            if let Err(err) = ctx.blobs.delete(&bucket, &output_key).await {
                warn!(job_id, key = %output_key, error = %err, "failed to delete segment output");
            }
            if let Err(err) = ctx.repo.delete(&row.id).await {
                warn!(job_id, segment_id = %row.id, error = %err, "failed to delete segment document");
            }
        } else {
            debug!(job_id, segment_id = %row.id, "retaining debug segment");
        }
        segments.push(summary);
    }
    let missing = missing_segments(job, phase, &segments);
    if !missing.is_empty() {
        warn!(job_id, missing = missing.len(), "merged output has gaps");
        segments.extend(missing);
        segments.sort_by_key(|summary| summary.ordinal);
    }

    let output_key = merged_output_key(job_id, phase, &ctx.pipeline.output_ext);
    let size_bytes = merged.len() as u64;
    ctx.blobs
        .put(&bucket, &output_key, merged.freeze())
        .await
        .map_err(|source| ReassembleError::Upload {
            job_id: job_id.to_string(),
            key: output_key.clone(),
            source,
        })?;

    if let Err(err) = ctx.repo.drop_index(&index).await {
        warn!(job_id, index = %index.name(), error = %err, "failed to drop segment index");
    }

    let saved_segments = segments.clone();
    let saved_key = output_key.clone();
    let saved: JobDocument = ctx
        .retry
        .update(ctx.repo.as_ref(), job_id, |fresh: &mut JobDocument| {
            let state = fresh
                .phase_mut(phase)
                .ok_or_else(|| Rejected::new(format!("job has no `{phase}` phase")))?;
            state.segments = saved_segments.clone();
            state.output_key = Some(saved_key.clone());
            fresh.touch();
            Ok(())
        })
        .await
        .map_err(|source| ReassembleError::Save {
            job_id: job_id.to_string(),
            source,
        })?;

    apply_raw_retention(ctx, &saved, &bucket).await;

    let report = ReassemblyReport {
        job_id: job_id.to_string(),
        output_key,
        size_bytes,
        segments,
    };
    info!(
        job_id,
        output_key = %report.output_key,
        size_bytes,
        segments = report.segments.len(),
        failed = report.failed_segments(),
        "job reassembled"
    );
    Ok(report)
}

/// Error summaries for every ordinal below `segment_count` the complete view
/// never returned.
fn missing_segments(
    job: &JobDocument,
    phase: &str,
    seen: &[SegmentSummary],
) -> Vec<SegmentSummary> {
    let Some(state) = job.phase(phase) else {
        return Vec::new();
    };
    let Some(count) = state.segment_count else {
        return Vec::new();
    };
    let seen: BTreeSet<u64> = seen.iter().map(|summary| summary.ordinal).collect();
    let size = job.raw.as_ref().and_then(|raw| raw.size_bytes);
    (0..count)
        .filter(|ordinal| !seen.contains(ordinal))
        .map(|ordinal| {
            let segment_start = ordinal.saturating_mul(state.segment_size);
            let full_end = segment_start.saturating_add(state.segment_size);
            SegmentSummary {
                id: segment_local_id(ordinal),
                ordinal,
                segment_start,
                segment_end: size.map_or(full_end, |size| full_end.min(size)),
                segment_size: state.segment_size,
                sw_version: None,
                compute_target: None,
                output_key: None,
                compute_start: None,
                compute_end: None,
                error: Some(MISSING_SEGMENT_ERROR.to_string()),
            }
        })
        .collect()
}

/// Drop the raw input unless it is kept, and the ordinal 0 raw slice unless
/// the raw debug flag keeps it.
async fn apply_raw_retention(ctx: &PipelineContext, job: &JobDocument, bucket: &str) {
    let Some(raw) = job.raw.as_ref() else {
        return;
    };
    if !raw.retain_input.is_keep() {
        match ctx.blobs.delete(bucket, &raw.key).await {
            Ok(_) => debug!(job_id = %job.id, key = %raw.key, "raw input deleted"),
            Err(err) => warn!(job_id = %job.id, key = %raw.key, error = %err, "failed to delete raw input"),
        }
    }
    if !raw.retain_debug.is_keep() {
        let key = raw_segment_key(&job.id, 0);
        if let Err(err) = ctx.blobs.delete(bucket, &key).await {
            warn!(job_id = %job.id, key = %key, error = %err, "failed to delete raw debug slice");
        }
    }
}
