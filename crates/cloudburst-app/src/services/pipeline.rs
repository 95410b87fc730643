//! Wires segmenter, workers, barrier and reassembler together.
//!
//! [`handle_segment`] is what one stateless invocation runs for one segment.
//! [`run_local`] drives a whole job inside a single process by fanning those
//! invocations out on a `JoinSet`.

use std::collections::BTreeSet;
use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::services::barrier::{BarrierError, BarrierOutcome, await_barrier};
use crate::services::context::PipelineContext;
use crate::services::reassembler::{ReassembleError, ReassemblyReport, reassemble};
use crate::services::records::{JobDocument, JobStatus, segment_doc_id};
use crate::services::retry::SaveError;
use crate::services::segmenter::{SegmentError, Segmentation, segment_job};
use crate::services::store::{RepoError, load};
use crate::services::worker::{SkipReason, WorkerError, WorkerOutcome, process_segment};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Segment(#[from] SegmentError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error(transparent)]
    Barrier(#[from] BarrierError),
    #[error(transparent)]
    Reassemble(#[from] ReassembleError),
    #[error("job `{job_id}`: {source}")]
    Repo {
        job_id: String,
        #[source]
        source: RepoError,
    },
    #[error("job `{job_id}`: failed to advance phase: {source}")]
    Advance {
        job_id: String,
        #[source]
        source: SaveError,
    },
    #[error("job `{job_id}`: {failed} segment invocations failed; first: {first}")]
    Segments {
        job_id: String,
        failed: usize,
        first: String,
    },
}

/// What one segment invocation did.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentRun {
    pub worker: WorkerOutcome,
    pub barrier: Option<BarrierOutcome>,
    pub reassembly: Option<ReassemblyReport>,
}

/// Worker, then barrier, then reassembly when this invocation wins the race.
pub async fn handle_segment(
    ctx: &PipelineContext,
    segment_id: &str,
) -> Result<SegmentRun, PipelineError> {
    let worker = process_segment(ctx, segment_id).await?;
    if let WorkerOutcome::Skipped {
        reason: SkipReason::PhaseMismatch,
        ..
    } = worker
    {
        return Ok(SegmentRun {
            worker,
            barrier: None,
            reassembly: None,
        });
    }

    // Redelivered completions still run the barrier; the claim keeps it single.
    let barrier = await_barrier(ctx, worker.segment()).await?;
    let reassembly = match &barrier {
        BarrierOutcome::Claimed(job) => Some(reassemble(ctx, job).await?),
        BarrierOutcome::NotTerminal | BarrierOutcome::AlreadyStarted => None,
    };
    Ok(SegmentRun {
        worker,
        barrier: Some(barrier),
        reassembly,
    })
}

/// Move a freshly segmented phase to `analyzing`. Already past it is fine.
pub async fn advance_to_analyzing(
    ctx: &PipelineContext,
    job_id: &str,
) -> Result<(), PipelineError> {
    match ctx
        .retry
        .transition(
            ctx.repo.as_ref(),
            job_id,
            ctx.phase(),
            &[JobStatus::Segmented],
            JobStatus::Analyzing,
        )
        .await
    {
        Ok(_) => Ok(()),
        Err(err) if err.is_rejected() => {
            debug!(job_id, reason = %err, "phase already past segmented");
            Ok(())
        }
        Err(source) => Err(PipelineError::Advance {
            job_id: job_id.to_string(),
            source,
        }),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalRun {
    pub job_id: String,
    pub segments: u64,
    pub processed: usize,
    /// `None` when the job was already complete or another process merged it.
    pub reassembly: Option<ReassemblyReport>,
}

/// Segment `job_id` (or resume it) and process every segment concurrently.
///
/// The first failing invocation aborts the rest; rerunning resumes from the
/// segments still lacking `compute_end`.
pub async fn run_local(ctx: Arc<PipelineContext>, job_id: &str) -> Result<LocalRun, PipelineError> {
    let mut unwritten = BTreeSet::new();
    match segment_job(&ctx, job_id).await? {
        Segmentation::Done(report) if !report.failures.is_empty() => {
            warn!(
                job_id,
                failed = report.failures.len(),
                "some segments could not be created"
            );
            unwritten.extend(report.failures.iter().map(|failure| failure.ordinal));
        }
        Segmentation::Done(_) => {}
        Segmentation::Skipped { status, .. } if status.is_terminal() => {
            info!(job_id, %status, "job already finished");
            return Ok(LocalRun {
                job_id: job_id.to_string(),
                segments: 0,
                processed: 0,
                reassembly: None,
            });
        }
        Segmentation::Skipped { status, .. } => {
            info!(job_id, %status, "resuming segmented job");
        }
    }
    advance_to_analyzing(&ctx, job_id).await?;

    let job: JobDocument =
        load(ctx.repo.as_ref(), job_id)
            .await
            .map_err(|source| PipelineError::Repo {
                job_id: job_id.to_string(),
                source,
            })?;
    let segments = job
        .phase(ctx.phase())
        .and_then(|state| state.segment_count)
        .unwrap_or(0);

    let mut tasks = JoinSet::new();
    for ordinal in 0..segments {
        if unwritten.contains(&ordinal) {
            continue;
        }
        let segment_id = segment_doc_id(job_id, ctx.phase(), ordinal);
        let exists = ctx
            .repo
            .exists(&segment_id)
            .await
            .map_err(|source| PipelineError::Repo {
                job_id: job_id.to_string(),
                source,
            })?;
        if !exists {
            // Reassembly reports the gap.
            warn!(job_id, segment_id, "segment document missing; skipping");
            continue;
        }
        let ctx = Arc::clone(&ctx);
        tasks.spawn(async move { handle_segment(&ctx, &segment_id).await });
    }

    let mut processed = 0;
    let mut reassembly = None;
    let mut failures = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(run)) => {
                if run.worker.is_processed() {
                    processed += 1;
                }
                if run.reassembly.is_some() {
                    reassembly = run.reassembly;
                }
            }
            Ok(Err(err)) => {
                warn!(job_id, error = %err, "segment invocation failed");
                if failures.is_empty() {
                    // The terminal segment's barrier can never drain now.
                    tasks.abort_all();
                }
                failures.push(err.to_string());
            }
            Err(join_err) if join_err.is_cancelled() => {}
            Err(join_err) => failures.push(join_err.to_string()),
        }
    }

    if let Some(first) = failures.first() {
        return Err(PipelineError::Segments {
            job_id: job_id.to_string(),
            failed: failures.len(),
            first: first.clone(),
        });
    }
    info!(job_id, segments, processed, merged = reassembly.is_some(), "local run finished");
    Ok(LocalRun {
        job_id: job_id.to_string(),
        segments,
        processed,
        reassembly,
    })
}
