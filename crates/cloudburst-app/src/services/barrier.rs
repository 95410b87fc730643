//! Completion barrier run after each segment finishes.
//!
//! Only the invocation holding the `last_seg` segment waits. It polls the
//! incomplete view until it drains, re-reads the job, and claims reassembly with
//! an optimistic `segmented|analyzing -> complete` transition. Losing either
//! check means another detector already claimed the job.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::services::context::PipelineContext;
use crate::services::records::{JobDocument, JobStatus, SegmentDocument};
use crate::services::retry::SaveError;
use crate::services::store::{RepoError, SegmentIndex, SegmentView, load};

/// Pause between polls of the incomplete view.
#[async_trait]
pub trait Waiter: Send + Sync {
    /// Returns `false` if the wait was cancelled and polling should stop.
    async fn wait(&self) -> bool;
}

#[async_trait]
impl<T: Waiter + ?Sized> Waiter for std::sync::Arc<T> {
    async fn wait(&self) -> bool {
        (**self).wait().await
    }
}

/// Sleeps a fixed interval; a `true` on the cancel channel interrupts it.
#[derive(Debug, Clone)]
pub struct SleepWaiter {
    interval: Duration,
    cancel: Option<watch::Receiver<bool>>,
}

enum Woke {
    Elapsed,
    Cancelled,
    SenderGone,
}

impl SleepWaiter {
    pub fn new(interval: Duration, cancel: watch::Receiver<bool>) -> Self {
        Self {
            interval,
            cancel: Some(cancel),
        }
    }

    /// A waiter nothing can cancel.
    pub fn uncancellable(interval: Duration) -> Self {
        Self {
            interval,
            cancel: None,
        }
    }
}

#[async_trait]
impl Waiter for SleepWaiter {
    async fn wait(&self) -> bool {
        let Some(cancel) = &self.cancel else {
            tokio::time::sleep(self.interval).await;
            return true;
        };
        if *cancel.borrow() {
            return false;
        }
        let mut cancel = cancel.clone();
        let woke = tokio::select! {
            _ = tokio::time::sleep(self.interval) => Woke::Elapsed,
            changed = cancel.wait_for(|cancelled| *cancelled) => {
                if changed.is_ok() { Woke::Cancelled } else { Woke::SenderGone }
            }
        };
        match woke {
            Woke::Elapsed => true,
            Woke::Cancelled => false,
            Woke::SenderGone => {
                tokio::time::sleep(self.interval).await;
                true
            }
        }
    }
}

/// Yields to the scheduler instead of sleeping.
#[derive(Debug, Clone, Copy, Default)]
pub struct YieldWaiter;

#[async_trait]
impl Waiter for YieldWaiter {
    async fn wait(&self) -> bool {
        tokio::task::yield_now().await;
        true
    }
}

#[derive(Debug, Error)]
pub enum BarrierError {
    #[error("job `{job_id}`: incomplete-segment query failed: {source}")]
    Query {
        job_id: String,
        #[source]
        source: RepoError,
    },
    #[error("job `{job_id}`: failed to re-read job document: {source}")]
    Load {
        job_id: String,
        #[source]
        source: RepoError,
    },
    #[error("job `{job_id}`: failed to claim reassembly: {source}")]
    Claim {
        job_id: String,
        #[source]
        source: SaveError,
    },
    #[error("job `{job_id}`: barrier wait cancelled with {remaining} segments outstanding")]
    Cancelled { job_id: String, remaining: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub enum BarrierOutcome {
    /// The segment is not the terminal one; nothing to wait for.
    NotTerminal,
    /// Another detector already moved the job to `complete`.
    AlreadyStarted,
    /// This detector won; the job document is the freshly saved `complete` copy.
    Claimed(JobDocument),
}

pub async fn await_barrier(
    ctx: &PipelineContext,
    segment: &SegmentDocument,
) -> Result<BarrierOutcome, BarrierError> {
    if !segment.last_seg {
        return Ok(BarrierOutcome::NotTerminal);
    }
    let job_id = segment.raw_id.as_str();
    let phase = segment.phase.as_str();
    let index = SegmentIndex::new(phase, job_id);

    loop {
        match ctx.repo.query(&index, SegmentView::Incomplete, false).await {
            Ok(rows) if rows.is_empty() => break,
            Ok(rows) => {
                debug!(job_id, remaining = rows.len(), "segments still outstanding");
                if !ctx.waiter.wait().await {
                    return Err(BarrierError::Cancelled {
                        job_id: job_id.to_string(),
                        remaining: rows.len(),
                    });
                }
            }
            Err(RepoError::IndexMissing(name)) => {
                // Dropped by a reassembly that already finished.
                debug!(job_id, index = %name, "index gone; treating as drained");
                break;
            }
            Err(source) => {
                return Err(BarrierError::Query {
                    job_id: job_id.to_string(),
                    source,
                });
            }
        }
    }

    let fresh: JobDocument =
        load(ctx.repo.as_ref(), job_id)
            .await
            .map_err(|source| BarrierError::Load {
                job_id: job_id.to_string(),
                source,
            })?;
    if fresh.status(phase) == Some(JobStatus::Complete) {
        info!(job_id, "reassembly already started");
        return Ok(BarrierOutcome::AlreadyStarted);
    }

    match ctx
        .retry
        .transition(
            ctx.repo.as_ref(),
            job_id,
            phase,
            &[JobStatus::Segmented, JobStatus::Analyzing],
            JobStatus::Complete,
        )
        .await
    {
        Ok(job) => {
            info!(job_id, "barrier passed; reassembly claimed");
            Ok(BarrierOutcome::Claimed(job))
        }
        Err(err) if err.is_rejected() => {
            info!(job_id, reason = %err, "reassembly already started");
            Ok(BarrierOutcome::AlreadyStarted)
        }
        Err(source) => Err(BarrierError::Claim {
            job_id: job_id.to_string(),
            source,
        }),
    }
}
