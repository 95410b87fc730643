//! Reclaim notifications: stop the runner, flush partial work, mark the job.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bon::Builder;
use chrono::Utc;
use cloudburst_server::ReclaimNotice;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::InstanceConfig;
use crate::constants::{RECLAIMED_ERROR, RECLAIM_SETTLE_TIMEOUT, TRANSIENT_PHASE};
use crate::services::blob_store::BlobStore;
use crate::services::records::{JobDocument, JobStatus, WorkUnit};
use crate::services::retry::{ConflictRetry, Rejected, SaveError};
use crate::services::runner::{ActiveJob, WorkDir};
use crate::services::store::{RepoError, StateRepository, load};

#[derive(Debug, Error)]
pub enum PreemptionError {
    #[error("no job is running on instance `{instance_id}`")]
    NoActiveJob { instance_id: String },
    #[error("job `{job_id}`: {source}")]
    Repo {
        job_id: String,
        #[source]
        source: RepoError,
    },
    #[error("job `{job_id}` is invalid: {reason}")]
    Invalid { job_id: String, reason: String },
    #[error("job `{job_id}`: failed to record reclaim: {source}")]
    Save {
        job_id: String,
        #[source]
        source: SaveError,
    },
}

/// What handling one notice did to the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReclaimOutcome {
    /// Nothing left to lose; the job document is untouched.
    Complete { job_id: String },
    /// The job was interrupted and is now `reclaimed`.
    Interrupted {
        job_id: String,
        /// Index of the input that was in flight, if any.
        in_flight: Option<usize>,
        flushed: Vec<String>,
    },
}

impl ReclaimOutcome {
    pub fn message(&self) -> String {
        match self {
            ReclaimOutcome::Complete { job_id } => {
                format!("{job_id} COMPLETE and prepped for reclamation")
            }
            ReclaimOutcome::Interrupted { job_id, .. } => {
                format!("{job_id} INCOMPLETE and prepped for reclamation")
            }
        }
    }
}

#[derive(Builder)]
pub struct PreemptionHandler {
    repo: Arc<dyn StateRepository>,
    blobs: Arc<dyn BlobStore>,
    config: InstanceConfig,
    scratch_dir: PathBuf,
    active: ActiveJob,
    #[builder(default)]
    retry: ConflictRetry,
    #[builder(default = RECLAIM_SETTLE_TIMEOUT)]
    settle_timeout: Duration,
}

/// The answer for a job that no reclaim can change any more.
fn settled(job: &JobDocument) -> Option<ReclaimOutcome> {
    match job.status(TRANSIENT_PHASE) {
        Some(JobStatus::Complete) => {
            info!(job_id = %job.id, "job already complete; nothing to flush");
            Some(ReclaimOutcome::Complete {
                job_id: job.id.clone(),
            })
        }
        Some(JobStatus::Reclaimed) => Some(ReclaimOutcome::Interrupted {
            job_id: job.id.clone(),
            in_flight: None,
            flushed: Vec::new(),
        }),
        _ => None,
    }
}

impl PreemptionHandler {
    pub async fn handle(&self, notice: &ReclaimNotice) -> Result<ReclaimOutcome, PreemptionError> {
        let job_id = self.locate(&notice.id).await?;
        info!(job_id = %job_id, instance_id = %notice.id, event = %notice.event, "reclaim notice received");

        let job = self.load(&job_id).await?;
        if let Some(outcome) = settled(&job) {
            return Ok(outcome);
        }
        let Some(bucket) = job.bucket.clone() else {
            return Err(PreemptionError::Invalid {
                job_id,
                reason: "job has no bucket".to_string(),
            });
        };

        self.active.signal_reclaim();
        if !self.active.wait_idle(&job_id, self.settle_timeout).await {
            warn!(job_id = %job_id, timeout_secs = self.settle_timeout.as_secs(), "runner still busy; flushing anyway");
        }

        // The runner may have started another input since the first read.
        let job = self.load(&job_id).await?;
        if let Some(outcome) = settled(&job) {
            return Ok(outcome);
        }
        let in_flight = job.inputs.iter().position(WorkUnit::is_in_flight);
        let mut flushed = Vec::new();
        let mut flush_errors = Vec::new();
        if let Some(index) = in_flight
            && let Some(input_key) = job.inputs[index].input_key.as_deref()
        {
            let work = WorkDir::for_input(&self.scratch_dir, input_key, &self.config);
            let output_key = job.inputs[index]
                .output_key
                .clone()
                .unwrap_or_else(|| work.output_key(&self.config));
            let result = work
                .flush(self.blobs.as_ref(), &bucket, &output_key, true)
                .await;
            flushed = result.results;
            flush_errors = result.errors;
            for error in &flush_errors {
                warn!(job_id = %job_id, error = %error, "partial upload failed");
            }
        }

        let results = flushed.clone();
        let reclaimed_at = Utc::now();
        self.retry
            .update(self.repo.as_ref(), &job_id, |fresh: &mut JobDocument| {
                let state = fresh
                    .phase_mut(TRANSIENT_PHASE)
                    .ok_or_else(|| Rejected::new("job has no transient phase"))?;
                if state.status.is_terminal() {
                    return Err(Rejected::new(format!("job already {}", state.status)));
                }
                state.status = JobStatus::Reclaimed;
                state.completed_at = Some(reclaimed_at);
                // No input may stay open on a reclaimed job.
                for (index, unit) in fresh.inputs.iter_mut().enumerate() {
                    if !unit.is_in_flight() {
                        continue;
                    }
                    let mut error = RECLAIMED_ERROR.to_string();
                    if Some(index) == in_flight {
                        if !flush_errors.is_empty() {
                            error.push_str(&format!("; upload failed: {}", flush_errors.join("; ")));
                        }
                        unit.results.extend(results.iter().cloned());
                    }
                    unit.error = Some(error);
                    unit.compute_end = Some(reclaimed_at);
                }
                fresh.touch();
                Ok(())
            })
            .await
            .map(|_: JobDocument| ())
            .or_else(|err| self.settled_elsewhere(&job_id, err))?;

        info!(job_id = %job_id, ?in_flight, flushed = flushed.len(), "job reclaimed");
        Ok(ReclaimOutcome::Interrupted {
            job_id,
            in_flight,
            flushed,
        })
    }

    /// The job running here, or the job whose instance matches the notice.
    async fn locate(&self, instance_id: &str) -> Result<String, PreemptionError> {
        if let Some(job_id) = self.active.current() {
            return Ok(job_id);
        }
        let jobs = self
            .repo
            .list_jobs()
            .await
            .map_err(|source| PreemptionError::Repo {
                job_id: instance_id.to_string(),
                source,
            })?;
        jobs.into_iter()
            .find(|job| {
                job.instance
                    .as_ref()
                    .and_then(|spec| spec.compute_target.as_deref())
                    == Some(instance_id)
            })
            .map(|job| job.id)
            .ok_or_else(|| PreemptionError::NoActiveJob {
                instance_id: instance_id.to_string(),
            })
    }

    async fn load(&self, job_id: &str) -> Result<JobDocument, PreemptionError> {
        load(self.repo.as_ref(), job_id)
            .await
            .map_err(|source| PreemptionError::Repo {
                job_id: job_id.to_string(),
                source,
            })
    }

    /// A rejected update is fine when the job reached a terminal state meanwhile.
    fn settled_elsewhere(&self, job_id: &str, err: SaveError) -> Result<(), PreemptionError> {
        if err.is_rejected() {
            warn!(job_id, reason = %err, "job settled before reclaim was recorded");
            return Ok(());
        }
        Err(PreemptionError::Save {
            job_id: job_id.to_string(),
            source: err,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;
    use tempfile::TempDir;

    use crate::services::blob_store::MemoryBlobStore;
    use crate::services::records::{Document, InstanceSpec, PhaseState, RetentionFlag};
    use crate::services::store::{
        MemoryRepository, SegmentIndex, SegmentView, ViewRow, create_typed, save_typed,
    };

    fn notice(id: &str) -> ReclaimNotice {
        ReclaimNotice {
            id: id.to_string(),
            service_name: "compute".into(),
            event: "reclaim-scheduled".into(),
            timestamp: "1700000000".into(),
            link: "https://example.invalid".into(),
            nonce: "n".into(),
        }
    }

    async fn seed_job(repo: &dyn StateRepository, status: JobStatus, inputs: Vec<WorkUnit>) {
        let mut job = JobDocument::new("batch", "bucket");
        let mut state = PhaseState::pending(0, RetentionFlag::Discard);
        state.status = status;
        job.phases.insert(TRANSIENT_PHASE.into(), state);
        job.instance = Some(InstanceSpec {
            compute_target: Some("vm-7".into()),
            ..InstanceSpec::new(8)
        });
        job.inputs = inputs;
        create_typed(repo, job).await.expect("job");
    }

    fn handler(
        repo: Arc<dyn StateRepository>,
        blobs: Arc<MemoryBlobStore>,
        scratch: &TempDir,
        active: &ActiveJob,
    ) -> PreemptionHandler {
        PreemptionHandler::builder()
            .repo(repo)
            .blobs(blobs)
            .config(InstanceConfig::default())
            .scratch_dir(scratch.path().to_path_buf())
            .active(active.clone())
            .settle_timeout(Duration::from_secs(2))
            .build()
    }

    async fn fixture(
        status: JobStatus,
        inputs: Vec<WorkUnit>,
    ) -> (PreemptionHandler, Arc<MemoryRepository>, Arc<MemoryBlobStore>, TempDir, ActiveJob) {
        let repo = Arc::new(MemoryRepository::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        seed_job(repo.as_ref(), status, inputs).await;
        let scratch = TempDir::new().expect("scratch");
        let active = ActiveJob::new();
        let handler = handler(repo.clone(), blobs.clone(), &scratch, &active);
        (handler, repo, blobs, scratch, active)
    }

    fn in_flight(id: &str) -> WorkUnit {
        WorkUnit {
            output_key: Some(format!("batch/{id}/results.out")),
            compute_start: Some(Utc::now()),
            ..WorkUnit::new(id, format!("batch/{id}/a.nw"))
        }
    }

    /// Stand-in runner: holds the slot until reclaim is signalled.
    fn hold_until_reclaimed(active: &ActiveJob) -> tokio::sync::watch::Receiver<bool> {
        let mut reclaim = active.try_begin("batch").expect("slot free");
        let observed = reclaim.clone();
        let active = active.clone();
        tokio::spawn(async move {
            let _ = reclaim.wait_for(|reclaimed| *reclaimed).await;
            active.finish("batch");
        });
        observed
    }

    /// Hands out the job once, then starts its first input behind the caller's back.
    struct StartsInputAfterFirstRead {
        inner: MemoryRepository,
        raced: AtomicBool,
    }

    #[async_trait]
    impl StateRepository for StartsInputAfterFirstRead {
        async fn get(&self, id: &str) -> Result<Document, RepoError> {
            let doc = self.inner.get(id).await?;
            if !self.raced.swap(true, Ordering::SeqCst)
                && let Document::Job(job) = &doc
            {
                let mut started = job.clone();
                started.inputs[0].output_key = Some("batch/input-0/results.out".into());
                started.inputs[0].compute_start = Some(Utc::now());
                save_typed(&self.inner, started).await?;
            }
            Ok(doc)
        }

        async fn exists(&self, id: &str) -> Result<bool, RepoError> {
            self.inner.exists(id).await
        }

        async fn create(&self, doc: Document) -> Result<Document, RepoError> {
            self.inner.create(doc).await
        }

        async fn save(&self, doc: Document) -> Result<Document, RepoError> {
            self.inner.save(doc).await
        }

        async fn delete(&self, id: &str) -> Result<bool, RepoError> {
            self.inner.delete(id).await
        }

        async fn define_index(&self, index: &SegmentIndex) -> Result<(), RepoError> {
            self.inner.define_index(index).await
        }

        async fn drop_index(&self, index: &SegmentIndex) -> Result<bool, RepoError> {
            self.inner.drop_index(index).await
        }

        async fn query(
            &self,
            index: &SegmentIndex,
            view: SegmentView,
            include_docs: bool,
        ) -> Result<Vec<ViewRow>, RepoError> {
            self.inner.query(index, view, include_docs).await
        }

        async fn list_jobs(&self) -> Result<Vec<JobDocument>, RepoError> {
            self.inner.list_jobs().await
        }
    }

    #[tokio::test]
    async fn complete_job_is_left_alone() {
        let (handler, repo, _blobs, _scratch, active) =
            fixture(JobStatus::Complete, vec![WorkUnit::new("input-0", "batch/input-0/a.nw")]).await;
        let _slot = active.try_begin("batch").expect("slot free");
        let outcome = handler.handle(&notice("vm-7")).await.expect("handle");
        assert_eq!(outcome.message(), "batch COMPLETE and prepped for reclamation");
        assert!(!active.is_reclaimed());
        let job: JobDocument = load(repo.as_ref(), "batch").await.expect("job");
        assert_eq!(job.status(TRANSIENT_PHASE), Some(JobStatus::Complete));
    }

    #[tokio::test]
    async fn in_flight_input_is_flushed_and_marked() {
        let mut done = WorkUnit::new("input-0", "batch/input-0/a.nw");
        done.compute_start = Some(Utc::now());
        done.compute_end = Some(Utc::now());
        let (handler, repo, blobs, scratch, active) =
            fixture(JobStatus::Processing, vec![done, in_flight("input-1")]).await;
        let reclaim = hold_until_reclaimed(&active);

        let work_dir = scratch.path().join("batch/input-1");
        std::fs::create_dir_all(&work_dir).expect("work dir");
        std::fs::write(work_dir.join("input.dat"), b"in").expect("input");
        std::fs::write(work_dir.join("results.out"), b"half").expect("results");
        std::fs::write(work_dir.join("progress.log"), b"log").expect("log");

        let outcome = handler.handle(&notice("vm-7")).await.expect("handle");
        assert_eq!(outcome.message(), "batch INCOMPLETE and prepped for reclamation");
        assert!(*reclaim.borrow());
        assert!(active.current().is_none());

        assert_eq!(
            blobs.get("bucket", "batch/input-1/results.out").await.expect("partial"),
            Bytes::from_static(b"half")
        );
        assert!(blobs.exists("bucket", "batch/input-1/progress.log").await.expect("log"));
        assert!(!blobs.exists("bucket", "batch/input-1/input.dat").await.expect("input"));

        let job: JobDocument = load(repo.as_ref(), "batch").await.expect("job");
        assert_eq!(job.status(TRANSIENT_PHASE), Some(JobStatus::Reclaimed));
        let unit = &job.inputs[1];
        assert_eq!(unit.error.as_deref(), Some(RECLAIMED_ERROR));
        assert!(unit.compute_end.is_some());
        assert_eq!(unit.results, vec!["batch/input-1/progress.log".to_string()]);
        assert!(job.inputs[0].error.is_none());
    }

    #[tokio::test]
    async fn input_started_after_first_read_is_still_flushed() {
        let repo = Arc::new(StartsInputAfterFirstRead {
            inner: MemoryRepository::new(),
            raced: AtomicBool::new(false),
        });
        seed_job(
            &repo.inner,
            JobStatus::Processing,
            vec![WorkUnit::new("input-0", "batch/input-0/a.nw")],
        )
        .await;
        let blobs = Arc::new(MemoryBlobStore::new());
        let scratch = TempDir::new().expect("scratch");
        let active = ActiveJob::new();
        let handler = handler(repo.clone(), blobs.clone(), &scratch, &active);

        let work_dir = scratch.path().join("batch/input-0");
        std::fs::create_dir_all(&work_dir).expect("work dir");
        std::fs::write(work_dir.join("results.out"), b"early").expect("results");

        let outcome = handler.handle(&notice("vm-7")).await.expect("handle");
        assert!(matches!(outcome, ReclaimOutcome::Interrupted { in_flight: Some(0), .. }));
        assert_eq!(
            blobs.get("bucket", "batch/input-0/results.out").await.expect("partial"),
            Bytes::from_static(b"early")
        );

        let job: JobDocument = load(&repo.inner, "batch").await.expect("job");
        assert_eq!(job.status(TRANSIENT_PHASE), Some(JobStatus::Reclaimed));
        let unit = &job.inputs[0];
        assert!(unit.compute_start.is_some());
        assert!(unit.compute_end.is_some());
        assert_eq!(unit.error.as_deref(), Some(RECLAIMED_ERROR));
    }

    #[tokio::test]
    async fn failed_input_is_not_treated_as_in_flight() {
        let failed = WorkUnit {
            error: Some("command exited with 3".into()),
            ..in_flight("input-0")
        };
        let (handler, repo, _blobs, _scratch, _active) =
            fixture(JobStatus::Processing, vec![failed, in_flight("input-1")]).await;
        let outcome = handler.handle(&notice("vm-7")).await.expect("handle");
        assert!(matches!(outcome, ReclaimOutcome::Interrupted { in_flight: Some(1), .. }));
        let job: JobDocument = load(repo.as_ref(), "batch").await.expect("job");
        assert_eq!(job.inputs[0].error.as_deref(), Some("command exited with 3"));
        assert!(job.inputs[0].compute_end.is_none());
        assert_eq!(job.inputs[1].error.as_deref(), Some(RECLAIMED_ERROR));
    }

    #[tokio::test]
    async fn falls_back_to_instance_lookup() {
        let (handler, repo, _blobs, _scratch, _active) =
            fixture(JobStatus::Processing, vec![in_flight("input-0")]).await;
        let outcome = handler.handle(&notice("vm-7")).await.expect("handle");
        assert!(matches!(outcome, ReclaimOutcome::Interrupted { in_flight: Some(0), .. }));
        let job: JobDocument = load(repo.as_ref(), "batch").await.expect("job");
        assert_eq!(job.status(TRANSIENT_PHASE), Some(JobStatus::Reclaimed));

        let err = handler.handle(&notice("vm-unknown")).await.expect_err("unknown");
        assert!(matches!(err, PreemptionError::NoActiveJob { .. }));
    }
}
