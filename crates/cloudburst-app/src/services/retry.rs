//! Conditional save with re-fetch on revision conflicts.
//!
//! Every writer of a shared document goes through [`ConflictRetry`]. The first
//! attempt saves the caller's copy as-is; after a conflict the latest revision
//! is fetched, the caller's mutation is reapplied and the save is retried.
//! Only conflicts are retried, and only up to `max_attempts` in total.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use backon::{ConstantBuilder, Retryable};
use thiserror::Error;
use tokio::time::sleep;
use tracing::warn;

use crate::constants::CONFLICT_RETRY_ATTEMPTS;
use crate::services::records::{JobDocument, JobStatus};
use crate::services::store::{RepoError, StateRepository, Stored, load, save_typed};

/// A mutation declined to apply to the freshly fetched document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejected(pub String);

impl Rejected {
    pub fn new(reason: impl Into<String>) -> Self {
        Rejected(reason.into())
    }
}

#[derive(Debug, Error)]
pub enum SaveError {
    #[error("gave up saving `{id}` after {attempts} conflicting attempts")]
    Exhausted { id: String, attempts: usize },
    #[error("update of `{id}` rejected: {reason}")]
    Rejected { id: String, reason: String },
    #[error(transparent)]
    Repo(#[from] RepoError),
}

impl SaveError {
    fn is_conflict(&self) -> bool {
        matches!(self, SaveError::Repo(err) if err.is_conflict())
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, SaveError::Rejected { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictRetry {
    pub max_attempts: usize,
}

impl Default for ConflictRetry {
    fn default() -> Self {
        Self {
            max_attempts: CONFLICT_RETRY_ATTEMPTS,
        }
    }
}

impl ConflictRetry {
    pub fn new(max_attempts: usize) -> Self {
        debug_assert!(max_attempts > 0);
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    fn backoff(&self) -> ConstantBuilder {
        ConstantBuilder::default()
            .with_delay(Duration::ZERO)
            .with_max_times(self.max_attempts.saturating_sub(1))
    }

    /// Save `doc`, which already carries the mutation, re-fetching and
    /// reapplying `mutate` on every conflict.
    pub async fn save<D, F>(
        &self,
        repo: &dyn StateRepository,
        doc: D,
        mutate: F,
    ) -> Result<D, SaveError>
    where
        D: Stored,
        F: Fn(&mut D) -> Result<(), Rejected> + Send + Sync,
    {
        let id = doc.doc_id().to_string();
        self.run(repo, id, Some(doc), mutate).await
    }

    /// Fetch the latest `id`, apply `mutate`, save; retried on conflict.
    pub async fn update<D, F>(
        &self,
        repo: &dyn StateRepository,
        id: &str,
        mutate: F,
    ) -> Result<D, SaveError>
    where
        D: Stored,
        F: Fn(&mut D) -> Result<(), Rejected> + Send + Sync,
    {
        self.run(repo, id.to_string(), None, mutate).await
    }

    /// Optimistic transition: move `phase` of job `job_id` to `next` only if
    /// its current status is one of `expected`, otherwise `SaveError::Rejected`.
    pub async fn transition(
        &self,
        repo: &dyn StateRepository,
        job_id: &str,
        phase: &str,
        expected: &[JobStatus],
        next: JobStatus,
    ) -> Result<JobDocument, SaveError> {
        debug_assert!(expected.iter().all(|from| from.can_advance_to(next)));
        self.update(repo, job_id, |job: &mut JobDocument| {
            let state = job
                .phase_mut(phase)
                .ok_or_else(|| Rejected::new(format!("job has no `{phase}` phase")))?;
            if !expected.contains(&state.status) {
                return Err(Rejected::new(format!(
                    "expected {} but found {}",
                    expected
                        .iter()
                        .map(|status| status.as_str())
                        .collect::<Vec<_>>()
                        .join("|"),
                    state.status
                )));
            }
            let now = chrono::Utc::now();
            state.status = next;
            if state.started_at.is_none() {
                state.started_at = Some(now);
            }
            if next.is_terminal() {
                state.completed_at = Some(now);
            }
            job.touch();
            Ok(())
        })
        .await
    }

    async fn run<D, F>(
        &self,
        repo: &dyn StateRepository,
        id: String,
        seed: Option<D>,
        mutate: F,
    ) -> Result<D, SaveError>
    where
        D: Stored,
        F: Fn(&mut D) -> Result<(), Rejected> + Send + Sync,
    {
        let seed = Mutex::new(seed);
        let attempts = AtomicUsize::new(0);
        let seed = &seed;
        let attempts = &attempts;
        let mutate = &mutate;
        let id_ref = id.as_str();

        let attempt = || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            let staged = seed.lock().ok().and_then(|mut slot| slot.take());
            let doc = match staged {
                Some(doc) => doc,
                None => {
                    let mut fresh: D = load(repo, id_ref).await?;
                    mutate(&mut fresh).map_err(|Rejected(reason)| SaveError::Rejected {
                        id: id_ref.to_string(),
                        reason,
                    })?;
                    fresh
                }
            };
            save_typed(repo, doc).await.map_err(SaveError::from)
        };

        let outcome = attempt
            .retry(self.backoff())
            .sleep(sleep)
            .when(SaveError::is_conflict)
            .notify(|err: &SaveError, _delay: Duration| {
                warn!(
                    doc_id = id_ref,
                    attempt = attempts.load(Ordering::SeqCst),
                    error = %err,
                    "revision conflict; refetching"
                );
            })
            .await;

        match outcome {
            Err(err) if err.is_conflict() => Err(SaveError::Exhausted {
                id,
                attempts: attempts.load(Ordering::SeqCst),
            }),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::records::{Document, JobDocument};
    use crate::services::store::{
        MemoryRepository, SegmentIndex, SegmentView, ViewRow, create_typed,
    };
    use async_trait::async_trait;

    /// Repository whose saves always lose the race.
    struct AlwaysConflicting {
        inner: MemoryRepository,
        saves: AtomicUsize,
    }

    #[async_trait]
    impl StateRepository for AlwaysConflicting {
        async fn get(&self, id: &str) -> Result<Document, RepoError> {
            self.inner.get(id).await
        }
        async fn exists(&self, id: &str) -> Result<bool, RepoError> {
            self.inner.exists(id).await
        }
        async fn create(&self, doc: Document) -> Result<Document, RepoError> {
            self.inner.create(doc).await
        }
        async fn save(&self, doc: Document) -> Result<Document, RepoError> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            Err(RepoError::Conflict {
                id: doc.id().to_string(),
            })
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
    async fn gives_up_after_ten_attempts() {
        let repo = AlwaysConflicting {
            inner: MemoryRepository::new(),
            saves: AtomicUsize::new(0),
        };
        let job = create_typed(&repo, JobDocument::new("stuck", "bucket"))
            .await
            .expect("create");

        let err = ConflictRetry::default()
            .save(&repo, job, |doc: &mut JobDocument| {
                doc.error = Some("x".into());
                Ok(())
            })
            .await
            .expect_err("never succeeds");

        assert!(matches!(err, SaveError::Exhausted { attempts: 10, .. }));
        assert_eq!(repo.saves.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn reapplies_mutation_on_fresh_copy() {
        let repo = MemoryRepository::new();
        let stale = create_typed(&repo, JobDocument::new("shared", "bucket"))
            .await
            .expect("create");

        // Another writer moves the document on.
        let mut other = stale.clone();
        other.sw_version = Some("other".into());
        save_typed(&repo, other).await.expect("other writer");

        let mut mine = stale;
        mine.error = Some("mine".into());
        let saved = ConflictRetry::default()
            .save(&repo, mine, |doc: &mut JobDocument| {
                doc.error = Some("mine".into());
                Ok(())
            })
            .await
            .expect("retried save");

        assert_eq!(saved.error.as_deref(), Some("mine"));
        assert_eq!(saved.sw_version.as_deref(), Some("other"));
        assert!(saved.rev.as_deref().is_some_and(|rev| rev.starts_with("3-")));
    }

    #[tokio::test]
    async fn rejection_stops_without_saving() {
        let repo = MemoryRepository::new();
        let stale = create_typed(&repo, JobDocument::new("guarded", "bucket"))
            .await
            .expect("create");
        let mut other = stale.clone();
        other.error = Some("taken".into());
        save_typed(&repo, other).await.expect("other writer");

        let err = ConflictRetry::default()
            .save(&repo, stale, |doc: &mut JobDocument| {
                if doc.error.is_some() {
                    return Err(Rejected::new("already claimed"));
                }
                Ok(())
            })
            .await
            .expect_err("rejected");
        assert!(err.is_rejected());
    }

    #[tokio::test]
    async fn transition_requires_expected_state() {
        use crate::services::records::{PhaseState, RetentionFlag};

        let repo = MemoryRepository::new();
        let mut job = JobDocument::new("staged", "bucket");
        job.phases.insert(
            "fft".into(),
            PhaseState::pending(10, RetentionFlag::Discard),
        );
        create_typed(&repo, job).await.expect("create");

        let retry = ConflictRetry::default();
        let err = retry
            .transition(&repo, "staged", "fft", &[JobStatus::Segmented], JobStatus::Complete)
            .await
            .expect_err("still pending");
        assert!(err.is_rejected());

        let moved = retry
            .transition(&repo, "staged", "fft", &[JobStatus::Pending], JobStatus::Segmented)
            .await
            .expect("advance");
        assert_eq!(moved.status("fft"), Some(JobStatus::Segmented));
        let done = retry
            .transition(
                &repo,
                "staged",
                "fft",
                &[JobStatus::Segmented, JobStatus::Analyzing],
                JobStatus::Complete,
            )
            .await
            .expect("complete");
        assert!(done.phase("fft").and_then(|p| p.completed_at).is_some());
    }

    #[tokio::test]
    async fn update_fetches_first() {
        let repo = MemoryRepository::new();
        create_typed(&repo, JobDocument::new("fresh", "bucket"))
            .await
            .expect("create");
        let saved: JobDocument = ConflictRetry::new(3)
            .update(&repo, "fresh", |doc: &mut JobDocument| {
                doc.sw_version = Some("v2".into());
                Ok(())
            })
            .await
            .expect("update");
        assert_eq!(saved.sw_version.as_deref(), Some("v2"));

        let missing = ConflictRetry::new(3)
            .update::<JobDocument, _>(&repo, "absent", |_| Ok(()))
            .await
            .expect_err("missing");
        assert!(matches!(missing, SaveError::Repo(RepoError::NotFound(_))));
    }
}
