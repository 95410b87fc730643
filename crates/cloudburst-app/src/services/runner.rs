//! Executes a transient job's inputs on the instance it was launched on.

use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use bon::Builder;
use chrono::Utc;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::InstanceConfig;
use crate::constants::{DEFAULT_DURATION_HOURS, MISSING_FIELDS_ERROR, TRANSIENT_PHASE};
use crate::services::blob_store::BlobStore;
use crate::services::records::{JobDocument, JobStatus, WorkUnit};
use crate::services::retry::{ConflictRetry, Rejected, SaveError};
use crate::services::store::{RepoError, StateRepository, load};

/// The job this instance is currently running, plus the reclaim signal the
/// preemption handler raises to stop it.
#[derive(Debug, Clone)]
pub struct ActiveJob {
    inner: Arc<ActiveInner>,
}

#[derive(Debug)]
struct ActiveInner {
    current: watch::Sender<Option<String>>,
    reclaim: watch::Sender<bool>,
}

impl Default for ActiveJob {
    fn default() -> Self {
        let (current, _) = watch::channel(None);
        let (reclaim, _) = watch::channel(false);
        Self {
            inner: Arc::new(ActiveInner { current, reclaim }),
        }
    }
}

impl ActiveJob {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot for `job_id` and return its reclaim receiver, or `None`
    /// when another job already holds it.
    pub fn try_begin(&self, job_id: &str) -> Option<watch::Receiver<bool>> {
        let claimed = self.inner.current.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(job_id.to_string());
            true
        });
        if !claimed {
            return None;
        }
        self.inner.reclaim.send_replace(false);
        Some(self.inner.reclaim.subscribe())
    }

    pub fn current(&self) -> Option<String> {
        self.inner.current.borrow().clone()
    }

    /// Clear the slot if it still holds `job_id`.
    pub fn finish(&self, job_id: &str) {
        self.inner.current.send_if_modified(|slot| {
            if slot.as_deref() != Some(job_id) {
                return false;
            }
            *slot = None;
            true
        });
    }

    /// Wait until `job_id` no longer holds the slot. Returns `false` on timeout.
    pub async fn wait_idle(&self, job_id: &str, timeout: Duration) -> bool {
        let mut slot = self.inner.current.subscribe();
        tokio::time::timeout(
            timeout,
            slot.wait_for(|current| current.as_deref() != Some(job_id)),
        )
        .await
        .is_ok()
    }

    pub fn signal_reclaim(&self) {
        self.inner.reclaim.send_replace(true);
    }

    pub fn is_reclaimed(&self) -> bool {
        *self.inner.reclaim.borrow()
    }
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("job `{job_id}`: {source}")]
    Repo {
        job_id: String,
        #[source]
        source: RepoError,
    },
    #[error("job `{job_id}` is invalid: {reason}")]
    Invalid { job_id: String, reason: String },
    #[error("cannot run `{job_id}`: instance busy with `{running}`")]
    Busy { job_id: String, running: String },
    #[error("job `{job_id}`: failed to save progress: {source}")]
    Save {
        job_id: String,
        #[source]
        source: SaveError,
    },
    #[error("failed to prepare {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Complete,
    Reclaimed,
    /// The job was already terminal when the run started.
    AlreadyFinished(JobStatus),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub job_id: String,
    pub outcome: RunOutcome,
    pub succeeded: usize,
    pub failed: usize,
}

/// Scratch layout for one input: `{scratch}/{dirname(input_key)}/`.
#[derive(Debug, Clone)]
pub struct WorkDir {
    pub dir: PathBuf,
    /// Blob key prefix shared by the input and its results.
    pub prefix: String,
    pub input_path: PathBuf,
    pub results_path: PathBuf,
}

impl WorkDir {
    pub fn for_input(scratch: &Path, input_key: &str, config: &InstanceConfig) -> Self {
        let prefix = input_key
            .rsplit_once('/')
            .map(|(dir, _)| dir.to_string())
            .unwrap_or_default();
        let dir = if prefix.is_empty() {
            scratch.to_path_buf()
        } else {
            scratch.join(&prefix)
        };
        Self {
            input_path: dir.join(&config.input_file_name),
            results_path: dir.join(&config.results_file_name),
            dir,
            prefix,
        }
    }

    pub fn output_key(&self, config: &InstanceConfig) -> String {
        self.key_for(&config.results_file_name)
    }

    fn key_for(&self, file_name: &str) -> String {
        if self.prefix.is_empty() {
            file_name.to_string()
        } else {
            format!("{}/{file_name}", self.prefix)
        }
    }

    /// Upload whatever the command left behind and clear the directory.
    ///
    /// The results file goes to `output_key`; every other file except the
    /// input goes to `{prefix}/{name}` and is returned as a result key.
    pub async fn flush(
        &self,
        blobs: &dyn BlobStore,
        bucket: &str,
        output_key: &str,
        overwrite: bool,
    ) -> Flushed {
        let mut flushed = Flushed::default();
        remove_quietly(&self.input_path).await;

        if tokio::fs::try_exists(&self.results_path).await.unwrap_or(false) {
            match blobs
                .upload_file(bucket, output_key, &self.results_path, overwrite)
                .await
            {
                Ok(_) => remove_quietly(&self.results_path).await,
                Err(err) => flushed.errors.push(format!("{output_key}: {err}")),
            }
        }

        let mut extras = match list_files(&self.dir).await {
            Ok(files) => files,
            Err(err) => {
                flushed.errors.push(format!("{}: {err}", self.dir.display()));
                return flushed;
            }
        };
        extras.sort();
        for path in extras {
            if path == self.input_path || path == self.results_path {
                continue;
            }
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            let key = self.key_for(&name);
            match blobs.upload_file(bucket, &key, &path, overwrite).await {
                Ok(_) => {
                    remove_quietly(&path).await;
                    flushed.results.push(key);
                }
                Err(err) => flushed.errors.push(format!("{key}: {err}")),
            }
        }
        flushed
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Flushed {
    pub results: Vec<String>,
    pub errors: Vec<String>,
}

async fn list_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(files),
        Err(err) => return Err(err),
    };
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.path());
        }
    }
    Ok(files)
}

async fn remove_quietly(path: &Path) {
    if let Err(err) = tokio::fs::remove_file(path).await
        && err.kind() != std::io::ErrorKind::NotFound
    {
        debug!(path = %path.display(), error = %err, "failed to remove scratch file");
    }
}

enum Started {
    Ran((usize, usize, bool)),
    AlreadyFinished(JobStatus),
}

enum Exit {
    Finished(ExitStatus),
    Failed(String),
    TimedOut,
    Reclaimed,
}

#[derive(Builder)]
pub struct Runner {
    repo: Arc<dyn StateRepository>,
    blobs: Arc<dyn BlobStore>,
    config: InstanceConfig,
    scratch_dir: PathBuf,
    active: ActiveJob,
    #[builder(default)]
    retry: ConflictRetry,
}

impl Runner {
    /// Claim this instance for `job_id` and run it.
    pub async fn run(&self, job_id: &str) -> Result<RunReport, RunnerError> {
        let Some(reclaim) = self.active.try_begin(job_id) else {
            return Err(RunnerError::Busy {
                job_id: job_id.to_string(),
                running: self.active.current().unwrap_or_default(),
            });
        };
        self.run_claimed(job_id, reclaim).await
    }

    /// Run a job whose slot was already claimed with [`ActiveJob::try_begin`].
    /// The slot is released before returning.
    pub async fn run_claimed(
        &self,
        job_id: &str,
        reclaim: watch::Receiver<bool>,
    ) -> Result<RunReport, RunnerError> {
        let result = self.run_inputs_of(job_id, reclaim).await;
        self.active.finish(job_id);
        let (succeeded, failed, reclaimed) = match result {
            Ok(Started::Ran(counts)) => counts,
            Ok(Started::AlreadyFinished(status)) => {
                info!(job_id, %status, "job already finished");
                return Ok(RunReport {
                    job_id: job_id.to_string(),
                    outcome: RunOutcome::AlreadyFinished(status),
                    succeeded: 0,
                    failed: 0,
                });
            }
            // Preemption won the race for the job document.
            Err(RunnerError::Save { source, .. })
                if source.is_rejected() && self.active.is_reclaimed() =>
            {
                (0, 0, true)
            }
            Err(err) => return Err(err),
        };

        let outcome = if reclaimed {
            RunOutcome::Reclaimed
        } else {
            self.complete(job_id).await?
        };
        info!(job_id, ?outcome, succeeded, failed, "transient run finished");
        Ok(RunReport {
            job_id: job_id.to_string(),
            outcome,
            succeeded,
            failed,
        })
    }

    async fn run_inputs_of(
        &self,
        job_id: &str,
        reclaim: watch::Receiver<bool>,
    ) -> Result<Started, RunnerError> {
        let job: JobDocument = load(self.repo.as_ref(), job_id)
            .await
            .map_err(|source| RunnerError::Repo {
                job_id: job_id.to_string(),
                source,
            })?;
        let Some(status) = job.status(TRANSIENT_PHASE) else {
            return Err(self.record_invalid(job_id, "job has no transient phase").await);
        };
        if status.is_terminal() {
            return Ok(Started::AlreadyFinished(status));
        }
        let Some(bucket) = job.bucket.clone() else {
            return Err(self.record_invalid(job_id, "job has no bucket").await);
        };
        if self.config.command.is_empty() {
            return Err(self.record_invalid(job_id, "instance.command is empty").await);
        }
        let hours = job
            .instance
            .as_ref()
            .and_then(|spec| spec.duration_hours)
            .unwrap_or(DEFAULT_DURATION_HOURS);
        let timeout = Duration::from_secs(u64::from(hours) * 3600);
        self.run_inputs(job_id, &bucket, job.inputs.len(), timeout, reclaim)
            .await
            .map(Started::Ran)
    }

    /// Write `reason` onto the job and build the matching error.
    async fn record_invalid(&self, job_id: &str, reason: &str) -> RunnerError {
        let saved = self
            .retry
            .update(self.repo.as_ref(), job_id, |job: &mut JobDocument| {
                job.error = Some(reason.to_string());
                job.touch();
                Ok(())
            })
            .await
            .map(|_: JobDocument| ());
        if let Err(err) = saved {
            warn!(job_id, error = %err, "failed to record job error");
        }
        RunnerError::Invalid {
            job_id: job_id.to_string(),
            reason: reason.to_string(),
        }
    }

    async fn run_inputs(
        &self,
        job_id: &str,
        bucket: &str,
        count: usize,
        timeout: Duration,
        mut reclaim: watch::Receiver<bool>,
    ) -> Result<(usize, usize, bool), RunnerError> {
        let mut succeeded = 0;
        let mut failed = 0;
        for index in 0..count {
            if *reclaim.borrow() {
                return Ok((succeeded, failed, true));
            }
            let job: JobDocument = load(self.repo.as_ref(), job_id)
                .await
                .map_err(|source| RunnerError::Repo {
                    job_id: job_id.to_string(),
                    source,
                })?;
            if job.status(TRANSIENT_PHASE) == Some(JobStatus::Reclaimed) {
                return Ok((succeeded, failed, true));
            }
            let Some(unit) = job.inputs.get(index).cloned() else {
                break;
            };
            if unit.compute_end.is_some() || unit.error.is_some() {
                debug!(job_id, index, "input already handled");
                continue;
            }
            let Some(input_key) = unit.input_key.clone().filter(|_| unit.is_valid()) else {
                self.save_unit(job_id, index, |unit| {
                    unit.error = Some(MISSING_FIELDS_ERROR.to_string());
                })
                .await?;
                failed += 1;
                continue;
            };

            match self
                .run_one(job_id, bucket, index, &input_key, timeout, &mut reclaim)
                .await?
            {
                Some(true) => succeeded += 1,
                Some(false) => failed += 1,
                None => return Ok((succeeded, failed, true)),
            }
        }
        Ok((succeeded, failed, false))
    }

    /// `Some(success)` once the input is recorded, `None` if reclaimed.
    async fn run_one(
        &self,
        job_id: &str,
        bucket: &str,
        index: usize,
        input_key: &str,
        timeout: Duration,
        reclaim: &mut watch::Receiver<bool>,
    ) -> Result<Option<bool>, RunnerError> {
        let work = WorkDir::for_input(&self.scratch_dir, input_key, &self.config);
        tokio::fs::create_dir_all(&work.dir)
            .await
            .map_err(|source| RunnerError::Io {
                path: work.dir.clone(),
                source,
            })?;

        if let Err(err) = self
            .blobs
            .download_file(bucket, input_key, &work.input_path)
            .await
        {
            warn!(job_id, input_key, error = %err, "input download failed");
            let reason = format!("input `{input_key}` unavailable: {err}");
            self.save_unit(job_id, index, move |unit| unit.error = Some(reason.clone()))
                .await?;
            return Ok(Some(false));
        }

        let output_key = work.output_key(&self.config);
        let started = Utc::now();
        let stamped_key = output_key.clone();
        self.save_unit(job_id, index, move |unit| {
            unit.output_key = Some(stamped_key.clone());
            unit.compute_start = Some(started);
        })
        .await?;

        let exit = self.execute(&work.dir, timeout, reclaim).await;
        if matches!(exit, Exit::Reclaimed) {
            // The preemption handler flushes and records this input.
            info!(job_id, input_key, "reclaimed during execution");
            return Ok(None);
        }

        let failure = match exit {
            Exit::Finished(status) if status.success() => None,
            Exit::Finished(status) => Some(format!("command exited with {status}")),
            Exit::Failed(message) => Some(format!("command failed: {message}")),
            Exit::TimedOut => Some(format!("command exceeded {}s", timeout.as_secs())),
            Exit::Reclaimed => None,
        };
        let finished = Utc::now();
        let flushed = work
            .flush(self.blobs.as_ref(), bucket, &output_key, false)
            .await;
        let mut error = failure.clone();
        if !flushed.errors.is_empty() {
            let uploads = format!("result upload failed: {}", flushed.errors.join("; "));
            error = Some(match error {
                Some(existing) => format!("{existing}; {uploads}"),
                None => uploads,
            });
        }
        let results = flushed.results;
        let recorded_error = error.clone();
        self.save_unit(job_id, index, move |unit| {
            if failure.is_none() {
                unit.compute_end = Some(finished);
            }
            unit.results.extend(results.iter().cloned());
            unit.error = recorded_error.clone();
        })
        .await?;

        match error {
            None => {
                info!(job_id, input_key, "input complete");
                Ok(Some(true))
            }
            Some(reason) => {
                warn!(job_id, input_key, error = %reason, "input failed");
                Ok(Some(false))
            }
        }
    }

    async fn execute(
        &self,
        dir: &Path,
        timeout: Duration,
        reclaim: &mut watch::Receiver<bool>,
    ) -> Exit {
        let (program, args) = match self.config.command.split_first() {
            Some(split) => split,
            None => return Exit::Failed("empty command".to_string()),
        };
        let mut child = match Command::new(program)
            .args(args)
            .current_dir(dir)
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(err) => return Exit::Failed(format!("{program}: {err}")),
        };

        let exit = tokio::select! {
            waited = tokio::time::timeout(timeout, child.wait()) => match waited {
                Ok(Ok(status)) => Exit::Finished(status),
                Ok(Err(err)) => Exit::Failed(err.to_string()),
                Err(_) => Exit::TimedOut,
            },
            changed = reclaim.wait_for(|reclaimed| *reclaimed) => match changed {
                Ok(_) => Exit::Reclaimed,
                Err(_) => Exit::Failed("reclaim channel closed".to_string()),
            },
        };
        if !matches!(exit, Exit::Finished(_))
            && let Err(err) = child.kill().await
        {
            debug!(error = %err, "failed to kill command");
        }
        exit
    }

    async fn save_unit<F>(&self, job_id: &str, index: usize, apply: F) -> Result<(), RunnerError>
    where
        F: Fn(&mut WorkUnit) + Send + Sync,
    {
        self.retry
            .update(self.repo.as_ref(), job_id, |job: &mut JobDocument| {
                if job.status(TRANSIENT_PHASE) == Some(JobStatus::Reclaimed) {
                    return Err(Rejected::new("job reclaimed"));
                }
                let unit = job
                    .inputs
                    .get_mut(index)
                    .ok_or_else(|| Rejected::new(format!("input {index} removed")))?;
                apply(unit);
                job.touch();
                Ok(())
            })
            .await
            .map(|_: JobDocument| ())
            .map_err(|source| RunnerError::Save {
                job_id: job_id.to_string(),
                source,
            })
    }

    async fn complete(&self, job_id: &str) -> Result<RunOutcome, RunnerError> {
        match self
            .retry
            .transition(
                self.repo.as_ref(),
                job_id,
                TRANSIENT_PHASE,
                &[JobStatus::Pending, JobStatus::Processing],
                JobStatus::Complete,
            )
            .await
        {
            Ok(_) => Ok(RunOutcome::Complete),
            Err(err) if err.is_rejected() => {
                let job: JobDocument = load(self.repo.as_ref(), job_id)
                    .await
                    .map_err(|source| RunnerError::Repo {
                        job_id: job_id.to_string(),
                        source,
                    })?;
                match job.status(TRANSIENT_PHASE) {
                    Some(JobStatus::Reclaimed) => Ok(RunOutcome::Reclaimed),
                    Some(status) if status.is_terminal() => Ok(RunOutcome::AlreadyFinished(status)),
                    _ => Err(RunnerError::Save {
                        job_id: job_id.to_string(),
                        source: err,
                    }),
                }
            }
            Err(source) => Err(RunnerError::Save {
                job_id: job_id.to_string(),
                source,
            }),
        }
    }
}
