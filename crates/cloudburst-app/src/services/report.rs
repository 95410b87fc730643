//! Operator tools: submitting split jobs, status lines, collecting finished
//! outputs and cleaning up abandoned transient jobs.

use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::constants::TRANSIENT_PHASE;
use crate::services::blob_store::{BlobError, BlobStore};
use crate::services::records::{
    JobDocument, JobStatus, PhaseState, RawArtifact, RetentionFlag,
};
use crate::services::store::{RepoError, StateRepository, create_typed};
use crate::services::transient::ComputeProvider;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error("blob `{key}`: {source}")]
    Blob {
        key: String,
        #[source]
        source: BlobError,
    },
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode job `{job_id}`: {source}")]
    Json {
        job_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("job `{0}` already exists")]
    Duplicate(String),
    #[error("invalid submission: {0}")]
    Invalid(String),
}

/// One row of `status` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusLine {
    pub job_id: String,
    pub phase: String,
    pub status: JobStatus,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl std::fmt::Display for StatusLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}={} | {}", self.job_id, self.phase, self.status, self.detail)?;
        if let Some(error) = &self.error {
            write!(f, " | error: {error}")?;
        }
        Ok(())
    }
}

/// `1h02m03s` style rendering; negative spans clamp to zero.
pub fn format_elapsed(span: TimeDelta) -> String {
    let secs = span.num_seconds().max(0);
    let (hours, rest) = (secs / 3600, secs % 3600);
    let (mins, secs) = (rest / 60, rest % 60);
    if hours > 0 {
        format!("{hours}h{mins:02}m{secs:02}s")
    } else if mins > 0 {
        format!("{mins}m{secs:02}s")
    } else {
        format!("{secs}s")
    }
}

/// One line per job phase, sorted by job id.
pub fn status_lines(jobs: &[JobDocument], now: DateTime<Utc>) -> Vec<StatusLine> {
    let mut lines: Vec<StatusLine> = jobs
        .iter()
        .flat_map(|job| {
            job.phases.iter().map(move |(phase, state)| StatusLine {
                job_id: job.id.clone(),
                phase: phase.clone(),
                status: state.status,
                detail: describe(job, phase, state, now),
                error: job.error.clone(),
            })
        })
        .collect();
    lines.sort_by(|a, b| (&a.job_id, &a.phase).cmp(&(&b.job_id, &b.phase)));
    lines
}

fn describe(job: &JobDocument, phase: &str, state: &PhaseState, now: DateTime<Utc>) -> String {
    let started = state.started_at.or_else(|| {
        job.inputs
            .iter()
            .filter_map(|unit| unit.compute_start)
            .min()
    });
    match state.status {
        JobStatus::Complete => match (started, state.completed_at) {
            (Some(start), Some(end)) => format!("ran for {}", format_elapsed(end - start)),
            (_, Some(end)) => format!("finished {}", end.format("%Y-%m-%d %H:%M")),
            _ => "finished".to_string(),
        },
        JobStatus::Reclaimed => match state.completed_at {
            Some(at) => format!("reclaimed at {}", at.format("%Y-%m-%d %H:%M")),
            None => "reclaimed".to_string(),
        },
        _ if phase == TRANSIENT_PHASE && started.is_none() => "waiting for instance".to_string(),
        _ => match started {
            Some(start) => format!(
                "since {} ({})",
                start.format("%Y-%m-%d %H:%M"),
                format_elapsed(now - start)
            ),
            None => format!("submitted {} ago", format_elapsed(now - job.created_at)),
        },
    }
}

/// Which debug artifacts a split job keeps after reassembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugRetention {
    Raw,
    Segments,
    All,
}

#[derive(Debug, Clone)]
pub struct SplitSubmission {
    pub file: PathBuf,
    pub bucket: String,
    pub phase: String,
    pub segment_size: u64,
    /// Appended to the file stem as `{stem}.{suffix}`.
    pub suffix: Option<String>,
    pub keep_input: RetentionFlag,
    pub debug: Vec<DebugRetention>,
}

impl SplitSubmission {
    pub fn job_id(&self) -> Result<String, ReportError> {
        let stem = self
            .file
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .filter(|stem| !stem.is_empty())
            .ok_or_else(|| ReportError::Invalid(format!("{} has no file name", self.file.display())))?;
        Ok(match self.suffix.as_deref().filter(|s| !s.is_empty()) {
            Some(suffix) => format!("{stem}.{suffix}"),
            None => stem,
        })
    }

    fn retains(&self, kind: DebugRetention) -> RetentionFlag {
        RetentionFlag::from_bool(
            self.debug
                .iter()
                .any(|flag| *flag == kind || *flag == DebugRetention::All),
        )
    }
}

/// Upload the raw file to `{stem}/{file name}` and create the pending job.
pub async fn submit_split(
    repo: &dyn StateRepository,
    blobs: &dyn BlobStore,
    submission: &SplitSubmission,
) -> Result<JobDocument, ReportError> {
    if submission.segment_size == 0 {
        return Err(ReportError::Invalid("segment size must be positive".to_string()));
    }
    let job_id = submission.job_id()?;
    if repo.exists(&job_id).await? {
        return Err(ReportError::Duplicate(job_id));
    }

    let file_name = submission
        .file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = submission
        .file
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let key = format!("{stem}/{file_name}");
    blobs
        .upload_file(&submission.bucket, &key, &submission.file, false)
        .await
        .map_err(|source| ReportError::Blob {
            key: key.clone(),
            source,
        })?;

    let raw = RawArtifact {
        file_name,
        key,
        size_bytes: None,
        retain_input: submission.keep_input,
        retain_debug: submission.retains(DebugRetention::Raw),
    };
    let state = PhaseState::pending(
        submission.segment_size,
        submission.retains(DebugRetention::Segments),
    );
    let job = JobDocument::split(
        job_id,
        submission.bucket.clone(),
        raw,
        submission.phase.clone(),
        state,
    );
    let created = create_typed(repo, job).await?;
    info!(job_id = %created.id, "split job submitted");
    Ok(created)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectReport {
    /// Jobs whose documents and outputs were written locally.
    pub collected: Vec<String>,
    pub files: Vec<PathBuf>,
    /// `job:unit` pairs of transient inputs that never finished.
    pub unfinished_inputs: Vec<String>,
    pub errors: Vec<String>,
}

/// Download every complete job into `out_dir`: `{id}.json` plus its outputs
/// under their blob keys. With `delete`, downloaded blobs and the job
/// document are removed afterwards.
pub async fn collect(
    repo: &dyn StateRepository,
    blobs: &dyn BlobStore,
    out_dir: &Path,
    delete: bool,
) -> Result<CollectReport, ReportError> {
    tokio::fs::create_dir_all(out_dir)
        .await
        .map_err(|source| ReportError::Io {
            path: out_dir.to_path_buf(),
            source,
        })?;

    let mut jobs = repo.list_jobs().await?;
    jobs.sort_by(|a, b| a.id.cmp(&b.id));
    let mut report = CollectReport::default();
    for job in jobs {
        let complete = !job.phases.is_empty()
            && job.phases.values().all(|state| state.status == JobStatus::Complete);
        if !complete {
            continue;
        }
        let Some(bucket) = job.bucket.clone() else {
            report.errors.push(format!("{}: job has no bucket", job.id));
            continue;
        };

        let json_path = out_dir.join(format!("{}.json", job.id));
        let body = serde_json::to_vec_pretty(&job).map_err(|source| ReportError::Json {
            job_id: job.id.clone(),
            source,
        })?;
        tokio::fs::write(&json_path, body)
            .await
            .map_err(|source| ReportError::Io {
                path: json_path.clone(),
                source,
            })?;
        report.files.push(json_path);

        let mut failed = false;
        for key in output_keys(&job) {
            let target = out_dir.join(&key);
            match blobs.download_file(&bucket, &key, &target).await {
                Ok(_) => {
                    report.files.push(target);
                    if delete && let Err(err) = blobs.delete(&bucket, &key).await {
                        warn!(job_id = %job.id, key = %key, error = %err, "failed to delete collected blob");
                    }
                }
                Err(err) if err.is_not_found() => {
                    debug!(job_id = %job.id, key = %key, "output not present; skipped");
                }
                Err(err) => {
                    failed = true;
                    report.errors.push(format!("{}: {key}: {err}", job.id));
                }
            }
        }
        for unit in &job.inputs {
            if unit.compute_end.is_none() {
                let unit_id = unit.id.as_deref().unwrap_or("?");
                report.unfinished_inputs.push(format!("{}:{unit_id}", job.id));
            }
        }

        if delete && !failed {
            repo.delete(&job.id).await?;
        }
        info!(job_id = %job.id, "job collected");
        report.collected.push(job.id);
    }
    Ok(report)
}

/// Every blob a finished job produced: merged outputs for split jobs, and
/// inputs, outputs and result files for transient jobs.
fn output_keys(job: &JobDocument) -> Vec<String> {
    let mut keys: Vec<String> = job
        .phases
        .iter()
        .filter(|(phase, _)| phase.as_str() != TRANSIENT_PHASE)
        .filter_map(|(_, state)| state.output_key.clone())
        .collect();
    for unit in &job.inputs {
        keys.extend(unit.input_key.iter().cloned());
        keys.extend(unit.output_key.iter().cloned());
        keys.extend(unit.results.iter().cloned());
    }
    keys
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub cancelled_instances: Vec<String>,
    pub deleted_jobs: Vec<String>,
    pub deleted_blobs: usize,
    pub errors: Vec<String>,
}

/// Tear down transient jobs left `pending` or `reclaimed`: cancel their
/// instance, delete their blobs and their document. `dry_run` only reports.
pub async fn cleanup(
    repo: &dyn StateRepository,
    blobs: &dyn BlobStore,
    provider: &dyn ComputeProvider,
    dry_run: bool,
) -> Result<CleanupReport, ReportError> {
    let mut jobs = repo.list_jobs().await?;
    jobs.sort_by(|a, b| a.id.cmp(&b.id));
    let mut report = CleanupReport::default();

    for job in jobs {
        let Some(status) = job.status(TRANSIENT_PHASE) else {
            continue;
        };
        if !matches!(status, JobStatus::Pending | JobStatus::Reclaimed) {
            continue;
        }
        let instance = job
            .instance
            .as_ref()
            .and_then(|spec| spec.compute_target.clone());
        let keys = output_keys(&job);
        if dry_run {
            info!(job_id = %job.id, %status, instance = ?instance, blobs = keys.len(), "would clean up job");
            report.cancelled_instances.extend(instance);
            report.deleted_blobs += keys.len();
            report.deleted_jobs.push(job.id);
            continue;
        }

        if let Some(instance_id) = instance {
            match provider.cancel_instance(&instance_id).await {
                Ok(()) => report.cancelled_instances.push(instance_id),
                Err(err) => report.errors.push(format!("{}: cancel {instance_id}: {err}", job.id)),
            }
        }
        if let Some(bucket) = job.bucket.as_deref() {
            for key in &keys {
                match blobs.delete(bucket, key).await {
                    Ok(true) => report.deleted_blobs += 1,
                    Ok(false) => {}
                    Err(err) => report.errors.push(format!("{}: {key}: {err}", job.id)),
                }
            }
        }
        repo.delete(&job.id).await?;
        info!(job_id = %job.id, %status, "job cleaned up");
        report.deleted_jobs.push(job.id);
    }
    Ok(report)
}
