//! Lifecycle of jobs executed on preemptible compute instances.
//!
//! `pending -> processing -> complete | reclaimed`. [`Lifecycle::launch`]
//! provisions an instance, registers the reclaim webhook and submits the job;
//! [`Lifecycle::destroy`] cancels the instance once the job is complete.
//! Provisioning is never retried here: a failed launch leaves the error on the
//! job document for an operator to act on.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use bon::Builder;
use chrono::Utc;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::InstanceConfig;
use crate::constants::{
    CPU_TIERS, DEFAULT_CPUS, DURATION_TIERS, MISSING_FIELDS_ERROR, TRANSIENT_PHASE,
};
use crate::services::barrier::Waiter;
use crate::services::blob_store::BlobStore;
use crate::services::records::{
    InstanceProfile, InstanceSpec, JobDocument, JobStatus, PhaseState, RetentionFlag, WorkUnit,
};
use crate::services::retry::{ConflictRetry, Rejected, SaveError};
use crate::services::store::{RepoError, StateRepository, create_typed, load};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{stage}: request failed: {message}")]
    Request { stage: &'static str, message: String },
    #[error("{stage}: unexpected HTTP status {status}: {body}")]
    Status {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[error("{stage}: invalid response: {message}")]
    Decode { stage: &'static str, message: String },
    #[error("instance `{id}` failed to provision: {message}")]
    Failed { id: String, message: String },
    #[error("instance `{id}` not ready after {polls} polls")]
    Timeout { id: String, polls: u32 },
    #[error("wait for instance `{id}` cancelled")]
    Cancelled { id: String },
}

impl ProviderError {
    fn request(stage: &'static str, err: reqwest::Error) -> Self {
        ProviderError::Request {
            stage,
            message: err.to_string(),
        }
    }

    /// Connection failures, 5xx and 429 are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Request { .. } => true,
            ProviderError::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// What the provider is asked to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceRequest {
    pub hostname: String,
    pub cpus: u32,
    pub flavor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datacenter: Option<String>,
    pub transient: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceState {
    Provisioning,
    Ready { address: String },
    Failed { message: String },
}

/// Compute provider seam: create, poll, register webhook, cancel.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Returns the provider's instance id.
    async fn create_instance(&self, request: &InstanceRequest) -> Result<String, ProviderError>;

    async fn instance_status(&self, id: &str) -> Result<InstanceState, ProviderError>;

    async fn register_webhook(
        &self,
        id: &str,
        uri: &str,
        secret: Option<&str>,
    ) -> Result<(), ProviderError>;

    async fn cancel_instance(&self, id: &str) -> Result<(), ProviderError>;
}

/// Request channel to the agent running on a provisioned instance.
#[async_trait]
pub trait InstanceChannel: Send + Sync {
    /// Hands `job_id` to the agent at `address:port`; returns its reply.
    async fn submit(&self, address: &str, port: u16, job_id: &str) -> Result<String, ProviderError>;
}

fn http_client() -> Result<Client, ProviderError> {
    Client::builder()
        .timeout(Duration::from_secs(30))
        .user_agent(concat!("cloudburst/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|err| ProviderError::request("build_client", err))
}

async fn decode<T: DeserializeOwned>(
    stage: &'static str,
    response: Response,
) -> Result<T, ProviderError> {
    let response = expect_success(stage, response).await?;
    response
        .json::<T>()
        .await
        .map_err(|err| ProviderError::Decode {
            stage,
            message: err.to_string(),
        })
}

async fn expect_success(stage: &'static str, response: Response) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ProviderError::Status {
        stage,
        status: status.as_u16(),
        body,
    })
}

#[derive(Deserialize)]
struct CreatedInstance {
    id: String,
}

#[derive(Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Serialize)]
struct WebhookRequest<'a> {
    uri: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    secret: Option<&'a str>,
}

/// JSON-over-HTTP provider API rooted at `instance.api_url`.
#[derive(Debug, Clone)]
pub struct HttpComputeProvider {
    base_url: String,
    token: Option<String>,
    http: Client,
    backoff: ExponentialBuilder,
}

impl HttpComputeProvider {
    pub fn new(config: &InstanceConfig) -> Result<Self, ProviderError> {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(250))
            .with_max_delay(Duration::from_secs(5))
            .with_max_times(6)
            .with_jitter();
        Ok(Self {
            base_url: config.api_url.trim_end_matches('/').to_string(),
            token: config.api_token.clone(),
            http: http_client()?,
            backoff,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl ComputeProvider for HttpComputeProvider {
    async fn create_instance(&self, request: &InstanceRequest) -> Result<String, ProviderError> {
        let stage = "create_instance";
        let response = self
            .authorize(self.http.post(self.url("instances")))
            .json(request)
            .send()
            .await
            .map_err(|err| ProviderError::request(stage, err))?;
        let created: CreatedInstance = decode(stage, response).await?;
        Ok(created.id)
    }

    async fn instance_status(&self, id: &str) -> Result<InstanceState, ProviderError> {
        let stage = "instance_status";
        let url = self.url(&format!("instances/{id}"));
        let url = url.as_str();
        let attempt = || async move {
            let response = self
                .authorize(self.http.get(url))
                .send()
                .await
                .map_err(|err| ProviderError::request(stage, err))?;
            decode::<StatusResponse>(stage, response).await
        };
        let body = attempt
            .retry(self.backoff)
            .sleep(sleep)
            .when(ProviderError::is_transient)
            .notify(|err: &ProviderError, delay: Duration| {
                warn!(
                    instance_id = id,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "retrying instance status request"
                );
            })
            .await?;

        Ok(match body.status.as_str() {
            "ready" | "running" | "complete" => match body.address {
                Some(address) => InstanceState::Ready { address },
                None => InstanceState::Provisioning,
            },
            "failed" | "error" => InstanceState::Failed {
                message: body.message.unwrap_or_else(|| body.status.clone()),
            },
            _ => InstanceState::Provisioning,
        })
    }

    async fn register_webhook(
        &self,
        id: &str,
        uri: &str,
        secret: Option<&str>,
    ) -> Result<(), ProviderError> {
        let stage = "register_webhook";
        let response = self
            .authorize(self.http.put(self.url(&format!("instances/{id}/webhook"))))
            .json(&WebhookRequest { uri, secret })
            .send()
            .await
            .map_err(|err| ProviderError::request(stage, err))?;
        expect_success(stage, response).await.map(|_| ())
    }

    async fn cancel_instance(&self, id: &str) -> Result<(), ProviderError> {
        let stage = "cancel_instance";
        let url = self.url(&format!("instances/{id}"));
        let url = url.as_str();
        let attempt = || async move {
            let response = self
                .authorize(self.http.delete(url))
                .send()
                .await
                .map_err(|err| ProviderError::request(stage, err))?;
            expect_success(stage, response).await.map(|_| ())
        };
        attempt
            .retry(self.backoff)
            .sleep(sleep)
            .when(ProviderError::is_transient)
            .notify(|err: &ProviderError, delay: Duration| {
                warn!(
                    instance_id = id,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "retrying instance cancel request"
                );
            })
            .await
    }
}

#[derive(Deserialize)]
struct SubmitReply {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Posts `{ "id": job_id }` to `http://{address}:{port}/v1/jobs`.
#[derive(Debug, Clone)]
pub struct HttpInstanceChannel {
    http: Client,
}

impl HttpInstanceChannel {
    pub fn new() -> Result<Self, ProviderError> {
        Ok(Self { http: http_client()? })
    }
}

#[async_trait]
impl InstanceChannel for HttpInstanceChannel {
    async fn submit(&self, address: &str, port: u16, job_id: &str) -> Result<String, ProviderError> {
        let stage = "submit_job";
        let response = self
            .http
            .post(format!("http://{address}:{port}/v1/jobs"))
            .json(&serde_json::json!({ "id": job_id }))
            .send()
            .await
            .map_err(|err| ProviderError::request(stage, err))?;
        let reply: SubmitReply = decode(stage, response).await?;
        match (reply.result, reply.error) {
            (_, Some(error)) => Err(ProviderError::Decode {
                stage,
                message: error,
            }),
            (Some(result), None) => Ok(result),
            (None, None) => Ok(String::new()),
        }
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("job `{job_id}`: {source}")]
    Repo {
        job_id: String,
        #[source]
        source: RepoError,
    },
    #[error("job `{job_id}` is invalid: {reason}")]
    Invalid { job_id: String, reason: String },
    #[error("job `{job_id}`: failed to provision `{hostname}`: {source}")]
    Provision {
        job_id: String,
        hostname: String,
        #[source]
        source: ProviderError,
    },
    #[error("job `{job_id}`: failed to submit to instance `{instance_id}`: {source}")]
    Submit {
        job_id: String,
        instance_id: String,
        #[source]
        source: ProviderError,
    },
    #[error("job `{job_id}`: failed to cancel instance `{instance_id}`: {source}")]
    Cancel {
        job_id: String,
        instance_id: String,
        #[source]
        source: ProviderError,
    },
    #[error("job `{job_id}`: failed to save: {source}")]
    Save {
        job_id: String,
        #[source]
        source: SaveError,
    },
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchedInstance {
    pub job_id: String,
    pub instance_id: String,
    pub hostname: String,
    pub address: String,
    pub webhook: String,
    /// Reply of the instance agent to the submission.
    pub reply: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// Processing already started.
    AlreadyStarted { job_id: String, status: JobStatus },
    Launched(LaunchedInstance),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestroyOutcome {
    /// The job has not completed; the instance stays up.
    Incomplete { job_id: String, status: JobStatus },
    Cancelled { job_id: String, instance_id: String },
}

/// `C1_{cpus}X{cpus}X25` for the compute profile, `M1_{cpus}X{8*cpus}X25`
/// otherwise.
pub fn flavor_for(spec: &InstanceSpec) -> String {
    let cpus = spec.cpus;
    match spec.profile {
        InstanceProfile::Compute => format!("C1_{cpus}X{cpus}X25"),
        InstanceProfile::Standard => format!("M1_{cpus}X{}X25", cpus * 8),
    }
}

pub fn hostname_for(prefix: &str) -> String {
    format!("{prefix}-{}", Utc::now().timestamp_micros())
}

/// Reclaim callback URI registered for an instance at `address`.
pub fn webhook_uri(address: &str, port: u16, reclaim_path: &str) -> String {
    format!("http://{address}:{port}/{}", reclaim_path.trim_start_matches('/'))
}

/// Reject jobs the lifecycle cannot launch. Invalid inputs are tolerated here
/// and marked separately.
fn validate(job: &JobDocument) -> Result<&InstanceSpec, String> {
    if job.bucket.as_deref().is_none_or(str::is_empty) {
        return Err("job has no bucket".to_string());
    }
    let Some(spec) = job.instance.as_ref() else {
        return Err("job has no instance request".to_string());
    };
    if !CPU_TIERS.contains(&spec.cpus) {
        return Err(format!("unsupported cpu count {}; expected one of {CPU_TIERS:?}", spec.cpus));
    }
    if let Some(hours) = spec.duration_hours
        && !DURATION_TIERS.contains(&hours)
    {
        return Err(format!("unsupported duration {hours}h; expected one of {DURATION_TIERS:?}"));
    }
    if job.inputs.is_empty() {
        return Err("job has no inputs".to_string());
    }
    Ok(spec)
}

fn mark_invalid_inputs(job: &mut JobDocument) -> usize {
    let mut valid = 0;
    for unit in &mut job.inputs {
        if unit.is_valid() {
            valid += 1;
        } else {
            unit.error.get_or_insert_with(|| MISSING_FIELDS_ERROR.to_string());
        }
    }
    valid
}

#[derive(Builder)]
pub struct Lifecycle {
    repo: Arc<dyn StateRepository>,
    provider: Arc<dyn ComputeProvider>,
    channel: Arc<dyn InstanceChannel>,
    /// Paces provisioning status polls.
    poll: Arc<dyn Waiter>,
    config: InstanceConfig,
    /// Path the instance agent serves the reclaim callback on.
    reclaim_path: String,
    sw_version: String,
    #[builder(default)]
    retry: ConflictRetry,
}

impl Lifecycle {
    pub async fn launch(&self, job_id: &str) -> Result<LaunchOutcome, LifecycleError> {
        let mut job: JobDocument = load(self.repo.as_ref(), job_id)
            .await
            .map_err(|source| LifecycleError::Repo {
                job_id: job_id.to_string(),
                source,
            })?;
        let status = job.status(TRANSIENT_PHASE).unwrap_or(JobStatus::Pending);
        if status != JobStatus::Pending {
            info!(job_id, %status, "processing already started");
            return Ok(LaunchOutcome::AlreadyStarted {
                job_id: job_id.to_string(),
                status,
            });
        }

        let spec = match validate(&job) {
            Ok(spec) => spec.clone(),
            Err(reason) => return Err(self.fail(job_id, reason, None).await),
        };
        if mark_invalid_inputs(&mut job) == 0 {
            self.save_inputs(&job).await;
            return Err(self.fail(job_id, "no input has an id and input_key", None).await);
        }

        let hostname = hostname_for(&self.config.hostname_prefix);
        let request = InstanceRequest {
            hostname: hostname.clone(),
            cpus: spec.cpus,
            flavor: flavor_for(&spec),
            image_id: self.config.image_id.clone(),
            datacenter: self.config.datacenter.clone(),
            transient: true,
        };
        info!(job_id, hostname = %hostname, flavor = %request.flavor, "provisioning instance");

        let instance_id = match self.provider.create_instance(&request).await {
            Ok(id) => id,
            Err(source) => {
                let reason = format!("unable to create instance `{hostname}`: {source}");
                self.fail(job_id, reason, None).await;
                return Err(LifecycleError::Provision {
                    job_id: job_id.to_string(),
                    hostname,
                    source,
                });
            }
        };
        let (address, webhook) = match self.await_ready_and_register(&instance_id).await {
            Ok(ready) => ready,
            Err(source) => {
                let reason = format!("unable to bring up instance `{hostname}` ({instance_id}): {source}");
                self.fail(job_id, reason, Some(&instance_id)).await;
                return Err(LifecycleError::Provision {
                    job_id: job_id.to_string(),
                    hostname,
                    source,
                });
            }
        };

        let stamped = InstanceSpec {
            hostname: Some(hostname.clone()),
            compute_target: Some(instance_id.clone()),
            compute_webhook: Some(webhook.clone()),
            address: Some(address.clone()),
            ..spec
        };
        let sw_version = self.sw_version.clone();
        let claimed = self
            .retry
            .update(self.repo.as_ref(), job_id, |fresh: &mut JobDocument| {
                let current = fresh.status(TRANSIENT_PHASE).unwrap_or(JobStatus::Pending);
                if current != JobStatus::Pending {
                    return Err(Rejected::new(format!("status moved to {current}")));
                }
                mark_invalid_inputs(fresh);
                let state = fresh
                    .phases
                    .entry(TRANSIENT_PHASE.to_string())
                    .or_insert_with(|| PhaseState::pending(0, RetentionFlag::Discard));
                state.status = JobStatus::Processing;
                state.started_at = Some(Utc::now());
                state.sw_version = Some(sw_version.clone());
                fresh.instance = Some(stamped.clone());
                fresh.sw_version = Some(sw_version.clone());
                fresh.error = None;
                fresh.touch();
                Ok(())
            })
            .await;
        match claimed {
            Ok(_) => {}
            Err(err) if err.is_rejected() => {
                // Another launcher won; ours is surplus.
                warn!(job_id, instance_id = %instance_id, reason = %err, "launch lost race; cancelling instance");
                if let Err(cancel) = self.provider.cancel_instance(&instance_id).await {
                    warn!(job_id, instance_id = %instance_id, error = %cancel, "failed to cancel surplus instance");
                }
                let current: JobDocument = load(self.repo.as_ref(), job_id)
                    .await
                    .map_err(|source| LifecycleError::Repo {
                        job_id: job_id.to_string(),
                        source,
                    })?;
                return Ok(LaunchOutcome::AlreadyStarted {
                    job_id: job_id.to_string(),
                    status: current.status(TRANSIENT_PHASE).unwrap_or(JobStatus::Processing),
                });
            }
            Err(source) => {
                return Err(LifecycleError::Save {
                    job_id: job_id.to_string(),
                    source,
                });
            }
        }

        let reply = match self.channel.submit(&address, self.config.port, job_id).await {
            Ok(reply) => reply,
            Err(source) => {
                let reason = format!("unable to submit to instance `{instance_id}`: {source}");
                self.record_error(job_id, reason).await;
                return Err(LifecycleError::Submit {
                    job_id: job_id.to_string(),
                    instance_id,
                    source,
                });
            }
        };

        info!(job_id, instance_id = %instance_id, address = %address, "job started on instance");
        Ok(LaunchOutcome::Launched(LaunchedInstance {
            job_id: job_id.to_string(),
            instance_id,
            hostname,
            address,
            webhook,
            reply,
        }))
    }

    /// Cancel the instance of a completed job.
    pub async fn destroy(&self, job_id: &str) -> Result<DestroyOutcome, LifecycleError> {
        let job: JobDocument = load(self.repo.as_ref(), job_id)
            .await
            .map_err(|source| LifecycleError::Repo {
                job_id: job_id.to_string(),
                source,
            })?;
        let status = job.status(TRANSIENT_PHASE).unwrap_or(JobStatus::Pending);
        if status != JobStatus::Complete {
            debug!(job_id, %status, "processing incomplete; instance kept");
            return Ok(DestroyOutcome::Incomplete {
                job_id: job_id.to_string(),
                status,
            });
        }
        let Some(instance_id) = job
            .instance
            .as_ref()
            .and_then(|spec| spec.compute_target.clone())
        else {
            return Err(self.fail(job_id, "job has no compute_target", None).await);
        };
        if let Err(source) = self.provider.cancel_instance(&instance_id).await {
            self.record_error(job_id, format!("unable to cancel instance `{instance_id}`: {source}"))
                .await;
            return Err(LifecycleError::Cancel {
                job_id: job_id.to_string(),
                instance_id,
                source,
            });
        }
        info!(job_id, instance_id = %instance_id, "instance cancelled");
        Ok(DestroyOutcome::Cancelled {
            job_id: job_id.to_string(),
            instance_id,
        })
    }

    pub async fn cancel_instance(&self, instance_id: &str) -> Result<(), ProviderError> {
        self.provider.cancel_instance(instance_id).await
    }

    async fn await_ready_and_register(
        &self,
        instance_id: &str,
    ) -> Result<(String, String), ProviderError> {
        let max_polls = self.config.provision_max_polls.max(1);
        let mut ready = None;
        for poll in 1..=max_polls {
            match self.provider.instance_status(instance_id).await? {
                InstanceState::Ready { address } => {
                    ready = Some(address);
                    break;
                }
                InstanceState::Failed { message } => {
                    return Err(ProviderError::Failed {
                        id: instance_id.to_string(),
                        message,
                    });
                }
                InstanceState::Provisioning => {
                    debug!(instance_id, poll, "instance still provisioning");
                    if poll < max_polls && !self.poll.wait().await {
                        return Err(ProviderError::Cancelled {
                            id: instance_id.to_string(),
                        });
                    }
                }
            }
        }
        let Some(address) = ready else {
            return Err(ProviderError::Timeout {
                id: instance_id.to_string(),
                polls: max_polls,
            });
        };

        let webhook = webhook_uri(&address, self.config.port, &self.reclaim_path);
        self.provider
            .register_webhook(instance_id, &webhook, self.config.webhook_secret.as_deref())
            .await?;
        Ok((address, webhook))
    }

    /// Record `reason` (and the instance, if one exists) and build the error.
    async fn fail(
        &self,
        job_id: &str,
        reason: impl Into<String>,
        instance_id: Option<&str>,
    ) -> LifecycleError {
        let reason = reason.into();
        let saved = self
            .retry
            .update(self.repo.as_ref(), job_id, |job: &mut JobDocument| {
                job.error = Some(reason.clone());
                if let Some(id) = instance_id {
                    let spec = job.instance.get_or_insert_with(|| InstanceSpec::new(DEFAULT_CPUS));
                    spec.compute_target = Some(id.to_string());
                }
                job.touch();
                Ok(())
            })
            .await;
        if let Err(err) = saved {
            warn!(job_id, error = %err, "failed to record job error");
        }
        LifecycleError::Invalid {
            job_id: job_id.to_string(),
            reason,
        }
    }

    async fn record_error(&self, job_id: &str, reason: String) {
        self.fail(job_id, reason, None).await;
    }

    async fn save_inputs(&self, job: &JobDocument) {
        let inputs = job.inputs.clone();
        let saved = self
            .retry
            .update(self.repo.as_ref(), &job.id, |fresh: &mut JobDocument| {
                fresh.inputs = inputs.clone();
                fresh.touch();
                Ok(())
            })
            .await;
        if let Err(err) = saved {
            warn!(job_id = %job.id, error = %err, "failed to record input errors");
        }
    }
}

/// A directory of inputs to run on one transient instance.
#[derive(Debug, Clone)]
pub struct TransientSubmission {
    pub dir: PathBuf,
    pub bucket: String,
    /// Defaults to the directory name.
    pub job_id: Option<String>,
    pub cpus: u32,
    pub duration_hours: Option<u32>,
    pub profile: InstanceProfile,
    /// Only files with this extension are submitted.
    pub extension: Option<String>,
}

/// Upload every input file under `submission.dir` and create the pending job.
///
/// Inputs are keyed `{job_id}/input-{n}/{file_name}`; a failed upload is
/// recorded on its unit rather than aborting the submission.
pub async fn submit_from_dir(
    repo: &dyn StateRepository,
    blobs: &dyn BlobStore,
    submission: &TransientSubmission,
) -> Result<JobDocument, LifecycleError> {
    let job_id = match &submission.job_id {
        Some(id) => id.clone(),
        None => job_id_from_dir(&submission.dir),
    };
    let invalid = |reason: String| LifecycleError::Invalid {
        job_id: job_id.clone(),
        reason,
    };
    if !CPU_TIERS.contains(&submission.cpus) {
        return Err(invalid(format!("cpus must be one of {CPU_TIERS:?}")));
    }
    if let Some(hours) = submission.duration_hours
        && !DURATION_TIERS.contains(&hours)
    {
        return Err(invalid(format!("duration must be one of {DURATION_TIERS:?}")));
    }
    if repo.exists(&job_id).await.map_err(|source| LifecycleError::Repo {
        job_id: job_id.clone(),
        source,
    })? {
        return Err(LifecycleError::Repo {
            job_id: job_id.clone(),
            source: RepoError::Duplicate(job_id.clone()),
        });
    }

    let files = input_files(&submission.dir, submission.extension.as_deref()).await?;
    if files.is_empty() {
        return Err(invalid(format!("no input files in {}", submission.dir.display())));
    }

    let mut inputs = Vec::with_capacity(files.len());
    for (n, path) in files.iter().enumerate() {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let id = format!("input-{n}");
        let key = format!("{job_id}/{id}/{file_name}");
        let mut unit = WorkUnit::new(id, key.clone());
        if let Err(err) = blobs.upload_file(&submission.bucket, &key, path, false).await {
            warn!(job_id = %job_id, path = %path.display(), error = %err, "input upload failed");
            unit.error = Some(err.to_string());
        }
        inputs.push(unit);
    }

    let mut job = JobDocument::new(job_id.clone(), submission.bucket.clone());
    job.phases.insert(
        TRANSIENT_PHASE.to_string(),
        PhaseState::pending(0, RetentionFlag::Discard),
    );
    job.instance = Some(InstanceSpec {
        profile: submission.profile,
        duration_hours: submission.duration_hours,
        ..InstanceSpec::new(submission.cpus)
    });
    job.inputs = inputs;

    let created = create_typed(repo, job)
        .await
        .map_err(|source| LifecycleError::Repo {
            job_id: job_id.clone(),
            source,
        })?;
    info!(job_id = %created.id, inputs = created.inputs.len(), "transient job submitted");
    Ok(created)
}

/// Directory name with path separators and dots flattened to `_`.
fn job_id_from_dir(dir: &Path) -> String {
    dir.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "job".to_string())
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

async fn input_files(dir: &Path, extension: Option<&str>) -> Result<Vec<PathBuf>, LifecycleError> {
    let io_err = |source| LifecycleError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut entries = tokio::fs::read_dir(dir).await.map_err(io_err)?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
        let path = entry.path();
        if !entry.file_type().await.map_err(io_err)?.is_file() {
            continue;
        }
        let matches = extension.is_none_or(|ext| {
            path.extension()
                .is_some_and(|found| found.eq_ignore_ascii_case(ext.trim_start_matches('.')))
        });
        if matches {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
