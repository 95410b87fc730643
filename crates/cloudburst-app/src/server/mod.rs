//! Binds the application services to the HTTP surface.
//!
//! The same routes serve two roles. A controller launches transient instances
//! and drives split jobs in-process; an instance agent runs the transient job
//! it was handed and answers reclaim notices.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cloudburst_server::{
    ApiHandlers, HandlerError, JobTrigger, PreemptionReceiver, ReclaimNotice, ServerError,
};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::constants::TRANSIENT_PHASE;
use crate::error::AppError;
use crate::paths::AppPaths;
use crate::services::{
    ActiveJob, HttpComputeProvider, HttpInstanceChannel, JobDocument, JobStatus, Lifecycle,
    PipelineContext, PreemptionError, PreemptionHandler, RepoError, Runner, SleepWaiter,
    build_pipeline_context, load, run_local,
};

pub use cloudburst_server::build_api_router;

/// Which side of a transient job this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServeRole {
    #[default]
    Controller,
    Instance,
}

/// `POST /v1/jobs`: starts the job in the background and answers at once.
pub struct AppTrigger {
    ctx: Arc<PipelineContext>,
    lifecycle: Option<Arc<Lifecycle>>,
    runner: Option<Arc<Runner>>,
    active: ActiveJob,
}

impl AppTrigger {
    pub fn controller(ctx: Arc<PipelineContext>, lifecycle: Arc<Lifecycle>) -> Self {
        Self {
            ctx,
            lifecycle: Some(lifecycle),
            runner: None,
            active: ActiveJob::new(),
        }
    }

    pub fn instance(ctx: Arc<PipelineContext>, runner: Arc<Runner>, active: ActiveJob) -> Self {
        Self {
            ctx,
            lifecycle: None,
            runner: Some(runner),
            active,
        }
    }

    fn start_transient(&self, job_id: String) -> Result<String, HandlerError> {
        if let Some(runner) = &self.runner {
            let Some(reclaim) = self.active.try_begin(&job_id) else {
                let running = self.active.current().unwrap_or_default();
                return Err(HandlerError::internal(format!(
                    "instance busy with job `{running}`"
                )));
            };
            let runner = Arc::clone(runner);
            let id = job_id.clone();
            tokio::spawn(async move {
                match runner.run_claimed(&id, reclaim).await {
                    Ok(report) => info!(job_id = %id, outcome = ?report.outcome, "run finished"),
                    Err(err) => warn!(job_id = %id, error = %err, "run failed"),
                }
            });
            return Ok(format!("{job_id} started on this instance"));
        }
        let Some(lifecycle) = &self.lifecycle else {
            return Err(HandlerError::internal("transient jobs are not served here"));
        };
        let lifecycle = Arc::clone(lifecycle);
        let id = job_id.clone();
        tokio::spawn(async move {
            match lifecycle.launch(&id).await {
                Ok(outcome) => info!(job_id = %id, ?outcome, "launch finished"),
                Err(err) => warn!(job_id = %id, error = %err, "launch failed"),
            }
        });
        Ok(format!("{job_id} accepted for launch"))
    }

    fn start_split(&self, job_id: String) -> String {
        let ctx = Arc::clone(&self.ctx);
        let id = job_id.clone();
        tokio::spawn(async move {
            match run_local(ctx, &id).await {
                Ok(run) => info!(job_id = %id, segments = run.segments, "split job finished"),
                Err(err) => warn!(job_id = %id, error = %err, "split job failed"),
            }
        });
        format!("{job_id} accepted for segmentation")
    }
}

#[async_trait]
impl JobTrigger for AppTrigger {
    async fn trigger(&self, job_id: String) -> Result<String, HandlerError> {
        let job_id = job_id.trim().to_string();
        if job_id.is_empty() {
            return Err(HandlerError::invalid("job id may not be empty"));
        }
        let job: JobDocument = load(self.ctx.repo.as_ref(), &job_id)
            .await
            .map_err(|err| match err {
                RepoError::NotFound(_) => HandlerError::not_found(err.to_string()),
                other => HandlerError::internal(other.to_string()),
            })?;

        let transient = job.phase(TRANSIENT_PHASE).is_some();
        let phase = if transient {
            TRANSIENT_PHASE
        } else {
            self.ctx.phase()
        };
        let Some(status) = job.status(phase) else {
            return Err(HandlerError::invalid(format!(
                "job `{job_id}` has no `{phase}` phase"
            )));
        };
        if status.is_terminal() {
            return Ok(format!("{job_id} already {status}"));
        }
        if transient {
            // The controller only launches pending jobs; the agent only runs
            // jobs already handed to an instance.
            if self.runner.is_none() && status != JobStatus::Pending {
                return Ok(format!("{job_id} already {status}"));
            }
            return self.start_transient(job_id);
        }
        Ok(self.start_split(job_id))
    }
}

/// Reclaim callback handed to the server crate.
pub struct AppPreemption {
    handler: PreemptionHandler,
}

impl AppPreemption {
    pub fn new(handler: PreemptionHandler) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl PreemptionReceiver for AppPreemption {
    async fn reclaim(&self, notice: ReclaimNotice) -> Result<String, HandlerError> {
        self.handler
            .handle(&notice)
            .await
            .map(|outcome| outcome.message())
            .map_err(|err| match err {
                PreemptionError::NoActiveJob { .. } => HandlerError::not_found(err.to_string()),
                other => HandlerError::internal(other.to_string()),
            })
    }
}

/// Scratch root for instance work directories.
pub fn scratch_root(config: &AppConfig) -> Result<PathBuf, AppError> {
    match &config.instance.scratch_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|source| AppError::Io {
                path: dir.clone(),
                source,
            })?;
            Ok(dir.clone())
        }
        None => Ok(AppPaths::new(&config.storage.path)?.scratch_dir()?),
    }
}

/// The instance runner, sharing `active` with the preemption handler.
pub fn build_runner(
    config: &AppConfig,
    ctx: &PipelineContext,
    active: ActiveJob,
) -> Result<Runner, AppError> {
    Ok(Runner::builder()
        .repo(Arc::clone(&ctx.repo))
        .blobs(Arc::clone(&ctx.blobs))
        .config(config.instance.clone())
        .scratch_dir(scratch_root(config)?)
        .active(active)
        .retry(ctx.retry)
        .build())
}

/// Lifecycle manager talking to the configured compute provider.
pub fn build_lifecycle(
    config: &AppConfig,
    ctx: &PipelineContext,
    shutdown: watch::Receiver<bool>,
) -> Result<Lifecycle, AppError> {
    let provider = HttpComputeProvider::new(&config.instance)?;
    let channel = HttpInstanceChannel::new()?;
    let poll = SleepWaiter::new(
        Duration::from_secs(config.instance.provision_poll_secs),
        shutdown,
    );
    Ok(Lifecycle::builder()
        .repo(Arc::clone(&ctx.repo))
        .provider(Arc::new(provider))
        .channel(Arc::new(channel))
        .poll(Arc::new(poll))
        .config(config.instance.clone())
        .reclaim_path(config.server.reclaim_path.clone())
        .sw_version(config.pipeline.sw_version.clone())
        .retry(ctx.retry)
        .build())
}

/// Assemble the route handlers for `role` around an existing context.
pub fn build_handlers(
    config: &AppConfig,
    ctx: Arc<PipelineContext>,
    role: ServeRole,
    shutdown: watch::Receiver<bool>,
) -> Result<ApiHandlers, AppError> {
    let active = ActiveJob::new();
    let preemption = PreemptionHandler::builder()
        .repo(Arc::clone(&ctx.repo))
        .blobs(Arc::clone(&ctx.blobs))
        .config(config.instance.clone())
        .scratch_dir(scratch_root(config)?)
        .active(active.clone())
        .retry(ctx.retry)
        .build();

    let trigger = match role {
        ServeRole::Instance => {
            let runner = build_runner(config, &ctx, active.clone())?;
            AppTrigger::instance(Arc::clone(&ctx), Arc::new(runner), active)
        }
        ServeRole::Controller => {
            let lifecycle = build_lifecycle(config, &ctx, shutdown)?;
            AppTrigger::controller(Arc::clone(&ctx), Arc::new(lifecycle))
        }
    };

    Ok(ApiHandlers {
        trigger: Arc::new(trigger),
        reclaim: Arc::new(AppPreemption::new(preemption)),
    })
}

pub async fn serve(config: AppConfig, role: ServeRole) -> Result<(), AppError> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ctx = Arc::new(build_pipeline_context(&config, shutdown_rx.clone()).await?);
    let handlers = build_handlers(&config, ctx, role, shutdown_rx)?;
    info!(?role, "starting server");
    let served: Result<(), ServerError> =
        cloudburst_server::serve(config.server.clone(), handlers).await;
    shutdown_tx.send_replace(true);
    served.map_err(AppError::from)
}
