use std::{path::PathBuf, process, sync::Arc};

use chrono::Utc;
use cloudburst_app::cli::{
    CleanupArgs, Cli, CollectArgs, Commands, RunArgs, ServeArgs, StatusArgs, StatusFormat,
    SubmitArgs, TransientArgs, TransientCommands, TransientSubmitArgs, TriggerArgs, WorkerArgs,
};
use cloudburst_app::config::{self, AppConfig};
use cloudburst_app::constants::TRANSIENT_PHASE;
use cloudburst_app::error::AppError;
use cloudburst_app::server::{self, ServeRole, build_lifecycle, build_runner};
use cloudburst_app::services::{
    ActiveJob, HttpComputeProvider, JobDocument, PipelineContext, SplitSubmission,
    TransientSubmission, build_pipeline_context, cleanup, collect, handle_segment, load,
    run_local, status_lines, submit_from_dir, submit_split,
};
use serde::Deserialize;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, fmt};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let log_level = determine_log_level(&cli);
    init_tracing(log_level);

    if let Err(err) = run(cli).await {
        eprintln!("{err}");
        process::exit(1);
    }
}

fn init_tracing(level: LevelFilter) {
    let subscriber = fmt().with_max_level(level).with_target(false).finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("Tracing subscriber already set; skipping re-initialization.");
    }
}

/// Long-running commands log at info by default; reporting tools stay quiet.
fn determine_log_level(cli: &Cli) -> LevelFilter {
    let long_running = matches!(
        cli.command,
        Some(Commands::Serve(_) | Commands::Trigger(_) | Commands::Worker(_) | Commands::Run(_))
    );
    match (long_running, cli.verbose) {
        (true, 0) => LevelFilter::INFO,
        (true, 1) => LevelFilter::DEBUG,
        (true, _) => LevelFilter::TRACE,
        (false, 0) => LevelFilter::WARN,
        (false, 1) => LevelFilter::INFO,
        (false, 2) => LevelFilter::DEBUG,
        (false, _) => LevelFilter::TRACE,
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let Some(command) = cli.command else {
        Cli::print_help();
        return Ok(());
    };
    let config = config::load()?;

    match command {
        Commands::Serve(args) => run_serve(config, args).await,
        Commands::Submit(args) => run_submit(&config, args).await,
        Commands::Trigger(args) => run_trigger(&config, args).await,
        Commands::Worker(args) => run_worker(&config, args).await,
        Commands::Run(args) => run_instance_job(&config, args).await,
        Commands::Status(args) => run_status(&config, args).await,
        Commands::Transient(args) => run_transient(&config, args).await,
        Commands::Collect(args) => run_collect(&config, args).await,
        Commands::Cleanup(args) => run_cleanup(&config, args).await,
    }
}

/// Context whose barrier and provisioning waits stop on ctrl-c.
async fn interruptible_context(
    config: &AppConfig,
) -> Result<(Arc<PipelineContext>, watch::Receiver<bool>), AppError> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; stopping waits");
            shutdown_tx.send_replace(true);
        }
    });
    let ctx = build_pipeline_context(config, shutdown_rx.clone()).await?;
    Ok((Arc::new(ctx), shutdown_rx))
}

async fn run_serve(config: AppConfig, args: ServeArgs) -> Result<(), AppError> {
    let role = if args.instance {
        ServeRole::Instance
    } else {
        ServeRole::Controller
    };
    server::serve(config, role).await
}

async fn run_submit(config: &AppConfig, args: SubmitArgs) -> Result<(), AppError> {
    let (ctx, _) = interruptible_context(config).await?;
    let files = expand_inputs(&args.files)?;
    let debug: Vec<_> = args.debug.iter().copied().map(Into::into).collect();
    let mut failures = 0;
    for file in files {
        let submission = SplitSubmission {
            file: file.clone(),
            bucket: config.storage.bucket.clone(),
            phase: config.pipeline.phase.clone(),
            segment_size: args.segment_size.unwrap_or(config.pipeline.segment_size),
            suffix: args.suffix.clone(),
            keep_input: args.keep_input,
            debug: debug.clone(),
        };
        match submit_split(ctx.repo.as_ref(), ctx.blobs.as_ref(), &submission).await {
            Ok(job) => {
                println!("Created job {} for {}", job.id, file.display());
                if args.run {
                    let run = run_local(Arc::clone(&ctx), &job.id).await?;
                    println!("{}: {} segments processed", run.job_id, run.processed);
                }
            }
            Err(err) => {
                failures += 1;
                eprintln!("{}: {err}", file.display());
            }
        }
    }
    if failures > 0 {
        return Err(AppError::Config(format!("{failures} submissions failed")));
    }
    Ok(())
}

/// Files as given, with directories replaced by the files directly inside.
fn expand_inputs(inputs: &[PathBuf]) -> Result<Vec<PathBuf>, AppError> {
    let cwd = std::env::current_dir().map_err(AppError::WorkingDir)?;
    let mut files = Vec::new();
    for input in inputs {
        let path = if input.is_absolute() {
            input.clone()
        } else {
            cwd.join(input)
        };
        if path.is_dir() {
            let entries = std::fs::read_dir(&path).map_err(|source| AppError::Io {
                path: path.clone(),
                source,
            })?;
            let mut found: Vec<PathBuf> = entries
                .filter_map(Result::ok)
                .map(|entry| entry.path())
                .filter(|entry| entry.is_file())
                .collect();
            found.sort();
            files.extend(found);
        } else if path.is_file() {
            files.push(path);
        } else {
            eprintln!("Argument \"{}\" is not a file; ignoring.", input.display());
        }
    }
    Ok(files)
}

#[derive(Debug, Deserialize)]
struct TriggerReply {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

async fn run_trigger(config: &AppConfig, args: TriggerArgs) -> Result<(), AppError> {
    if let Some(url) = args.url {
        let endpoint = format!("{}/v1/jobs", url.trim_end_matches('/'));
        let response = reqwest::Client::new()
            .post(&endpoint)
            .json(&serde_json::json!({ "id": args.job_id }))
            .send()
            .await
            .map_err(|err| AppError::Config(format!("POST {endpoint}: {err}")))?;
        let status = response.status();
        let reply: TriggerReply = response
            .json()
            .await
            .map_err(|err| AppError::Config(format!("POST {endpoint}: {err}")))?;
        return match (status.is_success(), reply.result, reply.error) {
            (true, Some(result), _) => {
                println!("{result}");
                Ok(())
            }
            (_, _, Some(error)) => Err(AppError::Config(format!("{status}: {error}"))),
            _ => Err(AppError::Config(format!("{status}: empty reply"))),
        };
    }

    let (ctx, shutdown) = interruptible_context(config).await?;
    let job: JobDocument = load(ctx.repo.as_ref(), &args.job_id).await?;
    if job.phase(TRANSIENT_PHASE).is_some() {
        let lifecycle = build_lifecycle(config, &ctx, shutdown)?;
        let outcome = lifecycle.launch(&args.job_id).await?;
        println!("{outcome:?}");
        return Ok(());
    }
    let run = run_local(ctx, &args.job_id).await?;
    match run.reassembly {
        Some(report) => println!(
            "{}: merged {} segments into {} ({} failed)",
            run.job_id,
            report.segments.len(),
            report.output_key,
            report.failed_segments()
        ),
        None => println!("{}: nothing left to merge", run.job_id),
    }
    Ok(())
}

async fn run_worker(config: &AppConfig, args: WorkerArgs) -> Result<(), AppError> {
    let (ctx, _) = interruptible_context(config).await?;
    let run = handle_segment(&ctx, &args.segment_id).await?;
    info!(segment_id = %args.segment_id, processed = run.worker.is_processed(), barrier = ?run.barrier, "segment handled");
    if let Some(report) = run.reassembly {
        println!("{}: merged into {}", report.job_id, report.output_key);
    }
    Ok(())
}

async fn run_instance_job(config: &AppConfig, args: RunArgs) -> Result<(), AppError> {
    let (ctx, _) = interruptible_context(config).await?;
    let runner = build_runner(config, &ctx, ActiveJob::new())?;
    let report = runner.run(&args.job_id).await?;
    println!(
        "{}: {:?} ({} succeeded, {} failed)",
        report.job_id, report.outcome, report.succeeded, report.failed
    );
    Ok(())
}

async fn run_status(config: &AppConfig, args: StatusArgs) -> Result<(), AppError> {
    let (ctx, _) = interruptible_context(config).await?;
    let jobs = ctx.repo.list_jobs().await?;
    let lines = status_lines(&jobs, Utc::now());
    match args.format {
        StatusFormat::Json => println!("{}", serde_json::to_string_pretty(&lines)?),
        StatusFormat::Text => {
            for line in &lines {
                println!("  - {line}");
            }
        }
    }
    Ok(())
}

async fn run_transient(config: &AppConfig, args: TransientArgs) -> Result<(), AppError> {
    let (ctx, shutdown) = interruptible_context(config).await?;
    match args.command {
        TransientCommands::Submit(submit) => {
            let launch = submit.launch;
            let job = submit_transient(config, &ctx, submit).await?;
            println!("Created transient job {} with {} inputs", job.id, job.inputs.len());
            if launch {
                let lifecycle = build_lifecycle(config, &ctx, shutdown)?;
                println!("{:?}", lifecycle.launch(&job.id).await?);
            }
        }
        TransientCommands::Launch(launch) => {
            let lifecycle = build_lifecycle(config, &ctx, shutdown)?;
            println!("{:?}", lifecycle.launch(&launch.job_id).await?);
        }
        TransientCommands::Destroy(destroy) => {
            let lifecycle = build_lifecycle(config, &ctx, shutdown)?;
            println!("{:?}", lifecycle.destroy(&destroy.job_id).await?);
        }
    }
    Ok(())
}

async fn submit_transient(
    config: &AppConfig,
    ctx: &PipelineContext,
    args: TransientSubmitArgs,
) -> Result<JobDocument, AppError> {
    let submission = TransientSubmission {
        dir: args.dir,
        bucket: config.storage.bucket.clone(),
        job_id: args.job_id,
        cpus: args.cpus,
        duration_hours: Some(args.duration),
        profile: args.profile.into(),
        extension: args.ext,
    };
    Ok(submit_from_dir(ctx.repo.as_ref(), ctx.blobs.as_ref(), &submission).await?)
}

async fn run_collect(config: &AppConfig, args: CollectArgs) -> Result<(), AppError> {
    let (ctx, _) = interruptible_context(config).await?;
    let report = collect(ctx.repo.as_ref(), ctx.blobs.as_ref(), &args.out_dir, args.delete).await?;
    println!("The following jobs have completed processing:");
    for job_id in &report.collected {
        println!(" - {job_id}: download complete");
    }
    for unit in &report.unfinished_inputs {
        println!("Input {unit} did not complete!");
    }
    for error in &report.errors {
        eprintln!("{error}");
    }
    let jobs = ctx.repo.list_jobs().await?;
    let pending: Vec<_> = status_lines(&jobs, Utc::now())
        .into_iter()
        .filter(|line| !line.status.is_terminal())
        .collect();
    if !pending.is_empty() {
        println!("The following jobs have not completed processing:");
        for line in pending {
            println!("  - {line}");
        }
    }
    if !report.errors.is_empty() {
        return Err(AppError::Config(format!(
            "{} downloads failed",
            report.errors.len()
        )));
    }
    Ok(())
}

async fn run_cleanup(config: &AppConfig, args: CleanupArgs) -> Result<(), AppError> {
    let (ctx, _) = interruptible_context(config).await?;
    let provider = HttpComputeProvider::new(&config.instance)?;
    let report = cleanup(ctx.repo.as_ref(), ctx.blobs.as_ref(), &provider, args.dry_run).await?;
    let verb = if args.dry_run { "would be" } else { "were" };
    println!(
        "{} instances {verb} cancelled, {} blobs and {} jobs {verb} deleted",
        report.cancelled_instances.len(),
        report.deleted_blobs,
        report.deleted_jobs.len()
    );
    for job_id in &report.deleted_jobs {
        println!(". . . {job_id}");
    }
    for error in &report.errors {
        eprintln!("{error}");
    }
    Ok(())
}
