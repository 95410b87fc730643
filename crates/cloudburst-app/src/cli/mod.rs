use std::path::PathBuf;

use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand, ValueEnum};

mod transient;

pub use transient::{
    ProfileArg, TransientArgs, TransientCommands, TransientDestroyArgs, TransientLaunchArgs,
    TransientSubmitArgs,
};

use crate::services::{DebugRetention, RetentionFlag};

/// Top-level CLI entry point.
#[derive(Debug, Parser)]
#[command(
    name = "cloudburst",
    version,
    author,
    about = "Split, process and merge large inputs across stateless workers"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
    /// Increase logging verbosity (-v, -vv, -vvv).
    #[arg(global = true, short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub fn print_help() {
        let mut cmd = Cli::command();
        let _ = cmd.print_help();
        println!();
    }
}

/// Supported subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the HTTP server (job triggers and reclaim callbacks).
    Serve(ServeArgs),
    /// Upload raw files and create pending split jobs.
    Submit(SubmitArgs),
    /// Start a job, in-process or through a running server.
    Trigger(TriggerArgs),
    /// Process one segment, then run the completion barrier.
    Worker(WorkerArgs),
    /// Execute a transient job's inputs on this machine.
    Run(RunArgs),
    /// Print one status line per job phase.
    Status(StatusArgs),
    /// Transient-instance jobs.
    Transient(TransientArgs),
    /// Download finished jobs to a local directory.
    Collect(CollectArgs),
    /// Cancel instances and delete state of abandoned transient jobs.
    Cleanup(CleanupArgs),
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Serve as the agent on a transient instance instead of a controller.
    #[arg(long, action = ArgAction::SetTrue)]
    pub instance: bool,
}

/// Debug artifacts kept after reassembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DebugFlag {
    /// The ordinal 0 raw slice.
    Raw,
    /// The ordinal 0 segment output and document.
    Segments,
    All,
}

impl From<DebugFlag> for DebugRetention {
    fn from(flag: DebugFlag) -> Self {
        match flag {
            DebugFlag::Raw => DebugRetention::Raw,
            DebugFlag::Segments => DebugRetention::Segments,
            DebugFlag::All => DebugRetention::All,
        }
    }
}

/// `t` keeps, `f` discards.
pub fn parse_retention(value: &str) -> Result<RetentionFlag, String> {
    match value.trim() {
        "t" | "true" => Ok(RetentionFlag::Keep),
        "f" | "false" => Ok(RetentionFlag::Discard),
        other => Err(format!("expected `t` or `f`, got `{other}`")),
    }
}

#[derive(Debug, Args)]
pub struct SubmitArgs {
    /// Raw input files, or directories whose files are all submitted.
    #[arg(required = true)]
    pub files: Vec<PathBuf>,
    /// Bytes per segment (defaults to `pipeline.segment_size`).
    #[arg(short = 'z', long)]
    pub segment_size: Option<u64>,
    /// Appended to the file stem as `{stem}.{suffix}` to form the job id.
    #[arg(short = 's', long)]
    pub suffix: Option<String>,
    /// Keep the raw input after reassembly (`t`) or delete it (`f`).
    #[arg(short = 'r', long, default_value = "t", value_parser = parse_retention)]
    pub keep_input: RetentionFlag,
    /// Debug artifacts to keep; repeatable.
    #[arg(short = 'd', long = "debug", value_enum)]
    pub debug: Vec<DebugFlag>,
    /// Start each job in-process after it is created.
    #[arg(long, action = ArgAction::SetTrue)]
    pub run: bool,
}

#[derive(Debug, Args)]
pub struct TriggerArgs {
    pub job_id: String,
    /// Base URL of a running server; the job runs in-process when omitted.
    #[arg(long, value_name = "URL")]
    pub url: Option<String>,
}

#[derive(Debug, Args)]
pub struct WorkerArgs {
    /// Segment document id, `{job}.{phase}.S{n}`.
    pub segment_id: String,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    pub job_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StatusFormat {
    Text,
    Json,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    #[arg(long, value_enum, default_value_t = StatusFormat::Text)]
    pub format: StatusFormat,
}

#[derive(Debug, Args)]
pub struct CollectArgs {
    /// Directory receiving `{job}.json` files and outputs.
    #[arg(value_name = "DIR")]
    pub out_dir: PathBuf,
    /// Delete collected blobs and job documents afterwards.
    #[arg(long, action = ArgAction::SetTrue)]
    pub delete: bool,
}

#[derive(Debug, Args)]
pub struct CleanupArgs {
    /// Report what would be removed without touching anything.
    #[arg(long, action = ArgAction::SetTrue)]
    pub dry_run: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn submit_parses_retention_flags() {
        let cli = Cli::try_parse_from([
            "cloudburst", "submit", "a.h5", "-r", "f", "-d", "raw", "-d", "segments", "-s", "v2",
        ])
        .expect("parse");
        let Some(Commands::Submit(args)) = cli.command else {
            panic!("expected submit");
        };
        assert_eq!(args.keep_input, RetentionFlag::Discard);
        assert_eq!(args.debug, vec![DebugFlag::Raw, DebugFlag::Segments]);
        assert_eq!(args.suffix.as_deref(), Some("v2"));
    }

    #[test]
    fn rejects_unknown_retention_flag() {
        assert!(Cli::try_parse_from(["cloudburst", "submit", "a.h5", "-r", "maybe"]).is_err());
    }
}
