use std::path::PathBuf;

use clap::{Args, Subcommand, ValueEnum};

use crate::constants::{DEFAULT_CPUS, DEFAULT_DURATION_HOURS};
use crate::services::InstanceProfile;

/// Transient-instance command namespace.
#[derive(Debug, Args)]
pub struct TransientArgs {
    #[command(subcommand)]
    pub command: TransientCommands,
}

#[derive(Debug, Subcommand)]
pub enum TransientCommands {
    /// Upload a directory of inputs and create a pending transient job.
    Submit(TransientSubmitArgs),
    /// Provision an instance for a pending job and hand the job to it.
    Launch(TransientLaunchArgs),
    /// Cancel the instance of a completed job.
    Destroy(TransientDestroyArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProfileArg {
    Standard,
    Compute,
}

impl From<ProfileArg> for InstanceProfile {
    fn from(profile: ProfileArg) -> Self {
        match profile {
            ProfileArg::Standard => InstanceProfile::Standard,
            ProfileArg::Compute => InstanceProfile::Compute,
        }
    }
}

#[derive(Debug, Args)]
pub struct TransientSubmitArgs {
    /// Directory holding the input files.
    #[arg(value_name = "DIR")]
    pub dir: PathBuf,
    /// Job id (defaults to the directory name).
    #[arg(long)]
    pub job_id: Option<String>,
    /// CPU tier: 4, 8, 16 or 32.
    #[arg(long, default_value_t = DEFAULT_CPUS)]
    pub cpus: u32,
    /// Wall-clock limit per input in hours: 12, 24, 48 or 96.
    #[arg(long, default_value_t = DEFAULT_DURATION_HOURS)]
    pub duration: u32,
    #[arg(long, value_enum, default_value_t = ProfileArg::Standard)]
    pub profile: ProfileArg,
    /// Only submit files with this extension.
    #[arg(long)]
    pub ext: Option<String>,
    /// Launch the instance right after submitting.
    #[arg(long)]
    pub launch: bool,
}

#[derive(Debug, Args)]
pub struct TransientLaunchArgs {
    pub job_id: String,
}

#[derive(Debug, Args)]
pub struct TransientDestroyArgs {
    pub job_id: String,
}
