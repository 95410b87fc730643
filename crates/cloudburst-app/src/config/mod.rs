//! Configuration loading and XDG path helpers.
//!
//! Sources, lowest precedence first: built-in defaults,
//! `/etc/cloudburst/settings.toml` (directory overridable through
//! `CLOUDBURST_ETC_CONFIG_DIR`), `$XDG_CONFIG_HOME/cloudburst/settings.toml`,
//! `./config/settings.*`, the file named by `CLOUDBURST_CONFIG_FILE`, and
//! finally `CLOUDBURST__SECTION__KEY` environment variables.

use std::env;
use std::path::PathBuf;

use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;

pub use cloudburst_server::ServerConfig;

use crate::constants::{
    BARRIER_POLL_INTERVAL, CONFLICT_RETRY_ATTEMPTS, DEFAULT_BUCKET, DEFAULT_SEGMENT_SIZE,
    PROVISION_POLL_INTERVAL, SOFTWARE_VERSION,
};
use crate::services::blob_store::{DurableWrite, S3Options};

const LOCAL_CONFIG_FILE: &str = "config/settings";
const SETTINGS_FILE: &str = "settings.toml";
const ENV_PREFIX: &str = "CLOUDBURST";
const ETC_DIR_ENV: &str = "CLOUDBURST_ETC_CONFIG_DIR";
const CONFIG_FILE_ENV: &str = "CLOUDBURST_CONFIG_FILE";
const DEFAULT_ETC_DIR: &str = "/etc";

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("unable to resolve project directories")]
    MissingProjectDirs,
    #[error(transparent)]
    Build(#[from] config::ConfigError),
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub instance: InstanceConfig,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Fs,
    S3,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Root for documents, and for blobs under the `fs` backend.
    pub path: PathBuf,
    #[serde(default)]
    pub backend: StorageBackend,
    /// Bucket new jobs are submitted into.
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default)]
    pub durability: DurableWrite,
    #[serde(default)]
    pub s3: S3Options,
}

fn default_bucket() -> String {
    DEFAULT_BUCKET.to_string()
}

/// Settings for the split pipeline.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PipelineConfig {
    /// Job type key; also names the per-job index namespace.
    pub phase: String,
    /// Extension of per-segment and merged outputs.
    pub output_ext: String,
    pub segment_size: u64,
    pub sw_version: String,
    /// Recorded on each segment as the host that processed it.
    pub compute_target: String,
    pub conflict_retries: usize,
    pub barrier_poll_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            phase: "analysis".to_string(),
            output_ext: "out".to_string(),
            segment_size: DEFAULT_SEGMENT_SIZE,
            sw_version: SOFTWARE_VERSION.to_string(),
            compute_target: "local".to_string(),
            conflict_retries: CONFLICT_RETRY_ATTEMPTS,
            barrier_poll_secs: BARRIER_POLL_INTERVAL.as_secs(),
        }
    }
}

/// Settings for transient instances, used both by the controller that
/// provisions them and by the runner on the instance itself.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct InstanceConfig {
    /// Base URL of the compute provider API.
    pub api_url: String,
    pub api_token: Option<String>,
    pub hostname_prefix: String,
    /// Port the instance agent listens on.
    pub port: u16,
    /// Shared secret registered with the reclaim webhook.
    pub webhook_secret: Option<String>,
    pub image_id: Option<String>,
    pub datacenter: Option<String>,
    pub provision_poll_secs: u64,
    pub provision_max_polls: u32,
    /// Command executed in each input's working directory.
    pub command: Vec<String>,
    /// Name the downloaded input is given inside the working directory.
    pub input_file_name: String,
    pub results_file_name: String,
    pub scratch_dir: Option<PathBuf>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:9400/v1".to_string(),
            api_token: None,
            hostname_prefix: "cloudburst".to_string(),
            port: 8080,
            webhook_secret: None,
            image_id: None,
            datacenter: None,
            provision_poll_secs: PROVISION_POLL_INTERVAL.as_secs(),
            provision_max_polls: 60,
            command: vec!["./run.sh".to_string()],
            input_file_name: "input.dat".to_string(),
            results_file_name: "results.out".to_string(),
            scratch_dir: None,
        }
    }
}

pub fn load() -> Result<AppConfig, AppConfigError> {
    let default_storage = default_storage_path()?;
    let mut builder = Config::builder()
        .set_default("server.listen_addr", "127.0.0.1:8080")?
        .set_default(
            "storage.path",
            default_storage.to_string_lossy().to_string(),
        )?;

    let etc_root = env::var_os(ETC_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ETC_DIR));
    builder = builder.add_source(
        File::from(etc_root.join("cloudburst").join(SETTINGS_FILE)).required(false),
    );
    if let Ok(dirs) = project_dirs() {
        builder =
            builder.add_source(File::from(dirs.config_dir().join(SETTINGS_FILE)).required(false));
    }
    builder = builder.add_source(File::with_name(LOCAL_CONFIG_FILE).required(false));
    if let Some(path) = env::var_os(CONFIG_FILE_ENV) {
        builder = builder.add_source(File::from(PathBuf::from(path)).required(true));
    }
    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .list_separator(" ")
            .with_list_parse_key("instance.command")
            .try_parsing(true),
    );

    let cfg = builder.build()?.try_deserialize()?;
    Ok(cfg)
}

pub fn project_dirs() -> Result<ProjectDirs, AppConfigError> {
    ProjectDirs::from("dev", "cloudburst", "cloudburst").ok_or(AppConfigError::MissingProjectDirs)
}

fn default_storage_path() -> Result<PathBuf, AppConfigError> {
    Ok(project_dirs()?.data_dir().to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_defaults() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.segment_size, 864_000);
        assert_eq!(cfg.conflict_retries, 10);
        assert_eq!(cfg.barrier_poll_secs, 30);
    }

    #[test]
    fn instance_defaults_run_script() {
        let cfg = InstanceConfig::default();
        assert_eq!(cfg.command, vec!["./run.sh".to_string()]);
        assert_eq!(cfg.results_file_name, "results.out");
    }
}
