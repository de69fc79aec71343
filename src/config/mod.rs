// pgguard/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::cli::TargetArgs;

const DEFAULT_BACKUP_DIR: &str = "./backups";
const DEFAULT_TICK_INTERVAL_SECS: u64 = 1;
const DEFAULT_MAX_CONCURRENT_JOBS: usize = 2;

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonS3StorageConfig {
    pub bucket_name: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
    pub folder_prefix: Option<String>,
    #[serde(default)]
    pub force_path_style: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonSchedulerConfig {
    pub tick_interval_secs: Option<u64>,
    pub max_concurrent_jobs: Option<usize>,
}

/// A job registered when `schedule start` boots.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonJobConfig {
    pub trigger: String,
    #[serde(flatten)]
    pub target: TargetArgs,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub local_backup_dir: Option<PathBuf>,
    pub s3_storage: Option<JsonS3StorageConfig>,
    pub scheduler: Option<JsonSchedulerConfig>,
    #[serde(default)]
    pub jobs: Vec<JsonJobConfig>,
}

// Application's internal configuration structs

/// Connection settings for S3-compatible storage. Anything left unset falls
/// back to the AWS SDK's environment and profile chain.
#[derive(Clone, Default)]
pub struct S3Settings {
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub force_path_style: bool,
    pub default_bucket: Option<String>,
    pub default_prefix: Option<String>,
}

impl fmt::Debug for S3Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Settings")
            .field("region", &self.region)
            .field("endpoint_url", &self.endpoint_url)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &self.secret_access_key.as_ref().map(|_| "***"))
            .field("force_path_style", &self.force_path_style)
            .field("default_bucket", &self.default_bucket)
            .field("default_prefix", &self.default_prefix)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub tick_interval: Duration,
    pub max_concurrent_jobs: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(DEFAULT_TICK_INTERVAL_SECS),
            max_concurrent_jobs: DEFAULT_MAX_CONCURRENT_JOBS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub local_backup_dir: PathBuf,
    pub s3: S3Settings,
    pub scheduler: SchedulerSettings,
    pub jobs: Vec<JsonJobConfig>,
}

impl AppConfig {
    /// Loads `config.json` if present; a missing file yields the defaults.
    /// `BUCKET_NAME` in the environment (or `.env`) supplies the default bucket
    /// when the file does not.
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let raw_json_config = if config_path.exists() {
            let config_content = fs::read_to_string(config_path)
                .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
            serde_json::from_str(&config_content).with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?
        } else {
            debug!("No config file at {}, using defaults", config_path.display());
            RawJsonConfig::default()
        };

        let mut app_config = Self::from_raw(raw_json_config)?;
        if app_config.s3.default_bucket.is_none() {
            app_config.s3.default_bucket = env::var("BUCKET_NAME").ok().filter(|s| !s.is_empty());
        }
        Ok(app_config)
    }

    pub fn from_raw(raw_config: RawJsonConfig) -> Result<Self> {
        let local_backup_dir = raw_config
            .local_backup_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BACKUP_DIR));
        if local_backup_dir.as_os_str().is_empty() {
            anyhow::bail!("local_backup_dir cannot be empty in config.json.");
        }

        let s3 = raw_config
            .s3_storage
            .map(s3_settings_from_json)
            .unwrap_or_default();

        Ok(AppConfig {
            local_backup_dir,
            s3,
            scheduler: scheduler_settings_from_json(raw_config.scheduler.unwrap_or_default())?,
            jobs: raw_config.jobs,
        })
    }

    /// Applies `schedule start` overrides on top of the file values.
    pub fn override_scheduler(&mut self, tick_secs: Option<u64>, max_concurrent: Option<usize>) -> Result<()> {
        self.scheduler = scheduler_settings_from_json(JsonSchedulerConfig {
            tick_interval_secs: tick_secs.or(Some(self.scheduler.tick_interval.as_secs())),
            max_concurrent_jobs: max_concurrent.or(Some(self.scheduler.max_concurrent_jobs)),
        })?;
        Ok(())
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

fn s3_settings_from_json(s3_raw: JsonS3StorageConfig) -> S3Settings {
    let access_key_id = non_empty(s3_raw.access_key_id);
    let secret_access_key = non_empty(s3_raw.secret_access_key);
    if access_key_id.is_some() != secret_access_key.is_some() {
        // Only one half of a static credential pair: ignore both.
        warn!("s3_storage has only one of access_key_id/secret_access_key; using the AWS credential chain instead");
        return S3Settings {
            region: non_empty(s3_raw.region),
            endpoint_url: non_empty(s3_raw.endpoint_url),
            force_path_style: s3_raw.force_path_style,
            default_bucket: non_empty(s3_raw.bucket_name),
            default_prefix: non_empty(s3_raw.folder_prefix),
            ..S3Settings::default()
        };
    }

    S3Settings {
        region: non_empty(s3_raw.region),
        endpoint_url: non_empty(s3_raw.endpoint_url),
        access_key_id,
        secret_access_key,
        force_path_style: s3_raw.force_path_style,
        default_bucket: non_empty(s3_raw.bucket_name),
        default_prefix: non_empty(s3_raw.folder_prefix),
    }
}

fn scheduler_settings_from_json(raw: JsonSchedulerConfig) -> Result<SchedulerSettings> {
    let tick_interval_secs = raw.tick_interval_secs.unwrap_or(DEFAULT_TICK_INTERVAL_SECS);
    if tick_interval_secs == 0 {
        anyhow::bail!("scheduler.tick_interval_secs must be at least 1 second");
    }
    let max_concurrent_jobs = raw.max_concurrent_jobs.unwrap_or(DEFAULT_MAX_CONCURRENT_JOBS);
    if max_concurrent_jobs == 0 {
        anyhow::bail!("scheduler.max_concurrent_jobs must be at least 1");
    }
    Ok(SchedulerSettings {
        tick_interval: Duration::from_secs(tick_interval_secs),
        max_concurrent_jobs,
    })
}
