use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Deserialize;

use crate::backup::BackupTarget;
use crate::config::AppConfig;
use crate::errors::SchedulerError;
use crate::storage::Destination;
use crate::utils::connection::ConnectionDescriptor;

#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
pub struct Cli {
    /// Path to the JSON configuration file (optional)
    #[arg(long, global = true, default_value = "config.json")]
    pub config: PathBuf,

    /// Directory for the log file
    #[arg(long, global = true, default_value = "logs")]
    pub log_dir: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// One-shot database backups
    Backup {
        #[command(subcommand)]
        action: BackupAction,
    },
    /// One-shot database restores
    Restore {
        #[command(subcommand)]
        action: RestoreAction,
    },
    /// Inspect stored backups
    Storage {
        #[command(subcommand)]
        action: StorageAction,
    },
    /// Recurring backups
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
    /// Show version information
    Version,
}

#[derive(Subcommand)]
pub enum BackupAction {
    /// Dump a database now and store the artifact
    Run(TargetArgs),
}

#[derive(Subcommand)]
pub enum RestoreAction {
    /// Recreate a database from a .sql or .sql.gz dump
    Run(RestoreArgs),
}

#[derive(Subcommand)]
pub enum StorageAction {
    /// List the backups at a destination
    List(DestinationArgs),
}

#[derive(Subcommand)]
pub enum ScheduleAction {
    /// Start the scheduler with the configured jobs and open the job console
    Start(StartArgs),
}

#[derive(Debug, Clone, Args)]
pub struct StartArgs {
    /// Seconds between scheduler ticks
    #[arg(long)]
    pub tick_secs: Option<u64>,

    /// Maximum number of backups running at once
    #[arg(long)]
    pub max_concurrent: Option<usize>,

    /// Run without the interactive console until Ctrl-C
    #[arg(long)]
    pub no_console: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Local,
    S3,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

#[derive(Debug, Clone, Args, Deserialize)]
pub struct ConnectionArgs {
    /// Database host
    #[arg(short = 'H', long, default_value = "localhost")]
    #[serde(default = "default_host")]
    pub host: String,

    /// Database port
    #[arg(short, long, default_value_t = 5432)]
    #[serde(default = "default_port")]
    pub port: u16,

    /// Database username
    #[arg(short, long, env = "PGUSER")]
    pub username: String,

    /// Database password
    #[arg(short = 'P', long, env = "PGPASSWORD", hide_env_values = true)]
    pub password: String,

    /// Database name
    #[arg(short = 'D', long)]
    pub dbname: String,
}

impl ConnectionArgs {
    pub fn descriptor(&self) -> ConnectionDescriptor {
        ConnectionDescriptor {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            password: self.password.clone(),
            dbname: self.dbname.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Args, Deserialize)]
pub struct DestinationArgs {
    /// Storage location
    #[arg(short, long, value_enum, default_value_t = StorageKind::Local)]
    #[serde(default)]
    pub storage: StorageKind,

    /// Local storage directory (defaults to local_backup_dir from the config)
    #[arg(short, long)]
    #[serde(default)]
    pub output: Option<PathBuf>,

    /// S3 bucket name (defaults to s3_storage.bucket_name or BUCKET_NAME)
    #[arg(short, long)]
    #[serde(default)]
    pub bucket: Option<String>,

    /// S3 key prefix
    #[arg(long)]
    #[serde(default)]
    pub prefix: Option<String>,
}

impl DestinationArgs {
    pub fn resolve(&self, config: &AppConfig) -> Result<Destination, SchedulerError> {
        match self.storage {
            StorageKind::Local => Ok(Destination::Local {
                directory: self
                    .output
                    .clone()
                    .unwrap_or_else(|| config.local_backup_dir.clone()),
            }),
            StorageKind::S3 => {
                let bucket = self
                    .bucket
                    .clone()
                    .or_else(|| config.s3.default_bucket.clone())
                    .filter(|b| !b.trim().is_empty())
                    .ok_or_else(|| {
                        SchedulerError::InvalidTarget(
                            "missing required target field: bucket (pass --bucket or set s3_storage.bucket_name)".into(),
                        )
                    })?;
                Ok(Destination::S3 {
                    bucket,
                    prefix: self.prefix.clone().or_else(|| config.s3.default_prefix.clone()),
                })
            }
        }
    }
}

/// Connection plus destination of one backup.
#[derive(Debug, Clone, Args, Deserialize)]
pub struct TargetArgs {
    #[command(flatten)]
    #[serde(flatten)]
    pub connection: ConnectionArgs,

    #[command(flatten)]
    #[serde(flatten)]
    pub destination: DestinationArgs,
}

impl TargetArgs {
    pub fn to_target(&self, config: &AppConfig) -> Result<BackupTarget, SchedulerError> {
        let connection = self.connection.descriptor();
        connection.validate().map_err(SchedulerError::InvalidTarget)?;
        Ok(BackupTarget {
            connection,
            destination: self.destination.resolve(config)?,
        })
    }
}

#[derive(Debug, Clone, Args)]
pub struct RestoreArgs {
    /// Dump file to restore; with --from-storage, the object name at the destination
    #[arg(short, long)]
    pub file: String,

    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// Fetch --file from the storage destination first
    #[arg(long)]
    pub from_storage: bool,

    #[command(flatten)]
    pub destination: DestinationArgs,

    /// Restore into an existing database instead of dropping and recreating it
    #[arg(long)]
    pub keep_existing: bool,
}
