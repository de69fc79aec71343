//! Storage sinks: where finished dump artifacts are placed and where restores fetch them from.

pub(crate) mod local;
pub(crate) mod s3;

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::info;

use crate::config::S3Settings;
use crate::errors::StorageError;

use self::s3::S3Storage;

/// Named location for backup artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Local { directory: PathBuf },
    S3 { bucket: String, prefix: Option<String> },
}

impl Destination {
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::S3 { .. })
    }

    /// Object key for an artifact: `<prefix>/<file name>`, or just the file name.
    pub fn object_key(&self, file_name: &str) -> String {
        match self {
            Self::S3 { prefix: Some(prefix), .. } if !prefix.trim_matches('/').is_empty() => {
                format!("{}/{}", prefix.trim_matches('/'), file_name)
            }
            _ => file_name.to_string(),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local { directory } => write!(f, "local:{}", directory.display()),
            Self::S3 { bucket, prefix } => {
                write!(f, "s3://{}/{}", bucket, prefix.as_deref().unwrap_or_default())
            }
        }
    }
}

/// Persists artifacts to a [`Destination`] and retrieves them by name.
#[async_trait]
pub trait StorageSink: Send + Sync {
    /// Places the artifact and returns its final location.
    async fn put(&self, artifact: &Path, destination: &Destination) -> Result<String, StorageError>;

    async fn list(&self, destination: &Destination) -> Result<Vec<String>, StorageError>;

    /// Copies the named object into `download_to` and returns the local path.
    async fn get(
        &self,
        name: &str,
        destination: &Destination,
        download_to: &Path,
    ) -> Result<PathBuf, StorageError>;
}

/// Sink dispatching on the destination kind. The S3 client is built on first use
/// so purely local runs never touch AWS configuration.
pub struct Storage {
    s3_settings: S3Settings,
    s3: OnceCell<S3Storage>,
}

impl Storage {
    pub fn new(s3_settings: S3Settings) -> Self {
        Self {
            s3_settings,
            s3: OnceCell::new(),
        }
    }

    async fn s3(&self) -> &S3Storage {
        self.s3
            .get_or_init(|| S3Storage::connect(&self.s3_settings))
            .await
    }
}

#[async_trait]
impl StorageSink for Storage {
    async fn put(&self, artifact: &Path, destination: &Destination) -> Result<String, StorageError> {
        match destination {
            Destination::Local { directory } => local::put(artifact, directory).await,
            Destination::S3 { bucket, .. } => {
                let file_name = artifact_file_name(artifact)?;
                let key = destination.object_key(file_name);
                let location = self.s3().await.put(artifact, bucket, &key).await?;
                // The local copy was only staging for the upload.
                tokio::fs::remove_file(artifact)
                    .await
                    .map_err(|e| StorageError::io(artifact, e))?;
                Ok(location)
            }
        }
    }

    async fn list(&self, destination: &Destination) -> Result<Vec<String>, StorageError> {
        match destination {
            Destination::Local { directory } => local::list(directory).await,
            Destination::S3 { bucket, prefix } => {
                self.s3().await.list(bucket, prefix.as_deref()).await
            }
        }
    }

    async fn get(
        &self,
        name: &str,
        destination: &Destination,
        download_to: &Path,
    ) -> Result<PathBuf, StorageError> {
        match destination {
            Destination::Local { directory } => local::get(directory, name, download_to).await,
            Destination::S3 { bucket, .. } => {
                self.s3().await.get(bucket, name, download_to).await
            }
        }
    }
}

fn artifact_file_name(artifact: &Path) -> Result<&str, StorageError> {
    artifact
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| StorageError::Config(format!("artifact path has no file name: {}", artifact.display())))
}

/// `storage list`: prints every object at the destination, one per line.
pub async fn run_list_flow(sink: &dyn StorageSink, destination: &Destination) -> anyhow::Result<()> {
    let objects = sink.list(destination).await?;
    info!("Listed {} objects at {}", objects.len(), destination);
    for object in objects {
        println!("{object}");
    }
    Ok(())
}
