use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, info};

use crate::errors::StorageError;

/// Moves an artifact into `directory`. An artifact already there is left in place.
pub async fn put(artifact: &Path, directory: &Path) -> Result<String, StorageError> {
    fs::create_dir_all(directory)
        .await
        .map_err(|e| StorageError::io(directory, e))?;

    let file_name = artifact
        .file_name()
        .ok_or_else(|| StorageError::Config(format!("artifact path has no file name: {}", artifact.display())))?;
    let dest_path = directory.join(file_name);

    if artifact.parent() == Some(directory) {
        debug!("Artifact {} already in local storage", artifact.display());
        return Ok(dest_path.display().to_string());
    }

    if fs::rename(artifact, &dest_path).await.is_err() {
        // rename fails across filesystems
        fs::copy(artifact, &dest_path)
            .await
            .map_err(|e| StorageError::io(&dest_path, e))?;
        fs::remove_file(artifact)
            .await
            .map_err(|e| StorageError::io(artifact, e))?;
    }

    info!("Stored {} in local storage as {}", artifact.display(), dest_path.display());
    Ok(dest_path.display().to_string())
}

/// File names in `directory`, sorted.
pub async fn list(directory: &Path) -> Result<Vec<String>, StorageError> {
    let mut entries = fs::read_dir(directory)
        .await
        .map_err(|e| StorageError::io(directory, e))?;

    let mut objects = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| StorageError::io(directory, e))?
    {
        let is_file = entry
            .file_type()
            .await
            .map(|t| t.is_file())
            .unwrap_or(false);
        if is_file {
            objects.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    objects.sort();
    debug!("Listed {} files in local storage directory {}", objects.len(), directory.display());
    Ok(objects)
}

pub async fn get(directory: &Path, name: &str, download_to: &Path) -> Result<PathBuf, StorageError> {
    let src_path = directory.join(name);
    if !fs::try_exists(&src_path).await.unwrap_or(false) {
        return Err(StorageError::NotFound(src_path.display().to_string()));
    }
    if let Some(parent) = download_to.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| StorageError::io(parent, e))?;
    }
    fs::copy(&src_path, download_to)
        .await
        .map_err(|e| StorageError::io(download_to, e))?;
    info!("Copied {} from local storage to {}", src_path.display(), download_to.display());
    Ok(download_to.to_path_buf())
}
