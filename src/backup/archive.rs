// pgguard/src/backup/archive.rs
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::errors::ExecutionError;

/// True for `.gz` files.
pub fn is_gzip(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("gz"))
}

/// Gzips `source` into `dest_path` and removes `source`.
///
/// # Arguments
/// * `source` - Plain SQL dump produced by `pg_dump`.
/// * `dest_path` - The full path where the `.sql.gz` file will be created.
///
/// # Returns
/// Path to the compressed file.
pub fn gzip_file(source: &Path, dest_path: &Path) -> Result<PathBuf, ExecutionError> {
    debug!("Compressing {} to {}", source.display(), dest_path.display());

    let input = File::open(source)
        .map_err(|e| ExecutionError::io(format!("opening dump {}", source.display()), e))?;
    let output = File::create(dest_path)
        .map_err(|e| ExecutionError::io(format!("creating archive {}", dest_path.display()), e))?;

    let mut encoder = GzEncoder::new(BufWriter::new(output), Compression::default());
    let written = io::copy(&mut BufReader::new(input), &mut encoder)
        .and_then(|_| encoder.finish())
        .and_then(|mut writer| writer.flush());
    if let Err(e) = written {
        // Cleanup on failure
        if let Err(remove_err) = std::fs::remove_file(dest_path) {
            debug!("Could not remove partial archive {}: {}", dest_path.display(), remove_err);
        }
        return Err(ExecutionError::io(format!("compressing {}", source.display()), e));
    }

    std::fs::remove_file(source)
        .map_err(|e| ExecutionError::io(format!("removing uncompressed dump {}", source.display()), e))?;

    Ok(dest_path.to_path_buf())
}

/// Decompresses a `.gz` dump into `dest_path`, leaving the archive untouched.
pub fn gunzip_file(archive_path: &Path, dest_path: &Path) -> Result<PathBuf, ExecutionError> {
    debug!("Decompressing {} to {}", archive_path.display(), dest_path.display());

    let input = File::open(archive_path)
        .map_err(|e| ExecutionError::io(format!("opening archive {}", archive_path.display()), e))?;
    let output = File::create(dest_path)
        .map_err(|e| ExecutionError::io(format!("creating {}", dest_path.display()), e))?;

    let mut decoder = GzDecoder::new(BufReader::new(input));
    let mut writer = BufWriter::new(output);
    io::copy(&mut decoder, &mut writer)
        .and_then(|_| writer.flush())
        .map_err(|e| ExecutionError::io(format!("decompressing {}", archive_path.display()), e))?;

    Ok(dest_path.to_path_buf())
}

/// Runs [`gzip_file`] on the blocking pool.
pub async fn compress_dump(sql_path: PathBuf, gz_path: PathBuf) -> Result<PathBuf, ExecutionError> {
    tokio::task::spawn_blocking(move || gzip_file(&sql_path, &gz_path))
        .await
        .map_err(|e| ExecutionError::io("compressing dump", io::Error::other(e)))?
}

/// Runs [`gunzip_file`] on the blocking pool.
pub async fn decompress_dump(archive_path: PathBuf, dest_path: PathBuf) -> Result<PathBuf, ExecutionError> {
    tokio::task::spawn_blocking(move || gunzip_file(&archive_path, &dest_path))
        .await
        .map_err(|e| ExecutionError::io("decompressing dump", io::Error::other(e)))?
}
