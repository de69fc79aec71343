use std::path::{Path, PathBuf};

use aws_sdk_s3 as s3;
use s3::config::{Credentials, Region};
use s3::error::DisplayErrorContext;
use s3::primitives::ByteStream;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::config::S3Settings;
use crate::errors::StorageError;

/// Client for an S3-compatible object store (AWS, DigitalOcean Spaces, MinIO).
pub struct S3Storage {
    client: s3::Client,
}

impl S3Storage {
    /// Builds a client from explicit settings, falling back to the standard AWS
    /// environment/profile chain for anything not configured.
    pub async fn connect(settings: &S3Settings) -> Self {
        let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest());
        if let Some(region) = &settings.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &settings.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        if let (Some(key_id), Some(secret)) = (&settings.access_key_id, &settings.secret_access_key) {
            loader = loader.credentials_provider(Credentials::new(key_id, secret, None, None, "Static"));
        }
        let sdk_config = loader.load().await;

        let config = s3::config::Builder::from(&sdk_config)
            .force_path_style(settings.force_path_style)
            .build();
        debug!("S3 client ready (endpoint: {:?})", settings.endpoint_url);
        Self {
            client: s3::Client::from_conf(config),
        }
    }

    pub async fn put(&self, file_path: &Path, bucket: &str, key: &str) -> Result<String, StorageError> {
        info!("Uploading {} to s3://{}/{}", file_path.display(), bucket, key);

        let body = ByteStream::from_path(file_path)
            .await
            .map_err(|e| s3_error("read", bucket, key, e))?;

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| sdk_error("PutObject", bucket, key, e))?;

        info!("Uploaded {} to s3://{}/{}", file_path.display(), bucket, key);
        Ok(format!("s3://{bucket}/{key}"))
    }

    /// Every key under `prefix`, following continuation tokens.
    pub async fn list(&self, bucket: &str, prefix: Option<&str>) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .set_prefix(prefix.map(str::to_string))
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .map_err(|e| sdk_error("ListObjectsV2", bucket, prefix.unwrap_or_default(), e))?;

            keys.extend(output.contents().iter().filter_map(|o| o.key().map(str::to_string)));

            match output.next_continuation_token() {
                Some(token) if output.is_truncated().unwrap_or(false) => {
                    continuation_token = Some(token.to_string());
                }
                _ => break,
            }
        }

        debug!("Listed {} objects in s3://{}", keys.len(), bucket);
        Ok(keys)
    }

    pub async fn get(&self, bucket: &str, key: &str, destination_path: &Path) -> Result<PathBuf, StorageError> {
        info!("Downloading s3://{}/{} to {}", bucket, key, destination_path.display());

        if let Some(parent_dir) = destination_path.parent() {
            tokio::fs::create_dir_all(parent_dir)
                .await
                .map_err(|e| StorageError::io(parent_dir, e))?;
        }

        let mut object = match self.client.get_object().bucket(bucket).key(key).send().await {
            Ok(object) => object,
            Err(e) if e.as_service_error().is_some_and(|se| se.is_no_such_key()) => {
                return Err(StorageError::NotFound(format!("s3://{bucket}/{key}")));
            }
            Err(e) => return Err(sdk_error("GetObject", bucket, key, e)),
        };

        let mut output_file = File::create(destination_path)
            .await
            .map_err(|e| StorageError::io(destination_path, e))?;

        let mut total_bytes = 0;
        while let Some(chunk) = object
            .body
            .try_next()
            .await
            .map_err(|e| s3_error("GetObject", bucket, key, e))?
        {
            output_file
                .write_all(&chunk)
                .await
                .map_err(|e| StorageError::io(destination_path, e))?;
            total_bytes += chunk.len();
        }
        output_file
            .flush()
            .await
            .map_err(|e| StorageError::io(destination_path, e))?;

        info!("Downloaded {} bytes from s3://{}/{}", total_bytes, bucket, key);
        Ok(destination_path.to_path_buf())
    }
}

fn s3_error(operation: &'static str, bucket: &str, key: &str, err: impl std::fmt::Display) -> StorageError {
    StorageError::S3 {
        operation,
        bucket: bucket.to_string(),
        key: key.to_string(),
        message: err.to_string(),
    }
}

/// Short reason for the recorded result (top-level message plus root cause);
/// the SDK's full error context goes to the debug log.
fn sdk_error<E>(operation: &'static str, bucket: &str, key: &str, err: E) -> StorageError
where
    E: std::error::Error + 'static,
{
    debug!("S3 {} on s3://{}/{} failed: {}", operation, bucket, key, DisplayErrorContext(&err));

    let mut message = err.to_string();
    let mut root = err.source();
    while let Some(cause) = root.and_then(|c| c.source()) {
        root = Some(cause);
    }
    if let Some(cause) = root {
        let cause = cause.to_string();
        if !message.contains(&cause) {
            message = format!("{message}: {cause}");
        }
    }
    s3_error(operation, bucket, key, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("dispatch failure")]
    struct DispatchFailure(#[source] ConnectorError);

    #[derive(Debug, thiserror::Error)]
    #[error("io error")]
    struct ConnectorError(#[source] std::io::Error);

    #[test]
    fn sdk_errors_keep_top_message_and_root_cause() {
        let err = DispatchFailure(ConnectorError(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "Connection refused",
        )));

        let StorageError::S3 { message, .. } = sdk_error("PutObject", "db-backups", "a.sql.gz", err) else {
            panic!("expected an S3 error");
        };
        assert_eq!(message, "dispatch failure: Connection refused");
    }
}
