// MinIO storage client and connection management

use crate::config::MinioConfig;
use crate::errors::StorageError;
use s3::bucket::Bucket;
use s3::creds::Credentials;
use s3::region::Region;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

/// MinIO client wrapper
#[derive(Clone, Debug)]
pub struct MinioClient {
    bucket: Arc<Bucket>,
    public_base_url: String,
}

impl MinioClient {
    /// Create a new MinIO client from configuration
    #[instrument(skip(config), fields(endpoint = %config.endpoint, bucket = %config.bucket))]
    pub async fn new(config: &MinioConfig) -> Result<Self, StorageError> {
        info!("Initializing MinIO client");

        // rust-s3 Region::Custom expects the endpoint without a scheme
        let endpoint = config
            .endpoint
            .trim_start_matches("http://")
            .trim_start_matches("https://")
            .to_string();

        let credentials = Credentials::new(
            Some(&config.access_key),
            Some(&config.secret_key),
            None,
            None,
            None,
        )
        .map_err(|e| {
            error!(error = %e, "Failed to create MinIO credentials");
            StorageError::MinioError(format!("Failed to create credentials: {}", e))
        })?;

        let region = Region::Custom {
            region: config.region.clone(),
            endpoint,
        };

        let bucket = Bucket::new(&config.bucket, region, credentials)
            .map_err(|e| {
                error!(error = %e, "Failed to create MinIO bucket");
                StorageError::MinioError(format!("Failed to create bucket: {}", e))
            })?
            .with_path_style();

        info!(bucket = %config.bucket, "MinIO client initialized successfully");

        Ok(Self {
            bucket: Arc::new(bucket),
            public_base_url: config.public_base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Health check for MinIO connection
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), StorageError> {
        debug!("Performing MinIO health check");

        self.bucket
            .list("".to_string(), Some("/".to_string()))
            .await
            .map(|_| ())
            .map_err(|e| {
                error!(error = %e, "MinIO health check failed");
                StorageError::MinioError(format!("Health check failed: {}", e))
            })
    }

    /// Store data at `path` with the given content type
    #[instrument(skip(self, data), fields(path = %path, size = data.len()))]
    pub async fn put_object(
        &self,
        path: &str,
        data: &[u8],
        content_type: &str,
    ) -> Result<(), StorageError> {
        let response = self
            .bucket
            .put_object_with_content_type(path, data, content_type)
            .await
            .map_err(|e| {
                error!(error = %e, path = %path, "Failed to store object to MinIO");
                StorageError::MinioError(format!("Failed to put object '{}': {}", path, e))
            })?;

        let status = response.status_code();
        if !(200..300).contains(&status) {
            error!(status, path = %path, "MinIO rejected object upload");
            return Err(StorageError::MinioError(format!(
                "Failed to put object '{}': status {}",
                path, status
            )));
        }

        debug!(path = %path, "Object stored successfully");
        Ok(())
    }

    /// Publicly reachable URL for an object path
    pub fn public_url(&self, path: &str) -> String {
        public_url(&self.public_base_url, path)
    }
}

fn public_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}
