use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use log::{debug, info};

use super::{DriveError, ObjectStore};
use crate::core::config::DriveConfig;

/// Any S3-compatible endpoint (MinIO, R2, AWS) with path-style addressing.
pub struct S3Store {
    client: S3Client,
    bucket: String,
}

impl S3Store {
    pub async fn connect(config: &DriveConfig) -> Result<Self, DriveError> {
        let endpoint = if config.server.ends_with('/') {
            config.server.clone()
        } else {
            format!("{}/", config.server)
        };

        let base_config = aws_config::defaults(BehaviorVersion::latest())
            .endpoint_url(endpoint)
            .region(aws_config::Region::new(config.region.clone()))
            .credentials_provider(aws_sdk_s3::config::Credentials::new(
                config.access_key.clone(),
                config.secret_key.clone(),
                None,
                None,
                "static",
            ))
            .load()
            .await;

        let s3_config = S3ConfigBuilder::from(&base_config)
            .force_path_style(true)
            .build();

        let client = S3Client::from_conf(s3_config);
        if client.head_bucket().bucket(&config.bucket).send().await.is_err() {
            info!("Creating bucket {}", config.bucket);
            client
                .create_bucket()
                .bucket(&config.bucket)
                .send()
                .await
                .map_err(|e| DriveError::Storage(e.to_string()))?;
        }

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
        })
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), DriveError> {
        debug!("Uploading {} bytes to s3://{}/{}", bytes.len(), self.bucket, key);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| DriveError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, DriveError> {
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|s| s.is_no_such_key()) {
                    DriveError::NotFound(key.to_string())
                } else {
                    DriveError::Storage(e.to_string())
                }
            })?;
        let data = object
            .body
            .collect()
            .await
            .map_err(|e| DriveError::Storage(e.to_string()))?;
        Ok(data.into_bytes().to_vec())
    }

    async fn delete(&self, key: &str) -> Result<(), DriveError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| DriveError::Storage(e.to_string()))?;
        Ok(())
    }
}
