use crate::backend::{ObjectBackend, ObjectBody, ObjectProperties, PresignedUpload};
use crate::config::BackendConfig;
use crate::error::BrokerError;
use anyhow::Context;
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::config::{Builder as S3ConfigBuilder, Credentials};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration, MetadataDirective};
use aws_sdk_s3::Client as S3Client;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::{Duration, SystemTime};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, instrument};
use urlencoding::encode;

/// S3-compatible object backend
pub struct S3Backend {
    client: S3Client,
    bucket: String,
    region: String,
}

impl S3Backend {
    /// Create a new S3 backend from resolved configuration.
    ///
    /// Credentials come from the resolved configuration only; the ambient
    /// AWS credential chain is never consulted.
    pub fn new(config: &BackendConfig) -> Self {
        let credentials = Credentials::new(
            config.access_key_id.clone(),
            config.secret_access_key.clone(),
            None,
            None,
            "snapvault-config",
        );

        let mut s3_config_builder = S3ConfigBuilder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.container,
            region = %config.region,
            "S3 backend initialized"
        );

        Self {
            client,
            bucket: config.container.clone(),
            region: config.region.clone(),
        }
    }
}

#[async_trait]
impl ObjectBackend for S3Backend {
    async fn container_exists(&self) -> Result<bool, BrokerError> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    Err(BrokerError::Transport(
                        anyhow::Error::new(e).context("Failed to check bucket existence"),
                    ))
                }
            }
        }
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn ensure_container(&self) -> Result<(), BrokerError> {
        if self.container_exists().await? {
            return Ok(());
        }

        let mut request = self.client.create_bucket().bucket(&self.bucket);

        // us-east-1 rejects an explicit location constraint
        if self.region != "us-east-1" {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }

        match request.send().await {
            Ok(_) => {
                info!(bucket = %self.bucket, "Created bucket");
                Ok(())
            }
            Err(e) => {
                // Lost a creation race with another request
                if e.as_service_error()
                    .map(|e| e.is_bucket_already_owned_by_you() || e.is_bucket_already_exists())
                    .unwrap_or(false)
                {
                    Ok(())
                } else {
                    Err(BrokerError::Transport(
                        anyhow::Error::new(e).context("Failed to create bucket"),
                    ))
                }
            }
        }
    }

    async fn presign_upload(
        &self,
        key: &str,
        starts_at: SystemTime,
        expires_in: Duration,
    ) -> Result<PresignedUpload, BrokerError> {
        let presigning_config = PresigningConfig::builder()
            .start_time(starts_at)
            .expires_in(expires_in)
            .build()
            .context("Failed to create presigning config")
            .map_err(BrokerError::Transport)?;

        // A presigned PUT is bound to this method and key: it cannot read,
        // list or delete.
        let presigned = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .context("Failed to generate presigned upload URL")
            .map_err(BrokerError::Transport)?;

        Ok(PresignedUpload {
            url: presigned.uri().to_string(),
            method: presigned.method().to_string(),
        })
    }

    async fn properties(&self, key: &str) -> Result<ObjectProperties, BrokerError> {
        let head = match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(head) => head,
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    return Err(BrokerError::NotFound);
                }
                return Err(BrokerError::Transport(
                    anyhow::Error::new(e).context("Failed to fetch object properties"),
                ));
            }
        };

        Ok(ObjectProperties {
            content_type: head.content_type().map(str::to_string),
            content_length: head
                .content_length()
                .and_then(|len| u64::try_from(len).ok()),
            metadata: head.metadata().cloned().unwrap_or_default(),
        })
    }

    #[instrument(skip(self, metadata), fields(bucket = %self.bucket))]
    async fn replace_metadata(
        &self,
        key: &str,
        content_type: Option<String>,
        metadata: HashMap<String, String>,
    ) -> Result<(), BrokerError> {
        // S3 metadata is immutable; rewrite the object onto itself. The copy
        // drops the content type unless it is restated.
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .key(key)
            .copy_source(copy_source(&self.bucket, key))
            .metadata_directive(MetadataDirective::Replace)
            .set_content_type(content_type)
            .set_metadata(Some(metadata))
            .send()
            .await
            .context("Failed to update object metadata")
            .map_err(BrokerError::Transport)?;

        debug!(key = %key, "Object metadata replaced");
        Ok(())
    }

    async fn open(&self, key: &str) -> Result<Option<ObjectBody>, BrokerError> {
        match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => {
                let stream = ReaderStream::new(output.body.into_async_read());
                Ok(Some(stream.boxed()))
            }
            Err(e) => {
                // Deleted between the existence check and the read
                if e.as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    Ok(None)
                } else {
                    Err(BrokerError::Transport(
                        anyhow::Error::new(e).context("Failed to download object"),
                    ))
                }
            }
        }
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn delete(&self, key: &str) -> Result<(), BrokerError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .context("Failed to delete object")
            .map_err(BrokerError::Transport)?;

        debug!(key = %key, "Object deleted");
        Ok(())
    }
}

/// Build the `x-amz-copy-source` value: `<bucket>/<key>` with each key
/// segment percent-encoded and the separators kept.
fn copy_source(bucket: &str, key: &str) -> String {
    let encoded_key = key.split('/').map(encode).collect::<Vec<_>>().join("/");
    format!("{bucket}/{encoded_key}")
}
