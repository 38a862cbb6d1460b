//! Object broker: upload credentials, policy attachment and gated downloads.

use crate::access::can_access;
use crate::acl::{self, AclPolicy, Permission, Visibility};
use crate::backend::{ObjectBackend, ObjectBody, ObjectHandle};
use crate::config::BackendConfig;
use crate::credentials::{CredentialIssuer, UploadCredential};
use crate::error::BrokerError;
use crate::paths::{object_key, PathNormalizer, OBJECT_PATH_PREFIX};
use crate::s3_backend::S3Backend;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Content type served when the object has none recorded
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// A download that has passed every check and is ready to stream.
///
/// Producing one of these is the commit point: all lookups, access checks
/// and metadata fetches are complete and the body is already open, so the
/// HTTP layer can write headers without any later failure path.
pub struct ObjectDownload {
    pub content_type: String,
    /// Body size, when the backend reports one
    pub content_length: Option<u64>,
    pub cache_control: String,
    pub body: ObjectBody,
}

impl std::fmt::Debug for ObjectDownload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectDownload")
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .field("cache_control", &self.cache_control)
            .finish_non_exhaustive()
    }
}

/// Access-control broker in front of the object store.
///
/// Built once at startup and shared; holds no mutable state.
pub struct ObjectBroker {
    backend: Arc<dyn ObjectBackend>,
    issuer: CredentialIssuer,
    normalizer: PathNormalizer,
    cache_ttl: Duration,
}

impl ObjectBroker {
    pub fn new(
        backend: Arc<dyn ObjectBackend>,
        normalizer: PathNormalizer,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            issuer: CredentialIssuer::new(backend.clone()),
            backend,
            normalizer,
            cache_ttl,
        }
    }

    /// Broker backed by S3 using resolved configuration
    pub fn from_config(config: &BackendConfig, cache_ttl: Duration) -> Self {
        Self::new(
            Arc::new(S3Backend::new(config)),
            PathNormalizer::new(config),
            cache_ttl,
        )
    }

    pub fn backend(&self) -> &Arc<dyn ObjectBackend> {
        &self.backend
    }

    /// Mint a signed upload URL for a fresh object
    pub async fn issue_upload_credential(&self) -> Result<UploadCredential, BrokerError> {
        self.issuer.issue_upload_credential().await
    }

    /// Canonicalize a raw object URL; see [`PathNormalizer::normalize`]
    pub fn normalize(&self, raw: &str) -> String {
        self.normalizer.normalize(raw)
    }

    /// Resolve a live handle for a canonical object path
    pub async fn locate(&self, object_path: &str) -> Result<ObjectHandle, BrokerError> {
        let key = object_key(object_path).ok_or(BrokerError::NotFound)?;
        ObjectHandle::locate(self.backend.clone(), key).await
    }

    /// Check access to an object and open it for streaming.
    ///
    /// Fails `NotFound` for paths outside the managed namespace or missing
    /// objects, and `AccessDenied` before any byte of the body is read.
    #[instrument(skip(self, requester), fields(requester = requester.unwrap_or("anonymous")))]
    pub async fn serve(
        &self,
        object_path: &str,
        requester: Option<&str>,
    ) -> Result<ObjectDownload, BrokerError> {
        let result = self.prepare_download(object_path, requester).await;

        match &result {
            Ok(download) => {
                metrics::counter!("broker.downloads.served").increment(1);
                debug!(content_length = ?download.content_length, "Serving object");
            }
            Err(BrokerError::NotFound) => {
                metrics::counter!("broker.downloads.not_found").increment(1);
            }
            Err(BrokerError::AccessDenied) => {
                metrics::counter!("broker.downloads.denied").increment(1);
                info!("Object access denied");
            }
            Err(_) => {}
        }

        result
    }

    async fn prepare_download(
        &self,
        object_path: &str,
        requester: Option<&str>,
    ) -> Result<ObjectDownload, BrokerError> {
        let handle = self.locate(object_path).await?;

        let policy = acl::get_policy(&handle);
        if !can_access(policy.as_ref(), requester, Permission::Read) {
            return Err(BrokerError::AccessDenied);
        }

        let properties = handle.properties();

        // Cacheability is independent of accessibility: an object without a
        // policy is readable by anyone but still cached privately.
        let visibility = policy
            .map(|p| p.visibility)
            .unwrap_or(Visibility::Private);

        let body = handle.open().await?.ok_or_else(|| {
            BrokerError::Transport(anyhow::anyhow!(
                "Unable to stream object {}",
                handle.key()
            ))
        })?;

        Ok(ObjectDownload {
            content_type: properties
                .content_type
                .clone()
                .filter(|ct| !ct.is_empty())
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            content_length: properties.content_length,
            cache_control: format!(
                "{}, max-age={}",
                visibility.as_str(),
                self.cache_ttl.as_secs()
            ),
            body,
        })
    }

    /// Attach `policy` to the object behind `path` if it is managed storage.
    ///
    /// Returns the normalized path. Paths that point outside the managed
    /// namespace (external URLs) are returned as-is with no policy write.
    #[instrument(skip(self, policy), fields(owner = %policy.owner))]
    pub async fn attach_policy_if_managed(
        &self,
        path: &str,
        policy: &AclPolicy,
    ) -> Result<String, BrokerError> {
        let normalized = self.normalize(path);
        if !normalized.starts_with(OBJECT_PATH_PREFIX) {
            debug!(path = %normalized, "Path outside managed storage, no policy attached");
            return Ok(normalized);
        }

        let mut handle = self.locate(&normalized).await?;
        acl::set_policy(&mut handle, policy).await?;

        metrics::counter!("broker.policies.attached").increment(1);
        Ok(normalized)
    }

    /// Delete the object behind a canonical path
    #[instrument(skip(self))]
    pub async fn delete_object(&self, object_path: &str) -> Result<(), BrokerError> {
        let handle = self.locate(object_path).await?;
        handle.delete().await?;

        info!(key = %handle.key(), "Object deleted");
        Ok(())
    }
}
