//! Storage backend abstraction.
//!
//! The broker never talks to S3 directly; it goes through [`ObjectBackend`]
//! so the same access logic runs against [`crate::S3Backend`] in production
//! and [`crate::MemoryBackend`] in tests.

use crate::error::BrokerError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Streamed object body
pub type ObjectBody = BoxStream<'static, std::io::Result<Bytes>>;

/// Object properties returned by a metadata fetch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectProperties {
    /// MIME type recorded at upload, if any
    pub content_type: Option<String>,
    /// Size of the object body in bytes
    pub content_length: Option<u64>,
    /// User-defined metadata key/value pairs
    pub metadata: HashMap<String, String>,
}

/// A signed request authorizing a single upload
#[derive(Debug, Clone)]
pub struct PresignedUpload {
    /// Fully signed URL the client sends its bytes to
    pub url: String,
    /// HTTP method the signature is bound to
    pub method: String,
}

/// Operations the broker needs from an object store.
///
/// Missing objects are reported as [`BrokerError::NotFound`]; every other
/// failure is [`BrokerError::Transport`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Whether the container exists
    async fn container_exists(&self) -> Result<bool, BrokerError>;

    /// Create the container if it does not exist yet. Idempotent.
    async fn ensure_container(&self) -> Result<(), BrokerError>;

    /// Sign a write-only request for `key`. Does not contact the object.
    async fn presign_upload(
        &self,
        key: &str,
        starts_at: SystemTime,
        expires_in: Duration,
    ) -> Result<PresignedUpload, BrokerError>;

    /// Fetch content type, length and user metadata. `NotFound` if absent.
    async fn properties(&self, key: &str) -> Result<ObjectProperties, BrokerError>;

    /// Replace the user metadata of an object, keeping its body.
    ///
    /// `content_type` is written back alongside the metadata; callers pass the
    /// value they already hold so the backend needs no extra lookup.
    async fn replace_metadata(
        &self,
        key: &str,
        content_type: Option<String>,
        metadata: HashMap<String, String>,
    ) -> Result<(), BrokerError>;

    /// Open the object body. `None` when the backend yields no readable stream.
    async fn open(&self, key: &str) -> Result<Option<ObjectBody>, BrokerError>;

    /// Delete an object
    async fn delete(&self, key: &str) -> Result<(), BrokerError>;
}

/// Live handle to an object confirmed to exist at lookup time.
///
/// The properties fetched by the existence check are kept on the handle, so
/// one lookup serves the policy read, the headers and the metadata rewrite.
#[derive(Clone)]
pub struct ObjectHandle {
    backend: Arc<dyn ObjectBackend>,
    key: String,
    properties: ObjectProperties,
}

impl ObjectHandle {
    /// Resolve a handle for `key`, failing with `NotFound` if the object is absent.
    pub async fn locate(backend: Arc<dyn ObjectBackend>, key: &str) -> Result<Self, BrokerError> {
        let properties = backend.properties(key).await?;

        Ok(Self {
            backend,
            key: key.to_string(),
            properties,
        })
    }

    /// Storage key of the object
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Properties as of lookup, including metadata written through this handle
    pub fn properties(&self) -> &ObjectProperties {
        &self.properties
    }

    pub async fn replace_metadata(
        &mut self,
        metadata: HashMap<String, String>,
    ) -> Result<(), BrokerError> {
        self.backend
            .replace_metadata(&self.key, self.properties.content_type.clone(), metadata.clone())
            .await?;
        self.properties.metadata = metadata;
        Ok(())
    }

    pub async fn open(&self) -> Result<Option<ObjectBody>, BrokerError> {
        self.backend.open(&self.key).await
    }

    pub async fn delete(&self) -> Result<(), BrokerError> {
        self.backend.delete(&self.key).await
    }
}

impl std::fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectHandle")
            .field("key", &self.key)
            .finish()
    }
}
