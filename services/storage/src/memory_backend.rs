//! In-memory object backend.

use crate::backend::{ObjectBackend, ObjectBody, ObjectProperties, PresignedUpload};
use crate::error::BrokerError;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::{Duration, SystemTime};
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    content_type: Option<String>,
    metadata: HashMap<String, String>,
}

/// In-memory object backend backed by a `RwLock<HashMap>`.
///
/// Useful for tests and local development. Tracks how many times an object
/// body has been opened so callers can assert that no bytes were read.
pub struct MemoryBackend {
    container: String,
    container_created: AtomicBool,
    objects: RwLock<HashMap<String, StoredObject>>,
    opens: AtomicUsize,
}

impl MemoryBackend {
    /// Create an empty backend. The container does not exist until
    /// [`ObjectBackend::ensure_container`] is called.
    pub fn new(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            container_created: AtomicBool::new(false),
            objects: RwLock::new(HashMap::new()),
            opens: AtomicUsize::new(0),
        }
    }

    /// Store an object as if a client had completed an upload.
    pub fn insert(&self, key: &str, data: impl Into<Bytes>, content_type: Option<&str>) {
        let mut map = self.objects.write().expect("lock poisoned");
        map.insert(
            key.to_string(),
            StoredObject {
                data: data.into(),
                content_type: content_type.map(str::to_string),
                metadata: HashMap::new(),
            },
        );
    }

    /// Current user metadata of an object
    pub fn metadata(&self, key: &str) -> Option<HashMap<String, String>> {
        let map = self.objects.read().expect("lock poisoned");
        map.get(key).map(|o| o.metadata.clone())
    }

    /// Number of times any object body has been opened
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Whether `ensure_container` has run
    pub fn container_created(&self) -> bool {
        self.container_created.load(Ordering::SeqCst)
    }

    /// Keys currently stored
    pub fn keys(&self) -> Vec<String> {
        let map = self.objects.read().expect("lock poisoned");
        map.keys().cloned().collect()
    }
}

#[async_trait]
impl ObjectBackend for MemoryBackend {
    async fn container_exists(&self) -> Result<bool, BrokerError> {
        Ok(self.container_created())
    }

    async fn ensure_container(&self) -> Result<(), BrokerError> {
        self.container_created.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn presign_upload(
        &self,
        key: &str,
        starts_at: SystemTime,
        expires_in: Duration,
    ) -> Result<PresignedUpload, BrokerError> {
        let starts_at: DateTime<Utc> = starts_at.into();
        Ok(PresignedUpload {
            url: format!(
                "memory://{}/{}?starts={}&expires-in={}",
                self.container,
                key,
                starts_at.timestamp(),
                expires_in.as_secs()
            ),
            method: "PUT".to_string(),
        })
    }

    async fn properties(&self, key: &str) -> Result<ObjectProperties, BrokerError> {
        let map = self.objects.read().expect("lock poisoned");
        let object = map.get(key).ok_or(BrokerError::NotFound)?;
        Ok(ObjectProperties {
            content_type: object.content_type.clone(),
            content_length: Some(object.data.len() as u64),
            metadata: object.metadata.clone(),
        })
    }

    async fn replace_metadata(
        &self,
        key: &str,
        content_type: Option<String>,
        metadata: HashMap<String, String>,
    ) -> Result<(), BrokerError> {
        let mut map = self.objects.write().expect("lock poisoned");
        let object = map.get_mut(key).ok_or(BrokerError::NotFound)?;
        object.content_type = content_type;
        object.metadata = metadata;
        debug!(key = %key, "replaced object metadata in memory");
        Ok(())
    }

    async fn open(&self, key: &str) -> Result<Option<ObjectBody>, BrokerError> {
        let data = {
            let map = self.objects.read().expect("lock poisoned");
            match map.get(key) {
                Some(object) => object.data.clone(),
                None => return Ok(None),
            }
        };

        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Some(futures::stream::once(async move { Ok::<_, std::io::Error>(data) }).boxed()))
    }

    async fn delete(&self, key: &str) -> Result<(), BrokerError> {
        let mut map = self.objects.write().expect("lock poisoned");
        map.remove(key);
        debug!(key = %key, "deleted object from memory");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replace_metadata_keeps_body() {
        let backend = MemoryBackend::new("photos");
        backend.insert("uploads/a", b"jpeg bytes".to_vec(), Some("image/jpeg"));

        let mut metadata = HashMap::new();
        metadata.insert("camera".to_string(), "x100".to_string());
        backend
            .replace_metadata("uploads/a", Some("image/jpeg".to_string()), metadata)
            .await
            .unwrap();

        let props = backend.properties("uploads/a").await.unwrap();
        assert_eq!(props.content_type.as_deref(), Some("image/jpeg"));
        assert_eq!(props.content_length, Some(10));
        assert_eq!(props.metadata.get("camera").map(String::as_str), Some("x100"));
    }

    #[tokio::test]
    async fn test_missing_object() {
        let backend = MemoryBackend::new("photos");
        assert!(matches!(
            backend.properties("uploads/none").await,
            Err(BrokerError::NotFound)
        ));
        assert!(backend.open("uploads/none").await.unwrap().is_none());
        assert_eq!(backend.open_count(), 0);
    }
}
