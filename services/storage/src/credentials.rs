use crate::backend::ObjectBackend;
use crate::error::BrokerError;
use crate::paths::object_path;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{info, instrument};
use uuid::Uuid;

/// Lifetime of a signed upload URL, enforced by the backend
pub const UPLOAD_CREDENTIAL_TTL: Duration = Duration::from_secs(15 * 60);

/// Key prefix for client uploads
pub const UPLOAD_KEY_PREFIX: &str = "uploads/";

/// Signed upload credential handed to a client
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadCredential {
    /// URL the client PUTs its bytes to
    #[serde(rename = "uploadURL")]
    pub upload_url: String,
    /// Canonical path of the object once uploaded
    pub object_path: String,
    /// When the upload URL stops working
    pub expires_at: DateTime<Utc>,
}

/// Mints write-only upload URLs for fresh object keys.
///
/// Credentials are never persisted and cannot be revoked; they lapse on
/// their own after [`UPLOAD_CREDENTIAL_TTL`].
pub struct CredentialIssuer {
    backend: Arc<dyn ObjectBackend>,
}

impl CredentialIssuer {
    pub fn new(backend: Arc<dyn ObjectBackend>) -> Self {
        Self { backend }
    }

    /// Issue a credential for a new, never-used object key.
    ///
    /// The object itself is not contacted; it does not exist yet.
    #[instrument(skip(self))]
    pub async fn issue_upload_credential(&self) -> Result<UploadCredential, BrokerError> {
        self.backend.ensure_container().await?;

        let object_id = Uuid::new_v4();
        let key = format!("{UPLOAD_KEY_PREFIX}{object_id}");

        let starts_at = SystemTime::now();
        let presigned = self
            .backend
            .presign_upload(&key, starts_at, UPLOAD_CREDENTIAL_TTL)
            .await?;

        let credential = UploadCredential {
            upload_url: presigned.url,
            object_path: object_path(&key),
            expires_at: DateTime::<Utc>::from(starts_at + UPLOAD_CREDENTIAL_TTL),
        };

        metrics::counter!("broker.credentials.issued").increment(1);
        info!(object_path = %credential.object_path, "Upload credential issued");

        Ok(credential)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockObjectBackend;
    use crate::memory_backend::MemoryBackend;
    use std::collections::HashSet;

    #[tokio::test]
    async fn test_issue_creates_container_and_canonical_path() {
        let backend = Arc::new(MemoryBackend::new("photos"));
        let issuer = CredentialIssuer::new(backend.clone());

        let credential = issuer.issue_upload_credential().await.unwrap();

        assert!(backend.container_created());
        let key = credential
            .object_path
            .strip_prefix("/api/objects/uploads/")
            .unwrap();
        assert!(Uuid::parse_str(key).is_ok());
        assert!(credential
            .upload_url
            .starts_with(&format!("memory://photos/uploads/{key}?")));
        assert!(credential.upload_url.contains("expires-in=900"));
        // Nothing is written at issuance time
        assert!(backend.keys().is_empty());
    }

    #[tokio::test]
    async fn test_expiry_within_fifteen_minutes() {
        let issuer = CredentialIssuer::new(Arc::new(MemoryBackend::new("photos")));
        let before = Utc::now();

        let credential = issuer.issue_upload_credential().await.unwrap();
        let after = Utc::now();

        assert!(credential.expires_at <= after + chrono::Duration::minutes(15));
        assert!(credential.expires_at >= before + chrono::Duration::minutes(15));
    }

    #[tokio::test]
    async fn test_object_paths_are_unique() {
        let issuer = CredentialIssuer::new(Arc::new(MemoryBackend::new("photos")));

        let mut paths = HashSet::new();
        for _ in 0..200 {
            let credential = issuer.issue_upload_credential().await.unwrap();
            assert!(paths.insert(credential.object_path));
        }
        assert_eq!(paths.len(), 200);
    }

    #[tokio::test]
    async fn test_backend_failure_propagates() {
        let mut backend = MockObjectBackend::new();
        backend
            .expect_ensure_container()
            .returning(|| Err(BrokerError::Transport(anyhow::anyhow!("bucket unreachable"))));
        backend.expect_presign_upload().never();

        let issuer = CredentialIssuer::new(Arc::new(backend));

        assert!(matches!(
            issuer.issue_upload_credential().await,
            Err(BrokerError::Transport(_))
        ));
    }

    #[test]
    fn test_credential_wire_format() {
        let credential = UploadCredential {
            upload_url: "https://example.test/photos/uploads/abc?sig".to_string(),
            object_path: "/api/objects/uploads/abc".to_string(),
            expires_at: Utc::now(),
        };

        let json = serde_json::to_value(&credential).unwrap();
        assert_eq!(json["uploadURL"], "https://example.test/photos/uploads/abc?sig");
        assert_eq!(json["objectPath"], "/api/objects/uploads/abc");
        assert!(json.get("expiresAt").is_some());
    }
}
