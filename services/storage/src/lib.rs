//! SnapVault Object Broker
//!
//! Access-control broker between the SnapVault photo sharing application and
//! its S3-compatible object store. Clients never hold backend credentials:
//! they receive short-lived, write-only upload URLs, and every read goes
//! through an owner/visibility policy check before bytes are streamed back.
//!
//! ## Features
//!
//! - **Upload Credentials**: presigned `PUT` URLs bound to a freshly minted
//!   `uploads/<uuid>` key, valid for 15 minutes
//! - **Metadata-Stored Policies**: the owner/visibility policy lives in the
//!   object's own metadata, no side table required
//! - **Gated Downloads**: not-found and access checks complete before any
//!   response header is written
//! - **Canonical Paths**: raw backend URLs are rewritten to
//!   `/api/objects/<key>`
//!
//! ## Architecture
//!
//! ```text
//!  Client                    Object Broker                     S3 Bucket
//! ┌────────┐  request-url   ┌──────────────┐  presign PUT     ┌──────────┐
//! │        │───────────────▶│ Credential   │─────────────────▶│ uploads/ │
//! │        │◀───────────────│ Issuer       │                  │  {uuid}  │
//! │        │   uploadURL    └──────────────┘                  └──────────┘
//! │        │                                                       ▲
//! │        │──────────────── PUT bytes ────────────────────────────┘
//! │        │                                                       │
//! │        │  GET /api/     ┌──────────────┐  head / get          │
//! │        │  objects/...   │ Download     │──────────────────────┘
//! │        │───────────────▶│ Broker       │
//! └────────┘                └──────────────┘
//!                                  │
//!                     ┌────────────┴────────────┐
//!                     ▼                         ▼
//!              ┌──────────────┐          ┌──────────────┐
//!              │ ACL Policy   │          │ Access       │
//!              │ Store        │          │ Evaluator    │
//!              └──────────────┘          └──────────────┘
//! ```

pub mod access;
pub mod acl;
pub mod api;
pub mod backend;
pub mod broker;
pub mod config;
pub mod credentials;
pub mod error;
pub mod memory_backend;
pub mod paths;
pub mod s3_backend;

pub use access::can_access;
pub use acl::{AclPolicy, Permission, Visibility, ACL_POLICY_METADATA_KEY};
pub use api::{AppState, CallerIdentity};
pub use backend::{ObjectBackend, ObjectBody, ObjectHandle, ObjectProperties, PresignedUpload};
pub use broker::{ObjectBroker, ObjectDownload};
pub use config::{BackendConfig, Config, ConfigError};
pub use credentials::{CredentialIssuer, UploadCredential, UPLOAD_CREDENTIAL_TTL};
pub use error::BrokerError;
pub use memory_backend::MemoryBackend;
pub use paths::{PathNormalizer, OBJECT_PATH_PREFIX};
pub use s3_backend::S3Backend;
