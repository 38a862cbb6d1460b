//! Object access policies, stored as metadata on the object itself.
//!
//! There is no side table: a policy lives under [`ACL_POLICY_METADATA_KEY`]
//! in the object's user metadata, serialized as JSON.

use crate::backend::ObjectHandle;
use crate::error::BrokerError;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Metadata key holding the serialized policy
pub const ACL_POLICY_METADATA_KEY: &str = "aclpolicy";

/// Who may read an object besides its owner
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Private => "private",
        }
    }
}

/// Owner/visibility pair governing read access to one object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AclPolicy {
    /// Identity of the uploading user. Never changes once attached.
    pub owner: String,
    pub visibility: Visibility,
}

impl AclPolicy {
    pub fn public(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            visibility: Visibility::Public,
        }
    }

    pub fn private(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            visibility: Visibility::Private,
        }
    }
}

/// Requested operation on an object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Read,
    Write,
}

/// Read the policy attached to an object.
///
/// Works from the metadata fetched when the handle was located, so backend
/// failures have already surfaced there. Absent and malformed policies both
/// yield `None`; a half-written value must never turn a read into an error.
pub fn get_policy(handle: &ObjectHandle) -> Option<AclPolicy> {
    let raw = handle.properties().metadata.get(ACL_POLICY_METADATA_KEY)?;

    match serde_json::from_str(raw) {
        Ok(policy) => Some(policy),
        Err(e) => {
            warn!(key = %handle.key(), error = %e, "Ignoring malformed ACL policy");
            None
        }
    }
}

/// Attach `policy` to an object, preserving all other metadata keys.
///
/// This is a read-modify-write with no conditional check: two concurrent
/// calls on the same object race and the last writer wins. The upload
/// workflow attaches a policy exactly once per object, right after the
/// owning record is created.
pub async fn set_policy(handle: &mut ObjectHandle, policy: &AclPolicy) -> Result<(), BrokerError> {
    let mut metadata = handle.properties().metadata.clone();

    let serialized = serde_json::to_string(policy).map_err(|e| {
        BrokerError::Transport(anyhow::Error::new(e).context("Failed to serialize ACL policy"))
    })?;
    metadata.insert(ACL_POLICY_METADATA_KEY.to_string(), serialized);

    handle.replace_metadata(metadata).await?;

    debug!(
        key = %handle.key(),
        owner = %policy.owner,
        visibility = policy.visibility.as_str(),
        "ACL policy attached"
    );
    Ok(())
}
