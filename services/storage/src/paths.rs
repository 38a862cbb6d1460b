//! Canonical object addressing.
//!
//! Everything outside the broker refers to objects as
//! `/api/objects/<key>`. Raw backend URLs are rewritten into that form.

use crate::config::BackendConfig;

/// Prefix of every application-facing object path
pub const OBJECT_PATH_PREFIX: &str = "/api/objects/";

/// Canonical path for a storage key
pub fn object_path(key: &str) -> String {
    format!("{OBJECT_PATH_PREFIX}{key}")
}

/// Storage key addressed by a canonical path, if it is one
pub fn object_key(path: &str) -> Option<&str> {
    path.strip_prefix(OBJECT_PATH_PREFIX)
        .filter(|key| !key.is_empty())
}

/// Rewrites backend-native URLs into canonical object paths
#[derive(Debug, Clone)]
pub struct PathNormalizer {
    public_url_prefix: String,
}

impl PathNormalizer {
    pub fn new(config: &BackendConfig) -> Self {
        Self::with_prefix(config.public_url_prefix())
    }

    pub fn with_prefix(public_url_prefix: impl Into<String>) -> Self {
        Self {
            public_url_prefix: public_url_prefix.into(),
        }
    }

    /// Rewrite a backend URL under the container prefix to
    /// `/api/objects/<key>`, dropping any query string (such as a leftover
    /// signature) or fragment. Any other input is returned unchanged.
    pub fn normalize(&self, raw: &str) -> String {
        let Some(rest) = raw.strip_prefix(self.public_url_prefix.as_str()) else {
            return raw.to_string();
        };

        let key = rest
            .split(|c: char| c == '?' || c == '#')
            .next()
            .unwrap_or_default();

        object_path(key)
    }
}
