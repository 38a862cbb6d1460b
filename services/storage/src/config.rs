//! Service configuration and storage backend resolution.
//!
//! Settings are layered with the `config` crate: built-in defaults, then
//! optional files, then `STORAGE__*` environment variables. Backend
//! credentials are resolved once at startup; a missing credential is fatal
//! and the service never binds its listener.

use axum::http::Uri;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// Main configuration for the object broker service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Object storage backend settings
    #[serde(default)]
    pub backend: BackendSettings,
    /// Download behaviour
    #[serde(default)]
    pub broker: BrokerSettings,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Raw object storage settings as read from configuration sources.
///
/// Credentials are optional here so that a missing value surfaces as a
/// [`ConfigError::MissingRequired`] from [`BackendSettings::resolve`] rather
/// than as an opaque deserialization failure.
#[derive(Clone, Deserialize)]
pub struct BackendSettings {
    /// Account identity (S3 access key id)
    pub access_key_id: Option<String>,
    /// Account secret (S3 secret access key)
    pub secret_access_key: Option<String>,
    /// Bucket holding every object managed by the broker
    #[serde(default = "default_container")]
    pub container: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Permit a plain http endpoint. Upload credentials are then issued
    /// over an insecure transport, so only local development sets this.
    #[serde(default)]
    pub allow_insecure_endpoint: bool,
}

/// Download settings
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerSettings {
    /// max-age advertised in Cache-Control for served objects
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

/// API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Header carrying the caller identity set by a trusted auth proxy.
    /// Unset by default: identity then comes only from the auth layer.
    #[serde(default)]
    pub identity_header: Option<String>,
}

/// Fully resolved backend configuration.
///
/// Constructed once at startup and treated as immutable afterwards.
#[derive(Clone)]
pub struct BackendConfig {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub container: String,
    pub region: String,
    pub endpoint_url: Option<String>,
    pub force_path_style: bool,
}

// Default value functions
fn default_service_name() -> String {
    "object-broker".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_container() -> String {
    "photos".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_cache_ttl_secs() -> u64 {
    3600
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> Result<Self, ConfigError> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "object-broker")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/storage").required(false))
            .add_source(config::File::with_name("/etc/snapvault/storage").required(false))
            // Override with environment variables
            // STORAGE__BACKEND__ACCESS_KEY_ID -> backend.access_key_id
            .add_source(
                config::Environment::with_prefix("STORAGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Get the download cache TTL as Duration
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.broker.cache_ttl_secs)
    }
}

impl BackendSettings {
    /// Resolve backend credentials, failing fast if any are absent.
    pub fn resolve(&self) -> Result<BackendConfig, ConfigError> {
        let access_key_id = required(&self.access_key_id, "backend.access_key_id")?;
        let secret_access_key = required(&self.secret_access_key, "backend.secret_access_key")?;

        let container = self.container.trim();
        if container.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "backend.container".to_string(),
                message: "container name must not be empty".to_string(),
            });
        }

        let endpoint_url = self
            .endpoint_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(|url| validate_endpoint(url, self.allow_insecure_endpoint))
            .transpose()?;

        Ok(BackendConfig {
            access_key_id,
            secret_access_key,
            container: container.to_string(),
            region: self.region.clone(),
            endpoint_url,
            force_path_style: self.force_path_style,
        })
    }
}

impl BackendConfig {
    /// Fully qualified public URL prefix of the container, with a trailing
    /// slash. Object URLs authored against the backend start with this.
    pub fn public_url_prefix(&self) -> String {
        match &self.endpoint_url {
            Some(endpoint) if self.force_path_style => {
                format!("{}/{}/", endpoint.trim_end_matches('/'), self.container)
            }
            Some(endpoint) => match endpoint.parse::<Uri>() {
                Ok(uri) => format!(
                    "{}://{}.{}/",
                    uri.scheme_str().unwrap_or("https"),
                    self.container,
                    uri.authority().map(|a| a.as_str()).unwrap_or_default()
                ),
                Err(_) => format!("{}/{}/", endpoint.trim_end_matches('/'), self.container),
            },
            None => format!(
                "https://{}.s3.{}.amazonaws.com/",
                self.container, self.region
            ),
        }
    }
}

fn required(value: &Option<String>, key: &str) -> Result<String, ConfigError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ConfigError::MissingRequired(key.to_string()))
}

fn validate_endpoint(raw: &str, allow_insecure: bool) -> Result<String, ConfigError> {
    let invalid = |message: &str| ConfigError::InvalidValue {
        key: "backend.endpoint_url".to_string(),
        message: message.to_string(),
    };

    let uri: Uri = raw.parse().map_err(|_| invalid("not a valid URL"))?;
    if uri.authority().is_none() {
        return Err(invalid("URL has no host"));
    }

    match uri.scheme_str() {
        Some("https") => {}
        Some("http") if allow_insecure => {}
        Some("http") => {
            return Err(invalid(
                "plain http endpoints require backend.allow_insecure_endpoint",
            ))
        }
        _ => return Err(invalid("URL scheme must be https")),
    }

    Ok(raw.trim_end_matches('/').to_string())
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            access_key_id: None,
            secret_access_key: None,
            container: default_container(),
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
            allow_insecure_endpoint: false,
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
            identity_header: None,
        }
    }
}

impl fmt::Debug for BackendSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendSettings")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &self.secret_access_key.as_ref().map(|_| "<redacted>"))
            .field("container", &self.container)
            .field("region", &self.region)
            .field("endpoint_url", &self.endpoint_url)
            .field("force_path_style", &self.force_path_style)
            .field("allow_insecure_endpoint", &self.allow_insecure_endpoint)
            .finish()
    }
}

impl fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConfig")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("container", &self.container)
            .field("region", &self.region)
            .field("endpoint_url", &self.endpoint_url)
            .field("force_path_style", &self.force_path_style)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> BackendSettings {
        BackendSettings {
            access_key_id: Some("AKIDEXAMPLE".to_string()),
            secret_access_key: Some("wJalrXUtnFEMI".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_values() {
        assert_eq!(default_container(), "photos");
        assert_eq!(default_cache_ttl_secs(), 3600);
        assert_eq!(ApiConfig::default().identity_header, None);
    }

    #[test]
    fn test_resolve_requires_identity() {
        let mut s = settings();
        s.access_key_id = None;
        match s.resolve() {
            Err(ConfigError::MissingRequired(key)) => assert_eq!(key, "backend.access_key_id"),
            other => panic!("expected MissingRequired, got {:?}", other),
        }
    }

    #[test]
    fn test_resolve_requires_secret() {
        let mut s = settings();
        s.secret_access_key = Some("   ".to_string());
        match s.resolve() {
            Err(ConfigError::MissingRequired(key)) => {
                assert_eq!(key, "backend.secret_access_key")
            }
            other => panic!("expected MissingRequired, got {:?}", other),
        }
    }

    #[test]
    fn test_resolve_defaults_container() {
        let resolved = settings().resolve().unwrap();
        assert_eq!(resolved.container, "photos");
        assert_eq!(resolved.region, "us-east-1");
        assert!(resolved.endpoint_url.is_none());
    }

    #[test]
    fn test_resolve_rejects_plain_http_endpoint() {
        let mut s = settings();
        s.endpoint_url = Some("http://localhost:9000".to_string());
        assert!(matches!(
            s.resolve(),
            Err(ConfigError::InvalidValue { .. })
        ));

        s.allow_insecure_endpoint = true;
        let resolved = s.resolve().unwrap();
        assert_eq!(resolved.endpoint_url.as_deref(), Some("http://localhost:9000"));
    }

    #[test]
    fn test_public_url_prefix() {
        let mut resolved = settings().resolve().unwrap();
        assert_eq!(
            resolved.public_url_prefix(),
            "https://photos.s3.us-east-1.amazonaws.com/"
        );

        resolved.endpoint_url = Some("https://storage.example.com".to_string());
        assert_eq!(
            resolved.public_url_prefix(),
            "https://photos.storage.example.com/"
        );

        resolved.force_path_style = true;
        assert_eq!(
            resolved.public_url_prefix(),
            "https://storage.example.com/photos/"
        );
    }

    #[test]
    fn test_debug_redacts_secret() {
        let resolved = settings().resolve().unwrap();
        let rendered = format!("{:?}", resolved);
        assert!(!rendered.contains("wJalrXUtnFEMI"));
        assert!(rendered.contains("<redacted>"));
        assert!(!format!("{:?}", settings()).contains("wJalrXUtnFEMI"));
    }
}
