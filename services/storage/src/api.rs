use crate::broker::ObjectBroker;
use crate::config::{ApiConfig, ConfigError};
use crate::credentials::UploadCredential;
use crate::error::{BrokerError, ErrorResponse};
use crate::paths::object_path;
use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    body::Body,
    extract::{FromRequestParts, Path, State},
    http::{header, request::Parts, HeaderName, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<ObjectBroker>,
    /// Header set by a trusted auth proxy with the caller's user id.
    /// `None` ignores any such header sent by clients.
    pub identity_header: Option<HeaderName>,
}

impl AppState {
    pub fn new(broker: Arc<ObjectBroker>, config: &ApiConfig) -> Result<Self, ConfigError> {
        let identity_header = config
            .identity_header
            .as_deref()
            .map(|name| {
                HeaderName::from_bytes(name.as_bytes()).map_err(|e| ConfigError::InvalidValue {
                    key: "api.identity_header".to_string(),
                    message: e.to_string(),
                })
            })
            .transpose()?;

        Ok(Self {
            broker,
            identity_header,
        })
    }
}

/// Identity of the caller as resolved by the authentication layer.
///
/// An upstream session middleware inserts this as a request extension.
/// Behind an auth proxy, `api.identity_header` names a header to read it
/// from instead. Absent or empty means anonymous.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerIdentity(pub Option<String>);

impl CallerIdentity {
    pub fn user(id: impl Into<String>) -> Self {
        Self(Some(id.into()))
    }

    pub fn as_deref(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

#[async_trait]
impl FromRequestParts<AppState> for CallerIdentity {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        if let Some(identity) = parts.extensions.get::<CallerIdentity>() {
            return Ok(identity.clone());
        }

        let Some(identity_header) = &state.identity_header else {
            return Ok(Self::default());
        };

        let id = parts
            .headers
            .get(identity_header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        Ok(Self(id))
    }
}

/// Upload URL request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadUrlRequest {
    /// Original file name
    pub name: Option<String>,
    /// File size in bytes
    pub size: Option<u64>,
    /// MIME type reported by the client
    pub content_type: Option<String>,
}

/// File details echoed back to the client
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadMetadata {
    pub name: String,
    pub size: Option<u64>,
    pub content_type: Option<String>,
}

/// Upload URL response
#[derive(Debug, Serialize)]
pub struct UploadUrlResponse {
    #[serde(flatten)]
    pub credential: UploadCredential,
    pub metadata: UploadMetadata,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/uploads/request-url", post(request_upload_url))
        .route("/api/objects/*key", get(serve_object))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "object-broker"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    // Check backend connectivity
    match state.broker.backend().container_exists().await {
        Ok(exists) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "backend": "connected",
                "container_exists": exists
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "backend": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Issue a signed upload URL
#[instrument(skip(state, request))]
async fn request_upload_url(
    State(state): State<AppState>,
    Json(request): Json<UploadUrlRequest>,
) -> Result<Json<UploadUrlResponse>, Response> {
    let Some(name) = request.name.filter(|n| !n.trim().is_empty()) else {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "Missing required field: name".to_string(),
                code: "MISSING_FIELD".to_string(),
            }),
        )
            .into_response());
    };

    let credential = state.broker.issue_upload_credential().await.map_err(|e| {
        error!(error = %e, "Failed to generate upload URL");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: "Failed to generate upload URL".to_string(),
                code: "PRESIGN_ERROR".to_string(),
            }),
        )
            .into_response()
    })?;

    Ok(Json(UploadUrlResponse {
        credential,
        metadata: UploadMetadata {
            name,
            size: request.size,
            content_type: request.content_type,
        },
    }))
}

/// Stream an object through the access gate
#[instrument(skip(state, identity))]
async fn serve_object(
    State(state): State<AppState>,
    identity: CallerIdentity,
    Path(key): Path<String>,
) -> Result<Response, BrokerError> {
    let download = state
        .broker
        .serve(&object_path(&key), identity.as_deref())
        .await?;

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, download.content_type)
        .header(header::CACHE_CONTROL, download.cache_control);
    if let Some(length) = download.content_length {
        response = response.header(header::CONTENT_LENGTH, length);
    }

    response
        .body(Body::from_stream(download.body))
        .context("Failed to build object response")
        .map_err(BrokerError::Transport)
}

/// Start the API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting object broker API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::AclPolicy;
    use crate::backend::{MockObjectBackend, ObjectProperties};
    use crate::memory_backend::MemoryBackend;
    use bytes::Bytes;
    use futures::{stream, StreamExt};
    use crate::paths::PathNormalizer;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app_with(config: ApiConfig) -> (Router, Arc<ObjectBroker>, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new("photos"));
        let broker = Arc::new(ObjectBroker::new(
            backend.clone(),
            PathNormalizer::with_prefix("https://photos.s3.us-east-1.amazonaws.com/"),
            Duration::from_secs(3600),
        ));
        let state = AppState::new(broker.clone(), &config).unwrap();
        (create_router(state, &config), broker, backend)
    }

    fn test_app() -> (Router, Arc<ObjectBroker>, Arc<MemoryBackend>) {
        app_with(ApiConfig::default())
    }

    /// App deployed behind a proxy that sets `x-user-id`
    fn proxied_app() -> (Router, Arc<ObjectBroker>, Arc<MemoryBackend>) {
        app_with(ApiConfig {
            identity_header: Some("x-user-id".to_string()),
            ..Default::default()
        })
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        response
            .into_body()
            .collect()
            .await
            .unwrap()
            .to_bytes()
            .to_vec()
    }

    fn get(uri: &str, user: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method("GET").uri(uri);
        if let Some(user) = user {
            builder = builder.header("x-user-id", user);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_serve_public_object() {
        let (app, broker, backend) = test_app();
        backend.insert("uploads/abc", b"photo".to_vec(), Some("image/jpeg"));
        broker
            .attach_policy_if_managed("/api/objects/uploads/abc", &AclPolicy::public("42"))
            .await
            .unwrap();

        let response = app.oneshot(get("/api/objects/uploads/abc", None)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers[header::CONTENT_TYPE], "image/jpeg");
        assert_eq!(headers[header::CONTENT_LENGTH], "5");
        assert_eq!(headers[header::CACHE_CONTROL], "public, max-age=3600");
        assert_eq!(body_bytes(response).await, b"photo");
    }

    #[tokio::test]
    async fn test_private_object_status_codes() {
        let (app, broker, backend) = proxied_app();
        backend.insert("uploads/abc", b"photo".to_vec(), None);
        broker
            .attach_policy_if_managed("/api/objects/uploads/abc", &AclPolicy::private("42"))
            .await
            .unwrap();

        let denied = app
            .clone()
            .oneshot(get("/api/objects/uploads/abc", Some("43")))
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);
        let body: serde_json::Value = serde_json::from_slice(&body_bytes(denied).await).unwrap();
        assert_eq!(body["code"], "ACCESS_DENIED");

        let anonymous = app
            .clone()
            .oneshot(get("/api/objects/uploads/abc", None))
            .await
            .unwrap();
        assert_eq!(anonymous.status(), StatusCode::FORBIDDEN);

        let owner = app
            .oneshot(get("/api/objects/uploads/abc", Some("42")))
            .await
            .unwrap();
        assert_eq!(owner.status(), StatusCode::OK);
        assert_eq!(owner.headers()[header::CACHE_CONTROL], "private, max-age=3600");
    }

    #[tokio::test]
    async fn test_client_identity_header_ignored_by_default() {
        let (app, broker, backend) = test_app();
        backend.insert("uploads/abc", b"photo".to_vec(), None);
        broker
            .attach_policy_if_managed("/api/objects/uploads/abc", &AclPolicy::private("42"))
            .await
            .unwrap();

        let response = app
            .oneshot(get("/api/objects/uploads/abc", Some("42")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_unknown_length_omits_content_length() {
        let mut backend = MockObjectBackend::new();
        backend
            .expect_properties()
            .returning(|_| Ok(ObjectProperties::default()));
        backend.expect_open().returning(|_| {
            Ok(Some(
                stream::once(async { Ok::<_, std::io::Error>(Bytes::from("photo")) }).boxed(),
            ))
        });
        let broker = Arc::new(ObjectBroker::new(
            Arc::new(backend),
            PathNormalizer::with_prefix("https://photos.s3.us-east-1.amazonaws.com/"),
            Duration::from_secs(3600),
        ));
        let config = ApiConfig::default();
        let app = create_router(AppState::new(broker, &config).unwrap(), &config);

        let response = app.oneshot(get("/api/objects/uploads/abc", None)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(header::CONTENT_LENGTH).is_none());
        assert_eq!(body_bytes(response).await, b"photo");
    }

    #[tokio::test]
    async fn test_missing_object_is_404() {
        let (app, _, _) = test_app();

        let response = app
            .oneshot(get("/api/objects/doesnotexist", Some("1")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(body["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_identity_from_extension() {
        let (app, broker, backend) = proxied_app();
        backend.insert("uploads/abc", b"photo".to_vec(), None);
        broker
            .attach_policy_if_managed("/api/objects/uploads/abc", &AclPolicy::private("42"))
            .await
            .unwrap();

        let mut request = get("/api/objects/uploads/abc", Some("43"));
        request.extensions_mut().insert(CallerIdentity::user("42"));

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_request_upload_url() {
        let (app, _, backend) = test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/uploads/request-url")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"name":"beach.jpg","size":2048,"contentType":"image/jpeg"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert!(body["objectPath"]
            .as_str()
            .unwrap()
            .starts_with("/api/objects/uploads/"));
        assert!(body["uploadURL"].as_str().unwrap().starts_with("memory://photos/uploads/"));
        assert_eq!(body["metadata"]["name"], "beach.jpg");
        assert_eq!(body["metadata"]["size"], 2048);
        assert_eq!(body["metadata"]["contentType"], "image/jpeg");
        assert!(backend.container_created());
    }

    #[tokio::test]
    async fn test_request_upload_url_requires_name() {
        let (app, _, _) = test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/uploads/request-url")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"size":2048}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_readiness() {
        let (app, _, _) = test_app();

        let response = app
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_start_api_server_reports_bind_failure() {
        let occupied = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ApiConfig {
            host: "127.0.0.1".to_string(),
            port: occupied.local_addr().unwrap().port(),
            ..Default::default()
        };
        let (_, broker, _) = test_app();
        let state = AppState::new(broker, &config).unwrap();

        assert!(start_api_server(state, &config).await.is_err());
    }

    #[test]
    fn test_invalid_identity_header_rejected() {
        let broker = Arc::new(ObjectBroker::new(
            Arc::new(MemoryBackend::new("photos")),
            PathNormalizer::with_prefix("https://photos.s3.us-east-1.amazonaws.com/"),
            Duration::from_secs(3600),
        ));
        let config = ApiConfig {
            identity_header: Some("bad header".to_string()),
            ..Default::default()
        };

        assert!(matches!(
            AppState::new(broker, &config),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
