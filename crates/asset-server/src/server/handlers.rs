//! Axum request handlers for all service endpoints.

use std::sync::Arc;

use atrest::delivery::PassThroughReason;
use atrest::KeyProvider;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use common::protocol::{ErrorResponse, FieldRequest, FieldResponse, HealthResponse};
use common::ServiceError;
use tokio::sync::oneshot;
use tracing::warn;

use super::delivery::{self, ChannelResponse, Head};
use super::state::AppState;
use crate::storage::{asset_error, ASSET_KEY_HEADER};

/// Render a [`ServiceError`] as its status code and JSON body.
pub fn error_response(err: &ServiceError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(ErrorResponse::from(err))).into_response()
}

/// Per-asset secret from the request, if any. The value is never logged.
fn asset_key(headers: &HeaderMap) -> Result<Option<String>, ServiceError> {
    match headers.get(ASSET_KEY_HEADER) {
        None => Ok(None),
        Some(v) => v
            .to_str()
            .map(|s| Some(s.to_owned()))
            .map_err(|_| ServiceError::BadRequest("X-Asset-Key header is not valid text".into())),
    }
}

/// `PUT /assets/:name`: store the request body and encrypt it at rest.
pub async fn upload(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let secret = match asset_key(&headers) {
        Ok(s) => s,
        Err(e) => return error_response(&e),
    };
    match state.store.save(&name, body, secret).await {
        Ok(stored) => (StatusCode::CREATED, Json(stored)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// `GET /assets/:name`: decrypt-on-download, or serve the stored file as is.
///
/// The interceptor runs on a blocking thread. The handler waits only for the
/// response head; the decrypted body streams afterwards.
pub async fn download(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    let asset = match state.store.locate(&name).await {
        Ok(a) => a,
        Err(e) => return error_response(&e),
    };
    let provider = match asset_key(&headers).and_then(|s| state.store.key_provider(s)) {
        Ok(p) => p,
        Err(e) => return error_response(&e),
    };

    let (head_tx, head_rx) = oneshot::channel();
    let (body_tx, body_rx) = delivery::body_channel();
    let response = ChannelResponse::new(head_tx, body_tx);
    let interceptor = Arc::clone(&state.interceptor);
    let task_asset = asset.clone();
    tokio::task::spawn_blocking(move || {
        let provider = provider.as_ref().map(|p| p as &dyn KeyProvider);
        delivery::run_interceptor(&interceptor, &task_asset, provider, response);
    });

    match head_rx.await {
        Ok(Head::Stream(headers)) => delivery::stream_response(headers, body_rx),
        Ok(Head::Failed(headers, message)) => delivery::failed_response(headers, message),
        Ok(Head::PassThrough(PassThroughReason::Missing)) => {
            error_response(&ServiceError::NotFound(format!("asset {name}")))
        }
        Ok(Head::PassThrough(_)) => {
            match delivery::serve_stored(&asset, state.interceptor.options().disposition).await {
                Ok(resp) => resp,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    error_response(&ServiceError::NotFound(format!("asset {name}")))
                }
                Err(e) => error_response(&asset_error(e.into())),
            }
        }
        Err(_) => {
            warn!("download task ended without a response head");
            error_response(&ServiceError::Internal("download failed".into()))
        }
    }
}

/// `POST /fields/encrypt`: encrypt a column value under the default key.
pub async fn encrypt_field(
    State(state): State<AppState>,
    Json(req): Json<FieldRequest>,
) -> Response {
    match state.crypto.encrypt_field(&req.value) {
        Ok(value) => (StatusCode::OK, Json(FieldResponse { value })).into_response(),
        Err(e) => {
            warn!(error = %e, "field encryption failed");
            error_response(&ServiceError::Internal("encryption failed".into()))
        }
    }
}

/// `POST /fields/decrypt`: decrypt a stored column value.
///
/// Never fails: values that are not ciphertext, or do not authenticate, are
/// returned unchanged.
pub async fn decrypt_field(
    State(state): State<AppState>,
    Json(req): Json<FieldRequest>,
) -> Response {
    let value = state.crypto.decrypt_field(&req.value);
    (StatusCode::OK, Json(FieldResponse { value })).into_response()
}

/// `GET /health`: readiness check.
///
/// Returns `200 OK` when the storage root is a directory, `503` otherwise.
pub async fn health(State(state): State<AppState>) -> Response {
    let storage_ready = state.store.is_ready().await;
    let (status_code, status_str) = if storage_ready {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    let body = HealthResponse {
        status: status_str.into(),
        storage_ready,
    };
    (status_code, Json(body)).into_response()
}

/// Catch-all 404 handler.
pub async fn not_found() -> impl IntoResponse {
    let err = ErrorResponse::new("not_found", "the requested resource does not exist");
    (StatusCode::NOT_FOUND, Json(err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use atrest::{DeliveryOptions, KeyResolver};
    use axum::{
        body::to_bytes,
        http::{header, Request},
        routing::{get, post},
        Router,
    };
    use tower::ServiceExt;

    const SECRET: &str = "5f1e3c9a7b2d4e6f8091a2b3c4d5e6f708192a3b4c5d6e7f8091a2b3c4d5e6f7";

    fn test_state(root: &std::path::Path) -> AppState {
        AppState::new(
            root,
            KeyResolver::new(SECRET).unwrap(),
            DeliveryOptions::default(),
        )
    }

    fn test_router(state: AppState) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/fields/encrypt", post(encrypt_field))
            .route("/fields/decrypt", post(decrypt_field))
            .with_state(state)
    }

    async fn post_field(app: Router, uri: &str, value: &str) -> String {
        let req = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::json!({ "value": value }).to_string()))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice::<FieldResponse>(&bytes).unwrap().value
    }

    #[tokio::test]
    async fn health_returns_503_without_storage_root() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_router(test_state(&dir.path().join("missing")));
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn health_returns_200_with_storage_root() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_router(test_state(dir.path()));
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn field_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_router(test_state(dir.path()));
        let sealed = post_field(app.clone(), "/fields/encrypt", "hello world").await;
        assert_ne!(sealed, "hello world");
        assert!(sealed.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(post_field(app, "/fields/decrypt", &sealed).await, "hello world");
    }

    #[tokio::test]
    async fn decrypt_field_is_fail_open() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_router(test_state(dir.path()));
        assert_eq!(post_field(app.clone(), "/fields/decrypt", "abc123").await, "abc123");
        assert_eq!(post_field(app, "/fields/decrypt", "plain text").await, "plain text");
    }

    #[tokio::test]
    async fn empty_field_is_not_encrypted() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_router(test_state(dir.path()));
        assert_eq!(post_field(app, "/fields/encrypt", "").await, "");
    }

    #[test]
    fn asset_key_rejects_opaque_bytes() {
        let mut headers = HeaderMap::new();
        assert_eq!(asset_key(&headers).unwrap(), None);
        headers.insert(
            ASSET_KEY_HEADER,
            axum::http::HeaderValue::from_bytes(b"\xff\xfe").unwrap(),
        );
        assert!(matches!(asset_key(&headers), Err(ServiceError::BadRequest(_))));
    }

    #[test]
    fn error_response_uses_mapped_status() {
        let resp = error_response(&ServiceError::Unavailable("storage".into()));
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
