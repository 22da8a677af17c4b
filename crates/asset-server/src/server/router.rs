//! Axum router construction.

use std::time::Duration;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use super::{handlers, middleware, state::AppState};

/// Build the application [`Router`] with all routes and middleware attached.
pub fn build(state: AppState) -> Router {
    routes(middleware::REQUEST_TIMEOUT).with_state(state)
}

/// Route table. `timeout` covers every route except uploads, whose handler
/// runs for as long as the client keeps sending.
fn routes(timeout: Duration) -> Router<AppState> {
    Router::new()
        .route("/assets/:name", get(handlers::download))
        .route("/fields/encrypt", post(handlers::encrypt_field))
        .route("/fields/decrypt", post(handlers::decrypt_field))
        .route("/health", get(handlers::health))
        .route_layer(TimeoutLayer::new(timeout))
        .route(
            "/assets/:name",
            put(handlers::upload).layer(DefaultBodyLimit::disable()),
        )
        .fallback(handlers::not_found)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use atrest::delivery::{ExecutionMode, FilenameSource};
    use atrest::{DeliveryOptions, KeyResolver};
    use axum::{
        body::{to_bytes, Body},
        http::{header, HeaderName, HeaderValue, Request, StatusCode},
    };
    use axum_test::TestServer;
    use bytes::Bytes;
    use common::protocol::UploadResponse;
    use std::path::Path;
    use tower::ServiceExt;

    const SECRET: &str = "5f1e3c9a7b2d4e6f8091a2b3c4d5e6f708192a3b4c5d6e7f8091a2b3c4d5e6f7";
    const ASSET_SECRET: &str = "a0a1a2a3a4a5a6a7a8a9aaabacadaeafb0b1b2b3b4b5b6b7b8b9babbbcbdbebf";

    fn app(root: &Path, options: DeliveryOptions) -> Router {
        build(AppState::new(root, KeyResolver::new(SECRET).unwrap(), options))
    }

    fn server(root: &Path, options: DeliveryOptions) -> TestServer {
        TestServer::new(app(root, options)).unwrap()
    }

    fn pdf_bytes() -> Vec<u8> {
        (0..200_000u32).map(|i| (i % 251) as u8).collect()
    }

    fn asset_key(value: &str) -> (HeaderName, HeaderValue) {
        (
            HeaderName::from_static("x-asset-key"),
            HeaderValue::from_str(value).unwrap(),
        )
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let dir = tempfile::tempdir().unwrap();
        let req = Request::builder()
            .uri("/unknown")
            .body(Body::empty())
            .unwrap();
        let resp = app(dir.path(), DeliveryOptions::default())
            .oneshot(req)
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn upload_then_download_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path(), DeliveryOptions::default());
        let bytes = pdf_bytes();

        let put = server
            .put("/assets/report.pdf")
            .bytes(Bytes::from(bytes.clone()))
            .await;
        put.assert_status(StatusCode::CREATED);
        let stored: UploadResponse = put.json();
        assert_eq!(stored.stored_name, "report.pdf.enc");
        assert!(stored.encrypted);
        assert_eq!(stored.bytes_encrypted, bytes.len() as u64);

        let on_disk = std::fs::read(dir.path().join("report.pdf.enc")).unwrap();
        assert_ne!(on_disk, bytes);
        assert!(!dir.path().join("report.pdf").exists());

        let get = server.get("/assets/report.pdf").await;
        get.assert_status_ok();
        assert_eq!(get.as_bytes().as_ref(), bytes.as_slice());
        let h = get.headers();
        assert_eq!(h[header::CONTENT_TYPE], "application/pdf");
        assert_eq!(
            h[header::CONTENT_DISPOSITION],
            "attachment; filename=\"report.pdf\""
        );
        assert_eq!(h[header::CACHE_CONTROL], "private, no-cache, no-store");
        assert!(h.get(header::CONTENT_LENGTH).is_none());
    }

    #[tokio::test]
    async fn stored_filename_keeps_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(
            dir.path(),
            DeliveryOptions {
                filename: FilenameSource::Stored,
                ..DeliveryOptions::default()
            },
        );
        server
            .put("/assets/report.pdf")
            .bytes(Bytes::from_static(b"%PDF-1.7"))
            .await
            .assert_status(StatusCode::CREATED);

        let get = server.get("/assets/report.pdf").await;
        assert_eq!(
            get.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"report.pdf.enc\""
        );
        assert_eq!(get.as_bytes().as_ref(), b"%PDF-1.7");
    }

    #[tokio::test]
    async fn per_asset_key_is_required_to_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path(), DeliveryOptions::default());
        let (name, value) = asset_key(ASSET_SECRET);
        server
            .put("/assets/secret.txt")
            .add_header(name.clone(), value.clone())
            .bytes(Bytes::from_static(b"customer data"))
            .await
            .assert_status(StatusCode::CREATED);

        let with_key = server
            .get("/assets/secret.txt")
            .add_header(name, value)
            .await;
        with_key.assert_status_ok();
        assert_eq!(with_key.as_bytes().as_ref(), b"customer data");

        let without_key = server.get("/assets/secret.txt").await;
        without_key.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(without_key.headers()[header::CONTENT_TYPE], "text/plain");
        assert_eq!(without_key.headers()[header::CONTENT_DISPOSITION], "inline");
        assert!(!without_key.text().contains("customer data"));
    }

    #[tokio::test]
    async fn malformed_asset_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (name, value) = asset_key("zz");
        server(dir.path(), DeliveryOptions::default())
            .put("/assets/a.txt")
            .add_header(name, value)
            .bytes(Bytes::from_static(b"data"))
            .await
            .assert_status(StatusCode::BAD_REQUEST);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn reserved_suffix_upload_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        server(dir.path(), DeliveryOptions::default())
            .put("/assets/evil.enc")
            .bytes(Bytes::from_static(b"not ciphertext"))
            .await
            .assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_asset_is_404() {
        let dir = tempfile::tempdir().unwrap();
        server(dir.path(), DeliveryOptions::default())
            .get("/assets/nothing.pdf")
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn plaintext_asset_is_served_as_stored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("legacy.txt"), b"from before encryption").unwrap();

        let get = server(dir.path(), DeliveryOptions::default())
            .get("/assets/legacy.txt")
            .await;
        get.assert_status_ok();
        assert_eq!(get.as_bytes().as_ref(), b"from before encryption");
        assert_eq!(get.headers()[header::CONTENT_TYPE], "text/plain");
        assert_eq!(get.headers()[header::CONTENT_LENGTH], "22");
    }

    #[tokio::test]
    async fn test_mode_serves_ciphertext_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(
            dir.path(),
            DeliveryOptions {
                mode: ExecutionMode::Test,
                ..DeliveryOptions::default()
            },
        );
        server
            .put("/assets/fixture.txt")
            .bytes(Bytes::from_static(b"fixture"))
            .await
            .assert_status(StatusCode::CREATED);

        let get = server.get("/assets/fixture.txt").await;
        get.assert_status_ok();
        let on_disk = std::fs::read(dir.path().join("fixture.txt.enc")).unwrap();
        assert_eq!(get.as_bytes().as_ref(), on_disk.as_slice());
        assert_eq!(
            get.headers()[header::CONTENT_TYPE],
            "application/octet-stream"
        );
    }

    #[tokio::test]
    async fn slow_upload_outlives_request_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let app = routes(Duration::from_millis(50)).with_state(AppState::new(
            dir.path(),
            KeyResolver::new(SECRET).unwrap(),
            DeliveryOptions::default(),
        ));

        let chunks = futures::stream::unfold(0u8, |n| async move {
            if n == 3 {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(40)).await;
            Some((Ok::<_, std::io::Error>(Bytes::from_static(b"slow ")), n + 1))
        });
        let put = Request::builder()
            .method("PUT")
            .uri("/assets/slow.txt")
            .body(Body::from_stream(chunks))
            .unwrap();
        let resp = app.clone().oneshot(put).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert!(dir.path().join("slow.txt.enc").exists());

        let get = Request::builder()
            .uri("/assets/slow.txt")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(get).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), b"slow slow slow ");
    }

    #[tokio::test]
    async fn tampered_first_chunk_fails_before_output() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(dir.path(), DeliveryOptions::default());
        server
            .put("/assets/doc.txt")
            .bytes(Bytes::from_static(b"important"))
            .await
            .assert_status(StatusCode::CREATED);

        let path = dir.path().join("doc.txt.enc");
        let mut raw = std::fs::read(&path).unwrap();
        raw[atrest::crypto::stream::HEADER_LEN + 4] ^= 0x01;
        std::fs::write(&path, raw).unwrap();

        let get = server.get("/assets/doc.txt").await;
        get.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(get.headers()[header::CONTENT_TYPE], "text/plain");
        assert!(!get.text().contains("important"));
    }

    #[tokio::test]
    async fn tampered_tail_aborts_the_body() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = vec![3u8; atrest::crypto::stream::CHUNK_PLAINTEXT_LEN * 2];
        let app = app(dir.path(), DeliveryOptions::default());

        let put = Request::builder()
            .method("PUT")
            .uri("/assets/big.bin")
            .body(Body::from(bytes))
            .unwrap();
        let resp = app.clone().oneshot(put).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let path = dir.path().join("big.bin.enc");
        let mut raw = std::fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        std::fs::write(&path, raw).unwrap();

        let get = Request::builder()
            .uri("/assets/big.bin")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(get).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(to_bytes(resp.into_body(), usize::MAX).await.is_err());
    }
}
