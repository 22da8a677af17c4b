//! Bridges the blocking download interceptor onto an axum response.
//!
//! The interceptor runs on a blocking thread and writes into a
//! [`ChannelResponse`]. Headers are buffered until the first body byte (or
//! `finish`), then sent once over a oneshot as a [`Head`]; body chunks follow
//! over a bounded mpsc channel that backs the response body stream. A failure
//! before the head is committed becomes a plain-text 500; a failure after it
//! aborts the body stream.

use std::io::{self, Write};

use atrest::delivery::{headers, DeliveryFailure, PassThroughReason};
use atrest::{Interception, KeyProvider, ResponseSink, StoredAsset, StreamingDownloadInterceptor};
use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

/// Body chunks buffered between the blocking writer and the client.
const BODY_BUFFER: usize = 8;

/// What the blocking side decided about the response head.
#[derive(Debug)]
pub enum Head {
    /// Decrypted body follows on the channel with these headers.
    Stream(HeaderMap),
    /// The host serves the stored file itself.
    PassThrough(PassThroughReason),
    /// Failed before any body byte; reverted headers and a message.
    Failed(HeaderMap, String),
}

type BodyItem = Result<Bytes, io::Error>;

/// [`ResponseSink`] backed by tokio channels.
#[derive(Debug)]
pub struct ChannelResponse {
    headers: HeaderMap,
    head: Option<oneshot::Sender<Head>>,
    body: Option<mpsc::Sender<BodyItem>>,
}

impl ChannelResponse {
    pub fn new(head: oneshot::Sender<Head>, body: mpsc::Sender<BodyItem>) -> Self {
        Self {
            headers: HeaderMap::new(),
            head: Some(head),
            body: Some(body),
        }
    }

    fn committed(&self) -> bool {
        self.head.is_none()
    }

    fn commit(&mut self, head: Head) {
        if let Some(tx) = self.head.take() {
            // The receiver is gone only if the request was dropped.
            let _ = tx.send(head);
        }
    }

    fn commit_stream(&mut self) {
        if !self.committed() {
            let headers = self.headers.clone();
            self.commit(Head::Stream(headers));
        }
    }

    fn pass_through(mut self, reason: PassThroughReason) {
        self.commit(Head::PassThrough(reason));
    }

    /// Report a failure: as the head if nothing was sent yet, otherwise as a
    /// body error so the client sees a truncated transfer.
    fn fail(mut self, message: String) {
        if self.committed() {
            if let Some(tx) = self.body.take() {
                let _ = tx.blocking_send(Err(io::Error::other(message)));
            }
        } else {
            let headers = self.headers.clone();
            self.commit(Head::Failed(headers, message));
        }
    }
}

impl Write for ChannelResponse {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.commit_stream();
        let tx = self
            .body
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::BrokenPipe))?;
        tx.blocking_send(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client disconnected"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ResponseSink for ChannelResponse {
    fn set_header(&mut self, name: &'static str, value: String) {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            (Ok(n), Ok(v)) => {
                self.headers.insert(n, v);
            }
            _ => warn!(header = name, "dropping unrepresentable response header"),
        }
    }

    fn remove_header(&mut self, name: &'static str) {
        if let Ok(n) = HeaderName::from_bytes(name.as_bytes()) {
            self.headers.remove(n);
        }
    }

    fn finish(&mut self) -> io::Result<()> {
        self.commit_stream();
        self.body.take();
        Ok(())
    }
}

/// Run the interceptor to completion on the current (blocking) thread.
pub fn run_interceptor(
    interceptor: &StreamingDownloadInterceptor,
    asset: &StoredAsset,
    provider: Option<&dyn KeyProvider>,
    response: ChannelResponse,
) {
    match interceptor.intercept(asset, provider, response) {
        Ok(Interception::PassThrough { response, reason }) => response.pass_through(reason),
        Ok(Interception::Completed(report)) => {
            info!(
                filename = %report.filename,
                plaintext_bytes = report.plaintext_bytes,
                budget = ?report.budget,
                "download completed"
            );
        }
        Err(DeliveryFailure {
            response,
            error,
            bytes_sent,
        }) => {
            warn!(error = %error, bytes_sent, "download failed");
            response.fail("the requested asset could not be delivered".into());
        }
    }
}

/// Turn the decrypted-body channel into a streaming response.
pub fn stream_response(headers: HeaderMap, body: mpsc::Receiver<BodyItem>) -> Response {
    let stream = futures::stream::unfold(body, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });
    let mut resp = Response::new(Body::from_stream(stream));
    *resp.headers_mut() = headers;
    resp
}

/// Plain-text error page with the headers the interceptor reverted to.
pub fn failed_response(headers: HeaderMap, message: String) -> Response {
    let mut resp = (StatusCode::INTERNAL_SERVER_ERROR, message).into_response();
    resp.headers_mut().extend(headers);
    resp
}

/// Serve the stored bytes as they are, with ordinary download headers.
pub async fn serve_stored(
    asset: &StoredAsset,
    disposition: headers::Disposition,
) -> io::Result<Response> {
    let file = tokio::fs::File::open(asset.path()).await?;
    let len = file.metadata().await?.len();
    let disposition = format!(
        "{}; filename={}",
        disposition.as_str(),
        headers::quote_filename(&asset.name())
    );

    let mut resp = Response::new(Body::from_stream(ReaderStream::new(file)));
    let h = resp.headers_mut();
    h.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(headers::mime_type(&asset.extension())),
    );
    h.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    if let Ok(v) = HeaderValue::from_bytes(disposition.as_bytes()) {
        h.insert(header::CONTENT_DISPOSITION, v);
    }
    Ok(resp)
}

/// Bounded body channel for one download.
pub fn body_channel() -> (mpsc::Sender<BodyItem>, mpsc::Receiver<BodyItem>) {
    mpsc::channel(BODY_BUFFER)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (
        ChannelResponse,
        oneshot::Receiver<Head>,
        mpsc::Receiver<BodyItem>,
    ) {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = body_channel();
        (ChannelResponse::new(head_tx, body_tx), head_rx, body_rx)
    }

    #[tokio::test]
    async fn head_is_committed_on_first_byte() {
        let (mut resp, head_rx, mut body_rx) = pair();
        tokio::task::spawn_blocking(move || {
            resp.set_header(headers::CONTENT_TYPE, "application/pdf".into());
            resp.set_header(headers::CONTENT_LENGTH, "10".into());
            resp.remove_header(headers::CONTENT_LENGTH);
            resp.write_all(b"abc").unwrap();
            resp.set_header(headers::PRAGMA, "too late".into());
            resp.finish().unwrap();
        })
        .await
        .unwrap();

        let Ok(Head::Stream(h)) = head_rx.await else {
            panic!("expected streaming head");
        };
        assert_eq!(h[header::CONTENT_TYPE], "application/pdf");
        assert!(h.get(header::CONTENT_LENGTH).is_none());
        assert!(h.get(header::PRAGMA).is_none());
        assert_eq!(body_rx.recv().await.unwrap().unwrap(), Bytes::from_static(b"abc"));
        assert!(body_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn failure_before_output_becomes_failed_head() {
        let (mut resp, head_rx, _body_rx) = pair();
        tokio::task::spawn_blocking(move || {
            resp.set_header(headers::CONTENT_TYPE, "text/plain".into());
            resp.fail("nope".into());
        })
        .await
        .unwrap();

        let Ok(Head::Failed(h, msg)) = head_rx.await else {
            panic!("expected failed head");
        };
        assert_eq!(h[header::CONTENT_TYPE], "text/plain");
        assert_eq!(msg, "nope");
    }

    #[tokio::test]
    async fn failure_after_output_aborts_body() {
        let (mut resp, head_rx, mut body_rx) = pair();
        tokio::task::spawn_blocking(move || {
            resp.write_all(b"partial").unwrap();
            resp.fail("tampered".into());
        })
        .await
        .unwrap();

        assert!(matches!(head_rx.await, Ok(Head::Stream(_))));
        assert!(body_rx.recv().await.unwrap().is_ok());
        assert!(body_rx.recv().await.unwrap().is_err());
    }

    #[tokio::test]
    async fn write_after_client_disconnect_is_broken_pipe() {
        let (mut resp, _head_rx, body_rx) = pair();
        drop(body_rx);
        let err = tokio::task::spawn_blocking(move || resp.write(b"x").unwrap_err())
            .await
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
