//! Outbound transport.
//!
//! Packed envelopes are POSTed to the receiver's endpoint. Failed sends are
//! reported, never retried: the conversation stays in its last persisted
//! state and can be driven again from there.

use crate::router::PacketRouter;
use async_trait::async_trait;
use dca_core::Addr;
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;

/// Content type of packed agent messages.
pub const WIRE_CONTENT_TYPE: &str = "application/ssi-agent-wire";

/// How much of a `text/plain` error body is kept.
pub const ERROR_MESSAGE_MAX_LEN: usize = 80;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{message}")]
    Status { status: u16, message: String },

    #[error("Endpoint unreachable: {0}")]
    Unreachable(String),
}

/// Delivery of packed envelopes to an endpoint URL.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver `envelope` and return the response body.
    async fn send(&self, endpoint: &str, envelope: Vec<u8>) -> Result<Vec<u8>, TransportError>;
}

/// Turn a non-200 reply into an error.
///
/// Plain-text bodies contribute at most [`ERROR_MESSAGE_MAX_LEN`] bytes to
/// the message; other bodies are left out.
pub fn check_http_status(
    status: u16,
    reason: &str,
    content_type: Option<&str>,
    body: &[u8],
) -> Result<(), TransportError> {
    if status == 200 {
        return Ok(());
    }
    let status_line = format!("{} {}", status, reason).trim_end().to_string();
    let message = match content_type {
        Some(ct) if ct.starts_with("text/plain") => {
            let end = body.len().min(ERROR_MESSAGE_MAX_LEN);
            format!("{}: {}", status_line, String::from_utf8_lossy(&body[..end]))
        }
        _ => status_line,
    };
    Err(TransportError::Status { status, message })
}

/// HTTP transport configuration.
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    pub timeout: Duration,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

/// Transport over HTTP POST.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, endpoint: &str, envelope: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        tracing::debug!(endpoint, bytes = envelope.len(), "posting message");
        let response = self
            .client
            .post(endpoint)
            .header(reqwest::header::CONTENT_TYPE, WIRE_CONTENT_TYPE)
            .body(envelope)
            .send()
            .await?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?;

        if let Err(e) = check_http_status(
            status.as_u16(),
            status.canonical_reason().unwrap_or_default(),
            content_type.as_deref(),
            &body,
        ) {
            tracing::warn!(endpoint, error = %e, "send failed");
            return Err(e);
        }
        Ok(body.to_vec())
    }
}

/// In-process transport that hands envelopes straight to a router.
///
/// Delivery happens on a spawned task, like a server that accepts the
/// request and processes it in the background.
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    router: RwLock<Weak<PacketRouter>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, router: &Arc<PacketRouter>) {
        *self.router.write() = Arc::downgrade(router);
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&self, endpoint: &str, envelope: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        let router = self
            .router
            .read()
            .upgrade()
            .ok_or_else(|| TransportError::Unreachable("no router attached".into()))?;
        let mut addr =
            Addr::from_client_url(endpoint).map_err(|e| TransportError::Unreachable(e.to_string()))?;
        addr.base_path.clear();

        router
            .deliver(&addr.address(), envelope)
            .map_err(|e| TransportError::Status {
                status: 500,
                message: e.to_string(),
            })?;
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_status() {
        assert!(check_http_status(200, "OK", None, b"").is_ok());
    }

    #[test]
    fn test_plain_text_body_is_truncated() {
        let body = vec![b'x'; 200];
        let err = check_http_status(500, "Internal Server Error", Some("text/plain; charset=utf-8"), &body)
            .unwrap_err();
        match err {
            TransportError::Status { status, message } => {
                assert_eq!(status, 500);
                assert_eq!(message, format!("500 Internal Server Error: {}", "x".repeat(80)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_other_body_is_dropped() {
        let err = check_http_status(404, "Not Found", Some("application/json"), b"{\"secret\":1}").unwrap_err();
        assert_eq!(err.to_string(), "404 Not Found");
    }

    #[tokio::test]
    async fn test_loopback_without_router() {
        let transport = LoopbackTransport::new();
        let err = transport.send("http://localhost/a/b", vec![]).await.unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(_)));
    }
}
