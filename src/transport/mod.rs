//! Single-message delivery to the remote telemetry sink.
//!
//! A transport makes exactly one attempt per call. Retrying and buffering
//! are the publisher's business, not the transport's.

pub mod http;

use async_trait::async_trait;
use thiserror::Error;

pub use http::HttpTransport;

/// Errors that can occur while delivering a message.
#[derive(Debug, Error)]
pub enum TransportError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Request(#[source] reqwest::Error),

    /// Sink returned an error status code
    #[error("Sink error ({code}): {message}")]
    Status {
        code: reqwest::StatusCode,
        message: String,
    },

    /// Request timeout
    #[error("Request timed out")]
    Timeout,

    /// Transport configuration error
    #[error("Transport configuration error: {0}")]
    Config(String),

    /// Delivery failed for a transport-specific reason
    #[error("Delivery failed: {0}")]
    Rejected(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else {
            TransportError::Request(err)
        }
    }
}

/// Delivers one encoded message to the sink.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, message: &[u8]) -> Result<(), TransportError>;
}
