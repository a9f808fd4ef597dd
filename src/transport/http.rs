//! HTTP transport posting each message to the sink endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use tracing::debug;

use super::{Transport, TransportError};
use crate::config::TransportConfig;

/// Header carrying the configured topic name.
pub const TOPIC_HEADER: &str = "X-Telemetry-Topic";

/// Transport that POSTs one JSON message per request.
///
/// The underlying client is reused for connection pooling. Each call makes a
/// single attempt bounded by the configured request timeout.
pub struct HttpTransport {
    /// The underlying HTTP client (reused for connection pooling)
    client: Client,

    /// Sink endpoint
    url: String,

    topic: String,
    auth_token: Option<String>,

    /// Request timeout duration
    timeout: Duration,
}

impl HttpTransport {
    /// Create a transport from the transport section of the configuration.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Config` if the URL is empty or the HTTP
    /// client cannot be built.
    pub fn new(config: &TransportConfig) -> Result<Self, TransportError> {
        Self::with_settings(
            config.url.clone(),
            config.topic.clone(),
            config.auth_token.clone(),
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    /// Create a transport with explicit settings.
    pub fn with_settings(
        url: impl Into<String>,
        topic: impl Into<String>,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let url = url.into();
        if url.trim().is_empty() {
            return Err(TransportError::Config("sink URL is empty".to_string()));
        }

        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| TransportError::Config(e.to_string()))?;

        Ok(Self {
            client,
            url,
            topic: topic.into(),
            auth_token,
            timeout,
        })
    }

    fn headers(&self) -> Result<HeaderMap, TransportError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            TOPIC_HEADER,
            HeaderValue::from_str(&self.topic)
                .map_err(|e| TransportError::Config(format!("invalid topic: {}", e)))?,
        );
        Ok(headers)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn publish(&self, message: &[u8]) -> Result<(), TransportError> {
        let mut request = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .headers(self.headers()?)
            .body(message.to_vec());

        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();

        if status.is_success() {
            debug!(url = %self.url, bytes = message.len(), "Message delivered");
            Ok(())
        } else {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());

            Err(TransportError::Status {
                code: status,
                message,
            })
        }
    }
}
