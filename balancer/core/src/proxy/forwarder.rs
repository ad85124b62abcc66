//! Streaming HTTP forwarder over reqwest

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use tokio::time::Instant;

use super::{strip_hop_by_hop, BackendResponse, ForwardError, Forwarder, ProxyRequest};
use crate::registry::ServerConfig;
use crate::routing::config::ProxyConfig;

/// Forwards requests with reqwest and streams bodies chunk by chunk
#[derive(Clone, Debug)]
pub struct HttpForwarder {
    client: reqwest::Client,
    config: ProxyConfig,
}

impl HttpForwarder {
    /// Create a forwarder with the given timeouts
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: ProxyConfig) -> Result<Self, reqwest::Error> {
        // No overall timeout: token streams may legitimately run for minutes
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self { client, config })
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    fn classify(&self, error: &reqwest::Error) -> ForwardError {
        if error.is_timeout() {
            ForwardError::Timeout(self.config.connect_timeout)
        } else if error.is_connect() {
            ForwardError::Connect(error.to_string())
        } else {
            ForwardError::Transport(error.to_string())
        }
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(
        &self,
        target: &ServerConfig,
        request: &ProxyRequest,
    ) -> Result<BackendResponse, ForwardError> {
        let url = format!("{}{}", target.base_url(), request.endpoint);
        let body = request.body_for(target)?;

        let mut headers = strip_hop_by_hop(&request.headers);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        tracing::debug!(
            request_id = %request.request_id,
            server = %target.server_url,
            model = %target.actual_model_name,
            endpoint = %request.endpoint,
            "Forwarding request"
        );

        let started = Instant::now();
        let send = self.client.post(&url).headers(headers).body(body).send();
        let response = match tokio::time::timeout(self.config.header_timeout, send).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(self.classify(&e)),
            Err(_) => return Err(ForwardError::Timeout(self.config.header_timeout)),
        };
        let time_to_headers = started.elapsed();

        let status = response.status();
        let headers = strip_hop_by_hop(response.headers());

        // Each chunk must arrive within the idle timeout; the first error ends the stream
        let idle = self.config.stream_idle_timeout;
        let chunks = Box::pin(response.bytes_stream());
        let body = futures::stream::unfold(Some(chunks), move |state| async move {
            let mut chunks = state?;
            match tokio::time::timeout(idle, chunks.next()).await {
                Ok(Some(Ok(bytes))) => Some((Ok(bytes), Some(chunks))),
                Ok(Some(Err(e))) => Some((Err(ForwardError::Body(e.to_string())), None)),
                Ok(None) => None,
                Err(_) => Some((Err(ForwardError::Timeout(idle)), None)),
            }
        })
        .boxed();

        Ok(BackendResponse {
            status,
            headers,
            body,
            time_to_headers,
        })
    }
}
