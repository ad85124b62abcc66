//! Proxy Forwarding
//!
//! Carries one client request to one chosen backend and streams the answer
//! back. The forwarder knows nothing about tiers or retries; it reports what
//! happened and the scheduler decides what that means.
//!
//! ```text
//!  client JSON ──> ProxyRequest ──> body_for(target) ──> POST {server_url}{endpoint}
//!                  (virtual model)   (model = actual)          │
//!                                                              v
//!  client  <── BackendResponse { status, headers, body stream } ┘
//! ```

mod forwarder;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use reqwest::header::{HeaderMap, HeaderName};
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::registry::ServerConfig;
use crate::routing::scheduler::SchedulerError;

pub use crate::routing::scheduler::ProxyResponse;
pub use forwarder::HttpForwarder;

/// Model metadata endpoint; older Ollama clients name the model in `name`
pub const SHOW_ENDPOINT: &str = "/api/show";

/// Endpoints forwarded verbatim to the backend
pub const PASSTHROUGH_ENDPOINTS: [&str; 5] = [
    "/v1/chat/completions",
    "/api/generate",
    "/api/chat",
    "/api/embeddings",
    SHOW_ENDPOINT,
];

/// Headers that belong to a single connection and are never forwarded
const HOP_BY_HOP: [&str; 9] = [
    "host",
    "content-length",
    "transfer-encoding",
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "upgrade",
];

/// Whether a header is connection-scoped
#[must_use]
pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Copy of `headers` without connection-scoped entries
#[must_use]
pub fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !is_hop_by_hop(name) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

// ============================================================================
// Request
// ============================================================================

/// One logical client request
#[derive(Clone, Debug)]
pub struct ProxyRequest {
    /// Identifier carried through logs
    pub request_id: Uuid,
    /// Path the client called, reused on the backend
    pub endpoint: String,
    /// Model name the client asked for
    pub virtual_model: String,
    /// Parsed request body
    pub payload: serde_json::Value,
    /// Client headers, hop-by-hop entries removed
    pub headers: HeaderMap,
    /// Body field that carried the model name
    model_field: &'static str,
}

impl ProxyRequest {
    /// Build a request from an already parsed JSON body
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidRequest`] if the body is not an
    /// object or has no non-empty string `model` field (`name` is accepted
    /// instead on [`SHOW_ENDPOINT`]).
    pub fn new(
        endpoint: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<Self, SchedulerError> {
        let endpoint = endpoint.into();
        let model_field = if endpoint == SHOW_ENDPOINT
            && payload.get("model").is_none()
            && payload.get("name").is_some()
        {
            "name"
        } else {
            "model"
        };

        let virtual_model = match payload.get(model_field) {
            Some(serde_json::Value::String(model)) if !model.trim().is_empty() => model.clone(),
            Some(_) => {
                return Err(SchedulerError::InvalidRequest(format!(
                    "`{model_field}` must be a non-empty string"
                )))
            }
            None if payload.is_object() => {
                return Err(SchedulerError::InvalidRequest(
                    "request body has no `model` field".to_string(),
                ))
            }
            None => {
                return Err(SchedulerError::InvalidRequest(
                    "request body must be a JSON object".to_string(),
                ))
            }
        };

        Ok(Self {
            request_id: Uuid::new_v4(),
            endpoint,
            virtual_model,
            payload,
            headers: HeaderMap::new(),
            model_field,
        })
    }

    /// Build a request from raw client bytes and headers
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidRequest`] for malformed JSON or a
    /// missing `model` field.
    pub fn from_json(
        endpoint: impl Into<String>,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<Self, SchedulerError> {
        let payload: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| SchedulerError::InvalidRequest(format!("malformed JSON body: {e}")))?;
        let mut request = Self::new(endpoint, payload)?;
        request.headers = strip_hop_by_hop(headers);
        Ok(request)
    }

    /// Body to send to `target`, with the model field set to its actual model name
    ///
    /// # Errors
    ///
    /// Returns [`ForwardError::Encode`] if the payload cannot be serialized.
    pub fn body_for(&self, target: &ServerConfig) -> Result<Bytes, ForwardError> {
        let mut payload = self.payload.clone();
        if let Some(object) = payload.as_object_mut() {
            object.insert(
                self.model_field.to_string(),
                serde_json::Value::String(target.actual_model_name.clone()),
            );
        }
        Ok(Bytes::from(serde_json::to_vec(&payload)?))
    }

    /// Whether the client asked for a streamed answer
    ///
    /// Ollama endpoints stream unless told otherwise; OpenAI-style ones only
    /// when asked.
    #[must_use]
    pub fn wants_stream(&self) -> bool {
        match self.payload.get("stream").and_then(serde_json::Value::as_bool) {
            Some(stream) => stream,
            None => self.endpoint.starts_with("/api/"),
        }
    }
}

// ============================================================================
// Response / Errors
// ============================================================================

/// Failure before or while reading a backend response
#[derive(Debug, Error)]
pub enum ForwardError {
    /// Could not open a connection
    #[error("connection failed: {0}")]
    Connect(String),

    /// No headers, or no next chunk, within the allowed time
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Request failed after connecting, before headers
    #[error("transport error: {0}")]
    Transport(String),

    /// Response body failed mid-stream
    #[error("response body failed: {0}")]
    Body(String),

    /// Request body could not be encoded
    #[error("cannot encode request body: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Backend answer with headers received and the body still streaming
pub struct BackendResponse {
    /// Backend status
    pub status: StatusCode,
    /// Backend headers, hop-by-hop entries removed
    pub headers: HeaderMap,
    /// Body chunks as they arrive
    pub body: BoxStream<'static, Result<Bytes, ForwardError>>,
    /// Time from send to headers
    pub time_to_headers: Duration,
}

impl std::fmt::Debug for BackendResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("time_to_headers", &self.time_to_headers)
            .finish_non_exhaustive()
    }
}

/// Sends a request to one backend
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Forward `request` to `target` and return once headers arrive
    async fn forward(
        &self,
        target: &ServerConfig,
        request: &ProxyRequest,
    ) -> Result<BackendResponse, ForwardError>;
}
