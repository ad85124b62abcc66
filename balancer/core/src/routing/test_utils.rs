//! Scheduler Test Utilities
//!
//! Scripted stand-ins for the three network seams of the scheduler, so the
//! pipeline can be driven deterministically without sockets.
//!
//! # Usage
//!
//! ```ignore
//! let probe = Arc::new(MockProbe::new());
//! probe.set_down("http://s1:11434");
//!
//! let monitor = Arc::new(MockMonitor::new());
//! monitor.set("http://s2:11434", ResourceVerdict::Insufficient);
//!
//! let forwarder = Arc::new(MockForwarder::new());
//! forwarder.reply("http://s3:11434", Reply::status(503));
//!
//! // After the test, verify which servers were called
//! assert_eq!(monitor.calls("http://s2:11434"), 1);
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;

use super::health::{HealthProbe, ProbeError};
use super::monitor::{ResourceCheck, ResourceMonitor, ResourceVerdict};
use crate::proxy::{BackendResponse, ForwardError, Forwarder, ProxyRequest};
use crate::registry::{ServerConfig, ServerType};

/// Row for virtual model `chat` backed by `llama3`
pub fn server(id: u64, url: &str, weight: u32, priority: u32) -> ServerConfig {
    ServerConfig::new(id, "chat", url, "llama3")
        .with_weight(weight)
        .with_priority(priority)
}

// ============================================================================
// Mock Probe
// ============================================================================

/// Health probe with per-URL up/down switches
#[derive(Debug, Default)]
pub struct MockProbe {
    down: Mutex<HashSet<String>>,
    delay: Mutex<Option<Duration>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl MockProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, url: &str) {
        self.down.lock().insert(url.to_string());
    }

    pub fn set_up(&self, url: &str) {
        self.down.lock().remove(url);
    }

    /// Delay every probe, to exercise timeouts and concurrency
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().get(url).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }
}

#[async_trait]
impl HealthProbe for MockProbe {
    async fn probe(&self, server_url: &str) -> Result<(), ProbeError> {
        *self.calls.lock().entry(server_url.to_string()).or_default() += 1;
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.down.lock().contains(server_url) {
            Err(ProbeError::Transport("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

// ============================================================================
// Mock Monitor
// ============================================================================

/// Resource monitor answering a fixed verdict per URL
#[derive(Debug)]
pub struct MockMonitor {
    verdicts: Mutex<HashMap<String, ResourceVerdict>>,
    default_verdict: ResourceVerdict,
    calls: Mutex<HashMap<String, usize>>,
}

impl MockMonitor {
    /// Every server sufficient unless told otherwise
    pub fn new() -> Self {
        Self::with_default(ResourceVerdict::Sufficient)
    }

    pub fn with_default(default_verdict: ResourceVerdict) -> Self {
        Self {
            verdicts: Mutex::new(HashMap::new()),
            default_verdict,
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn set(&self, url: &str, verdict: ResourceVerdict) {
        self.verdicts.lock().insert(url.to_string(), verdict);
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().get(url).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }
}

impl Default for MockMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceMonitor for MockMonitor {
    async fn check_resource(
        &self,
        server_url: &str,
        _server_type: ServerType,
        _performance_gb: u32,
    ) -> ResourceCheck {
        *self.calls.lock().entry(server_url.to_string()).or_default() += 1;
        let verdict = self
            .verdicts
            .lock()
            .get(server_url)
            .copied()
            .unwrap_or(self.default_verdict);
        let mut check = ResourceCheck::from_verdict(verdict);
        if verdict == ResourceVerdict::Unknown {
            check.detail = Some("monitor unreachable".to_string());
        }
        check
    }
}

// ============================================================================
// Mock Forwarder
// ============================================================================

/// Scripted backend behaviour
#[derive(Clone, Debug)]
pub enum Reply {
    /// Headers with `status`, then `chunks`, then end of stream
    Ok {
        status: u16,
        chunks: Vec<&'static str>,
    },

    /// Connection refused before headers
    ConnectError,

    /// 200 headers, `chunks`, then a body error
    BrokenStream { chunks: Vec<&'static str> },

    /// 200 headers, `chunks`, then nothing until the stream is dropped
    Hanging {
        chunks: Vec<&'static str>,
        dropped: Arc<AtomicBool>,
    },
}

impl Reply {
    /// Status with a small body
    pub fn status(status: u16) -> Self {
        Self::Ok {
            status,
            chunks: vec!["{\"done\":true}"],
        }
    }

    /// A stream that never ends, plus the flag set when it is dropped
    pub fn hanging(chunks: Vec<&'static str>) -> (Self, Arc<AtomicBool>) {
        let dropped = Arc::new(AtomicBool::new(false));
        (
            Self::Hanging {
                chunks,
                dropped: Arc::clone(&dropped),
            },
            dropped,
        )
    }
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// One forward seen by the mock
#[derive(Clone, Debug)]
pub struct ForwardCall {
    pub server_url: String,
    pub endpoint: String,
    pub body: serde_json::Value,
}

/// Forwarder replying from a script keyed by server URL
#[derive(Debug, Default)]
pub struct MockForwarder {
    replies: Mutex<HashMap<String, Reply>>,
    calls: Mutex<Vec<ForwardCall>>,
}

impl MockForwarder {
    /// Every server answers 200 unless told otherwise
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&self, url: &str, reply: Reply) {
        self.replies.lock().insert(url.to_string(), reply);
    }

    /// Server URLs in call order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().iter().map(|c| c.server_url.clone()).collect()
    }

    pub fn call_count(&self, url: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.server_url == url).count()
    }

    pub fn last_call(&self) -> Option<ForwardCall> {
        self.calls.lock().last().cloned()
    }
}

fn ok_chunks(chunks: Vec<&'static str>) -> Vec<Result<Bytes, ForwardError>> {
    chunks.into_iter().map(|c| Ok(Bytes::from(c))).collect()
}

#[async_trait]
impl Forwarder for MockForwarder {
    async fn forward(
        &self,
        target: &ServerConfig,
        request: &ProxyRequest,
    ) -> Result<BackendResponse, ForwardError> {
        let body = request.body_for(target)?;
        self.calls.lock().push(ForwardCall {
            server_url: target.server_url.clone(),
            endpoint: request.endpoint.clone(),
            body: serde_json::from_slice(&body)?,
        });

        let reply = self
            .replies
            .lock()
            .get(&target.server_url)
            .cloned()
            .unwrap_or_else(|| Reply::status(200));

        let (status, body) = match reply {
            Reply::Ok { status, chunks } => (status, futures::stream::iter(ok_chunks(chunks)).boxed()),
            Reply::ConnectError => {
                return Err(ForwardError::Connect("connection refused".to_string()))
            }
            Reply::BrokenStream { chunks } => {
                let mut items = ok_chunks(chunks);
                items.push(Err(ForwardError::Body("connection reset".to_string())));
                (200, futures::stream::iter(items).boxed())
            }
            Reply::Hanging { chunks, dropped } => {
                let state = (chunks.into_iter(), DropFlag(dropped));
                let body = futures::stream::unfold(state, |(mut rest, flag)| async move {
                    match rest.next() {
                        Some(chunk) => Some((Ok(Bytes::from(chunk)), (rest, flag))),
                        None => {
                            std::future::pending::<()>().await;
                            None
                        }
                    }
                });
                (200, body.boxed())
            }
        };

        Ok(BackendResponse {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            headers: HeaderMap::new(),
            body,
            time_to_headers: Duration::from_millis(5),
        })
    }
}
