//! Balancer Daemon - HTTP Front for a Pool of Ollama Servers
//!
//! Wires the [`balancer_core::Scheduler`] to an axum router. Clients talk to
//! the daemon exactly as they would to a single Ollama server; the daemon
//! picks a backend per request and streams the answer back.
//!
//! # Routes
//!
//! ```text
//! Client          POST /v1/chat/completions  /api/generate  /api/chat  /api/embeddings
//!                 POST /api/show
//!                 GET  /api/tags  /v1/models
//! Observability   GET  /health  /status  /metrics
//! Admin           GET  /admin/cache/stats           POST /admin/cache/clear
//!                 GET  /admin/model-usage/stats     POST /admin/model-usage/clear
//!                 GET  /admin/resource-monitor/config
//!                 GET  /admin/model-type/check/{model}
//!                 GET  /admin/model-type/overview
//!                 GET  /admin/server-priority/check/{model}
//!                 GET  /admin/server-priority/overview
//!                 POST /admin/registry/refresh
//!                 GET  /admin/servers/{id}/resources
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod admin;
pub mod error;
pub mod server;
pub mod state;

pub use error::ApiError;
pub use server::build_router;
pub use state::AppState;
