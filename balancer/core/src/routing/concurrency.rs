//! Concurrency Tracking
//!
//! Counts in-flight requests per `(server_url, model)` pair. A request holds
//! a [`ConcurrencyToken`] from the moment it is forwarded until its response
//! body is finished, fails, or is dropped by a disconnecting client; the
//! token's `Drop` is the only way the count goes down, so every exit path
//! releases it exactly once.
//!
//! The tracker also remembers when each pair last passed a fresh resource
//! check. While requests to a pair are in flight and that check is within
//! the grace period, the scheduler reuses it instead of asking the monitor
//! again. This keeps bursts against one backend from turning into bursts
//! against its monitor.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;

use super::config::ConcurrencyConfig;

type PairKey = (String, String);

#[derive(Debug, Default)]
struct PairState {
    in_flight: u64,
    last_started_at: Option<Instant>,
    last_sufficient_at: Option<Instant>,
}

/// In-flight counters per pair
#[derive(Debug)]
pub struct ConcurrencyTracker {
    grace_period: Duration,
    pairs: DashMap<PairKey, PairState>,
}

impl ConcurrencyTracker {
    /// Create an empty tracker
    #[must_use]
    pub fn new(config: &ConcurrencyConfig) -> Self {
        Self {
            grace_period: config.grace_period,
            pairs: DashMap::new(),
        }
    }

    /// Reuse window for fresh sufficient checks
    #[must_use]
    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    fn key(server_url: &str, model: &str) -> PairKey {
        (server_url.to_string(), model.to_string())
    }

    fn within_grace(&self, at: Option<Instant>) -> bool {
        at.is_some_and(|at| at.elapsed() <= self.grace_period)
    }

    /// Count a request as in flight until the token is dropped
    pub fn begin(self: &Arc<Self>, server_url: &str, model: &str) -> ConcurrencyToken {
        let key = Self::key(server_url, model);
        {
            let mut state = self.pairs.entry(key.clone()).or_default();
            state.in_flight += 1;
            state.last_started_at = Some(Instant::now());
        }
        ConcurrencyToken {
            tracker: Arc::clone(self),
            key,
        }
    }

    fn end(&self, key: &PairKey) {
        let idle = {
            let Some(mut state) = self.pairs.get_mut(key) else {
                tracing::error!(server = %key.0, model = %key.1, "Concurrency token released for unknown pair");
                return;
            };
            state.in_flight = state.in_flight.saturating_sub(1);
            state.in_flight == 0 && !self.within_grace(state.last_sufficient_at)
        };
        if idle {
            self.pairs
                .remove_if(key, |_, state| state.in_flight == 0 && !self.within_grace(state.last_sufficient_at));
        }
    }

    /// Note that a fresh resource check for the pair came back sufficient
    pub fn record_sufficient(&self, server_url: &str, model: &str) {
        self.pairs
            .entry(Self::key(server_url, model))
            .or_default()
            .last_sufficient_at = Some(Instant::now());
    }

    /// Whether the last sufficient check can stand in for a new one
    #[must_use]
    pub fn can_reuse(&self, server_url: &str, model: &str) -> bool {
        self.pairs
            .get(&Self::key(server_url, model))
            .is_some_and(|state| state.in_flight > 0 && self.within_grace(state.last_sufficient_at))
    }

    /// Forget every sufficient check, keeping in-flight counts
    ///
    /// Returns how many pairs had a check to forget. Idle pairs are dropped.
    pub fn clear_checks(&self) -> usize {
        let mut cleared = 0;
        self.pairs.retain(|_, state| {
            if state.last_sufficient_at.take().is_some() {
                cleared += 1;
            }
            state.in_flight > 0
        });
        cleared
    }

    /// Requests in flight for one pair
    #[must_use]
    pub fn in_flight(&self, server_url: &str, model: &str) -> u64 {
        self.pairs
            .get(&Self::key(server_url, model))
            .map_or(0, |state| state.in_flight)
    }

    /// Requests in flight across all pairs
    #[must_use]
    pub fn total_in_flight(&self) -> u64 {
        self.pairs.iter().map(|state| state.in_flight).sum()
    }

    /// Per-pair view for status endpoints, sorted by server then model
    #[must_use]
    pub fn snapshot(&self) -> Vec<ConcurrencySnapshot> {
        let mut all: Vec<ConcurrencySnapshot> = self
            .pairs
            .iter()
            .map(|item| ConcurrencySnapshot {
                server_url: item.key().0.clone(),
                model: item.key().1.clone(),
                in_flight: item.in_flight,
                since_last_start_ms: item
                    .last_started_at
                    .map(|at| u64::try_from(at.elapsed().as_millis()).unwrap_or(u64::MAX)),
                reusable: item.in_flight > 0 && self.within_grace(item.last_sufficient_at),
            })
            .collect();
        all.sort_by(|a, b| (&a.server_url, &a.model).cmp(&(&b.server_url, &b.model)));
        all
    }
}

/// In-flight view of one pair
#[derive(Clone, Debug, Serialize)]
pub struct ConcurrencySnapshot {
    /// Server base URL
    pub server_url: String,
    /// Actual model name
    pub model: String,
    /// Requests in flight
    pub in_flight: u64,
    /// Time since the most recent request started
    pub since_last_start_ms: Option<u64>,
    /// Whether a new request would reuse the last check
    pub reusable: bool,
}

/// Proof of an in-flight request; releases its slot when dropped
#[derive(Debug)]
#[must_use = "dropping the token ends the request immediately"]
pub struct ConcurrencyToken {
    tracker: Arc<ConcurrencyTracker>,
    key: PairKey,
}

impl ConcurrencyToken {
    /// Server URL this token counts against
    #[must_use]
    pub fn server_url(&self) -> &str {
        &self.key.0
    }

    /// Model this token counts against
    #[must_use]
    pub fn model(&self) -> &str {
        &self.key.1
    }

    /// End the request explicitly
    pub fn end(self) {
        drop(self);
    }
}

impl Drop for ConcurrencyToken {
    fn drop(&mut self) {
        self.tracker.end(&self.key);
    }
}
