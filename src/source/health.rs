//! Per-source health state tracking.
//!
//! Each source moves through `unknown → healthy ⇄ degraded → unreachable`,
//! driven only by probe and call outcomes. The failure counter resets in full
//! on one success; demotion to `unreachable` happens once the counter reaches
//! the configured threshold. Unreachable sources are re-probed on an
//! exponential backoff.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::RwLock;

/// Four-state health model for tool sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Not yet successfully probed
    Unknown,
    /// Last probe or call succeeded
    Healthy,
    /// Failing, but below the demotion threshold
    Degraded,
    /// Failed `failure_threshold` times in a row; excluded from the tool index
    Unreachable,
}

/// What a single recorded outcome did to a source's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    /// Became healthy from any other state
    Promoted,
    /// Healthy → degraded
    Degraded,
    /// Reached the failure threshold
    Demoted,
}

/// Exponential backoff: `initial`, doubling, capped at `max`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Return the current delay and double it for next time.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = std::cmp::min(self.current * 2, self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

fn unix_millis_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Mutable health record for one source.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceHealth {
    pub state: HealthState,
    /// Unix milliseconds of the last recorded outcome.
    pub last_checked_at: Option<u64>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    #[serde(skip)]
    next_probe_at: Option<Instant>,
    #[serde(skip)]
    backoff: Backoff,
}

impl SourceHealth {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            state: HealthState::Unknown,
            last_checked_at: None,
            consecutive_failures: 0,
            last_error: None,
            next_probe_at: None,
            backoff,
        }
    }

    /// Record a successful probe or call.
    pub fn record_success(&mut self) -> Transition {
        let previous = self.state;
        self.state = HealthState::Healthy;
        self.consecutive_failures = 0;
        self.last_error = None;
        self.last_checked_at = Some(unix_millis_now());
        self.next_probe_at = None;
        self.backoff.reset();

        if previous == HealthState::Healthy {
            Transition::Unchanged
        } else {
            Transition::Promoted
        }
    }

    /// Record a failed probe or call.
    pub fn record_failure(&mut self, error: impl Into<String>, threshold: u32) -> Transition {
        let previous = self.state;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_error = Some(error.into());
        self.last_checked_at = Some(unix_millis_now());

        self.state = if self.consecutive_failures >= threshold {
            HealthState::Unreachable
        } else {
            match previous {
                // unknown never jumps straight to degraded
                HealthState::Unknown => HealthState::Unknown,
                HealthState::Healthy | HealthState::Degraded => HealthState::Degraded,
                HealthState::Unreachable => HealthState::Unreachable,
            }
        };

        if self.state == HealthState::Unreachable {
            self.next_probe_at = Some(Instant::now() + self.backoff.next_delay());
        }

        match (previous, self.state) {
            (p, HealthState::Unreachable) if p != HealthState::Unreachable => Transition::Demoted,
            (HealthState::Healthy, HealthState::Degraded) => Transition::Degraded,
            _ => Transition::Unchanged,
        }
    }

    /// Whether the supervisor should probe this source at `now`.
    ///
    /// Only unreachable sources wait out their backoff.
    pub fn probe_due(&self, now: Instant) -> bool {
        match self.next_probe_at {
            Some(at) if self.state == HealthState::Unreachable => now >= at,
            _ => true,
        }
    }
}

/// Snapshot-swapped map of source id → health record.
///
/// Writers clone the map, change one record, and replace the whole `Arc`, so
/// readers never see a half-applied update.
pub struct HealthBoard {
    inner: RwLock<Arc<HashMap<String, SourceHealth>>>,
}

impl HealthBoard {
    pub fn new<'a>(ids: impl IntoIterator<Item = &'a str>, backoff: Backoff) -> Self {
        let map = ids
            .into_iter()
            .map(|id| (id.to_string(), SourceHealth::new(backoff.clone())))
            .collect();
        Self {
            inner: RwLock::new(Arc::new(map)),
        }
    }

    pub async fn snapshot(&self) -> Arc<HashMap<String, SourceHealth>> {
        self.inner.read().await.clone()
    }

    pub async fn state(&self, id: &str) -> Option<HealthState> {
        self.inner.read().await.get(id).map(|h| h.state)
    }

    /// Apply `f` to one record and publish a new snapshot.
    ///
    /// Returns `None` when `id` is not on the board.
    pub async fn update<F>(&self, id: &str, f: F) -> Option<Transition>
    where
        F: FnOnce(&mut SourceHealth) -> Transition,
    {
        let mut guard = self.inner.write().await;
        let mut next: HashMap<String, SourceHealth> = (**guard).clone();
        let transition = f(next.get_mut(id)?);
        *guard = Arc::new(next);
        Some(transition)
    }
}
