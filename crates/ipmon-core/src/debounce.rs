//! Debounce scheduling
//!
//! Collapses a burst of address notifications into a single refresh.
//!
//! ```text
//!   IDLE ──event──▶ ARMED(armed_at) ──now - armed_at >= delay──▶ IDLE (fire)
//!                     │  ▲
//!                     └──┘ further events: ignored
//! ```
//!
//! The quiet period is measured from the *first* event of a burst. Later
//! events do not push the deadline out, so a continuous stream of
//! notifications still produces a refresh every `delay`.

use std::time::Duration;
use tokio::time::Instant;

/// A refresh that has been requested but not yet fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRefresh {
    /// When the first event of the burst arrived
    pub armed_at: Instant,
}

/// Coalesces notification bursts into refresh triggers
#[derive(Debug, Clone)]
pub struct DebounceScheduler {
    delay: Duration,
    pending: Option<PendingRefresh>,
}

impl DebounceScheduler {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: None,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Record an event
    ///
    /// Returns `true` if this event armed the timer, `false` if a refresh was
    /// already pending.
    pub fn on_event(&mut self, now: Instant) -> bool {
        if self.pending.is_some() {
            return false;
        }
        self.pending = Some(PendingRefresh { armed_at: now });
        true
    }

    pub fn is_armed(&self) -> bool {
        self.pending.is_some()
    }

    pub fn pending(&self) -> Option<PendingRefresh> {
        self.pending
    }

    /// Instant at which the pending refresh becomes due
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.map(|p| p.armed_at + self.delay)
    }

    /// Evaluate the timer
    ///
    /// Returns `true` exactly once per burst, when the delay has elapsed,
    /// and returns the scheduler to idle.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.pending {
            Some(p) if now.saturating_duration_since(p.armed_at) >= self.delay => {
                self.pending = None;
                true
            }
            _ => false,
        }
    }
}
