//! Capped exponential retry backoff.
//!
//! The connection monitor and the receive loop share one formula:
//! `delay = min(2^retries * timeout, MAX_WAIT)`. A counter at zero yields the
//! plain cycle timeout, so a healthy component re-stabilizes to its normal
//! cadence immediately after the first successful cycle.

use std::time::Duration;

/// Default per-cycle timeout when the host does not supply one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Hard ceiling on the retry delay, so retry pressure on the broker never
/// grows unbounded.
pub const MAX_WAIT: Duration = Duration::from_millis(300_000);

/// Failure counter plus the delay formula derived from it.
///
/// Owned and mutated only by its component; reset to zero on any successful
/// operation cycle.
#[derive(Debug, Clone)]
pub struct Backoff {
    timeout: Duration,
    retries: u32,
}

impl Backoff {
    /// Creates a backoff tracker with the given per-cycle timeout.
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            retries: 0,
        }
    }

    /// Current delay: `min(2^retries * timeout, MAX_WAIT)`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn delay(&self) -> Duration {
        let base = self.timeout.as_millis() as u64;
        let factor = 1u64.checked_shl(self.retries).unwrap_or(u64::MAX);
        let millis = base
            .saturating_mul(factor)
            .min(MAX_WAIT.as_millis() as u64);
        Duration::from_millis(millis)
    }

    /// Records one failed cycle.
    pub fn record_failure(&mut self) {
        self.retries = self.retries.saturating_add(1);
    }

    /// Resets the counter after a successful cycle.
    pub fn reset(&mut self) {
        self.retries = 0;
    }

    /// Number of consecutive failures recorded since the last reset.
    #[must_use]
    pub const fn retries(&self) -> u32 {
        self.retries
    }
}
