//! ---
//! ops_section: "01-core-functionality"
//! ops_subsection: "module"
//! ops_type: "source"
//! ops_scope: "code"
//! ops_description: "Shared primitives and utilities for the core runtime."
//! ops_version: "v0.0.0-prealpha"
//! ops_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Time source used for timeout arithmetic and timestamping.
///
/// `now` is monotonic and drives every elapsed-time comparison; `utc_now` is only
/// used for human-facing timestamps in snapshots and envelopes.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Monotonic instant.
    fn now(&self) -> Instant;
    /// Wall-clock timestamp.
    fn utc_now(&self) -> DateTime<Utc>;
}

/// Shared handle to a clock implementation.
pub type SharedClock = Arc<dyn Clock>;

/// Production clock backed by `Instant::now()` and `Utc::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Return the system clock as a shared handle.
    pub fn shared() -> SharedClock {
        Arc::new(SystemClock)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for deterministic tests.
///
/// Clones share the same offset, so advancing one handle moves every holder.
#[derive(Debug, Clone)]
pub struct ManualClock {
    origin: Instant,
    origin_utc: DateTime<Utc>,
    offset: Arc<Mutex<Duration>>,
}

impl ManualClock {
    /// Start a clock frozen at the current instant.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            origin_utc: Utc::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }

    /// Total time advanced since construction.
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock()
    }

    /// Convenience conversion into a shared handle that still observes `advance` calls.
    pub fn shared(&self) -> SharedClock {
        Arc::new(self.clone())
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock()
    }

    fn utc_now(&self) -> DateTime<Utc> {
        let offset = *self.offset.lock();
        self.origin_utc
            + chrono::Duration::from_std(offset).unwrap_or_else(|_| chrono::Duration::zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_all_clones() {
        let clock = ManualClock::new();
        let start = clock.now();
        let start_utc = clock.utc_now();
        let shared = clock.shared();

        clock.advance(Duration::from_secs(30));

        assert_eq!(shared.now(), start + Duration::from_secs(30));
        assert_eq!(
            (shared.utc_now() - start_utc).num_seconds(),
            30,
            "wall clock follows the monotonic offset"
        );
        assert_eq!(clock.elapsed(), Duration::from_secs(30));
    }

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
