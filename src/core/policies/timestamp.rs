// src/core/policies/timestamp.rs

//! Client-side timestamp generation: a monotonic microsecond clock.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::warn;

/// The timestamp contract: microseconds since the epoch, strictly
/// increasing per generator.
pub trait TimestampGenerator: Send + Sync {
    fn next(&self) -> i64;
}

/// Follows the wall clock while it moves forward; when it regresses, keeps
/// issuing `last + 1` so timestamps stay strictly monotonic, and warns at
/// most once per second.
pub struct MonotonicTimestampGenerator {
    last: AtomicI64,
    last_warning: Mutex<Option<Instant>>,
}

impl MonotonicTimestampGenerator {
    pub fn new() -> Self {
        Self {
            last: AtomicI64::new(0),
            last_warning: Mutex::new(None),
        }
    }

    fn wall_clock_micros() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0)
    }

    fn warn_drift(&self, drift_micros: i64) {
        let mut guard = self.last_warning.lock();
        let due = guard
            .map(|at| at.elapsed() >= Duration::from_secs(1))
            .unwrap_or(true);
        if due {
            warn!(
                drift_micros,
                "system clock moved backwards; timestamps continue monotonically"
            );
            *guard = Some(Instant::now());
        }
    }
}

impl Default for MonotonicTimestampGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl TimestampGenerator for MonotonicTimestampGenerator {
    fn next(&self) -> i64 {
        let now = Self::wall_clock_micros();
        loop {
            let last = self.last.load(Ordering::Acquire);
            let candidate = if now > last { now } else { last + 1 };
            if self
                .last
                .compare_exchange_weak(last, candidate, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if now <= last && last - now > 1_000 {
                    self.warn_drift(last - now);
                }
                return candidate;
            }
        }
    }
}
