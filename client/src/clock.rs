//! Injectable time source.
//!
//! Every time-dependent component takes an `Arc<dyn Clock>` instead of
//! reading the wall clock, so tests can drive expiry, retention and enqueue
//! stamps deterministically.

use std::sync::atomic::{AtomicU64, Ordering};
use tillsync_engine::Timestamp;

/// Milliseconds-since-epoch time source.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> Timestamp;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Timestamp {
        chrono::Utc::now().timestamp_millis().max(0) as Timestamp
    }
}

/// A clock advanced by hand. Intended for tests, but also usable by hosts
/// that replay recorded sessions.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    pub fn advance(&self, delta_ms: Timestamp) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: Timestamp) {
        self.now.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}
