#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use ecutune_kernel_contracts::MonotonicTimeNs;

pub trait Clock: Send + Sync {
    fn now(&self) -> MonotonicTimeNs;
}

/// Monotonic time since construction, offset by one so it is never zero.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> MonotonicTimeNs {
        let elapsed = u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX);
        MonotonicTimeNs(elapsed.saturating_add(1))
    }
}

/// Test clock advanced by hand.
#[derive(Debug)]
pub struct ManualClock {
    now_ns: AtomicU64,
}

impl ManualClock {
    pub fn starting_at_ms(ms: u64) -> Self {
        Self {
            now_ns: AtomicU64::new(MonotonicTimeNs::from_ms(ms).0.max(1)),
        }
    }

    pub fn advance_ms(&self, ms: u64) {
        let step = MonotonicTimeNs::from_ms(ms).0;
        self.now_ns.fetch_add(step, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> MonotonicTimeNs {
        MonotonicTimeNs(self.now_ns.load(Ordering::SeqCst))
    }
}
