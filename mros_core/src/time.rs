//! Millisecond time sources for message timestamps and expiry.
//!
//! The bus never calls `Instant::now()` directly; it asks a [`TimeSource`].
//! Production code uses [`MonotonicTime`], tests drive a [`ManualTime`].

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic millisecond clock
pub trait TimeSource: Send + Sync + Debug {
    /// Milliseconds since an arbitrary, fixed origin
    fn now_ms(&self) -> u64;
}

/// Wall-clock time measured from process-local `Instant` origin
#[derive(Debug)]
pub struct MonotonicTime {
    origin: Instant,
}

impl MonotonicTime {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicTime {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicTime {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Manually advanced time, for deterministic tests and simulation
#[derive(Debug, Default)]
pub struct ManualTime {
    now: AtomicU64,
}

impl ManualTime {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) -> u64 {
        self.now.fetch_add(ms, Ordering::SeqCst) + ms
    }
}

impl TimeSource for ManualTime {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_time() {
        let time = ManualTime::new(5);
        assert_eq!(time.now_ms(), 5);
        assert_eq!(time.advance(20), 25);
        time.set(100);
        assert_eq!(time.now_ms(), 100);
    }

    #[test]
    fn test_monotonic_time_never_goes_back() {
        let time = MonotonicTime::new();
        let a = time.now_ms();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(time.now_ms() >= a);
    }
}
