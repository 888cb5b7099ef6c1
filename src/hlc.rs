//! Hybrid logical clock used for CAS generation.
//!
//! CAS values combine a 48-bit wall-clock component (milliseconds) with a
//! 16-bit logical counter, packed into a u64. Successive calls on one clock
//! are strictly monotonic even when the wall clock stalls or runs backwards,
//! and observed remote CAS values ratchet the clock forward so that local
//! mutations never reuse a version a peer has already handed out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Number of low bits reserved for the logical counter.
const LOGICAL_BITS: u32 = 16;

/// Hybrid logical clock. One instance per vBucket.
#[derive(Debug)]
pub struct HybridClock {
    /// Packed (physical << 16 | logical) of the last CAS handed out.
    max_cas: AtomicU64,
}

impl HybridClock {
    /// Create a clock that will never emit a CAS at or below `initial_cas`.
    pub fn new(initial_cas: u64) -> Self {
        Self {
            max_cas: AtomicU64::new(initial_cas),
        }
    }

    /// Generate the next CAS. Never returns zero.
    pub fn next_cas(&self) -> u64 {
        let physical = Self::wall_clock_ms() << LOGICAL_BITS;
        loop {
            let last = self.max_cas.load(Ordering::Acquire);
            let candidate = if physical > last { physical } else { last + 1 };
            if self
                .max_cas
                .compare_exchange_weak(last, candidate, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return candidate;
            }
        }
    }

    /// Ratchet the clock forward after observing a CAS from a peer.
    pub fn note_remote_cas(&self, cas: u64) {
        loop {
            let current = self.max_cas.load(Ordering::Acquire);
            if cas <= current {
                return;
            }
            if self
                .max_cas
                .compare_exchange_weak(current, cas, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// The highest CAS this clock has produced or observed.
    pub fn max_cas(&self) -> u64 {
        self.max_cas.load(Ordering::Acquire)
    }

    fn wall_clock_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

impl Default for HybridClock {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cas_strictly_monotonic() {
        let clock = HybridClock::default();
        let mut last = 0;
        for _ in 0..10_000 {
            let cas = clock.next_cas();
            assert!(cas > last);
            last = cas;
        }
    }

    #[test]
    fn test_never_zero() {
        let clock = HybridClock::default();
        assert_ne!(clock.next_cas(), 0);
    }

    #[test]
    fn test_remote_cas_ratchets() {
        let clock = HybridClock::default();
        let far_future = u64::MAX - 10;
        clock.note_remote_cas(far_future);
        assert_eq!(clock.max_cas(), far_future);
        assert!(clock.next_cas() > far_future);

        // Observing an older CAS must not move the clock backwards.
        let current = clock.max_cas();
        clock.note_remote_cas(1);
        assert_eq!(clock.max_cas(), current);
    }

    #[test]
    fn test_initial_floor_respected() {
        let clock = HybridClock::new(u64::MAX - 100);
        assert!(clock.next_cas() > u64::MAX - 100);
    }
}
