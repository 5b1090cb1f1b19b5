//! Lock-free counters and gauges with cache-line padding.

use atomic_float::AtomicF64;
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counter.
#[repr(align(64))]
#[derive(Debug, Default)]
pub struct LockFreeCounter {
    value: CachePadded<AtomicU64>,
}

impl LockFreeCounter {
    /// Zero-initialised counter.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            value: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// Add `delta`.
    pub fn increment(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    /// Current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Reset to zero, returning the previous value.
    pub fn reset(&self) -> u64 {
        self.value.swap(0, Ordering::AcqRel)
    }
}

/// Last-write-wins floating point gauge.
#[repr(align(64))]
#[derive(Debug)]
pub struct LockFreeGauge {
    value: CachePadded<AtomicF64>,
}

impl LockFreeGauge {
    /// Zero-initialised gauge.
    #[must_use]
    pub fn new() -> Self {
        Self {
            value: CachePadded::new(AtomicF64::new(0.0)),
        }
    }

    /// Overwrite the value.
    pub fn set(&self, value: f64) {
        self.value.store(value, Ordering::Release);
    }

    /// Add `delta` (may be negative).
    pub fn add(&self, delta: f64) {
        self.value.fetch_add(delta, Ordering::AcqRel);
    }

    /// Current value.
    pub fn get(&self) -> f64 {
        self.value.load(Ordering::Acquire)
    }
}

impl Default for LockFreeGauge {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn counter_survives_contention() {
        let counter = Arc::new(LockFreeCounter::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        counter.increment(1);
                    }
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().is_ok());
        }
        assert_eq!(counter.get(), 4_000);
        assert_eq!(counter.reset(), 4_000);
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn gauge_accumulates() {
        let gauge = LockFreeGauge::new();
        gauge.set(1.5);
        gauge.add(-0.5);
        assert!((gauge.get() - 1.0).abs() < f64::EPSILON);
    }
}
