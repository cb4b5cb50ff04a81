//! Wall-clock anchoring for kernel timestamps.
//!
//! Capture records carry `bpf_ktime_get_ns()` values; translating them
//! to epoch microseconds needs the system boot time in realtime terms.
//! The base drifts with clock adjustments, so it is refreshed
//! periodically and the drift between refreshes is exported as a stat.

use nix::time::{clock_gettime, ClockId};
use std::sync::atomic::{AtomicU64, Ordering};

fn clock_ns(clock: ClockId) -> u64 {
    match clock_gettime(clock) {
        Ok(ts) => (ts.tv_sec() as u64) * 1_000_000_000 + ts.tv_nsec() as u64,
        Err(_) => 0,
    }
}

pub fn realtime_ns() -> u64 {
    clock_ns(ClockId::CLOCK_REALTIME)
}

pub fn monotonic_ns() -> u64 {
    clock_ns(ClockId::CLOCK_MONOTONIC)
}

/// Seconds since boot, the unit the kernel stamps `update_time` with.
pub fn uptime_secs() -> u32 {
    (monotonic_ns() / 1_000_000_000) as u32
}

#[derive(Debug)]
pub struct BootTimeSync {
    boot_ns: AtomicU64,
    prev_boot_ns: AtomicU64,
}

impl BootTimeSync {
    pub fn new() -> Self {
        let now = Self::sample();
        Self {
            boot_ns: AtomicU64::new(now),
            prev_boot_ns: AtomicU64::new(now),
        }
    }

    fn sample() -> u64 {
        realtime_ns().saturating_sub(monotonic_ns())
    }

    pub fn boot_ns(&self) -> u64 {
        self.boot_ns.load(Ordering::Relaxed)
    }

    /// Re-anchor and return the drift against the previous base.
    pub fn refresh(&self) -> i64 {
        let fresh = Self::sample();
        let prev = self.boot_ns.swap(fresh, Ordering::Relaxed);
        self.prev_boot_ns.store(prev, Ordering::Relaxed);
        fresh as i64 - prev as i64
    }

    /// Difference between the two most recent anchors.
    pub fn drift_ns(&self) -> i64 {
        self.boot_ns.load(Ordering::Relaxed) as i64
            - self.prev_boot_ns.load(Ordering::Relaxed) as i64
    }
}

impl Default for BootTimeSync {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_base_is_stable_between_refreshes() {
        let sync = BootTimeSync::new();
        let first = sync.boot_ns();
        assert!(first > 0);
        let drift = sync.refresh();
        // Two samples a moment apart agree to well under a second.
        assert!(drift.abs() < 1_000_000_000, "drift {drift} ns");
        assert_eq!(sync.drift_ns(), drift);
    }

    #[test]
    fn uptime_is_monotonic() {
        let a = uptime_secs();
        let b = uptime_secs();
        assert!(b >= a);
    }
}
