// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 mdwire.io

//! Reconnect pacing.
//!
//! A [`ReconnectPacer`] spaces repeated attempts at one thing (resolving,
//! connecting to one address, binding a listener) by a jittered fixed
//! delay. The first attempt is immediate; each attempt schedules the next
//! one `delay * [0.5, 1.5)` later. [`PacerMap`] keeps one independent pacer
//! per resolved address in a bounded LRU so an unreachable address cannot
//! throttle attempts to a healthy one, and long-unused entries fall out.

use std::num::NonZeroUsize;
use std::thread;
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::addr::SocketAddress;

/// Granularity of the close check while sleeping out a pacing delay.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Per-address pacers retained before least-recently-used eviction.
const PACER_MAP_CAPACITY: usize = 64;

// ============================================================================
// ReconnectPacer
// ============================================================================

/// Jittered fixed-delay pacer for retry loops.
#[derive(Debug)]
pub struct ReconnectPacer {
    delay: Duration,
    next_attempt_at: Option<Instant>,
}

impl ReconnectPacer {
    /// Create a pacer with the given base delay.
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            next_attempt_at: None,
        }
    }

    /// Forget the schedule; the next attempt proceeds immediately.
    pub fn reset(&mut self) {
        self.next_attempt_at = None;
    }

    /// Sleep until the scheduled attempt time, checking `closed` every
    /// slice so a close aborts the wait promptly. Returns `false` when
    /// aborted. On a `true` return the next attempt is scheduled.
    pub fn sleep_before_attempt(&mut self, closed: &dyn Fn() -> bool) -> bool {
        if let Some(at) = self.next_attempt_at {
            loop {
                if closed() {
                    return false;
                }
                let now = Instant::now();
                if now >= at {
                    break;
                }
                thread::sleep((at - now).min(SLEEP_SLICE));
            }
        } else if closed() {
            return false;
        }
        let jitter = 0.5 + fastrand::f64();
        self.next_attempt_at = Some(Instant::now() + self.delay.mul_f64(jitter));
        true
    }
}

// ============================================================================
// PacerMap
// ============================================================================

/// Bounded map of independent per-address pacers.
#[derive(Debug)]
pub struct PacerMap {
    delay: Duration,
    map: LruCache<SocketAddress, ReconnectPacer>,
}

impl PacerMap {
    /// Create a map whose pacers all use `delay`.
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            map: LruCache::new(
                NonZeroUsize::new(PACER_MAP_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            ),
        }
    }

    /// Get the pacer for `address`, creating it on first use.
    pub fn pacer(&mut self, address: &SocketAddress) -> &mut ReconnectPacer {
        let delay = self.delay;
        self.map
            .get_or_insert_mut(address.clone(), || ReconnectPacer::new(delay))
    }

    /// Forget all pacing state.
    pub fn clear(&mut self) {
        self.map.clear();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const NEVER_CLOSED: fn() -> bool = || false;

    #[test]
    fn test_first_attempt_immediate() {
        let mut pacer = ReconnectPacer::new(Duration::from_secs(60));
        let start = Instant::now();
        assert!(pacer.sleep_before_attempt(&NEVER_CLOSED));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_second_attempt_paced() {
        let mut pacer = ReconnectPacer::new(Duration::from_millis(100));
        assert!(pacer.sleep_before_attempt(&NEVER_CLOSED));
        let start = Instant::now();
        assert!(pacer.sleep_before_attempt(&NEVER_CLOSED));
        // Jitter keeps the delay within [0.5, 1.5) of the base
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_reset_forgets_schedule() {
        let mut pacer = ReconnectPacer::new(Duration::from_secs(60));
        assert!(pacer.sleep_before_attempt(&NEVER_CLOSED));
        pacer.reset();
        let start = Instant::now();
        assert!(pacer.sleep_before_attempt(&NEVER_CLOSED));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_close_aborts_wait() {
        let mut pacer = ReconnectPacer::new(Duration::from_secs(60));
        assert!(pacer.sleep_before_attempt(&NEVER_CLOSED));
        let start = Instant::now();
        assert!(!pacer.sleep_before_attempt(&(|| true)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_pacer_map_independent_entries() {
        let mut map = PacerMap::new(Duration::from_secs(60));
        let a = SocketAddress::new("10.0.0.1", 7400);
        let b = SocketAddress::new("10.0.0.2", 7400);
        // Pacing one address does not schedule the other
        assert!(map.pacer(&a).sleep_before_attempt(&NEVER_CLOSED));
        let start = Instant::now();
        assert!(map.pacer(&b).sleep_before_attempt(&NEVER_CLOSED));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_pacer_map_clear() {
        let mut map = PacerMap::new(Duration::from_secs(60));
        let a = SocketAddress::new("10.0.0.1", 7400);
        assert!(map.pacer(&a).sleep_before_attempt(&NEVER_CLOSED));
        map.clear();
        let start = Instant::now();
        assert!(map.pacer(&a).sleep_before_attempt(&NEVER_CLOSED));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
