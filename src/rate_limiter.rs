//! Per-node admission control.
//!
//! Fixed window counter per node id. The check-and-increment runs while
//! holding the node's map entry, so two racing callers can never both take
//! the last slot of a window.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

use crate::constants::rate_limit::{CLEANUP_INTERVAL_SECS, IDLE_WINDOWS_BEFORE_CLEANUP};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateWindow {
    pub window_start: Instant,
    pub count: u32,
    pub capacity: u32,
}

pub struct RateLimiter {
    windows: DashMap<String, RateWindow>,
    last_cleanup: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            windows: DashMap::new(),
            last_cleanup: Mutex::new(Instant::now()),
        }
    }

    pub fn try_admit(&self, node_id: &str, capacity: u32, window: Duration) -> bool {
        self.try_admit_at(node_id, capacity, window, Instant::now())
    }

    pub fn try_admit_at(&self, node_id: &str, capacity: u32, window: Duration, now: Instant) -> bool {
        self.cleanup_idle(now, window);

        let mut entry = self
            .windows
            .entry(node_id.to_string())
            .or_insert_with(|| RateWindow {
                window_start: now,
                count: 0,
                capacity,
            });
        let slot = entry.value_mut();
        slot.capacity = capacity;

        if now.saturating_duration_since(slot.window_start) >= window {
            slot.window_start = now;
            slot.count = 0;
        }

        if slot.count >= slot.capacity {
            false
        } else {
            slot.count += 1;
            true
        }
    }

    /// Current window for a node, if it has ever been admitted.
    pub fn window(&self, node_id: &str) -> Option<RateWindow> {
        self.windows.get(node_id).map(|w| *w.value())
    }

    /// Slots left in the node's current window (ignores expiry).
    pub fn remaining(&self, node_id: &str) -> Option<u32> {
        self.window(node_id)
            .map(|w| w.capacity.saturating_sub(w.count))
    }

    pub fn tracked(&self) -> usize {
        self.windows.len()
    }

    // Drop windows idle for many window lengths to bound memory
    fn cleanup_idle(&self, now: Instant, window: Duration) {
        {
            let mut last = self.last_cleanup.lock();
            if now.saturating_duration_since(*last) <= Duration::from_secs(CLEANUP_INTERVAL_SECS) {
                return;
            }
            *last = now;
        }

        let max_age = window * IDLE_WINDOWS_BEFORE_CLEANUP;
        self.windows
            .retain(|_, w| now.saturating_duration_since(w.window_start) < max_age);
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
