//! Sliding-window event counters.
//!
//! The rechoke pass classifies peers by how many blocks and cancels were
//! exchanged in the recent past. Events decay out of the window lazily.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Counts events inside a trailing time window.
#[derive(Debug, Default)]
pub struct RecentHistory {
    events: VecDeque<(Instant, u32)>,
    total: u64,
}

impl RecentHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `n` events at `now`.
    pub fn add(&mut self, now: Instant, n: u32) {
        if n == 0 {
            return;
        }
        // Coalesce with the newest bucket when times collide.
        if let Some(last) = self.events.back_mut() {
            if last.0 == now {
                last.1 += n;
                self.total += u64::from(n);
                return;
            }
        }
        self.events.push_back((now, n));
        self.total += u64::from(n);
    }

    /// Number of events recorded within `window` of `now`.
    pub fn count(&mut self, now: Instant, window: Duration) -> u32 {
        self.prune(now, window);
        self.total.min(u32::MAX as u64) as u32
    }

    /// True when no events remain in the buffer.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&(t, n)) = self.events.front() {
            if now.saturating_duration_since(t) <= window {
                break;
            }
            self.total -= u64::from(n);
            self.events.pop_front();
        }
    }
}
