//! Sliding-window admission control for session messages.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

pub const DEFAULT_MAX_MESSAGES: usize = 10;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(5);

/// Admission policy: at most `max_messages` within any trailing `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiter {
    pub max_messages: usize,
    pub window: Duration,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGES, DEFAULT_WINDOW)
    }
}

impl RateLimiter {
    pub fn new(max_messages: usize, window: Duration) -> Self {
        Self {
            max_messages,
            window,
        }
    }

    /// Records `now` in `window` if the session is still under its budget.
    ///
    /// Timestamps older than the window are pruned first. A rejected
    /// message is not recorded.
    pub fn admit(&self, window: &mut RateWindow, now: Instant) -> bool {
        // Keep the sequence non-decreasing even if callers hand us a stale clock.
        let now = window.stamps.back().map_or(now, |&last| now.max(last));

        while let Some(&oldest) = window.stamps.front() {
            if now.duration_since(oldest) > self.window {
                window.stamps.pop_front();
            } else {
                break;
            }
        }

        if window.stamps.len() >= self.max_messages {
            return false;
        }

        window.stamps.push_back(now);
        true
    }
}

/// Timestamps of the recently admitted messages of one session.
#[derive(Debug, Default, Clone)]
pub struct RateWindow {
    stamps: VecDeque<Instant>,
}

impl RateWindow {
    pub fn len(&self) -> usize {
        self.stamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stamps.is_empty()
    }
}
