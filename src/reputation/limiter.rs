//! Outbound call budget for the reputation service.
//!
//! Remote services cap lookups and submissions per key; running out locally is cheaper
//! than being throttled remotely.

use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Fixed-window call counter, one window per endpoint
#[derive(Debug)]
pub struct CallLimiter {
    /// Map of endpoint -> (calls in window, window start)
    calls: DashMap<&'static str, (u32, Instant)>,
    /// Calls allowed per window, 0 = unlimited
    limit: u32,
    window: Duration,
}

impl CallLimiter {
    pub fn new(calls_per_minute: u32) -> Self {
        Self::with_window(calls_per_minute, Duration::from_secs(60))
    }

    pub fn with_window(limit: u32, window: Duration) -> Self {
        Self {
            calls: DashMap::new(),
            limit,
            window,
        }
    }

    /// Take one call from the endpoint's budget.
    /// Returns the time until the window resets when the budget is spent.
    pub fn try_acquire(&self, endpoint: &'static str) -> Result<(), Duration> {
        if self.limit == 0 {
            return Ok(());
        }

        let now = Instant::now();
        let mut entry = self.calls.entry(endpoint).or_insert((0, now));
        let (count, window_start) = entry.value_mut();

        if now.duration_since(*window_start) >= self.window {
            *count = 0;
            *window_start = now;
        }

        if *count >= self.limit {
            let reset_after = self
                .window
                .checked_sub(now.duration_since(*window_start))
                .unwrap_or_default();
            return Err(reset_after);
        }

        *count += 1;
        Ok(())
    }

    /// Calls left in the current window
    pub fn remaining(&self, endpoint: &'static str) -> Option<u32> {
        if self.limit == 0 {
            return None;
        }
        let now = Instant::now();
        let remaining = match self.calls.get(endpoint) {
            Some(entry) if now.duration_since(entry.1) < self.window => {
                self.limit.saturating_sub(entry.0)
            }
            _ => self.limit,
        };
        Some(remaining)
    }
}
