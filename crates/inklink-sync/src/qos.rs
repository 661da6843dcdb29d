//! QoS: write throttling and refresh debouncing for the device link.
//!
//! The companion radio drops writes when flooded, so every characteristic
//! write takes a permit from a rolling one-second window first. Device
//! refresh requests are debounced separately.
//!
//! Timing uses `tokio::time`, so paused-clock tests see exact waits.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use inklink_core::wire::{MAX_WRITES_PER_SECOND, REFRESH_MIN_INTERVAL_MS};

const WINDOW: Duration = Duration::from_secs(1);
const MIN_WAIT: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
struct LimiterState {
    recent_writes: VecDeque<Instant>,
    last_refresh_at: Option<Instant>,
}

#[derive(Debug)]
pub struct RateLimiter {
    state: Mutex<LimiterState>,
    max_per_window: usize,
    refresh_interval: Duration,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(
            MAX_WRITES_PER_SECOND,
            Duration::from_millis(REFRESH_MIN_INTERVAL_MS),
        )
    }
}

impl RateLimiter {
    pub fn new(max_writes_per_second: usize, refresh_interval: Duration) -> Self {
        Self {
            state: Mutex::new(LimiterState::default()),
            max_per_window: max_writes_per_second.max(1),
            refresh_interval,
        }
    }

    /// Wait until a write fits in the rolling window, then claim it.
    pub async fn acquire_permit(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                while let Some(&oldest) = state.recent_writes.front() {
                    if now.duration_since(oldest) >= WINDOW {
                        state.recent_writes.pop_front();
                    } else {
                        break;
                    }
                }

                if state.recent_writes.len() < self.max_per_window {
                    state.recent_writes.push_back(now);
                    return;
                }

                match state.recent_writes.front() {
                    Some(&oldest) => WINDOW
                        .saturating_sub(now.duration_since(oldest))
                        .max(MIN_WAIT),
                    None => MIN_WAIT,
                }
            };

            tracing::debug!(wait_ms = wait.as_millis() as u64, "write rate limit reached");
            tokio::time::sleep(wait).await;
        }
    }

    /// True at most once per refresh interval. A refused call does not
    /// extend the interval.
    pub async fn allow_refresh_request(&self) -> bool {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        if let Some(last) = state.last_refresh_at {
            if now.duration_since(last) < self.refresh_interval {
                return false;
            }
        }
        state.last_refresh_at = Some(now);
        true
    }
}
