//! Fixed-window limiter for JWKS refreshes.

use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Allows at most `max_per_window` refreshes in each fixed window.
///
/// Requests beyond the limit are refused immediately; nothing waits for the
/// next window.
pub struct RefreshLimiter {
    max_per_window: u32,
    window: Duration,
    state: Mutex<WindowState>,
}

struct WindowState {
    started: Instant,
    used: u32,
}

impl RefreshLimiter {
    pub fn new(max_per_window: u32, window: Duration) -> Self {
        Self {
            max_per_window,
            window,
            state: Mutex::new(WindowState {
                started: Instant::now(),
                used: 0,
            }),
        }
    }

    /// Consume one slot. Returns `false` when the current window is exhausted.
    pub fn try_acquire(&self) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };

        let now = Instant::now();
        if now.duration_since(state.started) >= self.window {
            state.started = now;
            state.used = 0;
        }

        if state.used >= self.max_per_window {
            return false;
        }
        state.used += 1;
        true
    }

    /// Slots left in the current window.
    pub fn remaining(&self) -> u32 {
        self.state
            .lock()
            .map(|state| {
                if state.started.elapsed() >= self.window {
                    self.max_per_window
                } else {
                    self.max_per_window.saturating_sub(state.used)
                }
            })
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_limit_within_window() {
        let limiter = RefreshLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        assert_eq!(limiter.remaining(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets() {
        let limiter = RefreshLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!limiter.try_acquire());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(limiter.remaining(), 1);
        assert!(limiter.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_budget_never_allows() {
        let limiter = RefreshLimiter::new(0, Duration::from_secs(60));
        assert!(!limiter.try_acquire());
    }
}
