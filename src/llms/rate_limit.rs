//! Client-side requests-per-minute limiting.
//!
//! The limiter counts requests in a fixed window. When the window is full,
//! callers sleep until it rolls over. The window is the only mutable state
//! shared between cells, so it sits behind a mutex that is never held across
//! an await point.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::conversation::Conversation;
use crate::errors::BackendError;
use crate::llms::backend::ModelBackend;

const MINUTE: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct Window {
    started: Instant,
    count: u32,
}

/// Fixed-window request counter.
#[derive(Debug)]
pub struct RpmLimiter {
    max_per_window: u32,
    window_len: Duration,
    window: Mutex<Window>,
}

impl RpmLimiter {
    pub fn new(max_rpm: u32) -> Self {
        Self::with_window(max_rpm, MINUTE)
    }

    pub fn with_window(max_per_window: u32, window_len: Duration) -> Self {
        Self {
            max_per_window: max_per_window.max(1),
            window_len,
            window: Mutex::new(Window {
                started: Instant::now(),
                count: 0,
            }),
        }
    }

    /// Count one request, sleeping first if the current window is full.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut window = self.window.lock();
                let elapsed = window.started.elapsed();
                if elapsed >= self.window_len {
                    window.started = Instant::now();
                    window.count = 0;
                }
                if window.count < self.max_per_window {
                    window.count += 1;
                    return;
                }
                self.window_len.saturating_sub(elapsed)
            };
            log::info!("max RPM reached, waiting {:?} for the next window", wait);
            tokio::time::sleep(wait).await;
        }
    }

    /// Requests counted in the current window.
    pub fn current(&self) -> u32 {
        let window = self.window.lock();
        if window.started.elapsed() >= self.window_len {
            0
        } else {
            window.count
        }
    }
}

/// A backend whose calls pass through an [`RpmLimiter`] first.
#[derive(Debug)]
pub struct RateLimitedBackend {
    inner: Arc<dyn ModelBackend>,
    limiter: RpmLimiter,
}

impl RateLimitedBackend {
    pub fn new(inner: Arc<dyn ModelBackend>, limiter: RpmLimiter) -> Self {
        Self { inner, limiter }
    }
}

#[async_trait]
impl ModelBackend for RateLimitedBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn provider(&self) -> &str {
        self.inner.provider()
    }

    async fn complete(&self, conversation: &Conversation) -> Result<String, BackendError> {
        self.limiter.acquire().await;
        self.inner.complete(conversation).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedBackend;

    #[tokio::test]
    async fn test_counts_within_window() {
        let limiter = RpmLimiter::new(3);
        limiter.acquire().await;
        limiter.acquire().await;
        assert_eq!(limiter.current(), 2);
    }

    #[tokio::test]
    async fn test_waits_for_next_window_when_full() {
        let limiter = RpmLimiter::with_window(2, Duration::from_millis(50));
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert_eq!(limiter.current(), 1);
    }

    #[tokio::test]
    async fn test_decorator_delegates() {
        let inner = Arc::new(ScriptedBackend::new("gpt-4").then_ok("3"));
        let backend = RateLimitedBackend::new(inner.clone(), RpmLimiter::new(10));
        assert_eq!(backend.name(), "gpt-4");
        assert_eq!(backend.complete(&Conversation::new()).await.unwrap(), "3");
        assert_eq!(inner.calls(), 1);
    }
}
