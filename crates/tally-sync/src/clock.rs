//! # Clock
//!
//! The scanner's reconnect path waits a fixed settle interval. Waiting goes
//! through [`Clock`] so tests can observe the wait without paying for it.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Source of delays.
pub trait Clock: Send + Sync + 'static {
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}

/// Real time via `tokio::time::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Records every requested sleep and returns at once.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every duration passed to `sleep`, in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Clock for ManualClock {
    async fn sleep(&self, duration: Duration) {
        self.sleeps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(duration);
        // Let other tasks run, as a real sleep would
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manual_clock_records() {
        let clock = ManualClock::new();
        clock.sleep(Duration::from_millis(1500)).await;
        clock.sleep(Duration::from_millis(10)).await;
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_millis(1500), Duration::from_millis(10)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_sleeps() {
        let start = tokio::time::Instant::now();
        TokioClock.sleep(Duration::from_secs(2)).await;
        assert!(start.elapsed() >= Duration::from_secs(2));
    }
}
