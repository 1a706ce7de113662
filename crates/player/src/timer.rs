//! Single-flight retry timer

use std::pin::Pin;
use std::time::Duration;
use tokio::time::{sleep, Instant, Sleep};

/// Owned handle on at most one scheduled retry
///
/// Scheduling while a retry is already pending is a no-op, so callers can
/// request a retry on every failure path without stacking timers.
#[derive(Debug, Default)]
pub struct RetryTimer {
    pending: Option<Pin<Box<Sleep>>>,
}

impl RetryTimer {
    /// Create an idle timer
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a retry after `delay`
    ///
    /// Returns `false` if a retry was already pending.
    pub fn schedule(&mut self, delay: Duration) -> bool {
        if self.pending.is_some() {
            return false;
        }
        self.pending = Some(Box::pin(sleep(delay)));
        true
    }

    /// Cancel the pending retry, if any
    ///
    /// Returns `true` if a retry was pending.
    pub fn cancel(&mut self) -> bool {
        self.pending.take().is_some()
    }

    /// Whether a retry is pending
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// When the pending retry is due
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|sleep| sleep.deadline())
    }

    /// Wait for the pending retry to fire
    ///
    /// Never completes while idle. Cancel safe: dropping the future keeps the
    /// retry pending.
    pub async fn fired(&mut self) {
        match self.pending.as_mut() {
            Some(sleep) => {
                sleep.as_mut().await;
                self.pending = None;
            }
            None => futures::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, task};

    #[tokio::test(start_paused = true)]
    async fn test_schedule_is_single_flight() {
        let mut timer = RetryTimer::new();
        assert!(timer.schedule(Duration::from_secs(2)));
        let first = timer.deadline().unwrap();

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(!timer.schedule(Duration::from_secs(2)));
        assert_eq!(timer.deadline(), Some(first));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay() {
        let mut timer = RetryTimer::new();
        let start = Instant::now();
        timer.schedule(Duration::from_secs(2));

        timer.fired().await;

        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(!timer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel() {
        let mut timer = RetryTimer::new();
        assert!(!timer.cancel());

        timer.schedule(Duration::from_secs(2));
        assert!(timer.cancel());
        assert!(!timer.is_pending());

        // Can be rescheduled after cancellation
        assert!(timer.schedule(Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timer_never_fires() {
        let mut timer = RetryTimer::new();
        let mut fired = task::spawn(timer.fired());

        assert_pending!(fired.poll());
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_pending!(fired.poll());
    }
}
