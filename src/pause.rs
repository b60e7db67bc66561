//! Pauses between retry attempts.
//!
//! The retry executor hands every computed backoff to a [`RetryPause`]
//! together with the attempt it precedes. Production waits on the tokio
//! timer; tests skip the wait or record the schedule.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Sink for the delay between a failed attempt and the next one.
#[async_trait]
pub trait RetryPause: Send + Sync + std::fmt::Debug {
    /// Wait out `delay` before retry attempt `next_attempt` (1-based).
    async fn wait(&self, delay: Duration, next_attempt: u32);
}

#[async_trait]
impl<P: RetryPause + ?Sized> RetryPause for Arc<P> {
    async fn wait(&self, delay: Duration, next_attempt: u32) {
        (**self).wait(delay, next_attempt).await;
    }
}

/// Production pause backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimerPause;

#[async_trait]
impl RetryPause for TimerPause {
    async fn wait(&self, delay: Duration, _next_attempt: u32) {
        tokio::time::sleep(delay).await;
    }
}

/// Test pause that returns immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPause;

#[async_trait]
impl RetryPause for NoPause {
    async fn wait(&self, _delay: Duration, _next_attempt: u32) {}
}

/// Test pause that records the schedule instead of waiting: which attempt
/// each delay preceded and how long it was.
#[derive(Debug, Default)]
pub struct RecordingPause {
    schedule: Mutex<Vec<(u32, Duration)>>,
}

impl RecordingPause {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pauses taken so far.
    pub fn count(&self) -> usize {
        self.lock().len()
    }

    /// The delay recorded before `attempt`, if that pause happened.
    pub fn delay_before(&self, attempt: u32) -> Option<Duration> {
        self.lock()
            .iter()
            .find(|(next, _)| *next == attempt)
            .map(|(_, delay)| *delay)
    }

    /// Total time the executor would have slept.
    pub fn total_delay(&self) -> Duration {
        self.lock().iter().map(|(_, delay)| *delay).sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(u32, Duration)>> {
        self.schedule.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl RetryPause for RecordingPause {
    async fn wait(&self, delay: Duration, next_attempt: u32) {
        self.lock().push((next_attempt, delay));
    }
}
