//! Bounded waiting.
//!
//! Every sleep in the engine goes through a [`Deadline`], so no wait can
//! outlive the action that started it.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};

/// Optional absolute cut-off for an action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// No cut-off.
    pub fn none() -> Self {
        Self(None)
    }

    pub fn at(instant: Instant) -> Self {
        Self(Some(instant))
    }

    pub fn after(duration: Duration) -> Self {
        Self(Some(Instant::now() + duration))
    }

    pub fn instant(&self) -> Option<Instant> {
        self.0
    }

    /// Whichever of the two cuts off first.
    pub fn earliest(self, other: Deadline) -> Deadline {
        match (self.0, other.0) {
            (Some(a), Some(b)) => Deadline(Some(a.min(b))),
            (a, b) => Deadline(a.or(b)),
        }
    }

    /// Time left, `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.0.map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_some_and(|r| r.is_zero())
    }

    /// The smaller of `limit` and the time left.
    pub fn clamp(&self, limit: Duration) -> Duration {
        self.remaining().map_or(limit, |r| r.min(limit))
    }

    /// Sleep for `duration`, or until the deadline if that comes first.
    ///
    /// Cutting the sleep short is a timeout.
    pub async fn sleep(&self, duration: Duration, operation: &str) -> Result<()> {
        let bounded = self.clamp(duration);
        tokio::time::sleep(bounded).await;
        if bounded < duration {
            return Err(EngineError::timeout(operation, bounded));
        }
        Ok(())
    }
}

/// Checkpoint for blocking work: errors once `cancel` has fired.
pub fn ensure_active(cancel: &CancellationToken, operation: &str) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(EngineError::Cancelled(operation.to_string()));
    }
    Ok(())
}

/// Delay before retry number `attempt + 1` (attempts count from 1).
pub fn backoff_delay(base: Duration, attempt: u32, exponential: bool) -> Duration {
    if !exponential || attempt <= 1 {
        return base;
    }
    let factor = 2u32.saturating_pow(attempt - 1);
    base.saturating_mul(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;

    #[test]
    fn exponential_backoff_doubles() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 1, true), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 2, true), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 3, true), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, 3, false), Duration::from_secs(1));
    }

    #[test]
    fn backoff_saturates() {
        let d = backoff_delay(Duration::from_secs(1), 200, true);
        assert_eq!(d, Duration::from_secs(u64::from(u32::MAX)));
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_sleep_completes() {
        let start = Instant::now();
        Deadline::none()
            .sleep(Duration::from_secs(5), "pause")
            .await
            .unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_is_cut_at_deadline() {
        let start = Instant::now();
        let deadline = Deadline::after(Duration::from_secs(2));
        let err = deadline
            .sleep(Duration::from_secs(10), "retry backoff")
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Timeout);
        assert_eq!(start.elapsed(), Duration::from_secs(2));
        assert!(deadline.expired());
    }

    #[tokio::test(start_paused = true)]
    async fn earliest_picks_the_sooner_cutoff() {
        let soon = Deadline::after(Duration::from_secs(1));
        let later = Deadline::after(Duration::from_secs(5));
        assert_eq!(later.earliest(soon), soon);
        assert_eq!(Deadline::none().earliest(later), later);
        assert_eq!(Deadline::none().earliest(Deadline::none()), Deadline::none());
    }

    #[tokio::test(start_paused = true)]
    async fn clamp_uses_remaining_time() {
        let deadline = Deadline::after(Duration::from_secs(3));
        assert_eq!(deadline.clamp(Duration::from_secs(10)), Duration::from_secs(3));
        assert_eq!(deadline.clamp(Duration::from_secs(1)), Duration::from_secs(1));
        assert_eq!(Deadline::none().clamp(Duration::from_secs(7)), Duration::from_secs(7));
    }

    #[test]
    fn cancelled_checkpoint_is_a_timeout() {
        let cancel = CancellationToken::new();
        assert!(ensure_active(&cancel, "template search").is_ok());
        cancel.cancel();
        let err = ensure_active(&cancel, "template search").unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Timeout);
        assert_eq!(err.to_string(), "template search was cancelled");
    }
}
