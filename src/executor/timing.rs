//! Deadline waiting for state timers.
//!
//! Tokio timers have millisecond granularity. When a spin margin is
//! configured, the wait sleeps until `deadline - margin` and then yields in a
//! loop until the deadline passes, trading CPU for sub-millisecond accuracy.

use std::time::Duration;
use tokio::time::{sleep_until, Instant};

/// Wait until `deadline`.
pub async fn wait_until(deadline: Instant, spin_margin: Duration) {
    if spin_margin.is_zero() {
        sleep_until(deadline).await;
        return;
    }

    let coarse = deadline.checked_sub(spin_margin).unwrap_or(deadline);
    if Instant::now() < coarse {
        sleep_until(coarse).await;
    }
    while Instant::now() < deadline {
        tokio::task::yield_now().await;
    }
}

/// Like [`wait_until`], but never completes when there is no deadline.
pub async fn wait_for_deadline(deadline: Option<Instant>, spin_margin: Duration) {
    match deadline {
        Some(deadline) => wait_until(deadline, spin_margin).await,
        None => std::future::pending().await,
    }
}

/// How late a timer fired relative to its deadline.
pub fn lateness(deadline: Instant, fired: Instant) -> Duration {
    fired.saturating_duration_since(deadline)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn wait_until_reaches_deadline() {
        let start = Instant::now();
        let deadline = start + Duration::from_millis(100);

        wait_until(deadline, Duration::ZERO).await;

        assert!(Instant::now() >= deadline);
        assert_eq!(lateness(deadline, Instant::now()), Duration::ZERO);
    }

    #[tokio::test]
    async fn spinning_wait_never_returns_early() {
        let deadline = Instant::now() + Duration::from_millis(3);

        wait_until(deadline, Duration::from_millis(2)).await;

        assert!(Instant::now() >= deadline);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_deadline_never_fires() {
        let waited = tokio::time::timeout(
            Duration::from_secs(10),
            wait_for_deadline(None, Duration::ZERO),
        )
        .await;
        assert!(waited.is_err());
    }

    #[test]
    fn lateness_saturates_for_early_fire() {
        let now = Instant::now();
        assert_eq!(lateness(now + Duration::from_secs(1), now), Duration::ZERO);
    }
}
