//! General utility code that didn't fit anywhere else
// (c) 2024 Ross Younger

mod tracing;
pub use tracing::setup as setup_tracing;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Arms a one-shot timer that fires at an absolute deadline.
///
/// The returned channel yields a value when the deadline passes. If `scope` is
/// cancelled first the timer task exits without firing. Re-arming (after a
/// phase change) is done by simply calling this again with a fresh deadline;
/// the old task, if still pending, dies with its scope.
pub fn timeout_at(scope: &CancellationToken, deadline: Instant) -> oneshot::Receiver<Instant> {
    let (tx, rx) = oneshot::channel();
    let scope = scope.clone();
    let _ = tokio::spawn(async move {
        tokio::select! {
            () = scope.cancelled() => (),
            () = tokio::time::sleep_until(deadline) => {
                let _ = tx.send(Instant::now());
            }
        }
    });
    rx
}

/// Converts a byte rate into decimal megabits per second
#[must_use]
pub fn to_mbps(bytes_per_second: f64) -> f64 {
    bytes_per_second * 8.0 / 1_000_000.0
}

/// Converts a byte rate into decimal megabytes per second
#[must_use]
pub fn to_mbytes_per_second(bytes_per_second: f64) -> f64 {
    bytes_per_second / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::timeout_at;
    use tokio::time::{Duration, Instant};
    use tokio_util::sync::CancellationToken;

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_at_deadline() {
        let scope = CancellationToken::new();
        let rx = timeout_at(&scope, Instant::now() + Duration::from_secs(5));
        let fired = rx.await;
        assert!(fired.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_does_not_fire_when_scope_cancelled() {
        let scope = CancellationToken::new();
        let rx = timeout_at(&scope, Instant::now() + Duration::from_secs(5));
        scope.cancel();
        // The sender is dropped without sending.
        assert!(rx.await.is_err());
    }

    #[test]
    fn cancellation_is_idempotent() {
        let scope = CancellationToken::new();
        let child = scope.child_token();
        scope.cancel();
        scope.cancel();
        assert!(scope.is_cancelled());
        assert!(child.is_cancelled());
    }

    #[test]
    fn unit_conversions() {
        assert!((super::to_mbps(1_000_000.0) - 8.0).abs() < f64::EPSILON);
        assert!((super::to_mbytes_per_second(2_500_000.0) - 2.5).abs() < f64::EPSILON);
    }
}
