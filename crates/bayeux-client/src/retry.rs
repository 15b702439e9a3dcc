//! Reachability-gated bounded retry.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::reachability::ReachabilityHandle;

/// Runs `op` up to `max_attempts` times, sleeping `interval` between
/// attempts. Waits for reachability once, up front; it is not re-checked
/// between attempts. The final attempt's error propagates.
///
/// `max_attempts` of zero is treated as one attempt.
pub async fn auto_retry<T, E, F, Fut>(
    reachability: &ReachabilityHandle,
    mut op: F,
    max_attempts: u32,
    interval: Duration,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut gate = reachability.clone();
    gate.await_up().await;

    let mut attempt: u32 = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts => {
                debug!(attempt, error = %e, "attempt failed; retrying");
                tokio::time::sleep(interval).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reachability::Reachability;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn flaky(fail_first: u32) -> (Arc<AtomicU32>, impl FnMut() -> std::future::Ready<Result<u32, String>>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let op = move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= fail_first {
                std::future::ready(Err(format!("boom {n}")))
            } else {
                std::future::ready(Ok(n))
            }
        };
        (calls, op)
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let handle = ReachabilityHandle::always_up();
        let (calls, op) = flaky(2);
        let result = auto_retry(&handle, op, 5, Duration::from_millis(100)).await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn last_attempt_error_propagates() {
        let handle = ReachabilityHandle::always_up();
        let (calls, op) = flaky(10);
        let result = auto_retry(&handle, op, 3, Duration::from_millis(100)).await;
        assert_eq!(result, Err("boom 3".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_attempts_behaves_as_one() {
        let handle = ReachabilityHandle::always_up();
        let (calls, op) = flaky(10);
        let result = auto_retry(&handle, op, 0, Duration::from_millis(100)).await;
        assert_eq!(result, Err("boom 1".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_reachability_before_first_attempt() {
        let oracle = Reachability::new(false);
        let handle = oracle.handle();
        let (calls, op) = flaky(0);

        let task = tokio::spawn(async move {
            auto_retry(&handle, op, 1, Duration::from_millis(100)).await
        });
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0, "gated while down");

        oracle.set_up(true);
        let result = task.await.unwrap();
        assert_eq!(result, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
