//! Awaitility-style polling helpers for asynchronous assertions.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Poll `condition` until it returns true, panicking after `timeout`.
pub async fn await_until<F, Fut>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition().await {
            return;
        }
        if Instant::now() >= deadline {
            panic!("condition not met within {timeout:?}");
        }
        sleep(POLL_INTERVAL).await;
    }
}

/// Assert that `condition` keeps holding for the whole `duration`.
pub async fn assert_holds_during<F, Fut>(duration: Duration, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        assert!(condition().await, "condition stopped holding early");
        sleep(POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_await_until_returns_once_condition_holds() {
        let calls = AtomicU32::new(0);
        await_until(Duration::from_secs(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { n >= 3 }
        })
        .await;
        assert!(calls.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test]
    #[should_panic(expected = "condition not met")]
    async fn test_await_until_panics_on_timeout() {
        await_until(Duration::from_millis(120), || async { false }).await;
    }
}
