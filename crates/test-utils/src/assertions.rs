//! Test assertion helpers.
//!
//! Provides polling-based assertions for async test scenarios.

use std::time::Duration;

use tokio::{
    sync::broadcast,
    time::{Instant, sleep},
};

/// Default polling interval for [`assert_eventually`].
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Polls a condition until it returns true or the timeout expires.
///
/// # Returns
///
/// `true` if the condition became true before timeout, `false` otherwise.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use sentinel_test_utils::assert_eventually;
///
/// # async fn example(registry_len: impl Fn() -> usize) {
/// let drained = assert_eventually(Duration::from_secs(2), || registry_len() == 0).await;
/// assert!(drained, "registry should drain after quit");
/// # }
/// ```
pub async fn assert_eventually<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let start = Instant::now();

    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        sleep(DEFAULT_POLL_INTERVAL).await;
    }

    // Final check after timeout
    condition()
}

/// Receives from `events` until an item satisfies `predicate` or the timeout
/// expires.
///
/// Items that do not match are skipped, and so is lag. Returns `None` on
/// timeout or when the channel closes.
pub async fn next_matching<T, F>(
    events: &mut broadcast::Receiver<T>,
    timeout: Duration,
    mut predicate: F,
) -> Option<T>
where
    T: Clone,
    F: FnMut(&T) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        let received = tokio::time::timeout_at(deadline, events.recv()).await.ok()?;
        match received {
            Ok(item) if predicate(&item) => return Some(item),
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {},
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}
