use std::time::Duration;

use anyhow::{Result, bail};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Exponential backoff w/ "full jitter":
/// sleep for a random duration in [0, min(cap, base * 2^attempt)].
///
/// This tends to behave well under contention and avoids lockstep retries.
pub fn backoff_full_jitter(base: Duration, cap: Duration, attempt: usize) -> Duration {
    let base_ms = base.as_millis() as u64;
    let cap_ms = cap.as_millis() as u64;

    // 2^attempt, saturating if attempt is huge.
    let pow = if attempt >= 63 {
        u64::MAX
    } else {
        1u64 << attempt
    };

    let exp_ms = base_ms.saturating_mul(pow);
    let upper = exp_ms.min(cap_ms).max(1); // avoid 0ms upper bound

    // Full jitter: uniform random in [0, upper]
    let jitter_ms = rand::random_range(0..=upper);
    Duration::from_millis(jitter_ms)
}

/// Idle wait between claim attempts. Returns early when `wake` fires (new
/// work was enqueued in-process); bails when the engine is shutting down.
pub async fn idle_wait(
    cancel: &CancellationToken,
    wake: &Notify,
    attempt: usize,
    cap: Duration,
) -> Result<()> {
    let base = Duration::from_millis(250);
    let delay = backoff_full_jitter(base, cap, attempt);

    tokio::select! {
        _ = cancel.cancelled() => bail!("shutting down"),
        _ = tokio::time::sleep(delay) => Ok(()),
        _ = wake.notified() => Ok(()),
    }
}

/// Plain cancellable sleep, used by action bodies polling for child results.
pub async fn sleep_cancellable(cancel: &CancellationToken, delay: Duration) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => bail!("shutting down"),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_under_cap() {
        let base = Duration::from_millis(250);
        let cap = Duration::from_secs(5);
        for attempt in 0..100 {
            let d = backoff_full_jitter(base, cap, attempt);
            assert!(d <= cap);
        }
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let d = backoff_full_jitter(Duration::from_millis(250), Duration::from_secs(10), 10_000);
        assert!(d <= Duration::from_secs(10));
    }
}
