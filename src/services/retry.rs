use std::time::Duration;

use tokio::sync::watch;

/// Capped exponential backoff.
///
/// Attempt `n` (zero-based) waits `min(base * 2^n, max)`. A delay suggested by
/// the provider (`Retry-After`) replaces the computed one but is still capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }

    pub fn allows(&self, retries_so_far: u32) -> bool {
        retries_so_far < self.max_retries
    }

    pub fn delay_for(&self, attempt: u32, suggested: Option<Duration>) -> Duration {
        let delay = match suggested {
            Some(hint) => hint,
            None => {
                let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(30))
    }
}

/// Sleep for `delay` unless the cancel flag flips first.
///
/// Returns `false` when the wait was cut short by cancellation.
pub async fn wait_or_cancel(delay: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
    if *cancel.borrow() {
        return false;
    }
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            changed = cancel.changed() => match changed {
                Ok(()) if *cancel.borrow() => return false,
                Ok(()) => continue,
                // Sender gone: nobody can cancel any more, finish the wait.
                Err(_) => {
                    (&mut sleep).await;
                    return true;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_cap() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_millis(700));
        assert_eq!(policy.delay_for(0, None), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1, None), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2, None), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3, None), Duration::from_millis(700));
        assert_eq!(policy.delay_for(40, None), Duration::from_millis(700));
    }

    #[test]
    fn test_retry_after_hint_is_capped() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(5));
        assert_eq!(
            policy.delay_for(0, Some(Duration::from_secs(2))),
            Duration::from_secs(2)
        );
        assert_eq!(
            policy.delay_for(0, Some(Duration::from_secs(60))),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_allows_counts_retries() {
        let policy = RetryPolicy::new(2, Duration::ZERO, Duration::ZERO);
        assert!(policy.allows(0));
        assert!(policy.allows(1));
        assert!(!policy.allows(2));
        assert!(!RetryPolicy::none().allows(0));
    }

    #[tokio::test]
    async fn test_wait_cut_short_by_cancel() {
        let (tx, mut rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            wait_or_cancel(Duration::from_secs(30), &mut rx).await
        });
        tx.send(true).unwrap();
        let completed = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(!completed);
    }
}
