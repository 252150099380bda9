use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Capped exponential backoff with jitter and a fixed retry ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Delay before the first retry, doubled for each further retry.
    pub base: Duration,
    /// Upper bound for a single delay.
    pub cap: Duration,
    /// Retries after the first attempt. The operation runs at most `max_retries + 1` times.
    pub max_retries: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(5),
            max_retries: 10,
        }
    }
}

impl Backoff {
    /// The delay before retry number `attempt`, counting from zero.
    ///
    /// Picked uniformly between half and all of the capped exponential delay so that concurrent
    /// callers spread out.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let full = self.base.saturating_mul(factor).min(self.cap);
        let full_ms = full.as_millis() as u64;
        if full_ms == 0 {
            return full;
        }

        Duration::from_millis(rand::thread_rng().gen_range(full_ms / 2..=full_ms))
    }

    /// Run `op` until it succeeds, `should_retry` rejects its error or the retries are used up.
    pub async fn retry<T, E, F, Fut>(
        &self,
        what: &str,
        mut op: F,
        should_retry: impl Fn(&E) -> bool,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_retries && should_retry(&e) => {
                    let delay = self.delay(attempt);
                    attempt += 1;
                    log::debug!(
                        "{what} failed (attempt {attempt}/{}), retrying in {delay:?}: {e}",
                        self.max_retries + 1
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> Backoff {
        Backoff {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(4),
            max_retries: 3,
        }
    }

    #[test]
    fn delay_is_capped() {
        let backoff = Backoff {
            base: Duration::from_millis(100),
            cap: Duration::from_millis(500),
            max_retries: 50,
        };

        for attempt in 0..40 {
            let delay = backoff.delay(attempt);
            assert!(delay <= Duration::from_millis(500), "{delay:?}");
        }
        assert!(backoff.delay(0) >= Duration::from_millis(50));
        assert!(backoff.delay(30) >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn retry_until_success() {
        let calls = &AtomicU32::new(0);
        let result: Result<u32, String> = fast()
            .retry(
                "flaky",
                move || async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err("refused".to_string())
                    } else {
                        Ok(n)
                    }
                },
                |_| true,
            )
            .await;

        assert_eq!(Ok(2), result);
        assert_eq!(3, calls.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn give_up_after_max_retries() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), String> = fast()
            .retry(
                "always failing",
                move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("refused".to_string())
                },
                |_| true,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(4, calls.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn terminal_errors_are_not_retried() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), String> = fast()
            .retry(
                "terminal",
                move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("not found".to_string())
                },
                |e| e != "not found",
            )
            .await;

        assert!(result.is_err());
        assert_eq!(1, calls.load(Ordering::SeqCst));
    }
}
