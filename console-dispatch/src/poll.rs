use std::future::Future;
use std::time::Duration;

use console_config::JobPollSettings;
use console_core::ConsoleError;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::error::{DispatchError, Result};

/// Exponential backoff with a hard deadline for remote job polling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JobPollPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: u32,
    pub timeout: Duration,
}

impl Default for JobPollPolicy {
    fn default() -> Self {
        Self::from(&JobPollSettings::default())
    }
}

impl From<&JobPollSettings> for JobPollPolicy {
    fn from(settings: &JobPollSettings) -> Self {
        Self {
            initial_interval: settings.initial_interval(),
            max_interval: settings.max_interval(),
            multiplier: settings.multiplier.max(1),
            timeout: settings.timeout(),
        }
    }
}

impl JobPollPolicy {
    pub fn next_interval(&self, current: Duration) -> Duration {
        current
            .saturating_mul(self.multiplier)
            .min(self.max_interval)
    }

    /// Calls `check` until it reports `true` or the timeout expires.
    ///
    /// Transient remote errors are logged and polled through; any other
    /// error ends the wait.
    pub async fn poll_until<F, Fut>(&self, what: &str, mut check: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<bool, ConsoleError>>,
    {
        let started = Instant::now();
        // Timeouts too large to represent never expire.
        let deadline = started.checked_add(self.timeout);
        let mut interval = self.initial_interval;

        loop {
            match check().await {
                Ok(true) => {
                    debug!(what, elapsed = ?started.elapsed(), "Remote work finished");
                    return Ok(());
                }
                Ok(false) => {}
                Err(e) if e.is_transient() => {
                    warn!(what, error = %e, "Polling failed, retrying");
                }
                Err(e) => return Err(e.into()),
            }

            let now = Instant::now();
            let pause = match deadline {
                Some(deadline) if now >= deadline => {
                    return Err(DispatchError::JobTimeout {
                        what: what.to_string(),
                        waited: self.timeout,
                    });
                }
                Some(deadline) => interval.min(deadline - now),
                None => interval,
            };
            sleep(pause).await;
            interval = self.next_interval(interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> JobPollPolicy {
        JobPollPolicy {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(4),
            multiplier: 2,
            timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = fast_policy();
        let mut interval = policy.initial_interval;
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(interval.as_millis());
            interval = policy.next_interval(interval);
        }
        assert_eq!(seen, vec![1, 2, 4, 4]);
    }

    #[tokio::test]
    async fn stops_polling_once_the_check_passes() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        fast_policy()
            .poll_until("job", move || async move {
                Ok(counter.fetch_add(1, Ordering::SeqCst) >= 2)
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn times_out_instead_of_hanging() {
        let policy = JobPollPolicy {
            timeout: Duration::from_millis(20),
            ..fast_policy()
        };
        let err = policy
            .poll_until("vm web-1", || async { Ok(false) })
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::JobTimeout { .. }));
        assert!(err.to_string().contains("vm web-1"));
    }

    #[tokio::test]
    async fn huge_timeouts_poll_without_a_deadline() {
        let settings = JobPollSettings {
            initial_interval_ms: 1,
            max_interval_ms: 2,
            timeout_secs: u64::MAX,
            ..JobPollSettings::default()
        };
        let policy = JobPollPolicy::from(&settings);
        assert_eq!(policy.timeout, Duration::from_secs(u64::MAX));

        let calls = AtomicU32::new(0);
        let counter = &calls;
        policy
            .poll_until("vm", move || async move {
                Ok(counter.fetch_add(1, Ordering::SeqCst) >= 1)
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn transient_errors_are_polled_through() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        fast_policy()
            .poll_until("job", move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ConsoleError::api("gateway timeout"))
                } else {
                    Ok(true)
                }
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn permanent_errors_end_the_wait() {
        let err = fast_policy()
            .poll_until("job", || async {
                Err(ConsoleError::NotFound("server".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Operation(_)));
    }
}
