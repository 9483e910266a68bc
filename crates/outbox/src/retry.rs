use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::warn;

/// Why a retried operation gave up.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: usize, last: E },

    /// The operation failed in a way retrying cannot fix.
    #[error("failed permanently on attempt {attempts}: {error}")]
    Permanent { attempts: usize, error: E },

    #[error("cancelled by shutdown")]
    Cancelled,
}

/// Retries an operation with an explicit list of delays.
///
/// The operation runs once, then once more after each delay, so a policy
/// with `n` delays makes at most `n + 1` attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    delays: Vec<Duration>,
}

impl RetryPolicy {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    /// Send policy used by the forwarder: 5 x 100 ms, 5 x 500 ms, 5 x 1 s.
    pub fn default_send() -> Self {
        let delays = [100, 500, 1000]
            .into_iter()
            .flat_map(|ms| std::iter::repeat_n(Duration::from_millis(ms), 5))
            .collect();
        Self { delays }
    }

    /// A single attempt.
    pub fn none() -> Self {
        Self { delays: Vec::new() }
    }

    pub fn attempts(&self) -> usize {
        self.delays.len() + 1
    }

    /// Runs `operation` until it succeeds, the delays run out, or
    /// `shutdown` is set.
    ///
    /// The shutdown flag is checked before every attempt and observed
    /// during every delay.
    pub async fn execute<T, E, F, Fut>(
        &self,
        operation: F,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.execute_while(operation, |_| true, shutdown).await
    }

    /// Like [`RetryPolicy::execute`], but stops with
    /// [`RetryError::Permanent`] as soon as `retryable` rejects an error.
    pub async fn execute_while<T, E, F, Fut, R>(
        &self,
        mut operation: F,
        retryable: R,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut delays = self.delays.iter();
        let mut attempt = 0;

        loop {
            if *shutdown.borrow() {
                return Err(RetryError::Cancelled);
            }
            attempt += 1;

            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            if !retryable(&error) {
                return Err(RetryError::Permanent {
                    attempts: attempt,
                    error,
                });
            }

            let Some(&delay) = delays.next() else {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: error,
                });
            };

            warn!(attempt, ?delay, error = %error, "Attempt failed, retrying");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    // A dropped sender counts as shutdown too.
                    if changed.is_err() || *shutdown.borrow() {
                        return Err(RetryError::Cancelled);
                    }
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::default_send()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counting_failures(
        fail_first: usize,
    ) -> (
        Arc<AtomicUsize>,
        impl FnMut() -> std::future::Ready<Result<usize, String>>,
    ) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let op = move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            std::future::ready(if n > fail_first {
                Ok(n)
            } else {
                Err(format!("failure {n}"))
            })
        };
        (calls, op)
    }

    #[test]
    fn default_send_policy_has_sixteen_attempts() {
        let policy = RetryPolicy::default_send();
        assert_eq!(policy.attempts(), 16);
        assert_eq!(policy.delays[0], Duration::from_millis(100));
        assert_eq!(policy.delays[5], Duration::from_millis(500));
        assert_eq!(policy.delays[14], Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let (_tx, mut rx) = watch::channel(false);
        let (calls, op) = counting_failures(3);

        let result = RetryPolicy::default_send().execute(op, &mut rx).await;
        assert_eq!(result.unwrap(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_last_delay() {
        let (_tx, mut rx) = watch::channel(false);
        let (calls, op) = counting_failures(usize::MAX);
        let policy = RetryPolicy::new(vec![Duration::from_millis(10); 2]);

        match policy.execute(op, &mut rx).await {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last, "failure 3");
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_stops_retrying() {
        let (_tx, mut rx) = watch::channel(false);
        let (calls, op) = counting_failures(usize::MAX);

        let result = RetryPolicy::default_send()
            .execute_while(op, |error: &String| !error.ends_with('1'), &mut rx)
            .await;
        match result {
            Err(RetryError::Permanent { attempts, error }) => {
                assert_eq!(attempts, 1);
                assert_eq!(error, "failure 1");
            }
            other => panic!("expected permanent failure, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_attempt_after_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();
        let (calls, op) = counting_failures(0);

        let result = RetryPolicy::none().execute(op, &mut rx).await;
        assert!(matches!(result, Err(RetryError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_delay() {
        let (tx, mut rx) = watch::channel(false);
        let (calls, op) = counting_failures(usize::MAX);
        let policy = RetryPolicy::new(vec![Duration::from_secs(3600)]);

        let handle = tokio::spawn(async move { policy.execute(op, &mut rx).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(true).unwrap();

        assert!(matches!(handle.await.unwrap(), Err(RetryError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
