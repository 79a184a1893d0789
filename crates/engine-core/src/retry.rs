use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Whether an error is worth another attempt or must bubble up now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retry,
    Stop,
}

/// Outcome of running an operation under the retry policy.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The classifier called the error fatal.
    Fatal(E),
    /// Retryable, but the configured attempts ran out.
    AttemptsExceeded(E),
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Fatal(err) | RetryError::AttemptsExceeded(err) => err,
        }
    }
}

/// Exponential-backoff retry with a caller-supplied error classifier.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::for_connectivity()
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: if max_delay.is_zero() { base_delay } else { max_delay },
        }
    }

    /// Transient network and auth hiccups on ordinary connections.
    pub fn for_connectivity() -> Self {
        Self::new(5, Duration::from_millis(250), Duration::from_secs(5))
    }

    /// Copy units: the initial attempt plus two retries.
    pub fn for_copy_unit(retries: usize) -> Self {
        Self::new(retries + 1, Duration::from_millis(500), Duration::from_secs(10))
    }

    pub async fn run<F, Fut, T, E, Classifier>(
        &self,
        mut op: F,
        classify: Classifier,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        Classifier: Fn(&E) -> RetryDisposition,
    {
        let mut attempt = 0;

        loop {
            match op().await {
                Ok(result) => return Ok(result),
                Err(err) => match classify(&err) {
                    RetryDisposition::Stop => return Err(RetryError::Fatal(err)),
                    RetryDisposition::Retry => {
                        if attempt + 1 >= self.max_attempts {
                            return Err(RetryError::AttemptsExceeded(err));
                        }
                        sleep(self.backoff_delay(attempt)).await;
                        attempt += 1;
                    }
                },
            }
        }
    }

    fn backoff_delay(&self, attempt: usize) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let factor = 1u128 << attempt.min(6);
        let delay_ms = self.base_delay.as_millis().saturating_mul(factor);
        Duration::from_millis(delay_ms.min(self.max_delay.as_millis()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    #[derive(Debug)]
    struct TestError(&'static str);

    #[tokio::test]
    async fn transient_failure_retries_then_succeeds() {
        let policy = RetryPolicy::new(4, Duration::ZERO, Duration::ZERO);
        let attempts = Arc::new(AtomicUsize::new(0));
        let op_attempts = attempts.clone();

        let result = policy
            .run(
                move || {
                    let op_attempts = op_attempts.clone();
                    async move {
                        if op_attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(TestError("transient"))
                        } else {
                            Ok::<_, TestError>("done")
                        }
                    }
                },
                |_| RetryDisposition::Retry,
            )
            .await;

        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_errors_do_not_retry() {
        let policy = RetryPolicy::new(5, Duration::ZERO, Duration::ZERO);
        let attempts = Arc::new(AtomicUsize::new(0));
        let op_attempts = attempts.clone();

        let result: Result<(), _> = policy
            .run(
                move || {
                    let op_attempts = op_attempts.clone();
                    async move {
                        op_attempts.fetch_add(1, Ordering::SeqCst);
                        Err(TestError("fatal"))
                    }
                },
                |_| RetryDisposition::Stop,
            )
            .await;

        assert!(matches!(result, Err(RetryError::Fatal(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn copy_unit_policy_allows_initial_plus_retries() {
        let policy = RetryPolicy::for_copy_unit(2);
        assert_eq!(policy.max_attempts, 3);

        let policy = RetryPolicy::new(policy.max_attempts, Duration::ZERO, Duration::ZERO);
        let attempts = Arc::new(AtomicUsize::new(0));
        let op_attempts = attempts.clone();

        let result: Result<(), _> = policy
            .run(
                move || {
                    let op_attempts = op_attempts.clone();
                    async move {
                        op_attempts.fetch_add(1, Ordering::SeqCst);
                        Err(TestError("transient"))
                    }
                },
                |_| RetryDisposition::Retry,
            )
            .await;

        assert!(matches!(result, Err(RetryError::AttemptsExceeded(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
