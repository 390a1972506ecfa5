//! Failure classification and the retry policy applied by the worker.
//!
//! Handlers report *what* went wrong; the policy decides *whether* to try
//! again. Only errors that a re-delivery can resolve are retried, and only a
//! bounded number of times.
use crate::JobResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// How the dispatch layer should treat a failed invocation.
pub enum Disposition {
    /// Transient; another attempt may succeed.
    Retry,
    /// Permanent; retrying cannot change the outcome.
    Discard,
}

/// Errors that know whether re-delivery can help.
pub trait Retryable {
    fn disposition(&self) -> Disposition;
}

impl Retryable for std::convert::Infallible {
    fn disposition(&self) -> Disposition {
        match *self {}
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Bounded retry with a fixed wait between attempts.
pub struct RetryPolicy {
    wait: std::time::Duration,
    attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            wait: Self::DEFAULT_WAIT,
            attempts: Self::DEFAULT_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    pub const DEFAULT_WAIT: std::time::Duration = std::time::Duration::from_secs(3);
    pub const DEFAULT_ATTEMPTS: u32 = 5;

    /// `attempts` counts every execution, the first one included.
    pub const fn new(wait: std::time::Duration, attempts: u32) -> Self {
        Self { wait, attempts }
    }

    pub fn wait(self, wait: std::time::Duration) -> Self {
        Self { wait, ..self }
    }

    pub fn attempts(self, attempts: u32) -> Self {
        Self { attempts, ..self }
    }

    pub fn max_attempts(&self) -> u32 {
        self.attempts
    }

    /// Map a handler outcome on the given 1-based attempt to the result the
    /// backend should persist.
    pub fn judge<E>(&self, attempt: u32, outcome: Result<(), E>) -> JobResult
    where
        E: Retryable + std::fmt::Display,
    {
        let error = match outcome {
            Ok(()) => return JobResult::Complete,
            Err(error) => error,
        };

        match error.disposition() {
            Disposition::Retry if attempt < self.attempts => {
                tracing::warn!(
                    error = %error,
                    attempt,
                    max_attempts = self.attempts,
                    "job failed, retrying"
                );
                JobResult::Retry(Some(self.wait))
            }
            Disposition::Retry => {
                tracing::error!(error = %error, attempt, "job failed, retries exhausted");
                JobResult::Discard
            }
            Disposition::Discard => {
                tracing::error!(error = %error, attempt, "job failed permanently");
                JobResult::Discard
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Failure(Disposition);

    impl std::fmt::Display for Failure {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self.0)
        }
    }

    impl Retryable for Failure {
        fn disposition(&self) -> Disposition {
            self.0
        }
    }

    #[test]
    fn success_completes() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.judge::<Failure>(1, Ok(())), JobResult::Complete);
    }

    #[test]
    fn retryable_failure_waits_until_attempts_run_out() {
        let policy = RetryPolicy::default();
        for attempt in 1..RetryPolicy::DEFAULT_ATTEMPTS {
            assert_eq!(
                policy.judge(attempt, Err(Failure(Disposition::Retry))),
                JobResult::Retry(Some(RetryPolicy::DEFAULT_WAIT))
            );
        }
        assert_eq!(
            policy.judge(RetryPolicy::DEFAULT_ATTEMPTS, Err(Failure(Disposition::Retry))),
            JobResult::Discard
        );
    }

    #[test]
    fn permanent_failure_is_discarded_on_first_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.judge(1, Err(Failure(Disposition::Discard))),
            JobResult::Discard
        );
    }

    #[test]
    fn single_attempt_policy_never_retries() {
        let policy = RetryPolicy::default().attempts(1);
        assert_eq!(
            policy.judge(1, Err(Failure(Disposition::Retry))),
            JobResult::Discard
        );
    }
}
