//! Bounded retry with backoff for single batch writes and page fetches

use std::fmt::Display;
use std::future::Future;
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::error::{SourceError, TargetError};

/// Errors that can tell a retryable failure from a permanent one
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

impl Retryable for TargetError {
    fn is_transient(&self) -> bool {
        TargetError::is_transient(self)
    }
}

impl Retryable for SourceError {
    fn is_transient(&self) -> bool {
        SourceError::is_transient(self)
    }
}

/// Final result of a retried operation plus how many attempts it took
#[derive(Debug)]
pub struct Attempted<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

impl<T, E> Attempted<T, E> {
    /// Attempts beyond the first
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Run `operation` until it succeeds, fails permanently, or the policy's
/// attempt bound is reached. The closure receives the 1-based attempt number.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, label: &str, mut operation: F) -> Attempted<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        debug!("{} attempt {}/{}", label, attempt, max_attempts);
        match operation(attempt).await {
            Ok(value) => {
                return Attempted {
                    result: Ok(value),
                    attempts: attempt,
                }
            },
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "{} attempt {}/{} failed: {}. Retrying in {}ms...",
                    label,
                    attempt,
                    max_attempts,
                    e,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            },
            Err(e) => {
                return Attempted {
                    result: Err(e),
                    attempts: attempt,
                }
            },
        }
    }
}
