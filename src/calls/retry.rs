//! Bounded retry with exponential backoff.

use log::warn;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Add up to a quarter of the delay as random jitter.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 200,
            max_backoff_ms: 2_000,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    /// The operation failed with an error that retrying cannot fix.
    Fatal(E),
    /// Every attempt failed with a retryable error.
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            Self::Fatal(e) | Self::Exhausted { last: e, .. } => e,
        }
    }
}

impl RetryPolicy {
    pub fn attach() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 1_000,
            jitter: false,
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` counts from 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff_ms);
        let jitter = if self.jitter && base >= 4 {
            rand::rng().random_range(0..=base / 4)
        } else {
            0
        };
        Duration::from_millis(base + jitter)
    }

    /// Run `op` until it succeeds, fails fatally or attempts run out.
    pub async fn run<T, E, F, Fut>(
        &self,
        what: &str,
        is_retryable: impl Fn(&E) -> bool,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        E: std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !is_retryable(&e) => return Err(RetryError::Fatal(e)),
                Err(e) if attempt >= max_attempts => {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: e,
                    });
                }
                Err(e) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        target: "Call/Retry",
                        "{what} failed (attempt {attempt}/{max_attempts}): {e}; retrying in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
