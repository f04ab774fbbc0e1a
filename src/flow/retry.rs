use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{future::Future, time::Duration};
use tokio::time::sleep;
use tracing::{error, warn};

use crate::error;

/// Which failures a stage may retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryScope {
    /// Only errors whose chain holds a transient store error.
    TransientIo,
    AnyError,
}

/// Bounded retry with exponential backoff: the n-th retry waits
/// `backoff * 2^(n-1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first. Zero behaves as one.
    pub max_attempts: u32,
    #[serde(rename = "backoff_ms", with = "millis")]
    pub backoff: Duration,
    pub scope: RetryScope,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(500),
            scope: RetryScope::TransientIo,
        }
    }
}

impl RetryPolicy {
    pub fn is_retryable(&self, err: &anyhow::Error) -> bool {
        match self.scope {
            RetryScope::TransientIo => error::is_transient(err),
            RetryScope::AnyError => true,
        }
    }

    pub fn delay_for(&self, retry: u32) -> Duration {
        self.backoff
            .saturating_mul(2u32.saturating_pow(retry.saturating_sub(1)))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error or runs
    /// out of attempts. Returns the result and the number of attempts used.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> (Result<T>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempts = 0;
        loop {
            attempts += 1;
            match op().await {
                Ok(v) => return (Ok(v), attempts),
                Err(e) if attempts < max_attempts && self.is_retryable(&e) => {
                    let delay = self.delay_for(attempts);
                    warn!(
                        stage = label,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying"
                    );
                    sleep(delay).await;
                }
                Err(e) => {
                    error!(stage = label, attempts, error = %e, "giving up");
                    return (Err(e), attempts);
                }
            }
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
