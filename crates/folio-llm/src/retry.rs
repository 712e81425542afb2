use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LlmError;

/// Explicit retry schedule for provider calls.
///
/// Attempt `n` (0-based) waits `base_delay * 2^n`, capped at `max_delay`, before attempt `n + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero is treated as one.
    pub max_attempts: u32,
    #[serde(with = "millis")]
    pub base_delay: Duration,
    #[serde(with = "millis")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

/// All attempts failed; carries the last error.
#[derive(Debug, thiserror::Error)]
#[error("gave up after {attempts} attempt(s): {source}")]
pub struct RetryExhausted {
    pub attempts: u32,
    #[source]
    pub source: LlmError,
}

impl RetryPolicy {
    /// Policy that never waits. Useful for tests and local backends.
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Backoff before the attempt following `attempt` (0-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `f` until it succeeds, fails with a non-retryable error, or attempts run out.
    ///
    /// # Errors
    ///
    /// Returns [`RetryExhausted`] with the last error and the number of attempts made.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut f: F) -> Result<T, RetryExhausted>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        let max = self.attempts();
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < max => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        operation,
                        attempt = attempt + 1,
                        max_attempts = max,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "transient provider failure, retrying: {e}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(source) => {
                    return Err(RetryExhausted {
                        attempts: attempt + 1,
                        source,
                    });
                }
            }
        }
    }
}

/// Parse the `Retry-After` header value as seconds, falling back to the policy backoff.
pub(crate) fn retry_delay(
    response: &reqwest::Response,
    policy: &RetryPolicy,
    attempt: u32,
) -> Duration {
    if let Some(val) = response.headers().get("retry-after")
        && let Ok(s) = val.to_str()
        && let Ok(secs) = s.parse::<u64>()
    {
        return Duration::from_secs(secs);
    }
    policy.delay_for(attempt)
}

/// Send an HTTP request, retrying on 429 responses according to `policy`.
///
/// Returns the first non-429 response for further processing by the caller.
///
/// # Errors
///
/// Returns `LlmError::RateLimited` if all attempts are exhausted, or the underlying
/// `reqwest::Error` wrapped as `LlmError::Http` for other failures.
pub(crate) async fn send_with_retry<F, Fut>(
    provider_name: &str,
    policy: &RetryPolicy,
    mut f: F,
) -> Result<reqwest::Response, LlmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<reqwest::Response, reqwest::Error>>,
{
    let max = policy.attempts();
    for attempt in 0..max {
        let response = f().await.map_err(LlmError::Http)?;
        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            if attempt + 1 == max {
                return Err(LlmError::RateLimited);
            }
            let delay = retry_delay(&response, policy, attempt);
            tracing::warn!(
                "{provider_name} rate limited, retrying in {}ms ({}/{})",
                delay.as_millis(),
                attempt + 1,
                max
            );
            tokio::time::sleep(delay).await;
            continue;
        }

        return Ok(response);
    }

    Err(LlmError::RateLimited)
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
