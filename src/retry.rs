//! Retry policy shared by all pollers.
//!
//! Classification is a pure function of the normalized gateway error, so the
//! retry/no-retry decision can be tested without any network timing. The
//! backoff schedule is linear in the attempt number with a small fixed
//! budget; trade submissions never go through this path.

use std::future::Future;
use std::time::Duration;

use crate::gateway::GatewayError;

/// Retry budget and backoff base for transient failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Additional attempts after the first (2 = up to 3 attempts total).
    pub max_retries: u32,
    /// Backoff base; attempt `n` waits `base_delay * n`.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(1000),
        }
    }
}

/// Outcome of classifying a gateway error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub retryable: bool,
    pub reason: &'static str,
}

/// Retryable iff no response was received, the request timed out, or the
/// backend answered with a 5xx. Everything else (4xx, malformed payload,
/// session expiry) is terminal.
pub fn classify(error: &GatewayError) -> Classification {
    match error {
        GatewayError::Network(_) => Classification {
            retryable: true,
            reason: "network",
        },
        GatewayError::Timeout => Classification {
            retryable: true,
            reason: "timeout",
        },
        GatewayError::Server { .. } => Classification {
            retryable: true,
            reason: "server_error",
        },
        GatewayError::Rejected { .. } => Classification {
            retryable: false,
            reason: "rejected",
        },
        GatewayError::Decode(_) => Classification {
            retryable: false,
            reason: "decode",
        },
        GatewayError::SessionExpired => Classification {
            retryable: false,
            reason: "session_expired",
        },
    }
}

impl RetryPolicy {
    /// Linear backoff: `base_delay * attempt`, attempt numbering from 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt.max(1)
    }
}

/// Drive an async operation through the retry budget. The closure is invoked
/// once per attempt and must return an owned future (clone captured handles
/// into it). Returns the last error when the budget is exhausted or the
/// failure is terminal.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, GatewayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                let class = classify(&error);
                if !class.retryable || attempt >= policy.max_retries {
                    return Err(error);
                }
                attempt += 1;
                let delay = policy.delay_for(attempt);
                tracing::debug!(
                    reason = class.reason,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "transient failure; retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
