// Optional retry layer in front of an ExpertClient

use super::client::{ExpertCallError, ExpertClient, ExpertReply};
use crate::orchestration::types::{Expert, RouteRequest};
use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Retry policy for expert calls. `max_retries = 0` disables retrying.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    #[serde(default)]
    pub max_retries: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    2000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn is_enabled(&self) -> bool {
        self.max_retries > 0
    }

    /// Doubling backoff without jitter or an elapsed-time limit; the caller
    /// counts attempts and the dispatcher's timer bounds the total.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.initial_backoff_ms))
            .with_max_interval(Duration::from_millis(self.max_backoff_ms))
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Wraps a client and retries retryable failures.
///
/// The dispatcher's per-call timeout still bounds the whole sequence of attempts.
pub struct RetryingClient<C> {
    inner: C,
    policy: RetryPolicy,
}

impl<C: ExpertClient> RetryingClient<C> {
    pub fn new(inner: C, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<C: ExpertClient> ExpertClient for RetryingClient<C> {
    async fn invoke(&self, expert: &Expert, request: &RouteRequest) -> Result<ExpertReply, ExpertCallError> {
        let mut backoff = self.policy.backoff();
        let mut attempt = 0;
        loop {
            match self.inner.invoke(expert, request).await {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_retryable() && attempt < self.policy.max_retries => {
                    let delay = backoff
                        .next_backoff()
                        .unwrap_or(Duration::from_millis(self.policy.max_backoff_ms));
                    warn!(
                        expert = %expert.id,
                        request_id = %request.id,
                        "Expert call failed, retrying in {:?} (attempt {}/{}): {}",
                        delay,
                        attempt + 1,
                        self.policy.max_retries,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
