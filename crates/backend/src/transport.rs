//! Resilient transport: per-attempt timeout, retry with backoff, Retry-After
//! honoring and cancellation for every backend call.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use relaybox_protocol::constants::{
    DEFAULT_REQUEST_TIMEOUT, DEFAULT_RETRY_ATTEMPTS, DEFAULT_UPLOAD_TIMEOUT,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{BackendError, TransportError};

/// Retry and timeout policy.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Retries after the first attempt (4 retries = 5 attempts).
    pub max_retries: u32,
    /// Backoff base; attempt `n` waits `base * 2^n` plus jitter.
    pub base_delay: Duration,
    /// Cap on the computed backoff.
    pub max_delay: Duration,
    /// Upper bound of the random jitter added to each backoff.
    pub max_jitter: Duration,
    /// Per-attempt timeout for general calls.
    pub request_timeout: Duration,
    /// Per-attempt timeout for large-payload uploads.
    pub upload_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_RETRY_ATTEMPTS,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_jitter: Duration::from_millis(500),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            upload_timeout: DEFAULT_UPLOAD_TIMEOUT,
        }
    }
}

impl TransportConfig {
    /// Total attempts allowed for one call.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Backoff before retry number `retry` (0-based), jitter included and
    /// capped at `max_delay`.
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let exp = retry.min(31);
        let backoff = self.base_delay.saturating_mul(1u32 << exp);
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        backoff.saturating_add(jitter).min(self.max_delay)
    }

    /// Per-attempt timeout for a call kind.
    pub fn timeout_for(&self, kind: CallKind) -> Duration {
        match kind {
            CallKind::Request => self.request_timeout,
            CallKind::Upload => self.upload_timeout,
        }
    }
}

/// Selects the per-attempt timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Request,
    Upload,
}

/// Executes backend operations under a [`TransportConfig`].
#[derive(Debug, Clone, Default)]
pub struct ResilientTransport {
    config: TransportConfig,
}

impl ResilientTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Runs `attempt` until it succeeds, fails permanently, exhausts the
    /// retry budget, or `cancel` fires.
    ///
    /// `attempt` is invoked once per try and must build a fresh request each
    /// time. Cancellation is checked before every attempt and raced against
    /// both the attempt and the backoff sleep.
    pub async fn call<T, F, Fut>(
        &self,
        operation: &str,
        kind: CallKind,
        cancel: &CancellationToken,
        mut attempt: F,
    ) -> Result<T, TransportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let timeout = self.config.timeout_for(kind);
        let max_attempts = self.config.max_attempts();
        let mut tries: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            tries += 1;

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(operation, attempt = tries, "attempt cancelled");
                    return Err(TransportError::Cancelled);
                }
                r = tokio::time::timeout(timeout, attempt()) => r,
            };

            let err = match outcome {
                Ok(Ok(value)) => {
                    if tries > 1 {
                        debug!(operation, attempts = tries, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Ok(Err(e)) => e,
                Err(_) => BackendError::Timeout(timeout),
            };

            if !err.is_retryable() {
                warn!(operation, attempt = tries, error = %err, "permanent backend error");
                return Err(TransportError::Permanent {
                    operation: operation.to_string(),
                    source: err,
                });
            }

            if tries >= max_attempts {
                warn!(operation, attempts = tries, error = %err, "retry budget exhausted");
                return Err(TransportError::Exhausted {
                    operation: operation.to_string(),
                    attempts: tries,
                    last: err,
                });
            }

            let backoff = self.config.delay_for_attempt(tries - 1);
            let delay = match err.retry_after() {
                Some(hint) => backoff.max(hint),
                None => backoff,
            };
            debug!(
                operation,
                attempt = tries,
                status = ?err.status(),
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying after backoff"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(operation, "backoff cancelled");
                    return Err(TransportError::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
