//! Rate-limited, retrying access to an [`EventSource`].

use anyhow::Result;
use cohort_core::{EventBatch, Protocol};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::future::Future;
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::warn;

use super::EventSource;
use crate::config::SyncConfig;

/// Wraps an [`EventSource`] with bounded retry and per-pass rate limiting.
///
/// Every call is attempted up to `max_attempts` times. Event queries go
/// through a [`FetchSession`], whose token bucket is created fresh for each
/// pass; the head query is never rate limited.
pub struct RateLimitedFetcher<S> {
    source: S,
    max_attempts: u32,
    retry_delay: Duration,
    requests_per_second: NonZeroU32,
}

impl<S: EventSource> RateLimitedFetcher<S> {
    /// Create a fetcher using the retry and rate settings of `config`.
    pub fn new(source: S, config: &SyncConfig) -> Self {
        Self {
            source,
            max_attempts: config.max_attempts.max(1),
            retry_delay: config.retry_delay(),
            requests_per_second: NonZeroU32::new(config.requests_per_second)
                .unwrap_or(NonZeroU32::MIN),
        }
    }

    /// Protocol of the wrapped source.
    pub fn protocol(&self) -> Protocol {
        self.source.protocol()
    }

    /// Wrapped source.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Remote head, retried.
    pub async fn current_head(&self) -> Result<u64> {
        self.with_retry("head query", || self.source.current_head())
            .await
    }

    /// Start a pass with a fresh rate limiter.
    pub fn session(&self) -> FetchSession<'_, S> {
        let quota = Quota::per_second(self.requests_per_second);
        FetchSession {
            fetcher: self,
            limiter: RateLimiter::direct(quota),
        }
    }

    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_attempts => {
                    warn!(
                        protocol = %self.protocol(),
                        "{} failed (attempt {}/{}): {:#}",
                        what,
                        attempt,
                        self.max_attempts,
                        e
                    );
                    attempt += 1;
                    if !self.retry_delay.is_zero() {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
                Err(e) => {
                    return Err(e.context(format!(
                        "{} failed after {} attempts",
                        what, self.max_attempts
                    )))
                }
            }
        }
    }
}

/// One pass worth of rate-limited event queries.
pub struct FetchSession<'a, S> {
    fetcher: &'a RateLimitedFetcher<S>,
    limiter: DefaultDirectRateLimiter,
}

impl<S: EventSource> FetchSession<'_, S> {
    /// Events in exactly `blocks`.
    ///
    /// Takes one permit per call; retries inside the call reuse it.
    pub async fn events_for_blocks(&self, blocks: &[u64]) -> Result<EventBatch> {
        self.limiter.until_ready().await;

        self.fetcher
            .with_retry("events query", || {
                self.fetcher.source.events_for_blocks(blocks)
            })
            .await
    }
}
