//! Rate-Limited Caller: wraps a logical external provider (LLM
//! analyzer backend, issue tracker) with a concurrency cap, a token
//! bucket, retry with full-jitter backoff, and a per-request timeout.
//!
//! Analyzers and the tracker writer never call a provider directly;
//! every external call is routed through a [`RateLimitedCaller`] so the
//! concurrency and backpressure rules hold crate-wide rather than per
//! call site.

pub mod backoff;

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::instrument;

use crate::config::CallerConfig;

pub use backoff::full_jitter_backoff;

/// Classification a provider call must map its own errors onto before
/// the caller can decide whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Retryable,
    FatalClient,
    FatalAuth,
}

#[derive(Debug, Error, Diagnostic)]
pub enum CallError {
    #[error("provider `{provider}` authentication failed")]
    #[diagnostic(code(hdorch::caller::auth))]
    Auth { provider: String },

    #[error("provider `{provider}` rejected the request: {message}")]
    #[diagnostic(code(hdorch::caller::fatal_client))]
    FatalClient { provider: String, message: String },

    #[error("provider `{provider}` exhausted its retry budget: {last}")]
    #[diagnostic(code(hdorch::caller::retries_exhausted))]
    RetriesExhausted { provider: String, last: String },

    #[error("call cancelled")]
    #[diagnostic(code(hdorch::caller::cancelled))]
    Cancelled,
}

/// A token bucket refilled on a fixed interval, independent of the
/// concurrency semaphore: it bounds *throughput* (calls per second)
/// while the concurrency semaphore bounds how many calls may be
/// in flight at once.
struct TokenBucket {
    tokens: Arc<Semaphore>,
    refill_task: JoinHandle<()>,
}

impl TokenBucket {
    fn new(rate_per_second: u32) -> Self {
        let rate_per_second = rate_per_second.max(1) as usize;
        let tokens = Arc::new(Semaphore::new(rate_per_second));
        let interval = Duration::from_secs(1) / rate_per_second as u32;
        let refill_tokens = Arc::clone(&tokens);
        let refill_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if refill_tokens.available_permits() < rate_per_second {
                    refill_tokens.add_permits(1);
                }
            }
        });
        Self {
            tokens,
            refill_task,
        }
    }
}

impl Drop for TokenBucket {
    fn drop(&mut self) {
        self.refill_task.abort();
    }
}

/// Snapshot of one provider's call traffic: queued, inflight,
/// tokens-available, retries, failures. Cheap to sample:
/// every field either reads a semaphore's permit count or an atomic
/// counter, no locking required.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallerMetrics {
    pub inflight: usize,
    pub queued: usize,
    pub tokens_available: usize,
    pub retries: usize,
    pub failures: usize,
}

/// Wraps one logical provider's calls with concurrency, rate limiting,
/// retry, and timeout, per the resource model's rules.
///
/// Every field is either an `Arc`-backed primitive or an atomic so `call`
/// takes `&self`: a single caller instance is meant to be shared (directly
/// or via `Arc`) across every concurrent task issuing calls to the same
/// provider, which is what lets the tracker writer submit a whole batch's
/// creates concurrently through one rate/concurrency budget.
pub struct RateLimitedCaller {
    provider: String,
    config: CallerConfig,
    concurrency: Arc<Semaphore>,
    rate: TokenBucket,
    cancelled: Arc<AtomicBool>,
    queued: Arc<AtomicUsize>,
    inflight: Arc<AtomicUsize>,
    retries: AtomicUsize,
    failures: AtomicUsize,
}

impl RateLimitedCaller {
    pub fn new(provider: impl Into<String>, config: CallerConfig) -> Self {
        let concurrency = Arc::new(Semaphore::new(config.max_concurrency));
        let rate = TokenBucket::new(config.rate_limit_per_second);
        Self {
            provider: provider.into(),
            config,
            concurrency,
            rate,
            cancelled: Arc::new(AtomicBool::new(false)),
            queued: Arc::new(AtomicUsize::new(0)),
            inflight: Arc::new(AtomicUsize::new(0)),
            retries: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        }
    }

    pub fn cancellation_handle(&self) -> CancellationHandle {
        CancellationHandle {
            cancelled: Arc::clone(&self.cancelled),
        }
    }

    /// Snapshot this provider's current traffic.
    pub fn metrics(&self) -> CallerMetrics {
        CallerMetrics {
            inflight: self.inflight.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            tokens_available: self.rate.tokens.available_permits(),
            retries: self.retries.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Execute `call` with the configured concurrency cap, retry policy,
    /// and per-attempt timeout. `call` classifies its own error so the
    /// caller can decide whether another attempt is worthwhile.
    #[instrument(skip(self, call), fields(provider = %self.provider))]
    pub async fn call<T, E, F, Fut>(&self, mut call: F) -> Result<T, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, (E, Classification)>>,
        E: std::fmt::Display,
    {
        if self.is_cancelled() {
            return Err(CallError::Cancelled);
        }

        self.queued.fetch_add(1, Ordering::Relaxed);
        let permit_result = self.concurrency.acquire().await;
        self.queued.fetch_sub(1, Ordering::Relaxed);
        let _concurrency_permit = permit_result.map_err(|_| CallError::Cancelled)?;
        let _inflight_guard = InflightGuard::new(Arc::clone(&self.inflight));

        let mut last_message = String::new();
        for attempt in 0..self.config.max_attempts {
            if self.is_cancelled() {
                return Err(CallError::Cancelled);
            }

            let _rate_permit = self
                .rate
                .tokens
                .acquire()
                .await
                .map_err(|_| CallError::Cancelled)?;

            match timeout(self.config.request_timeout, call()).await {
                Err(_) => {
                    last_message = "request timed out".to_string();
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(attempt, provider = %self.provider, "call timed out");
                }
                Ok(Ok(value)) => return Ok(value),
                Ok(Err((err, Classification::FatalAuth))) => {
                    let _ = err;
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    return Err(CallError::Auth {
                        provider: self.provider.clone(),
                    });
                }
                Ok(Err((err, Classification::FatalClient))) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    return Err(CallError::FatalClient {
                        provider: self.provider.clone(),
                        message: err.to_string(),
                    });
                }
                Ok(Err((err, Classification::Retryable))) => {
                    last_message = err.to_string();
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(attempt, provider = %self.provider, error = %last_message, "retryable provider error");
                }
            }

            if attempt + 1 < self.config.max_attempts {
                let delay =
                    full_jitter_backoff(attempt, self.config.base_delay, self.config.max_delay);
                tokio::time::sleep(delay).await;
            }
        }

        self.failures.fetch_add(1, Ordering::Relaxed);
        Err(CallError::RetriesExhausted {
            provider: self.provider.clone(),
            last: last_message,
        })
    }
}

/// Decrements a shared in-flight counter when dropped, so every early
/// return from [`RateLimitedCaller::call`] still releases its slot.
struct InflightGuard {
    inflight: Arc<AtomicUsize>,
}

impl InflightGuard {
    fn new(inflight: Arc<AtomicUsize>) -> Self {
        inflight.fetch_add(1, Ordering::Relaxed);
        Self { inflight }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.inflight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Cooperative cancellation handle threaded through every call, per the
/// coordinator's bounded-grace-period cancellation rule.
#[derive(Clone)]
pub struct CancellationHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancellationHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn caller(config: CallerConfig) -> RateLimitedCaller {
        RateLimitedCaller::new("test-provider", config)
    }

    #[tokio::test]
    async fn succeeds_on_first_try() {
        let caller = caller(CallerConfig::default());
        let result: Result<u32, CallError> = caller
            .call(|| async { Ok::<_, (String, Classification)>(42) })
            .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn retries_retryable_errors_then_succeeds() {
        let config = CallerConfig {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..CallerConfig::default()
        };
        let caller = caller(config);
        let attempts = AtomicU32::new(0);
        let result: Result<u32, CallError> = caller
            .call(|| {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(("transient".to_string(), Classification::Retryable))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_auth_does_not_retry() {
        let caller = caller(CallerConfig::default());
        let attempts = AtomicU32::new(0);
        let result: Result<u32, CallError> = caller
            .call(|| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<u32, _>(("nope".to_string(), Classification::FatalAuth)) }
            })
            .await;
        assert!(matches!(result, Err(CallError::Auth { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_retries_on_persistent_retryable_error() {
        let config = CallerConfig {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..CallerConfig::default()
        };
        let caller = caller(config);
        let result: Result<u32, CallError> = caller
            .call(|| async { Err::<u32, _>(("down".to_string(), Classification::Retryable)) })
            .await;
        assert!(matches!(result, Err(CallError::RetriesExhausted { .. })));
    }

    #[tokio::test]
    async fn cancellation_short_circuits_before_first_attempt() {
        let caller = caller(CallerConfig::default());
        caller.cancellation_handle().cancel();
        let result: Result<u32, CallError> = caller
            .call(|| async { Ok::<_, (String, Classification)>(1) })
            .await;
        assert!(matches!(result, Err(CallError::Cancelled)));
    }

    #[tokio::test]
    async fn a_single_caller_can_be_shared_across_concurrent_tasks() {
        let caller = Arc::new(caller(CallerConfig {
            max_concurrency: 4,
            ..CallerConfig::default()
        }));
        let mut handles = Vec::new();
        for i in 0..10u32 {
            let caller = Arc::clone(&caller);
            handles.push(tokio::spawn(async move {
                caller
                    .call(|| async move { Ok::<_, (String, Classification)>(i) })
                    .await
            }));
        }
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap().unwrap());
        }
        results.sort();
        assert_eq!(results, (0..10).collect::<Vec<_>>());
    }
}
