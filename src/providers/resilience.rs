//! Resilience chain for provider calls.
//!
//! Every outbound call passes, outer to inner: token-bucket rate limit →
//! bulkhead → circuit breaker → retry with backoff and jitter → per-call
//! deadline. Each layer is independently testable; [`ResilientProvider`]
//! composes them behind the same [`Provider`] trait as the raw clients.
//!
//! Clocks here are `tokio::time::Instant` so tests can drive them with a
//! paused runtime.

use super::{ChatRequest, ChunkStream, Provider, ProviderError};
use crate::config::ReliabilityConfig;
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;

// ── Token bucket ─────────────────────────────────────────────────

/// Steady-rate admission: `rate_per_second` tokens refill continuously,
/// capacity equals one second of budget.
pub struct TokenBucket {
    capacity: f64,
    refill_per_second: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate_per_second: f64) -> Self {
        let capacity = rate_per_second.max(1.0);
        Self {
            capacity,
            refill_per_second: rate_per_second.max(0.01),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take a token, or report how long until one is available.
    fn try_acquire(&self) -> Result<(), Duration> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_second).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - state.tokens;
            Err(Duration::from_secs_f64(deficit / self.refill_per_second))
        }
    }

    /// Wait until a token is available.
    pub async fn acquire(&self) {
        loop {
            match self.try_acquire() {
                Ok(()) => return,
                Err(wait) => tokio::time::sleep(wait).await,
            }
        }
    }
}

// ── Circuit breaker ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed { consecutive_failures: u32 },
    Open { opened_at: Instant },
    HalfOpen { probe_in_flight: bool },
}

/// Opens after `failure_threshold` consecutive failures; after `cooldown`
/// a single half-open probe is admitted, and its outcome decides whether
/// the circuit closes again.
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            state: Mutex::new(BreakerState::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    /// Whether a call may proceed right now.
    pub fn try_pass(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            BreakerState::Closed { .. } => true,
            BreakerState::Open { opened_at } => {
                if opened_at.elapsed() >= self.cooldown {
                    *state = BreakerState::HalfOpen {
                        probe_in_flight: true,
                    };
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen { probe_in_flight } => {
                if probe_in_flight {
                    false
                } else {
                    *state = BreakerState::HalfOpen {
                        probe_in_flight: true,
                    };
                    true
                }
            }
        }
    }

    pub fn on_success(&self) {
        *self.state.lock() = BreakerState::Closed {
            consecutive_failures: 0,
        };
    }

    pub fn on_failure(&self) {
        let mut state = self.state.lock();
        *state = match *state {
            BreakerState::Closed {
                consecutive_failures,
            } => {
                let failures = consecutive_failures + 1;
                if failures >= self.failure_threshold {
                    BreakerState::Open {
                        opened_at: Instant::now(),
                    }
                } else {
                    BreakerState::Closed {
                        consecutive_failures: failures,
                    }
                }
            }
            BreakerState::HalfOpen { .. } => BreakerState::Open {
                opened_at: Instant::now(),
            },
            open @ BreakerState::Open { .. } => open,
        };
    }

    /// Human-readable state for the status endpoint.
    pub fn state_label(&self) -> &'static str {
        match *self.state.lock() {
            BreakerState::Closed { .. } => "closed",
            BreakerState::Open { .. } => "open",
            BreakerState::HalfOpen { .. } => "half_open",
        }
    }
}

// ── Retry policy ─────────────────────────────────────────────────

/// Exponential backoff with jitter, bounded attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Delay before the attempt after `completed_attempts` failures.
    /// Jittered into the upper half of the exponential step.
    pub fn delay(&self, completed_attempts: u32) -> Duration {
        let exp = completed_attempts.saturating_sub(1).min(16);
        let base = self
            .initial
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max);
        let half = base / 2;
        let jitter = rand::thread_rng().gen_range(0..=half.as_millis().max(1) as u64);
        half + Duration::from_millis(jitter)
    }
}

// ── Resilient provider ───────────────────────────────────────────

/// Wraps a raw provider client in the full resilience chain.
pub struct ResilientProvider {
    inner: Arc<dyn Provider>,
    rate: TokenBucket,
    bulkhead: Arc<Semaphore>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    call_timeout: Duration,
}

impl ResilientProvider {
    pub fn new(inner: Arc<dyn Provider>, config: &ReliabilityConfig) -> Self {
        Self {
            inner,
            rate: TokenBucket::new(config.rate_per_second),
            bulkhead: Arc::new(Semaphore::new(config.bulkhead_permits.max(1))),
            breaker: CircuitBreaker::new(
                config.breaker_failure_threshold,
                Duration::from_secs(config.breaker_cooldown_seconds),
            ),
            retry: RetryPolicy {
                initial: Duration::from_millis(config.retry_initial_ms),
                max: Duration::from_millis(config.retry_max_ms),
                max_attempts: config.retry_max_attempts.max(1),
            },
            call_timeout: Duration::from_secs(config.call_timeout_seconds),
        }
    }

    pub fn breaker_state(&self) -> &'static str {
        self.breaker.state_label()
    }

    fn circuit_open_error(&self) -> ProviderError {
        ProviderError::CircuitOpen {
            provider: self.inner.name().to_string(),
        }
    }

    async fn admit(&self) -> Result<tokio::sync::OwnedSemaphorePermit, ProviderError> {
        self.rate.acquire().await;
        self.bulkhead
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ProviderError::Network("bulkhead closed".into()))
    }
}

#[async_trait]
impl Provider for ResilientProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn invoke(&self, request: &ChatRequest) -> Result<String, ProviderError> {
        let _permit = self.admit().await?;

        let mut attempt = 0u32;
        let mut last_error: ProviderError;
        loop {
            if !self.breaker.try_pass() {
                return Err(self.circuit_open_error());
            }
            attempt += 1;

            match tokio::time::timeout(self.call_timeout, self.inner.invoke(request)).await {
                Ok(Ok(reply)) => {
                    self.breaker.on_success();
                    return Ok(reply);
                }
                Ok(Err(e)) => {
                    self.breaker.on_failure();
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    last_error = e;
                }
                Err(_) => {
                    self.breaker.on_failure();
                    last_error = ProviderError::Timeout {
                        seconds: self.call_timeout.as_secs(),
                    };
                }
            }

            if attempt >= self.retry.max_attempts {
                // A pure deadline miss keeps its own kind so the boundary
                // can answer 504 instead of 502.
                if matches!(last_error, ProviderError::Timeout { .. }) {
                    return Err(last_error);
                }
                return Err(ProviderError::RetryExhausted {
                    provider: self.inner.name().to_string(),
                    attempts: attempt,
                    last: last_error.to_string(),
                });
            }
            tokio::time::sleep(self.retry.delay(attempt)).await;
        }
    }

    async fn invoke_stream(&self, request: &ChatRequest) -> Result<ChunkStream, ProviderError> {
        let permit = self.admit().await?;

        let mut attempt = 0u32;
        let mut last_error: ProviderError;
        let stream = loop {
            if !self.breaker.try_pass() {
                return Err(self.circuit_open_error());
            }
            attempt += 1;

            // Retry covers stream establishment only; once chunks flow,
            // failures surface in-band as error chunks.
            match tokio::time::timeout(self.call_timeout, self.inner.invoke_stream(request)).await
            {
                Ok(Ok(stream)) => {
                    self.breaker.on_success();
                    break stream;
                }
                Ok(Err(e)) => {
                    self.breaker.on_failure();
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    last_error = e;
                }
                Err(_) => {
                    self.breaker.on_failure();
                    last_error = ProviderError::Timeout {
                        seconds: self.call_timeout.as_secs(),
                    };
                }
            }

            if attempt >= self.retry.max_attempts {
                if matches!(last_error, ProviderError::Timeout { .. }) {
                    return Err(last_error);
                }
                return Err(ProviderError::RetryExhausted {
                    provider: self.inner.name().to_string(),
                    attempts: attempt,
                    last: last_error.to_string(),
                });
            }
            tokio::time::sleep(self.retry.delay(attempt)).await;
        };

        // The bulkhead permit rides along for the stream's lifetime, so a
        // slow consumer still counts against concurrency.
        use futures_util::StreamExt;
        let held = futures_util::stream::unfold(
            (stream, permit),
            |(mut stream, permit)| async move {
                stream.next().await.map(|chunk| (chunk, (stream, permit)))
            },
        );
        Ok(Box::pin(held))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::StreamChunk;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyProvider {
        calls: AtomicU32,
        fail_first: u32,
        error: fn() -> ProviderError,
    }

    impl FlakyProvider {
        fn failing_first(n: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_first: n,
                error: || ProviderError::Network("connection reset".into()),
            }
        }

        fn always_unauthorized() -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_first: u32::MAX,
                error: || ProviderError::Http {
                    status: 401,
                    message: "bad key".into(),
                },
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Provider for FlakyProvider {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn invoke(&self, _r: &ChatRequest) -> Result<String, ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err((self.error)())
            } else {
                Ok("reply".into())
            }
        }

        async fn invoke_stream(&self, r: &ChatRequest) -> Result<ChunkStream, ProviderError> {
            self.invoke(r).await?;
            Ok(Box::pin(futures_util::stream::iter([
                StreamChunk::Content {
                    content: "reply".into(),
                },
                StreamChunk::Done,
            ])))
        }
    }

    fn config(threshold: u32, attempts: u32) -> ReliabilityConfig {
        ReliabilityConfig {
            rate_per_second: 1000.0,
            bulkhead_permits: 5,
            breaker_failure_threshold: threshold,
            breaker_cooldown_seconds: 60,
            retry_initial_ms: 1,
            retry_max_ms: 10,
            retry_max_attempts: attempts,
            call_timeout_seconds: 120,
        }
    }

    fn request() -> ChatRequest {
        ChatRequest {
            system: "s".into(),
            user: "u".into(),
            model: "m".into(),
            temperature: 0.0,
            max_tokens: 16,
        }
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_failures() {
        let inner = Arc::new(FlakyProvider::failing_first(2));
        let provider = ResilientProvider::new(inner.clone(), &config(10, 5));
        let reply = provider.invoke(&request()).await.unwrap();
        assert_eq!(reply, "reply");
        assert_eq!(inner.calls(), 3);
    }

    #[tokio::test]
    async fn retry_exhaustion_has_distinct_kind() {
        let inner = Arc::new(FlakyProvider::failing_first(u32::MAX));
        let provider = ResilientProvider::new(inner, &config(10, 3));
        let err = provider.invoke(&request()).await.unwrap_err();
        assert!(matches!(
            err,
            ProviderError::RetryExhausted { attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_fast() {
        let inner = Arc::new(FlakyProvider::always_unauthorized());
        let provider = ResilientProvider::new(inner.clone(), &config(10, 5));
        let err = provider.invoke(&request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Http { status: 401, .. }));
        assert_eq!(inner.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_opens_and_blocks_without_upstream_call() {
        let inner = Arc::new(FlakyProvider::failing_first(u32::MAX));
        // Threshold 3 with 4 retry attempts: one invoke opens the circuit.
        let provider = ResilientProvider::new(inner.clone(), &config(3, 4));

        let err = provider.invoke(&request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::CircuitOpen { .. }));
        let calls_after_open = inner.calls();
        assert_eq!(calls_after_open, 3);

        // Next request fails immediately, upstream untouched.
        let err = provider.invoke(&request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::CircuitOpen { .. }));
        assert_eq!(inner.calls(), calls_after_open);
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_half_open_probe_recovers() {
        let inner = Arc::new(FlakyProvider::failing_first(3));
        let provider = ResilientProvider::new(inner.clone(), &config(3, 1));

        // Three failing invokes open the circuit.
        for _ in 0..3 {
            let _ = provider.invoke(&request()).await;
        }
        assert_eq!(provider.breaker_state(), "open");
        assert!(matches!(
            provider.invoke(&request()).await.unwrap_err(),
            ProviderError::CircuitOpen { .. }
        ));

        // After the cooldown a probe is admitted and succeeds.
        tokio::time::advance(Duration::from_secs(61)).await;
        let reply = provider.invoke(&request()).await.unwrap();
        assert_eq!(reply, "reply");
        assert_eq!(provider.breaker_state(), "closed");
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_half_open_admits_single_probe() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(60));
        breaker.on_failure();
        assert!(!breaker.try_pass());

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(breaker.try_pass(), "first probe admitted");
        assert!(!breaker.try_pass(), "second concurrent probe refused");

        breaker.on_failure();
        assert_eq!(breaker.state_label(), "open");
    }

    #[tokio::test(start_paused = true)]
    async fn token_bucket_paces_requests() {
        let bucket = TokenBucket::new(2.0);
        let start = Instant::now();
        bucket.acquire().await;
        bucket.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(10));

        // Third token requires a refill interval.
        bucket.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test]
    async fn deadline_maps_to_timeout_kind() {
        struct SlowProvider;
        #[async_trait]
        impl Provider for SlowProvider {
            fn name(&self) -> &str {
                "slow"
            }
            async fn invoke(&self, _r: &ChatRequest) -> Result<String, ProviderError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(String::new())
            }
            async fn invoke_stream(
                &self,
                _r: &ChatRequest,
            ) -> Result<ChunkStream, ProviderError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(ProviderError::Network("unreachable".into()))
            }
        }

        let mut cfg = config(10, 2);
        cfg.call_timeout_seconds = 0; // floor: fires immediately
        let provider = ResilientProvider::new(Arc::new(SlowProvider), &cfg);
        let err = provider.invoke(&request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Timeout { .. }));
    }

    #[tokio::test]
    async fn stream_path_retries_establishment() {
        use futures_util::StreamExt;
        let inner = Arc::new(FlakyProvider::failing_first(1));
        let provider = ResilientProvider::new(inner, &config(10, 3));
        let mut stream = provider.invoke_stream(&request()).await.unwrap();
        let mut content = String::new();
        while let Some(chunk) = stream.next().await {
            if let StreamChunk::Content { content: c } = chunk {
                content.push_str(&c);
            }
        }
        assert_eq!(content, "reply");
    }

    #[test]
    fn retry_delay_is_bounded_and_grows() {
        let policy = RetryPolicy {
            initial: Duration::from_secs(2),
            max: Duration::from_secs(60),
            max_attempts: 5,
        };
        let d1 = policy.delay(1);
        let d5 = policy.delay(5);
        assert!(d1 >= Duration::from_secs(1));
        assert!(d1 <= Duration::from_secs(2));
        assert!(d5 >= Duration::from_secs(16));
        assert!(d5 <= Duration::from_secs(32));
        // Far attempts stay capped.
        assert!(policy.delay(40) <= Duration::from_secs(60));
    }
}
