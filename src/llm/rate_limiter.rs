//! Call pacing for the shared model backend.
//!
//! Every acquirer queues on a FIFO-fair async mutex, so completions happen in
//! submission order regardless of which caller would have been ready first.

use std::sync::{Arc, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::RateLimitConfig;
use crate::error::LlmError;
use crate::llm::provider::{DeltaStream, LlmProvider, TurnRequest};

/// Jitter is drawn from `[0, MAX_JITTER_FRACTION * remaining_wait]`.
const MAX_JITTER_FRACTION: f64 = 0.5;

/// Enforces a minimum interval between successive completed acquisitions.
pub struct RateLimiter {
    min_interval: Duration,
    jitter: bool,
    /// Wait chain. Holding the guard means "my turn".
    chain: Mutex<()>,
    /// Kept outside the chain so `reset` never queues behind acquirers.
    last_request: std::sync::Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            jitter: true,
            chain: Mutex::new(()),
            last_request: std::sync::Mutex::new(None),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.min_interval).with_jitter(config.jitter)
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait for this caller's slot. Returns the instant the slot was granted,
    /// at least `min_interval` after the previous completed acquisition.
    pub async fn acquire(&self) -> Instant {
        let _turn = self.chain.lock().await;

        let remaining = self.remaining_wait();
        if !remaining.is_zero() {
            let delay = remaining + self.jitter_for(remaining);
            tracing::trace!(delay_ms = delay.as_millis() as u64, "Rate limiter pacing");
            tokio::time::sleep(delay).await;
        }

        let granted = Instant::now();
        *self
            .last_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(granted);
        granted
    }

    /// Forget the last request time. Queued acquirers keep their order.
    pub fn reset(&self) {
        *self
            .last_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn remaining_wait(&self) -> Duration {
        let last = *self
            .last_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match last {
            Some(at) => self.min_interval.saturating_sub(at.elapsed()),
            None => Duration::ZERO,
        }
    }

    fn jitter_for(&self, remaining: Duration) -> Duration {
        if !self.jitter {
            return Duration::ZERO;
        }
        let factor = rand::thread_rng().gen_range(0.0..=MAX_JITTER_FRACTION);
        remaining.mul_f64(factor)
    }
}

/// [`LlmProvider`] decorator that paces every streamed request.
pub struct RateLimitedProvider {
    inner: Arc<dyn LlmProvider>,
    limiter: Arc<RateLimiter>,
}

impl RateLimitedProvider {
    pub fn new(inner: Arc<dyn LlmProvider>, limiter: Arc<RateLimiter>) -> Self {
        Self { inner, limiter }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }
}

#[async_trait]
impl LlmProvider for RateLimitedProvider {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    async fn stream_turn(&self, request: TurnRequest) -> Result<DeltaStream, LlmError> {
        self.limiter.acquire().await;
        self.inner.stream_turn(request).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::llm::turn::request_turn;
    use crate::test_support::ScriptedLlm;

    const INTERVAL: Duration = Duration::from_millis(40);

    #[tokio::test]
    async fn first_acquire_is_immediate() {
        let limiter = RateLimiter::new(Duration::from_secs(10));
        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn completions_are_spaced_and_fifo() {
        let limiter = Arc::new(RateLimiter::new(INTERVAL));
        let log = Arc::new(StdMutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..4 {
            let limiter = Arc::clone(&limiter);
            let log = Arc::clone(&log);
            handles.push(tokio::spawn(async move {
                let granted = limiter.acquire().await;
                log.lock().unwrap().push((i, granted));
            }));
            // Make submission order deterministic.
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        for h in handles {
            h.await.unwrap();
        }

        let log = log.lock().unwrap();
        let order: Vec<usize> = log.iter().map(|(i, _)| *i).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
        for pair in log.windows(2) {
            let gap = pair[1].1.duration_since(pair[0].1);
            assert!(gap >= INTERVAL, "gap {gap:?} shorter than {INTERVAL:?}");
        }
    }

    #[tokio::test]
    async fn jitter_only_adds_delay() {
        let limiter = RateLimiter::new(INTERVAL).with_jitter(true);
        limiter.acquire().await;
        let start = Instant::now();
        limiter.acquire().await;
        let waited = start.elapsed();
        assert!(waited >= INTERVAL.mul_f64(0.9));
        assert!(waited < INTERVAL * 4);
    }

    #[tokio::test]
    async fn reset_clears_last_request() {
        let limiter = RateLimiter::new(Duration::from_secs(10)).with_jitter(false);
        limiter.acquire().await;
        limiter.reset();
        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn reset_keeps_queued_acquirers_in_order() {
        let limiter = Arc::new(RateLimiter::new(INTERVAL).with_jitter(false));
        limiter.acquire().await;
        let log = Arc::new(StdMutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..3 {
            let limiter = Arc::clone(&limiter);
            let log = Arc::clone(&log);
            handles.push(tokio::spawn(async move {
                limiter.acquire().await;
                log.lock().unwrap().push(i);
            }));
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        // All three are queued behind the pacing sleep of the first.
        limiter.reset();
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn provider_wrapper_paces_requests() {
        let inner = Arc::new(ScriptedLlm::new(vec![
            ScriptedLlm::text("one"),
            ScriptedLlm::text("two"),
        ]));
        let limiter = Arc::new(RateLimiter::new(INTERVAL).with_jitter(false));
        let provider = RateLimitedProvider::new(inner, Arc::clone(&limiter));

        let start = Instant::now();
        let first = request_turn(&provider, TurnRequest::new(vec![], vec![]))
            .await
            .unwrap();
        let second = request_turn(&provider, TurnRequest::new(vec![], vec![]))
            .await
            .unwrap();

        assert_eq!(first.content, "one");
        assert_eq!(second.content, "two");
        assert!(start.elapsed() >= INTERVAL);
        assert_eq!(provider.model_name(), "scripted");
    }
}
