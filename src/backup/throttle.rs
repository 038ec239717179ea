//! Upload throttling.
//!
//! A [`TokenBucket`] is shared by every upload in a backup run. Each write
//! through a [`ThrottledSink`] takes as many tokens as it has bytes, waiting
//! for the bucket to refill when it runs dry. Waiters queue on a fair mutex,
//! so they are admitted in arrival order.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    store::BlobSink,
};

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct TokenBucket {
    bytes_per_sec: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// A full bucket refilling at `bytes_per_sec`, holding at most `burst`
    /// bytes.
    pub fn new(bytes_per_sec: u64, burst: u64) -> Self {
        let capacity = burst.max(1) as f64;
        Self {
            bytes_per_sec: bytes_per_sec.max(1) as f64,
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// `None` when `bytes_per_sec` is zero, meaning unthrottled.
    pub fn from_rate(bytes_per_sec: u64, burst: Option<u64>) -> Option<Arc<Self>> {
        (bytes_per_sec > 0)
            .then(|| Arc::new(Self::new(bytes_per_sec, burst.unwrap_or(bytes_per_sec))))
    }

    pub fn bytes_per_sec(&self) -> u64 {
        self.bytes_per_sec as u64
    }

    /// Take `n` tokens, waiting as long as needed.
    ///
    /// Requests larger than the bucket are admitted by letting the balance go
    /// negative; the next caller then waits for the debt to be repaid.
    pub async fn acquire(&self, n: usize, cancel: &CancellationToken) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let refill = now.duration_since(state.last_refill).as_secs_f64() * self.bytes_per_sec;
        state.tokens = (state.tokens + refill).min(self.capacity);
        state.last_refill = now;

        state.tokens -= n as f64;
        if state.tokens >= 0.0 {
            return Ok(());
        }
        let wait = Duration::from_secs_f64(-state.tokens / self.bytes_per_sec);
        tokio::select! {
            _ = tokio::time::sleep(wait) => Ok(()),
            _ = cancel.cancelled() => {
                state.tokens += n as f64;
                Err(Error::Cancelled)
            }
        }
    }
}

/// Decorator that charges every write against a shared bucket.
pub struct ThrottledSink {
    inner: Box<dyn BlobSink>,
    bucket: Arc<TokenBucket>,
    cancel: CancellationToken,
}

impl ThrottledSink {
    pub fn new(inner: Box<dyn BlobSink>, bucket: Arc<TokenBucket>, cancel: CancellationToken) -> Self {
        Self {
            inner,
            bucket,
            cancel,
        }
    }
}

#[async_trait]
impl BlobSink for ThrottledSink {
    async fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.bucket.acquire(buf.len(), &self.cancel).await?;
        self.inner.write(buf).await
    }

    async fn finish(self: Box<Self>) -> Result<()> {
        self.inner.finish().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_rate_is_unthrottled() {
        assert!(TokenBucket::from_rate(0, None).is_none());
        assert_eq!(TokenBucket::from_rate(10, None).unwrap().bytes_per_sec(), 10);
    }

    #[tokio::test]
    async fn full_bucket_admits_burst_immediately() {
        let bucket = TokenBucket::new(1_000, 1_000);
        let cancel = CancellationToken::new();
        let start = Instant::now();
        bucket.acquire(1_000, &cancel).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn empty_bucket_waits_for_refill() {
        let bucket = TokenBucket::new(1_000, 1_000);
        let cancel = CancellationToken::new();
        bucket.acquire(1_000, &cancel).await.unwrap();
        let start = Instant::now();
        bucket.acquire(300, &cancel).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn oversized_request_runs_into_debt() {
        let bucket = TokenBucket::new(10_000, 100);
        let cancel = CancellationToken::new();
        let start = Instant::now();
        bucket.acquire(2_100, &cancel).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn cancel_releases_waiter() {
        let bucket = TokenBucket::new(1, 1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = bucket.acquire(1_000, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
