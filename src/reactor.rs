//! Event loop abstraction
//!
//! Every session is driven by one `Reactor`: it spawns the session owner task
//! and the channel pumps, schedules keep-alive and agent serving, enforces
//! timeouts, and retries operations that report "would block".

use std::future::Future;
use std::task::Poll;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Default pause between two attempts of an operation that would block.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct Reactor {
    handle: Handle,
    retry_interval: Duration,
}

impl Reactor {
    /// Bind to the runtime the caller is running on.
    ///
    /// Returns `None` outside of a tokio runtime.
    pub fn try_current() -> Option<Self> {
        Handle::try_current().ok().map(Self::from_handle)
    }

    pub fn from_handle(handle: Handle) -> Self {
        Self {
            handle,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    /// Latency vs. CPU knob for would-block retries.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Fail the in-flight operation once `limit` elapses.
    pub async fn timeout<F: Future>(
        &self,
        limit: Duration,
        future: F,
    ) -> Result<F::Output, tokio::time::error::Elapsed> {
        tokio::time::timeout(limit, future).await
    }

    /// Re-enter `op` until it is ready.
    ///
    /// `Poll::Pending` is the would-block signal: the step is retried after
    /// one retry interval, never skipped.
    pub async fn retry<T>(&self, mut op: impl FnMut() -> Poll<T>) -> T {
        let mut attempts: u64 = 0;
        loop {
            match op() {
                Poll::Ready(value) => {
                    if attempts > 0 {
                        trace!("Operation ready after {} would-block retries", attempts);
                    }
                    return value;
                }
                Poll::Pending => {
                    attempts += 1;
                    tokio::time::sleep(self.retry_interval).await;
                }
            }
        }
    }

    /// Run `tick` every `period` until it returns `false` or `token` fires.
    pub fn every<F, Fut>(&self, period: Duration, token: CancellationToken, mut tick: F) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.handle.spawn(async move {
            let mut interval = tokio::time::interval(period);
            // the first tick of a tokio interval completes immediately
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        if !tick().await {
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_retry_reenters_same_step() {
        let reactor = Reactor::try_current().unwrap().with_retry_interval(Duration::from_millis(1));
        let mut calls = 0;
        let value = reactor
            .retry(|| {
                calls += 1;
                if calls < 3 {
                    Poll::Pending
                } else {
                    Poll::Ready(calls)
                }
            })
            .await;
        assert_eq!(value, 3);
    }

    #[tokio::test]
    async fn test_timeout_fails_operation() {
        let reactor = Reactor::try_current().unwrap();
        let result = reactor
            .timeout(Duration::from_millis(5), tokio::time::sleep(Duration::from_secs(5)))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_every_stops_when_tick_returns_false() {
        let reactor = Reactor::try_current().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handle = reactor.every(Duration::from_millis(1), CancellationToken::new(), move || {
            let c = c.clone();
            async move { c.fetch_add(1, Ordering::SeqCst) < 2 }
        });
        handle.await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_try_current_outside_runtime() {
        assert!(Reactor::try_current().is_none());
    }
}
