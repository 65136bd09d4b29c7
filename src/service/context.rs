//! Per-session coordination primitives.
//!
//! Every task a session spawns holds a clone of its [`SessionContext`].
//! Cancelling the context is the only coordinated shutdown path; the first
//! failure reported through [`SessionContext::fail`] is kept and cancels
//! everything else.

use crate::error::{ProxyError, Result};
use crate::utils::metrics::Metrics;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::debug;

struct Inner {
    cancel: CancellationToken,
    error: Mutex<Option<ProxyError>>,
    metrics: Arc<Metrics>,
}

/// Shared cancellation and first-error slot for one session.
#[derive(Clone)]
pub struct SessionContext {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new(Arc::new(Metrics::new()))
    }
}

impl SessionContext {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            inner: Arc::new(Inner {
                cancel: CancellationToken::new(),
                error: Mutex::new(None),
                metrics,
            }),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.inner.cancel.cancelled()
    }

    /// Record `err` if it is the first failure, then cancel the session.
    pub fn fail(&self, err: ProxyError) {
        if let Ok(mut slot) = self.inner.error.lock() {
            if slot.is_none() {
                debug!(error = %err, "Session failed");
                *slot = Some(err);
            }
        }
        self.cancel();
    }

    /// Take the recorded failure, if any.
    pub fn take_error(&self) -> Option<ProxyError> {
        self.inner.error.lock().ok().and_then(|mut e| e.take())
    }
}

/// One-shot barrier: once opened it stays open.
#[derive(Clone, Debug)]
pub struct Latch {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

impl Latch {
    pub fn new() -> Self {
        Self {
            tx: Arc::new(watch::channel(false).0),
        }
    }

    /// Open the latch. Opening twice is a no-op.
    pub fn open(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until opened or the session is cancelled.
    pub async fn wait(&self, ctx: &SessionContext) -> Result<()> {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(ProxyError::Cancelled);
                    }
                }
                _ = ctx.cancelled() => return Err(ProxyError::Cancelled),
            }
        }
    }
}

/// Counter of outstanding tasks that can be awaited to reach zero.
#[derive(Clone, Debug)]
pub struct WaitGroup {
    tx: Arc<watch::Sender<usize>>,
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitGroup {
    pub fn new() -> Self {
        Self {
            tx: Arc::new(watch::channel(0).0),
        }
    }

    pub fn add(&self, n: usize) {
        self.tx.send_modify(|count| *count += n);
    }

    pub fn done(&self) {
        self.tx.send_modify(|count| *count = count.saturating_sub(1));
    }

    pub fn pending(&self) -> usize {
        *self.tx.borrow()
    }

    /// Wait until the count reaches zero or the session is cancelled.
    pub async fn wait(&self, ctx: &SessionContext) -> Result<()> {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() == 0 {
                return Ok(());
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(ProxyError::Cancelled);
                    }
                }
                _ = ctx.cancelled() => return Err(ProxyError::Cancelled),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_first_failure_wins() {
        let ctx = SessionContext::default();
        ctx.fail(ProxyError::Timeout);
        ctx.fail(ProxyError::ConnectionClosed);
        assert!(ctx.is_cancelled());
        assert!(matches!(ctx.take_error(), Some(ProxyError::Timeout)));
        assert!(ctx.take_error().is_none());
    }

    #[tokio::test]
    async fn test_latch_releases_waiters() {
        let ctx = SessionContext::default();
        let latch = Latch::new();
        let waiter = {
            let (latch, ctx) = (latch.clone(), ctx.clone());
            tokio::spawn(async move { latch.wait(&ctx).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        latch.open();
        latch.open();
        waiter.await.unwrap().unwrap();
        assert!(latch.is_open());
    }

    #[tokio::test]
    async fn test_latch_wait_is_cancellable() {
        let ctx = SessionContext::default();
        let latch = Latch::new();
        ctx.cancel();
        assert!(matches!(latch.wait(&ctx).await, Err(ProxyError::Cancelled)));
    }

    #[tokio::test]
    async fn test_wait_group_reaches_zero() {
        let ctx = SessionContext::default();
        let wg = WaitGroup::new();
        wg.wait(&ctx).await.unwrap();

        wg.add(2);
        let waiter = {
            let (wg, ctx) = (wg.clone(), ctx.clone());
            tokio::spawn(async move { wg.wait(&ctx).await })
        };
        wg.done();
        assert_eq!(wg.pending(), 1);
        wg.done();
        waiter.await.unwrap().unwrap();
    }
}
