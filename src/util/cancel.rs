use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

/// Single cancellation token shared by every suspension point in a session
/// (§5). Replaces the source's polled-every-200ms boolean with a
/// `tokio::select!`-driven wait so abort propagates immediately instead of
/// on the next poll tick.
#[derive(Clone)]
pub struct AbortToken {
    tx: watch::Sender<bool>,
}

pub struct AbortWaiter {
    rx: watch::Receiver<bool>,
}

impl AbortToken {
    pub fn new() -> (Self, AbortWaiter) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, AbortWaiter { rx })
    }

    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }

    /// Resets the token for reuse by a fresh session.
    pub fn reset(&self) {
        let _ = self.tx.send(false);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn waiter(&self) -> AbortWaiter {
        AbortWaiter {
            rx: self.tx.subscribe(),
        }
    }
}

impl AbortWaiter {
    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Sleeps for `duration`, returning early (without error) if aborted.
    /// Returns `true` if the sleep ran to completion, `false` if cancelled.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        if self.is_aborted() {
            return false;
        }
        tokio::select! {
            _ = sleep(duration) => true,
            _ = self.rx.changed() => false,
        }
    }

    /// Polls `poll_fn` every `tick` up to `timeout`, returning `Ok(true)`
    /// as soon as it returns `true`, `Ok(false)` on timeout, or an abort
    /// error if the token fires first.
    pub async fn poll_until<F, Fut>(
        &mut self,
        timeout: Duration,
        tick: Duration,
        mut poll_fn: F,
    ) -> crate::error::Result<bool>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = crate::error::Result<bool>>,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_aborted() {
                return Err(crate::error::GuiderError::aborted());
            }
            if poll_fn().await? {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            if !self.sleep(tick).await {
                return Err(crate::error::GuiderError::aborted());
            }
        }
    }
}
