//! Request-scoped deadline and cancellation.
//!
//! Every durable boundary (loading a run, forking a branch, reading a page
//! of history) runs through [`RequestContext::run`], which races the
//! operation against the deadline and the cancellation signal.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{HistoryError, HistoryResult};

/// Caller-supplied deadline and cancellation signal.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
}

/// Cancels every [`RequestContext`] created alongside it.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Cancel every context sharing this handle.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl RequestContext {
    /// No deadline, never cancelled.
    pub fn background() -> Self {
        Self::default()
    }

    /// Context whose deadline is `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancel: None,
        }
    }

    /// Context expiring at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            cancel: None,
        }
    }

    /// Context plus the handle that cancels it.
    pub fn with_cancel(self) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        (
            Self {
                deadline: self.deadline,
                cancel: Some(rx),
            },
            CancelHandle { tx },
        )
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Fail fast if the context is already done.
    pub fn check(&self, operation: &'static str) -> HistoryResult<()> {
        if self.is_cancelled() {
            return Err(HistoryError::Cancelled { operation });
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(HistoryError::DeadlineExceeded { operation });
            }
        }
        Ok(())
    }

    /// Run `fut` unless the context is cancelled or times out first.
    ///
    /// A cancelled or expired operation is dropped; its partial effects are
    /// whatever the callee had made durable before the drop.
    pub async fn run<T, F>(&self, operation: &'static str, fut: F) -> HistoryResult<T>
    where
        F: Future<Output = HistoryResult<T>>,
    {
        self.check(operation)?;

        let cancelled = wait_cancelled(self.cancel.clone());
        let expired = wait_deadline(self.deadline);

        tokio::select! {
            biased;
            _ = cancelled => Err(HistoryError::Cancelled { operation }),
            _ = expired => Err(HistoryError::DeadlineExceeded { operation }),
            result = fut => result,
        }
    }
}

async fn wait_cancelled(cancel: Option<watch::Receiver<bool>>) {
    let Some(mut rx) = cancel else {
        return std::future::pending().await;
    };
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Handle dropped without cancelling.
            return std::future::pending().await;
        }
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn background_context_runs_to_completion() {
        let ctx = RequestContext::background();
        let value = ctx.run("op", async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn cancelled_context_rejects_before_running() {
        let (ctx, handle) = RequestContext::background().with_cancel();
        handle.cancel();
        let err = ctx
            .run("load", async { Ok::<_, HistoryError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, HistoryError::Cancelled { operation: "load" }));
    }

    #[tokio::test]
    async fn cancel_interrupts_pending_operation() {
        let (ctx, handle) = RequestContext::background().with_cancel();
        let task = tokio::spawn(async move {
            ctx.run("fork", async {
                std::future::pending::<()>().await;
                Ok::<_, HistoryError>(())
            })
            .await
        });
        tokio::task::yield_now().await;
        handle.cancel();
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, HistoryError::Cancelled { operation: "fork" }));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expires_pending_operation() {
        let ctx = RequestContext::with_timeout(Duration::from_millis(50));
        let err = ctx
            .run("read", async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, HistoryError>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HistoryError::DeadlineExceeded { operation: "read" }
        ));
    }

    #[tokio::test]
    async fn dropped_handle_never_cancels() {
        let (ctx, handle) = RequestContext::background().with_cancel();
        drop(handle);
        assert!(!ctx.is_cancelled());
        assert_eq!(ctx.run("op", async { Ok(1) }).await.unwrap(), 1);
    }
}
