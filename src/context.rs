use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Span;

use crate::error::SqlHandleError;

/// Cancellation, deadline, and tracing scope for the work issued through a
/// handle.
///
/// Contexts are cheap to clone. Clones share the same cancellation token, so
/// cancelling any of them stops in-flight statements on all of them.
#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
    span: Span,
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    #[must_use]
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
            span: Span::none(),
        }
    }

    /// Wrap an existing token.
    #[must_use]
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            ..Self::background()
        }
    }

    /// Child context: cancelling the parent cancels the child, not the
    /// other way round.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
            span: self.span.clone(),
        }
    }

    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Set a deadline. An earlier existing deadline wins.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        });
        self
    }

    /// Statements executed under this context are logged inside `span`.
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    #[must_use]
    pub fn span(&self) -> &Span {
        &self.span
    }

    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Fail fast when the context is already done.
    pub(crate) fn check(&self) -> Result<(), SqlHandleError> {
        if self.token.is_cancelled() {
            return Err(SqlHandleError::Cancelled);
        }
        if self.deadline.is_some_and(|deadline| deadline <= Instant::now()) {
            return Err(SqlHandleError::DeadlineExceeded);
        }
        Ok(())
    }

    /// Drive `fut` until it completes or the context is done. Only for work
    /// that may be abandoned half way, such as a pool checkout.
    pub(crate) async fn run<F, T>(&self, fut: F) -> Result<T, SqlHandleError>
    where
        F: Future<Output = Result<T, SqlHandleError>>,
    {
        self.check()?;
        tokio::select! {
            res = fut => res,
            () = self.token.cancelled() => Err(SqlHandleError::Cancelled),
            () = self.expired() => Err(SqlHandleError::DeadlineExceeded),
        }
    }

    /// Drive a statement that the engine may already be executing.
    ///
    /// `fut` is never dropped mid-flight. When the context ends first,
    /// `interrupt` asks the engine to stop and `fut` is still awaited. A
    /// statement that finished anyway is reported as done; one that failed is
    /// reported with the context's error.
    pub(crate) async fn run_interruptible<F, T, I, IF>(
        &self,
        fut: F,
        interrupt: I,
    ) -> Result<T, SqlHandleError>
    where
        F: Future<Output = Result<T, SqlHandleError>>,
        I: FnOnce() -> IF,
        IF: Future<Output = ()>,
    {
        self.check()?;
        tokio::pin!(fut);
        let ended = tokio::select! {
            res = &mut fut => return res,
            () = self.token.cancelled() => SqlHandleError::Cancelled,
            () = self.expired() => SqlHandleError::DeadlineExceeded,
        };
        interrupt().await;
        match fut.await {
            Ok(done) => Ok(done),
            Err(err) => {
                tracing::debug!(error = %err, "statement stopped after {ended}");
                Err(ended)
            }
        }
    }

    async fn expired(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[tokio::test]
    async fn completes_when_not_cancelled() {
        let ctx = Context::background();
        let out = ctx.run(async { Ok::<_, SqlHandleError>(7) }).await.unwrap();
        assert_eq!(out, 7);
    }

    #[tokio::test]
    async fn cancelled_context_stops_work() {
        let ctx = Context::background();
        ctx.cancel();
        let err = ctx
            .run(async { Ok::<_, SqlHandleError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, SqlHandleError::Cancelled));

        let parent = Context::background();
        let child = parent.child();
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn deadline_interrupts_pending_work() {
        let ctx = Context::background().with_timeout(Duration::from_millis(20));
        let err = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, SqlHandleError>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SqlHandleError::DeadlineExceeded));
    }

    #[test]
    fn earlier_deadline_wins() {
        let now = Instant::now();
        let ctx = Context::background()
            .with_deadline(now + Duration::from_secs(1))
            .with_deadline(now + Duration::from_secs(10));
        assert_eq!(ctx.deadline(), Some(now + Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn interrupted_work_that_fails_reports_the_context() {
        let ctx = Context::background().with_timeout(Duration::from_millis(20));
        let interrupted = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&interrupted);
        let err = ctx
            .run_interruptible(
                async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Err::<(), _>(SqlHandleError::ExecutionError("interrupted".into()))
                },
                || async move { flag.store(true, Ordering::SeqCst) },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SqlHandleError::DeadlineExceeded));
        assert!(interrupted.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn interrupted_work_that_finishes_is_reported_done() {
        let ctx = Context::background();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });
        let out = ctx
            .run_interruptible(
                async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok::<_, SqlHandleError>(7)
                },
                || async {},
            )
            .await
            .unwrap();
        assert_eq!(out, 7);
    }
}
