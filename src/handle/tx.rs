use std::fmt;
use std::future::Future;

use super::Handle;
use crate::error::SqlHandleError;

/// Transaction isolation level, passed to the engine as given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        })
    }
}

/// Options for [`Handle::tx_with`]. Ignored for nested transactions, which
/// run as savepoints of the enclosing one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxOptions {
    pub isolation: Option<IsolationLevel>,
    pub read_only: bool,
}

impl TxOptions {
    #[must_use]
    pub fn isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation = Some(level);
        self
    }

    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
}

impl Handle {
    /// Run `f` inside a transaction with default options.
    ///
    /// # Errors
    /// See [`Handle::tx_with`].
    pub async fn tx<F, Fut, R, E>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(Handle) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: From<SqlHandleError>,
    {
        self.tx_with(TxOptions::default(), f).await
    }

    /// Run `f` with a handle scoped to a new transaction.
    ///
    /// `Ok` commits and `Err` rolls back; the callback's error is returned as
    /// is. Called on a transaction-scoped handle this opens a savepoint
    /// instead. The scoped handle must not outlive `f`: once the transaction
    /// finishes, its operations fail with `TransactionClosed`.
    ///
    /// # Errors
    /// The callback's error, or the begin/commit error converted into `E`.
    pub async fn tx_with<F, Fut, R, E>(&self, opts: TxOptions, f: F) -> Result<R, E>
    where
        F: FnOnce(Handle) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: From<SqlHandleError>,
    {
        let executor = self.session.executor.begin(&self.session.ctx, &opts).await?;
        let scoped = self.with_conn(executor.clone());
        match f(scoped).await {
            Ok(value) => {
                executor.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = executor.rollback().await {
                    tracing::warn!(error = %rollback_err, "transaction rollback failed");
                }
                Err(err)
            }
        }
    }
}
