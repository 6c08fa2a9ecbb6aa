use thiserror::Error;

#[derive(Debug, Error)]
pub enum SqlHandleError {
    #[cfg(feature = "postgres")]
    #[error(transparent)]
    PostgresError(#[from] tokio_postgres::Error),

    #[cfg(feature = "sqlite")]
    #[error(transparent)]
    SqliteError(#[from] rusqlite::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("SQL execution error: {0}")]
    ExecutionError(String),

    /// A single-row lookup matched nothing.
    #[error("record not found")]
    RecordNotFound,

    /// An update statement ran but changed no rows.
    ///
    /// Only `update`, `updates` and `updates_map` report this; deletes that
    /// match nothing succeed.
    #[error("no rows affected")]
    NoRowsAffected,

    #[error("WHERE conditions required")]
    MissingWhereClause,

    #[error("no table bound; use a model, a table option, or a typed destination")]
    MissingTable,

    #[error("context canceled")]
    Cancelled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    #[error("transaction has already been committed or rolled back")]
    TransactionClosed,
}

impl<E> From<bb8::RunError<E>> for SqlHandleError
where
    E: Into<SqlHandleError>,
{
    fn from(err: bb8::RunError<E>) -> Self {
        match err {
            bb8::RunError::User(inner) => inner.into(),
            bb8::RunError::TimedOut => {
                SqlHandleError::ConnectionError("pool checkout timed out".into())
            }
        }
    }
}
