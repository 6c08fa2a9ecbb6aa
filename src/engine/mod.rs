//! Execution against the configured engine.
//!
//! [`Executor`] is the only place that knows which engine a handle talks to.
//! Every statement passes through [`Executor::query`], [`Executor::execute`]
//! or [`Executor::execute_batch`], which translate placeholders, honour the
//! bound [`Context`], and emit one trace event per statement. A statement the
//! engine has started is interrupted, never dropped, when its context ends.

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Instant;

use tracing::Instrument;

use crate::config::{Config, Connector};
use crate::context::Context;
use crate::error::SqlHandleError;
use crate::handle::TxOptions;
use crate::results::ResultSet;
use crate::statement::Compiled;
use crate::translation::{PlaceholderStyle, bind_placeholders};
use crate::types::{Dialect, RowValues};

/// Open/closed state of a transaction scope.
///
/// Nested scopes are savepoints; a scope is usable only while it and every
/// enclosing scope are open.
pub(crate) struct ScopeState {
    savepoint: Option<String>,
    open: AtomicBool,
    parent: Option<Arc<ScopeState>>,
    counter: Arc<AtomicU32>,
}

impl ScopeState {
    pub(crate) fn root() -> Self {
        Self {
            savepoint: None,
            open: AtomicBool::new(true),
            parent: None,
            counter: Arc::new(AtomicU32::new(0)),
        }
    }

    pub(crate) fn nested(self: &Arc<Self>) -> Self {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        Self {
            savepoint: Some(format!("sql_handle_sp_{n}")),
            open: AtomicBool::new(true),
            parent: Some(Arc::clone(self)),
            counter: Arc::clone(&self.counter),
        }
    }

    pub(crate) fn savepoint(&self) -> Option<&str> {
        self.savepoint.as_deref()
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && self.parent.as_ref().is_none_or(|p| p.is_open())
    }

    pub(crate) fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

/// Where statements go: a pool, or one connection pinned to a transaction.
#[derive(Clone)]
pub(crate) enum Executor {
    #[cfg(feature = "sqlite")]
    SqlitePool(sqlite::SqlitePool),
    #[cfg(feature = "sqlite")]
    SqliteTx(sqlite::SqliteTx),
    #[cfg(feature = "postgres")]
    PostgresPool(postgres::PgPool),
    #[cfg(feature = "postgres")]
    PostgresTx(postgres::PgTx),
}

impl Executor {
    /// Build the pool for `config` and check out one connection to prove it
    /// works.
    pub(crate) async fn connect(config: &Config) -> Result<Self, SqlHandleError> {
        match &config.connector {
            #[cfg(feature = "sqlite")]
            Connector::Sqlite { path } => {
                let pool = config
                    .pool_builder()
                    .build(sqlite::SqliteManager::new(path.clone()))
                    .await
                    .map_err(|e| open_failed(&e))?;
                pool.get().await.map_err(|e| origin_failed(&e))?;
                Ok(Executor::SqlitePool(pool))
            }
            #[cfg(feature = "postgres")]
            Connector::Postgres { url } => {
                let pg_config: tokio_postgres::Config = url.parse().map_err(|e| open_failed(&e))?;
                let pool = config
                    .pool_builder()
                    .build(postgres::PgManager::new(pg_config))
                    .await
                    .map_err(|e| open_failed(&e))?;
                pool.get().await.map_err(|e| origin_failed(&e))?;
                Ok(Executor::PostgresPool(pool))
            }
        }
    }

    pub(crate) fn dialect(&self) -> Dialect {
        match self {
            #[cfg(feature = "sqlite")]
            Executor::SqlitePool(_) | Executor::SqliteTx(_) => Dialect::Sqlite,
            #[cfg(feature = "postgres")]
            Executor::PostgresPool(_) | Executor::PostgresTx(_) => Dialect::Postgres,
        }
    }

    pub(crate) fn in_transaction(&self) -> bool {
        match self {
            #[cfg(feature = "sqlite")]
            Executor::SqliteTx(_) => true,
            #[cfg(feature = "postgres")]
            Executor::PostgresTx(_) => true,
            _ => false,
        }
    }

    /// Run a row-returning statement.
    pub(crate) async fn query(
        &self,
        ctx: &Context,
        debug: bool,
        stmt: &Compiled,
    ) -> Result<ResultSet, SqlHandleError> {
        let sql = bind_placeholders(&stmt.sql, PlaceholderStyle::from(self.dialect()));
        let args = stmt.args.as_slice();
        let run = async {
            match self {
                #[cfg(feature = "sqlite")]
                Executor::SqlitePool(pool) => {
                    let conn = ctx.run(checkout(pool)).await?;
                    sqlite::guarded(ctx, &conn, sqlite::query(Arc::clone(&*conn), &sql, args)).await
                }
                #[cfg(feature = "sqlite")]
                Executor::SqliteTx(tx) => {
                    let conn = tx.conn()?;
                    sqlite::guarded(ctx, &conn, sqlite::query(Arc::clone(&conn), &sql, args)).await
                }
                #[cfg(feature = "postgres")]
                Executor::PostgresPool(pool) => {
                    let client = ctx.run(checkout(pool)).await?;
                    let fut = postgres::query(&client, &sql, args);
                    postgres::guarded(ctx, client.cancel_token(), fut).await
                }
                #[cfg(feature = "postgres")]
                Executor::PostgresTx(tx) => {
                    postgres::guarded(ctx, tx.cancel_token(), tx.query(&sql, args)).await
                }
            }
        };
        observe(ctx, debug, &sql, args, run, |rs| rs.results.len()).await
    }

    /// Run a statement and report the affected row count.
    pub(crate) async fn execute(
        &self,
        ctx: &Context,
        debug: bool,
        stmt: &Compiled,
    ) -> Result<usize, SqlHandleError> {
        let sql = bind_placeholders(&stmt.sql, PlaceholderStyle::from(self.dialect()));
        let args = stmt.args.as_slice();
        let run = async {
            match self {
                #[cfg(feature = "sqlite")]
                Executor::SqlitePool(pool) => {
                    let conn = ctx.run(checkout(pool)).await?;
                    sqlite::guarded(ctx, &conn, sqlite::execute(Arc::clone(&*conn), &sql, args))
                        .await
                }
                #[cfg(feature = "sqlite")]
                Executor::SqliteTx(tx) => {
                    let conn = tx.conn()?;
                    sqlite::guarded(ctx, &conn, sqlite::execute(Arc::clone(&conn), &sql, args)).await
                }
                #[cfg(feature = "postgres")]
                Executor::PostgresPool(pool) => {
                    let client = ctx.run(checkout(pool)).await?;
                    let fut = postgres::execute(&client, &sql, args);
                    postgres::guarded(ctx, client.cancel_token(), fut).await
                }
                #[cfg(feature = "postgres")]
                Executor::PostgresTx(tx) => {
                    postgres::guarded(ctx, tx.cancel_token(), tx.execute(&sql, args)).await
                }
            }
        };
        observe(ctx, debug, &sql, args, run, |n| *n).await
    }

    /// Run one or more parameterless statements as given.
    pub(crate) async fn execute_batch(
        &self,
        ctx: &Context,
        debug: bool,
        sql: &str,
    ) -> Result<(), SqlHandleError> {
        let run = async {
            match self {
                #[cfg(feature = "sqlite")]
                Executor::SqlitePool(pool) => {
                    let conn = ctx.run(checkout(pool)).await?;
                    sqlite::guarded(ctx, &conn, sqlite::execute_batch(Arc::clone(&*conn), sql)).await
                }
                #[cfg(feature = "sqlite")]
                Executor::SqliteTx(tx) => {
                    let conn = tx.conn()?;
                    sqlite::guarded(ctx, &conn, sqlite::execute_batch(Arc::clone(&conn), sql)).await
                }
                #[cfg(feature = "postgres")]
                Executor::PostgresPool(pool) => {
                    let client = ctx.run(checkout(pool)).await?;
                    let fut = postgres::execute_batch(&client, sql);
                    postgres::guarded(ctx, client.cancel_token(), fut).await
                }
                #[cfg(feature = "postgres")]
                Executor::PostgresTx(tx) => {
                    postgres::guarded(ctx, tx.cancel_token(), tx.batch(sql)).await
                }
            }
        };
        observe(ctx, debug, sql, &[], run, |()| 0).await
    }

    /// Open a transaction, or a savepoint when already inside one.
    pub(crate) async fn begin(
        &self,
        ctx: &Context,
        opts: &TxOptions,
    ) -> Result<Executor, SqlHandleError> {
        let run = async {
            match self {
                #[cfg(feature = "sqlite")]
                Executor::SqlitePool(pool) => {
                    Ok(Executor::SqliteTx(sqlite::SqliteTx::begin(pool, ctx, opts).await?))
                }
                #[cfg(feature = "sqlite")]
                Executor::SqliteTx(tx) => Ok(Executor::SqliteTx(tx.nested(ctx).await?)),
                #[cfg(feature = "postgres")]
                Executor::PostgresPool(pool) => {
                    Ok(Executor::PostgresTx(postgres::PgTx::begin(pool, ctx, opts).await?))
                }
                #[cfg(feature = "postgres")]
                Executor::PostgresTx(tx) => Ok(Executor::PostgresTx(tx.nested(ctx).await?)),
            }
        };
        run.instrument(ctx.span().clone()).await
    }

    /// The connection pool, unless this executor is pinned to a transaction.
    #[cfg(feature = "sqlite")]
    pub(crate) fn sqlite_pool(&self) -> Option<&sqlite::SqlitePool> {
        match self {
            Executor::SqlitePool(pool) => Some(pool),
            _ => None,
        }
    }

    #[cfg(feature = "postgres")]
    pub(crate) fn postgres_pool(&self) -> Option<&postgres::PgPool> {
        match self {
            Executor::PostgresPool(pool) => Some(pool),
            _ => None,
        }
    }

    /// Commit the transaction scope. Commit is not cancellable: a
    /// callback that finished must not be undone by a late cancellation.
    pub(crate) async fn commit(&self) -> Result<(), SqlHandleError> {
        match self {
            #[cfg(feature = "sqlite")]
            Executor::SqliteTx(tx) => tx.commit().await,
            #[cfg(feature = "postgres")]
            Executor::PostgresTx(tx) => tx.commit().await,
            _ => Err(SqlHandleError::ExecutionError(
                "commit outside a transaction".into(),
            )),
        }
    }

    pub(crate) async fn rollback(&self) -> Result<(), SqlHandleError> {
        match self {
            #[cfg(feature = "sqlite")]
            Executor::SqliteTx(tx) => tx.rollback().await,
            #[cfg(feature = "postgres")]
            Executor::PostgresTx(tx) => tx.rollback().await,
            _ => Err(SqlHandleError::ExecutionError(
                "rollback outside a transaction".into(),
            )),
        }
    }
}

fn open_failed(err: &dyn std::fmt::Display) -> SqlHandleError {
    SqlHandleError::ConnectionError(format!("open database connection failed, {err}"))
}

fn origin_failed(err: &dyn std::fmt::Display) -> SqlHandleError {
    SqlHandleError::ConnectionError(format!("get origin db instance failed, {err}"))
}

/// Check out a pooled connection. Nothing has reached the engine yet, so
/// callers may abandon this when their context ends.
async fn checkout<M>(pool: &bb8::Pool<M>) -> Result<bb8::PooledConnection<'_, M>, SqlHandleError>
where
    M: bb8::ManageConnection,
    M::Error: Into<SqlHandleError>,
{
    Ok(pool.get().await?)
}

/// Trace one statement. `fut` applies the context itself.
async fn observe<T, F>(
    ctx: &Context,
    debug: bool,
    sql: &str,
    args: &[RowValues],
    fut: F,
    rows: impl FnOnce(&T) -> usize,
) -> Result<T, SqlHandleError>
where
    F: Future<Output = Result<T, SqlHandleError>>,
{
    let started = Instant::now();
    let res = fut.instrument(ctx.span().clone()).await;
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

    let _entered = ctx.span().enter();
    match (&res, debug) {
        (Ok(out), true) => {
            tracing::info!(sql, args = ?args, elapsed_ms, rows = rows(out), "statement");
        }
        (Ok(out), false) => {
            tracing::debug!(sql, args = ?args, elapsed_ms, rows = rows(out), "statement");
        }
        (Err(err), true) => {
            tracing::info!(sql, args = ?args, elapsed_ms, error = %err, "statement failed");
        }
        (Err(err), false) => {
            tracing::debug!(sql, args = ?args, elapsed_ms, error = %err, "statement failed");
        }
    }
    res
}
