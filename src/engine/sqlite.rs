use std::fmt::Write as _;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bb8::{ManageConnection, Pool, PooledConnection};
use rusqlite::types::Value;
use rusqlite::{Connection, InterruptHandle, params_from_iter};
use tokio::sync::{Mutex, MutexGuard};

use super::ScopeState;
use crate::context::Context;
use crate::error::SqlHandleError;
use crate::handle::{IsolationLevel, TxOptions};
use crate::results::ResultSet;
use crate::types::RowValues;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub type SharedSqliteConnection = Arc<SqliteConnection>;
pub(crate) type SqlitePool = Pool<SqliteManager>;

/// One pooled `SQLite` connection and the handle that interrupts whatever it
/// is running.
pub struct SqliteConnection {
    inner: Mutex<Connection>,
    interrupt: InterruptHandle,
}

impl SqliteConnection {
    fn new(conn: Connection) -> Self {
        Self {
            interrupt: conn.get_interrupt_handle(),
            inner: Mutex::new(conn),
        }
    }

    /// Exclusive access to the raw connection.
    ///
    /// Calls on the returned guard block the current thread.
    pub async fn lock(&self) -> MutexGuard<'_, Connection> {
        self.inner.lock().await
    }

    /// Make the running statement, if any, fail with `SQLITE_INTERRUPT`.
    pub(crate) fn interrupt(&self) {
        self.interrupt.interrupt();
    }
}

/// bb8 manager for file-backed `SQLite` connections.
///
/// Each pooled connection sits behind an async mutex so blocking work can be
/// moved onto the blocking thread pool while the pool keeps ownership.
pub struct SqliteManager {
    path: String,
}

impl SqliteManager {
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

impl ManageConnection for SqliteManager {
    type Connection = SharedSqliteConnection;
    type Error = SqlHandleError;

    #[allow(clippy::manual_async_fn)]
    fn connect(&self) -> impl Future<Output = Result<Self::Connection, Self::Error>> + Send {
        let path = self.path.clone();
        async move {
            let conn = tokio::task::spawn_blocking(move || {
                let conn = Connection::open(&path)?;
                conn.busy_timeout(BUSY_TIMEOUT)?;
                conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
                Ok::<_, SqlHandleError>(conn)
            })
            .await
            .map_err(|e| SqlHandleError::ConnectionError(format!("sqlite open join error: {e}")))??;
            Ok(Arc::new(SqliteConnection::new(conn)))
        }
    }

    #[allow(clippy::manual_async_fn)]
    fn is_valid(
        &self,
        conn: &mut Self::Connection,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        let conn = Arc::clone(conn);
        async move {
            run_blocking(conn, |guard| {
                if !guard.is_autocommit() {
                    return Err(SqlHandleError::ConnectionError(
                        "sqlite connection left inside a transaction".into(),
                    ));
                }
                guard.execute_batch("SELECT 1")?;
                Ok(())
            })
            .await
        }
    }

    /// A connection still busy with abandoned work, or left inside a
    /// transaction, is not handed out again.
    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        !matches!(conn.inner.try_lock(), Ok(guard) if guard.is_autocommit())
    }
}

/// Run `func` against the connection on the blocking pool.
pub(crate) async fn run_blocking<F, R>(
    conn: SharedSqliteConnection,
    func: F,
) -> Result<R, SqlHandleError>
where
    F: FnOnce(&mut Connection) -> Result<R, SqlHandleError> + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut guard = conn.inner.blocking_lock();
        func(&mut guard)
    })
    .await
    .map_err(|e| SqlHandleError::ExecutionError(format!("sqlite worker join error: {e}")))?
}

/// Await `fut` under `ctx`, interrupting `conn` when the context ends first.
pub(crate) async fn guarded<T>(
    ctx: &Context,
    conn: &SqliteConnection,
    fut: impl Future<Output = Result<T, SqlHandleError>>,
) -> Result<T, SqlHandleError> {
    ctx.run_interruptible(fut, move || async move { conn.interrupt() })
        .await
}

/// Convert a bind value to its `SQLite` storage class.
pub(crate) fn row_value_to_sqlite_value(value: &RowValues) -> Value {
    match value {
        RowValues::Int(i) => Value::Integer(*i),
        RowValues::Float(f) => Value::Real(*f),
        RowValues::Text(s) => Value::Text(s.clone()),
        RowValues::Bool(b) => Value::Integer(i64::from(*b)),
        RowValues::Timestamp(dt) => {
            let mut text = String::with_capacity(32);
            let _ = write!(text, "{}", dt.format("%F %T%.f"));
            Value::Text(text)
        }
        RowValues::Null => Value::Null,
        RowValues::JSON(json) => Value::Text(json.to_string()),
        RowValues::Blob(bytes) => Value::Blob(bytes.clone()),
    }
}

fn convert_params(args: &[RowValues]) -> Vec<Value> {
    args.iter().map(row_value_to_sqlite_value).collect()
}

fn extract_value(row: &rusqlite::Row<'_>, idx: usize) -> Result<RowValues, SqlHandleError> {
    let value: Value = row.get(idx)?;
    Ok(match value {
        Value::Null => RowValues::Null,
        Value::Integer(i) => RowValues::Int(i),
        Value::Real(f) => RowValues::Float(f),
        Value::Text(s) => RowValues::Text(s),
        Value::Blob(b) => RowValues::Blob(b),
    })
}

fn query_sync(conn: &Connection, sql: &str, params: &[Value]) -> Result<ResultSet, SqlHandleError> {
    let mut stmt = conn.prepare_cached(sql)?;
    let column_names: Vec<String> = stmt
        .column_names()
        .iter()
        .map(ToString::to_string)
        .collect();
    let column_count = column_names.len();

    let mut result_set = ResultSet::with_capacity(10);
    result_set.set_column_names(Arc::new(column_names));

    let mut rows = stmt.query(params_from_iter(params.iter()))?;
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(column_count);
        for idx in 0..column_count {
            values.push(extract_value(row, idx)?);
        }
        result_set.add_row_values(values);
    }
    result_set.rows_affected = result_set.results.len();
    Ok(result_set)
}

fn execute_sync(conn: &Connection, sql: &str, params: &[Value]) -> Result<usize, SqlHandleError> {
    let mut stmt = conn.prepare_cached(sql)?;
    Ok(stmt.execute(params_from_iter(params.iter()))?)
}

pub(crate) async fn query(
    conn: SharedSqliteConnection,
    sql: &str,
    args: &[RowValues],
) -> Result<ResultSet, SqlHandleError> {
    let sql = sql.to_owned();
    let params = convert_params(args);
    run_blocking(conn, move |guard| query_sync(guard, &sql, &params)).await
}

pub(crate) async fn execute(
    conn: SharedSqliteConnection,
    sql: &str,
    args: &[RowValues],
) -> Result<usize, SqlHandleError> {
    let sql = sql.to_owned();
    let params = convert_params(args);
    run_blocking(conn, move |guard| execute_sync(guard, &sql, &params)).await
}

pub(crate) async fn execute_batch(
    conn: SharedSqliteConnection,
    sql: &str,
) -> Result<(), SqlHandleError> {
    let sql = sql.to_owned();
    run_blocking(conn, move |guard| Ok(guard.execute_batch(&sql)?)).await
}

/// Begin statement for `opts`. `SQLite` transactions are always serializable
/// and read-write.
fn begin_sql(opts: &TxOptions) -> Result<&'static str, SqlHandleError> {
    match opts.isolation {
        None | Some(IsolationLevel::Serializable) => {}
        Some(other) => {
            return Err(SqlHandleError::ConfigError(format!(
                "sqlite does not support isolation level {other}"
            )));
        }
    }
    if opts.read_only {
        return Err(SqlHandleError::ConfigError(
            "sqlite does not support read-only transactions".into(),
        ));
    }
    Ok("BEGIN IMMEDIATE")
}

/// Pooled connection pinned to one transaction.
struct TxConn {
    pooled: std::sync::Mutex<Option<PooledConnection<'static, SqliteManager>>>,
    conn: SharedSqliteConnection,
    finished: AtomicBool,
}

impl TxConn {
    fn release(&self) {
        self.finished.store(true, Ordering::Release);
        if let Ok(mut pooled) = self.pooled.lock() {
            pooled.take();
        }
    }
}

impl Drop for TxConn {
    fn drop(&mut self) {
        if self.finished.load(Ordering::Acquire) {
            return;
        }
        let pooled = match self.pooled.get_mut() {
            Ok(pooled) => pooled.take(),
            Err(_) => None,
        };
        let Some(pooled) = pooled else {
            return;
        };
        tracing::debug!("rolling back abandoned sqlite transaction");
        let conn = Arc::clone(&self.conn);
        // The pooled connection moves along so it only goes back to the
        // pool once the rollback has run.
        let rollback = move || {
            let guard = conn.inner.blocking_lock();
            if !guard.is_autocommit() {
                if let Err(e) = guard.execute_batch("ROLLBACK") {
                    tracing::warn!(error = %e, "sqlite rollback on drop failed");
                }
            }
            drop(guard);
            drop(pooled);
        };
        if tokio::runtime::Handle::try_current().is_ok() {
            drop(tokio::task::spawn_blocking(rollback));
        } else {
            rollback();
        }
    }
}

/// Transaction scope: the outermost transaction or a savepoint inside it.
#[derive(Clone)]
pub(crate) struct SqliteTx {
    root: Arc<TxConn>,
    scope: Arc<ScopeState>,
}

impl SqliteTx {
    pub(crate) async fn begin(
        pool: &SqlitePool,
        ctx: &Context,
        opts: &TxOptions,
    ) -> Result<Self, SqlHandleError> {
        let begin = begin_sql(opts)?;
        let pooled = ctx.run(async { Ok(pool.get_owned().await?) }).await?;
        let conn = Arc::clone(&*pooled);
        // owned before BEGIN is sent so an abandoned begin is rolled back on drop
        let root = Arc::new(TxConn {
            pooled: std::sync::Mutex::new(Some(pooled)),
            conn: Arc::clone(&conn),
            finished: AtomicBool::new(false),
        });
        let started = guarded(ctx, &conn, execute_batch(Arc::clone(&conn), begin)).await;
        if let Err(err) = started {
            root.release();
            return Err(err);
        }
        tracing::debug!("sqlite transaction begin");
        Ok(Self {
            root,
            scope: Arc::new(ScopeState::root()),
        })
    }

    /// Open a savepoint nested in this scope.
    pub(crate) async fn nested(&self, ctx: &Context) -> Result<Self, SqlHandleError> {
        let conn = self.conn()?;
        let scope = self.scope.nested();
        if let Some(name) = scope.savepoint() {
            let sql = format!("SAVEPOINT {name}");
            guarded(ctx, &conn, execute_batch(Arc::clone(&conn), &sql)).await?;
            tracing::debug!(savepoint = name, "sqlite savepoint");
        }
        Ok(Self {
            root: Arc::clone(&self.root),
            scope: Arc::new(scope),
        })
    }

    pub(crate) fn conn(&self) -> Result<SharedSqliteConnection, SqlHandleError> {
        if self.root.finished.load(Ordering::Acquire) || !self.scope.is_open() {
            return Err(SqlHandleError::TransactionClosed);
        }
        Ok(Arc::clone(&self.root.conn))
    }

    pub(crate) async fn commit(&self) -> Result<(), SqlHandleError> {
        let conn = self.conn()?;
        self.scope.close();
        match self.scope.savepoint() {
            Some(name) => execute_batch(conn, &format!("RELEASE SAVEPOINT {name}")).await,
            None => match execute_batch(Arc::clone(&conn), "COMMIT").await {
                Ok(()) => {
                    self.root.release();
                    tracing::debug!("sqlite transaction commit");
                    Ok(())
                }
                Err(err) => {
                    // an unreleased root is rolled back again on drop
                    match execute_batch(conn, "ROLLBACK").await {
                        Ok(()) => self.root.release(),
                        Err(e) => tracing::warn!(error = %e, "sqlite rollback after failed commit failed"),
                    }
                    Err(err)
                }
            },
        }
    }

    pub(crate) async fn rollback(&self) -> Result<(), SqlHandleError> {
        let conn = self.conn()?;
        self.scope.close();
        match self.scope.savepoint() {
            Some(name) => {
                execute_batch(
                    conn,
                    &format!("ROLLBACK TO SAVEPOINT {name}; RELEASE SAVEPOINT {name}"),
                )
                .await
            }
            None => {
                execute_batch(conn, "ROLLBACK").await?;
                self.root.release();
                tracing::debug!("sqlite transaction rollback");
                Ok(())
            }
        }
    }
}
