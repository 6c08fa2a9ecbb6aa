use std::error::Error;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bb8::{ManageConnection, Pool, PooledConnection};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tokio_postgres::types::{IsNull, ToSql, Type, to_sql_checked};
use tokio_postgres::{CancelToken, Client, NoTls, Row};
use tokio_util::bytes;

use super::ScopeState;
use crate::context::Context;
use crate::error::SqlHandleError;
use crate::handle::TxOptions;
use crate::results::ResultSet;
use crate::types::RowValues;

pub(crate) type PgPool = Pool<PgManager>;

/// bb8 manager for Postgres clients.
pub struct PgManager {
    config: tokio_postgres::Config,
}

impl PgManager {
    #[must_use]
    pub fn new(config: tokio_postgres::Config) -> Self {
        Self { config }
    }
}

impl ManageConnection for PgManager {
    type Connection = Client;
    type Error = tokio_postgres::Error;

    #[allow(clippy::manual_async_fn)]
    fn connect(&self) -> impl Future<Output = Result<Self::Connection, Self::Error>> + Send {
        let cfg = self.config.clone();
        async move {
            let (client, connection) = cfg.connect(NoTls).await?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::warn!(error = %e, "postgres connection closed with error");
                }
            });
            Ok(client)
        }
    }

    #[allow(clippy::manual_async_fn)]
    fn is_valid(
        &self,
        conn: &mut Self::Connection,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async move { conn.simple_query("SELECT 1").await.map(|_| ()) }
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        conn.is_closed()
    }
}

impl ToSql for RowValues {
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut bytes::BytesMut,
    ) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self {
            RowValues::Int(i) => match *ty {
                Type::INT2 => i16::try_from(*i)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*i)?.to_sql(ty, out),
                Type::FLOAT4 => (*i as f32).to_sql(ty, out),
                Type::FLOAT8 => (*i as f64).to_sql(ty, out),
                Type::BOOL => (*i != 0).to_sql(ty, out),
                Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
                    i.to_string().to_sql(ty, out)
                }
                _ => i.to_sql(ty, out),
            },
            RowValues::Float(f) => match *ty {
                Type::FLOAT4 => (*f as f32).to_sql(ty, out),
                _ => f.to_sql(ty, out),
            },
            RowValues::Text(s) => match *ty {
                Type::INT2 => s.parse::<i16>()?.to_sql(ty, out),
                Type::INT4 => s.parse::<i32>()?.to_sql(ty, out),
                Type::INT8 => s.parse::<i64>()?.to_sql(ty, out),
                Type::FLOAT4 => s.parse::<f32>()?.to_sql(ty, out),
                Type::FLOAT8 => s.parse::<f64>()?.to_sql(ty, out),
                Type::BOOL => s.parse::<bool>()?.to_sql(ty, out),
                Type::TIMESTAMP | Type::TIMESTAMPTZ | Type::DATE => {
                    RowValues::Timestamp(parse_timestamp(s)?).to_sql(ty, out)
                }
                Type::JSON | Type::JSONB => serde_json::from_str::<JsonValue>(s)
                    .unwrap_or_else(|_| JsonValue::String(s.clone()))
                    .to_sql(ty, out),
                _ => s.to_sql(ty, out),
            },
            RowValues::Bool(b) => match *ty {
                Type::INT2 | Type::INT4 | Type::INT8 => RowValues::Int(i64::from(*b)).to_sql(ty, out),
                _ => b.to_sql(ty, out),
            },
            RowValues::Timestamp(dt) => match *ty {
                Type::TIMESTAMPTZ => dt.and_utc().to_sql(ty, out),
                Type::DATE => dt.date().to_sql(ty, out),
                _ => dt.to_sql(ty, out),
            },
            RowValues::Null => Ok(IsNull::Yes),
            RowValues::JSON(json) => json.to_sql(ty, out),
            RowValues::Blob(bytes) => bytes.to_sql(ty, out),
        }
    }

    fn accepts(ty: &Type) -> bool {
        matches!(
            *ty,
            Type::INT2
                | Type::INT4
                | Type::INT8
                | Type::FLOAT4
                | Type::FLOAT8
                | Type::TEXT
                | Type::VARCHAR
                | Type::BPCHAR
                | Type::CHAR
                | Type::NAME
                | Type::UNKNOWN
                | Type::BOOL
                | Type::TIMESTAMP
                | Type::TIMESTAMPTZ
                | Type::DATE
                | Type::JSON
                | Type::JSONB
                | Type::BYTEA
        )
    }

    to_sql_checked!();
}

fn parse_timestamp(s: &str) -> Result<NaiveDateTime, chrono::ParseError> {
    NaiveDateTime::parse_from_str(s, "%F %T%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%FT%T%.f"))
        .or_else(|err| {
            NaiveDate::parse_from_str(s, "%F")
                .map(|d| d.and_time(chrono::NaiveTime::MIN))
                .map_err(|_| err)
        })
}

/// Extract a `RowValues` from a postgres row by column type.
fn extract_value(row: &Row, idx: usize) -> Result<RowValues, SqlHandleError> {
    let type_name = row.columns()[idx].type_().name();
    let value = match type_name {
        "int2" => row
            .try_get::<_, Option<i16>>(idx)?
            .map_or(RowValues::Null, |v| RowValues::Int(i64::from(v))),
        "int4" => row
            .try_get::<_, Option<i32>>(idx)?
            .map_or(RowValues::Null, |v| RowValues::Int(i64::from(v))),
        "int8" => row
            .try_get::<_, Option<i64>>(idx)?
            .map_or(RowValues::Null, RowValues::Int),
        "float4" => row
            .try_get::<_, Option<f32>>(idx)?
            .map_or(RowValues::Null, |v| RowValues::Float(f64::from(v))),
        "float8" => row
            .try_get::<_, Option<f64>>(idx)?
            .map_or(RowValues::Null, RowValues::Float),
        "bool" => row
            .try_get::<_, Option<bool>>(idx)?
            .map_or(RowValues::Null, RowValues::Bool),
        "timestamp" => row
            .try_get::<_, Option<NaiveDateTime>>(idx)?
            .map_or(RowValues::Null, RowValues::Timestamp),
        "timestamptz" => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map_or(RowValues::Null, |v| RowValues::Timestamp(v.naive_utc())),
        "date" => row
            .try_get::<_, Option<NaiveDate>>(idx)?
            .map_or(RowValues::Null, |v| {
                RowValues::Timestamp(v.and_time(chrono::NaiveTime::MIN))
            }),
        "json" | "jsonb" => row
            .try_get::<_, Option<JsonValue>>(idx)?
            .map_or(RowValues::Null, RowValues::JSON),
        "bytea" => row
            .try_get::<_, Option<Vec<u8>>>(idx)?
            .map_or(RowValues::Null, RowValues::Blob),
        _ => row
            .try_get::<_, Option<String>>(idx)?
            .map_or(RowValues::Null, RowValues::Text),
    };
    Ok(value)
}

fn build_result_set(rows: &[Row]) -> Result<ResultSet, SqlHandleError> {
    let mut result_set = ResultSet::with_capacity(rows.len());
    if let Some(row) = rows.first() {
        let columns: Vec<String> = row.columns().iter().map(|c| c.name().to_owned()).collect();
        result_set.set_column_names(Arc::new(columns));
    }
    for row in rows {
        let count = row.columns().len();
        let mut values = Vec::with_capacity(count);
        for idx in 0..count {
            values.push(extract_value(row, idx)?);
        }
        result_set.add_row_values(values);
    }
    result_set.rows_affected = rows.len();
    Ok(result_set)
}

fn params(args: &[RowValues]) -> Vec<&(dyn ToSql + Sync)> {
    args.iter().map(|a| a as &(dyn ToSql + Sync)).collect()
}

pub(crate) async fn query(
    client: &Client,
    sql: &str,
    args: &[RowValues],
) -> Result<ResultSet, SqlHandleError> {
    let rows = client.query(sql, &params(args)).await?;
    build_result_set(&rows)
}

pub(crate) async fn execute(
    client: &Client,
    sql: &str,
    args: &[RowValues],
) -> Result<usize, SqlHandleError> {
    let affected = client.execute(sql, &params(args)).await?;
    usize::try_from(affected)
        .map_err(|e| SqlHandleError::ExecutionError(format!("row count overflow: {e}")))
}

pub(crate) async fn execute_batch(client: &Client, sql: &str) -> Result<(), SqlHandleError> {
    Ok(client.batch_execute(sql).await?)
}

/// Await `fut` under `ctx`, asking the server to cancel it when the context
/// ends first.
pub(crate) async fn guarded<T>(
    ctx: &Context,
    cancel: CancelToken,
    fut: impl Future<Output = Result<T, SqlHandleError>>,
) -> Result<T, SqlHandleError> {
    ctx.run_interruptible(fut, move || async move {
        if let Err(e) = cancel.cancel_query(NoTls).await {
            tracing::debug!(error = %e, "postgres cancel request failed");
        }
    })
    .await
}

fn begin_sql(opts: &TxOptions) -> String {
    let mut sql = String::from("BEGIN");
    if let Some(level) = opts.isolation {
        sql.push_str(" ISOLATION LEVEL ");
        sql.push_str(&level.to_string());
    }
    if opts.read_only {
        sql.push_str(" READ ONLY");
    }
    sql
}

/// Pooled client pinned to one transaction.
struct TxConn {
    pooled: Mutex<Option<PooledConnection<'static, PgManager>>>,
    cancel: CancelToken,
    finished: AtomicBool,
}

impl Drop for TxConn {
    fn drop(&mut self) {
        if self.finished.load(Ordering::Acquire) {
            return;
        }
        let Some(client) = self.pooled.get_mut().take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                tracing::debug!("rolling back abandoned postgres transaction");
                // The client returns to the pool once the rollback has run.
                runtime.spawn(async move {
                    if let Err(e) = client.batch_execute("ROLLBACK").await {
                        tracing::warn!(error = %e, "postgres rollback on drop failed");
                    }
                });
            }
            Err(_) => {
                tracing::warn!("postgres transaction dropped outside a runtime; not rolled back");
            }
        }
    }
}

/// Transaction scope: the outermost transaction or a savepoint inside it.
#[derive(Clone)]
pub(crate) struct PgTx {
    root: Arc<TxConn>,
    scope: Arc<ScopeState>,
}

impl PgTx {
    pub(crate) async fn begin(
        pool: &PgPool,
        ctx: &Context,
        opts: &TxOptions,
    ) -> Result<Self, SqlHandleError> {
        let pooled = ctx.run(async { Ok(pool.get_owned().await?) }).await?;
        // owned before BEGIN is sent so an abandoned begin is rolled back on drop
        let root = Arc::new(TxConn {
            cancel: pooled.cancel_token(),
            pooled: Mutex::new(Some(pooled)),
            finished: AtomicBool::new(false),
        });
        let tx = Self {
            root,
            scope: Arc::new(ScopeState::root()),
        };
        let begin = begin_sql(opts);
        let started = guarded(ctx, tx.cancel_token(), tx.batch(&begin)).await;
        if let Err(err) = started {
            tx.root.finished.store(true, Ordering::Release);
            tx.root.pooled.lock().await.take();
            return Err(err);
        }
        tracing::debug!("postgres transaction begin");
        Ok(tx)
    }

    pub(crate) async fn nested(&self, ctx: &Context) -> Result<Self, SqlHandleError> {
        let scope = self.scope.nested();
        if let Some(name) = scope.savepoint() {
            let sql = format!("SAVEPOINT {name}");
            guarded(ctx, self.cancel_token(), self.batch(&sql)).await?;
            tracing::debug!(savepoint = name, "postgres savepoint");
        }
        Ok(Self {
            root: Arc::clone(&self.root),
            scope: Arc::new(scope),
        })
    }

    pub(crate) fn cancel_token(&self) -> CancelToken {
        self.root.cancel.clone()
    }

    fn check_open(&self) -> Result<(), SqlHandleError> {
        if self.root.finished.load(Ordering::Acquire) || !self.scope.is_open() {
            return Err(SqlHandleError::TransactionClosed);
        }
        Ok(())
    }

    pub(crate) async fn query(
        &self,
        sql: &str,
        args: &[RowValues],
    ) -> Result<ResultSet, SqlHandleError> {
        self.check_open()?;
        let guard = self.root.pooled.lock().await;
        let client = guard.as_ref().ok_or(SqlHandleError::TransactionClosed)?;
        query(client, sql, args).await
    }

    pub(crate) async fn execute(
        &self,
        sql: &str,
        args: &[RowValues],
    ) -> Result<usize, SqlHandleError> {
        self.check_open()?;
        let guard = self.root.pooled.lock().await;
        let client = guard.as_ref().ok_or(SqlHandleError::TransactionClosed)?;
        execute(client, sql, args).await
    }

    pub(crate) async fn batch(&self, sql: &str) -> Result<(), SqlHandleError> {
        self.check_open()?;
        let guard = self.root.pooled.lock().await;
        let client = guard.as_ref().ok_or(SqlHandleError::TransactionClosed)?;
        execute_batch(client, sql).await
    }

    /// Finish the outermost transaction and hand the client back to the pool.
    async fn finish_root(&self, sql: &str) -> Result<(), SqlHandleError> {
        let mut guard = self.root.pooled.lock().await;
        let client = guard.as_ref().ok_or(SqlHandleError::TransactionClosed)?;
        let res = execute_batch(client, sql).await;
        let res = match res {
            Ok(()) => Ok(()),
            Err(err) => match execute_batch(client, "ROLLBACK").await {
                Ok(()) => Err(err),
                Err(e) => {
                    // leave the client in place for the drop rollback
                    tracing::warn!(error = %e, "postgres rollback after failed {sql} failed");
                    return Err(err);
                }
            },
        };
        self.root.finished.store(true, Ordering::Release);
        guard.take();
        res
    }

    pub(crate) async fn commit(&self) -> Result<(), SqlHandleError> {
        self.check_open()?;
        self.scope.close();
        match self.scope.savepoint() {
            Some(name) => self.batch_unchecked(&format!("RELEASE SAVEPOINT {name}")).await,
            None => {
                let res = self.finish_root("COMMIT").await;
                tracing::debug!(ok = res.is_ok(), "postgres transaction commit");
                res
            }
        }
    }

    pub(crate) async fn rollback(&self) -> Result<(), SqlHandleError> {
        self.check_open()?;
        self.scope.close();
        match self.scope.savepoint() {
            Some(name) => {
                self.batch_unchecked(&format!(
                    "ROLLBACK TO SAVEPOINT {name}; RELEASE SAVEPOINT {name}"
                ))
                .await
            }
            None => {
                let res = self.finish_root("ROLLBACK").await;
                tracing::debug!(ok = res.is_ok(), "postgres transaction rollback");
                res
            }
        }
    }

    async fn batch_unchecked(&self, sql: &str) -> Result<(), SqlHandleError> {
        let guard = self.root.pooled.lock().await;
        let client = guard.as_ref().ok_or(SqlHandleError::TransactionClosed)?;
        execute_batch(client, sql).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::IsolationLevel;

    #[test]
    fn begin_statement_carries_options() {
        assert_eq!(begin_sql(&TxOptions::default()), "BEGIN");
        let opts = TxOptions {
            isolation: Some(IsolationLevel::RepeatableRead),
            read_only: true,
        };
        assert_eq!(begin_sql(&opts), "BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY");
    }

    #[test]
    fn accepts_common_column_types() {
        assert!(<RowValues as ToSql>::accepts(&Type::INT4));
        assert!(<RowValues as ToSql>::accepts(&Type::JSONB));
        assert!(!<RowValues as ToSql>::accepts(&Type::UUID));
    }

    #[test]
    fn narrows_integers_for_int4_columns() {
        let mut out = bytes::BytesMut::new();
        RowValues::Int(7).to_sql(&Type::INT4, &mut out).unwrap();
        assert_eq!(&out[..], &7_i32.to_be_bytes());

        let mut out = bytes::BytesMut::new();
        assert!(
            RowValues::Int(i64::MAX)
                .to_sql(&Type::INT4, &mut out)
                .is_err()
        );

        let mut out = bytes::BytesMut::new();
        RowValues::Text("12".into())
            .to_sql(&Type::INT8, &mut out)
            .unwrap();
        assert_eq!(&out[..], &12_i64.to_be_bytes());
    }
}
