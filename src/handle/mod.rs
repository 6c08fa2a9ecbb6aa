//! The caller-facing handle.
//!
//! A [`Handle`] wraps one immutable session: an executor, a [`Context`], the
//! debug flag, and the bound [`Statement`]. Derivations such as
//! [`Handle::with_context`] or [`Handle::model`] build a new session and leave
//! the original untouched, so handles can be shared freely between tasks.
//!
//! ```rust,no_run
//! use serde::{Deserialize, Serialize};
//! use sql_handle::prelude::*;
//!
//! #[derive(Debug, Default, Serialize, Deserialize)]
//! struct User {
//!     id: i64,
//!     nickname: String,
//!     age: i64,
//! }
//!
//! impl Record for User {
//!     const TABLE: &'static str = "test_users";
//! }
//!
//! # async fn demo() -> Result<(), SqlHandleError> {
//! let db = Handle::open(Config::new(Connector::Sqlite { path: "app.db".into() })).await?;
//! let mut users = Vec::new();
//! db.find_many::<User>(&mut users, &[pagination(1, 20)]).await?;
//! let adults = db.table("test_users").count(&[where_raw("age >= ?", &[18.into()])]).await?;
//! # let _ = adults;
//! # Ok(())
//! # }
//! ```

mod read;
mod tx;
mod write;

use std::fmt;
use std::sync::Arc;

pub use tx::{IsolationLevel, TxOptions};

use crate::config::Config;
use crate::context::Context;
use crate::engine::Executor;
#[cfg(feature = "postgres")]
use crate::engine::postgres::PgManager;
#[cfg(feature = "sqlite")]
use crate::engine::sqlite::SqliteManager;
use crate::error::SqlHandleError;
use crate::options::{QueryOption, apply_options};
use crate::record::{self, Record};
use crate::results::ResultSet;
use crate::statement::{Compiled, Statement};
use crate::types::{Dialect, RowValues};

struct Session {
    executor: Executor,
    ctx: Context,
    debug: bool,
    statement: Statement,
}

/// Entry point for every database operation.
#[derive(Clone)]
pub struct Handle {
    session: Arc<Session>,
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("dialect", &self.dialect())
            .field("debug", &self.session.debug)
            .field("in_transaction", &self.in_transaction())
            .field("statement", &self.session.statement)
            .finish()
    }
}

impl Handle {
    /// Open a pooled handle.
    ///
    /// # Errors
    /// `ConnectionError` with "open database connection failed, .." when the
    /// pool cannot be built and "get origin db instance failed, .." when the
    /// first connection cannot be checked out.
    pub async fn open(config: Config) -> Result<Self, SqlHandleError> {
        let executor = Executor::connect(&config).await?;
        tracing::debug!(dialect = ?config.connector.dialect(), "database handle opened");
        Ok(Self::from_executor(executor, config.debug))
    }

    pub(crate) fn from_executor(executor: Executor, debug: bool) -> Self {
        Self {
            session: Arc::new(Session {
                executor,
                ctx: Context::background(),
                debug,
                statement: Statement::new(),
            }),
        }
    }

    fn derive(&self, change: impl FnOnce(&mut Session)) -> Self {
        let mut session = Session {
            executor: self.session.executor.clone(),
            ctx: self.session.ctx.clone(),
            debug: self.session.debug,
            statement: self.session.statement.clone(),
        };
        change(&mut session);
        Self {
            session: Arc::new(session),
        }
    }

    #[must_use]
    pub fn dialect(&self) -> Dialect {
        self.session.executor.dialect()
    }

    #[must_use]
    pub fn context(&self) -> &Context {
        &self.session.ctx
    }

    #[must_use]
    pub fn is_debug(&self) -> bool {
        self.session.debug
    }

    /// Whether this handle is scoped to a transaction.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.session.executor.in_transaction()
    }

    /// The statement every operation on this handle starts from.
    #[must_use]
    pub fn statement(&self) -> &Statement {
        &self.session.statement
    }

    /// The underlying `SQLite` pool, for work this layer does not cover.
    ///
    /// `None` for `PostgreSQL` handles and for handles scoped to a
    /// transaction, whose connection is not shared.
    #[cfg(feature = "sqlite")]
    #[must_use]
    pub fn sqlite_pool(&self) -> Option<&bb8::Pool<SqliteManager>> {
        self.session.executor.sqlite_pool()
    }

    /// The underlying `PostgreSQL` pool. `None` for `SQLite` handles and
    /// inside transactions.
    #[cfg(feature = "postgres")]
    #[must_use]
    pub fn postgres_pool(&self) -> Option<&bb8::Pool<PgManager>> {
        self.session.executor.postgres_pool()
    }

    /// Bind a cancellation and tracing context. Handles without one run in a
    /// background context.
    #[must_use]
    pub fn with_context(&self, ctx: Context) -> Self {
        self.derive(|s| s.ctx = ctx)
    }

    /// Bind the table of `T`. A non-zero primary key on `value` also becomes
    /// a row filter.
    ///
    /// # Errors
    /// Returns `Serialization` if `value` does not serialise to an object.
    pub fn model<T: Record>(&self, value: &T) -> Result<Self, SqlHandleError> {
        let key = record::primary_key(value)?;
        Ok(self.derive(|s| {
            let mut statement = std::mem::take(&mut s.statement)
                .table(T::TABLE)
                .primary_key(T::PRIMARY_KEY);
            if let Some(key) = key {
                statement = statement.where_eq(T::PRIMARY_KEY, key);
            }
            s.statement = statement;
        }))
    }

    /// Log every statement at INFO instead of DEBUG.
    #[must_use]
    pub fn debug(&self) -> Self {
        self.derive(|s| s.debug = true)
    }

    /// Replace the bound statement.
    #[must_use]
    pub fn with_statement(&self, statement: Statement) -> Self {
        self.derive(|s| s.statement = statement)
    }

    /// Same session on a different executor.
    pub(crate) fn with_conn(&self, executor: Executor) -> Self {
        self.derive(|s| s.executor = executor)
    }

    /// Read operations on the derived handle run `sql` instead of building
    /// a SELECT. Placeholders are `?` (or `$N`).
    #[must_use]
    pub fn raw(&self, sql: &str, args: &[RowValues]) -> Self {
        let compiled = Compiled::new(sql, args.to_vec());
        self.derive(|s| {
            s.statement = std::mem::take(&mut s.statement).raw(compiled.sql, compiled.args);
        })
    }

    /// Bind a table by name for column-oriented operations.
    #[must_use]
    pub fn table(&self, name: &str) -> Self {
        self.derive(|s| s.statement = std::mem::take(&mut s.statement).table(name))
    }

    /// The bound statement with `opts` folded over it.
    #[must_use]
    pub fn build_options(&self, opts: &[QueryOption]) -> Statement {
        apply_options(self.session.statement.clone(), opts)
    }

    async fn fetch(&self, compiled: &Compiled) -> Result<ResultSet, SqlHandleError> {
        self.session
            .executor
            .query(&self.session.ctx, self.session.debug, compiled)
            .await
    }

    async fn run(&self, compiled: &Compiled) -> Result<usize, SqlHandleError> {
        self.session
            .executor
            .execute(&self.session.ctx, self.session.debug, compiled)
            .await
    }

    /// Execute literal SQL and return the affected row count.
    ///
    /// # Errors
    /// Engine errors propagate unchanged.
    pub async fn exec(&self, sql: &str, args: &[RowValues]) -> Result<usize, SqlHandleError> {
        self.run(&Compiled::new(sql, args.to_vec())).await
    }

    /// Execute one or more parameterless statements, e.g. DDL.
    ///
    /// # Errors
    /// Engine errors propagate unchanged.
    pub async fn exec_batch(&self, sql: &str) -> Result<(), SqlHandleError> {
        self.session
            .executor
            .execute_batch(&self.session.ctx, self.session.debug, sql)
            .await
    }
}
