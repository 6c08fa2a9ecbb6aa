//! Option-composable CRUD, raw SQL, and transactions over pooled `SQLite` and
//! `PostgreSQL` connections.
//!
//! Every operation on a [`Handle`] takes a slice of [`QueryOption`]s that are
//! folded, in order, over the handle's bound [`Statement`]. Handles are
//! immutable: [`Handle::with_context`], [`Handle::model`], [`Handle::debug`],
//! [`Handle::raw`] and [`Handle::table`] all return new handles.
//!
//! Update operations report [`SqlHandleError::NoRowsAffected`] when nothing
//! changed; deletes that match nothing succeed.

pub mod config;
pub mod context;
mod engine;
pub mod error;
pub mod handle;
pub mod options;
pub mod prelude;
pub mod record;
pub mod results;
pub mod statement;
pub mod translation;
pub mod types;

pub use config::{Config, Connector};
pub use context::Context;
pub use error::SqlHandleError;
pub use handle::{Handle, IsolationLevel, TxOptions};
pub use options::{Pagination, QueryOption};
pub use record::Record;
pub use results::{CustomDbRow, ResultSet};
pub use statement::{Compiled, Statement};
pub use types::{Dialect, RowValues};

#[cfg(feature = "postgres")]
pub use engine::postgres::PgManager;
#[cfg(feature = "sqlite")]
pub use engine::sqlite::{SharedSqliteConnection, SqliteConnection, SqliteManager};
