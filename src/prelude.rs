//! Convenient imports for common functionality.
//!
//! ```rust
//! use sql_handle::prelude::*;
//!
//! let window = Pagination::normalize(0, 500);
//! assert_eq!((window.offset, window.limit), (0, 100));
//! ```

pub use crate::config::{Config, Connector};
pub use crate::context::Context;
pub use crate::error::SqlHandleError;
pub use crate::handle::{Handle, IsolationLevel, TxOptions};
pub use crate::options::{
    Pagination, QueryOption, columns, no_conflict, order_by, pagination, table, where_eq,
    where_raw, wildcard, with_id,
};
pub use crate::record::Record;
pub use crate::results::{CustomDbRow, ResultSet};
pub use crate::statement::{Compiled, Statement};
pub use crate::types::{Dialect, RowValues};
