//! Composable query modifiers.
//!
//! Every operation on a [`Handle`](crate::Handle) takes a slice of
//! [`QueryOption`]s and folds them, left to right, over the handle's bound
//! [`Statement`]:
//! ```rust
//! use sql_handle::options::{apply_options, pagination, with_id};
//! use sql_handle::statement::Statement;
//!
//! let stmt = apply_options(Statement::new(), &[with_id(1), pagination(0, 500)]);
//! assert_eq!(stmt.limit_value(), Some(100));
//! assert_eq!(stmt.offset_value(), Some(0));
//! ```

use std::fmt;
use std::sync::Arc;

use crate::statement::{OnConflict, Statement};
use crate::types::RowValues;

const DEFAULT_PAGE_SIZE: i64 = 20;
const MAX_PAGE_SIZE: i64 = 100;

/// A named transformation of builder state.
#[derive(Clone)]
pub struct QueryOption {
    apply: Arc<dyn Fn(Statement) -> Statement + Send + Sync>,
}

impl QueryOption {
    /// Wrap a custom transformation.
    pub fn new<F>(apply: F) -> Self
    where
        F: Fn(Statement) -> Statement + Send + Sync + 'static,
    {
        Self {
            apply: Arc::new(apply),
        }
    }

    #[must_use]
    pub fn apply(&self, stmt: Statement) -> Statement {
        (self.apply)(stmt)
    }
}

impl fmt::Debug for QueryOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOption").finish_non_exhaustive()
    }
}

/// Apply `opts` in caller order. No options means the statement comes back
/// as it went in.
#[must_use]
pub fn apply_options(stmt: Statement, opts: &[QueryOption]) -> Statement {
    if opts.is_empty() {
        return stmt;
    }
    opts.iter().fold(stmt, |stmt, opt| opt.apply(stmt))
}

/// Normalised page window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub offset: i64,
    pub limit: i64,
}

impl Pagination {
    /// Clamp caller input: pages start at 1, sizes default to 20 and never
    /// exceed 100.
    #[must_use]
    pub fn normalize(page: i64, size: i64) -> Self {
        let page = if page <= 0 { 1 } else { page };
        let size = match size {
            s if s > MAX_PAGE_SIZE => MAX_PAGE_SIZE,
            s if s <= 0 => DEFAULT_PAGE_SIZE,
            s => s,
        };
        Self {
            offset: (page - 1).saturating_mul(size),
            limit: size,
        }
    }
}

/// Page `page` (1-based) of `size` rows.
#[must_use]
pub fn pagination(page: i64, size: i64) -> QueryOption {
    let window = Pagination::normalize(page, size);
    QueryOption::new(move |stmt| stmt.offset(window.offset).limit(window.limit))
}

/// Restrict to the row whose `id` equals `id`.
#[must_use]
pub fn with_id(id: i64) -> QueryOption {
    QueryOption::new(move |stmt| stmt.where_eq("id", id))
}

/// Skip inserted rows that conflict on `columns`, or on any constraint when
/// no columns are given.
#[must_use]
pub fn no_conflict(columns: &[&str]) -> QueryOption {
    let on_conflict = OnConflict::do_nothing(columns.iter().copied());
    QueryOption::new(move |stmt| stmt.on_conflict(on_conflict.clone()))
}

/// Project every column, discarding columns chosen by earlier options.
#[must_use]
pub fn wildcard() -> QueryOption {
    QueryOption::new(Statement::select_all)
}

/// Equality predicate on an arbitrary column.
#[must_use]
pub fn where_eq(column: &str, value: impl Into<RowValues>) -> QueryOption {
    let column = column.to_owned();
    let value = value.into();
    QueryOption::new(move |stmt| stmt.where_eq(&column, value.clone()))
}

/// Raw predicate with `?` placeholders.
#[must_use]
pub fn where_raw(sql: &str, args: &[RowValues]) -> QueryOption {
    let sql = sql.to_owned();
    let args = args.to_vec();
    QueryOption::new(move |stmt| stmt.where_raw(sql.clone(), args.clone()))
}

/// ORDER BY expression, e.g. `"age desc"`.
#[must_use]
pub fn order_by(expr: &str) -> QueryOption {
    let expr = expr.to_owned();
    QueryOption::new(move |stmt| stmt.order_by(expr.clone()))
}

/// Project only `columns`.
#[must_use]
pub fn columns(columns: &[&str]) -> QueryOption {
    let columns: Vec<String> = columns.iter().map(|c| (*c).to_owned()).collect();
    QueryOption::new(move |stmt| stmt.select(columns.clone()))
}

/// Target `table` explicitly.
#[must_use]
pub fn table(table: &str) -> QueryOption {
    let table = table.to_owned();
    QueryOption::new(move |stmt| stmt.table(table.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statement::ConflictAction;

    #[test]
    fn pages_below_one_behave_as_first_page() {
        for page in [-5, -1, 0, 1] {
            assert_eq!(Pagination::normalize(page, 10).offset, 0, "page {page}");
        }
        assert_eq!(Pagination::normalize(3, 10).offset, 20);
    }

    #[test]
    fn sizes_clamp_into_range() {
        assert_eq!(Pagination::normalize(1, 0).limit, 20);
        assert_eq!(Pagination::normalize(1, -7).limit, 20);
        assert_eq!(Pagination::normalize(1, 1).limit, 1);
        assert_eq!(Pagination::normalize(1, 100).limit, 100);
        assert_eq!(Pagination::normalize(1, 101).limit, 100);
        assert_eq!(Pagination::normalize(2, i64::MAX).offset, 100);
    }

    #[test]
    fn empty_option_list_is_identity() {
        let stmt = Statement::new().table("t").where_eq("id", 1);
        assert_eq!(apply_options(stmt.clone(), &[]), stmt);
    }

    #[test]
    fn options_apply_in_caller_order() {
        let stmt = apply_options(
            Statement::new(),
            &[where_eq("a", 1), where_eq("b", 2), order_by("a"), order_by("b desc")],
        );
        let sql: Vec<&str> = stmt.conditions().iter().map(|c| c.sql.as_str()).collect();
        assert_eq!(sql, vec!["\"a\" = ?", "\"b\" = ?"]);
        assert_eq!(stmt.order(), ["a".to_owned(), "b desc".to_owned()]);

        // same clause twice is additive, never deduplicated
        let twice = apply_options(Statement::new(), &[with_id(1), with_id(1)]);
        assert_eq!(twice.conditions().len(), 2);
    }

    #[test]
    fn no_conflict_targets() {
        let any = apply_options(Statement::new(), &[no_conflict(&[])]);
        let conflict = any.conflict().unwrap();
        assert!(conflict.columns.is_empty());
        assert_eq!(conflict.action, ConflictAction::DoNothing);

        let named = apply_options(Statement::new(), &[no_conflict(&["nickname", "age"])]);
        assert_eq!(named.conflict().unwrap().columns, vec!["nickname", "age"]);
    }

    #[test]
    fn wildcard_projects_everything() {
        let stmt = apply_options(Statement::new(), &[wildcard()]);
        assert_eq!(stmt.selects(), ["*".to_owned()]);

        let stmt = apply_options(Statement::new(), &[columns(&["nickname", "age"]), wildcard()]);
        assert_eq!(stmt.selects(), ["*".to_owned()]);

        let stmt = apply_options(Statement::new(), &[wildcard(), columns(&["nickname"])]);
        assert_eq!(stmt.selects(), ["*".to_owned(), "nickname".to_owned()]);
    }
}
