//! Accumulated query intent.
//!
//! A [`Statement`] is the builder state options transform. It is a plain
//! value: every builder method consumes it and returns the next state, so a
//! statement captured by a handle is never modified by a later operation.

mod render;

pub(crate) use render::{
    SelectKind, render_count, render_delete, render_exists, render_insert, render_pluck,
    render_select, render_update, render_upsert,
};
pub use render::quote_ident;

use crate::types::RowValues;

/// SQL text with bare `?` placeholders and its positional arguments.
///
/// This is the product of a dry run: the statement is fully compiled but has
/// not been sent to the engine.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Compiled {
    pub sql: String,
    pub args: Vec<RowValues>,
}

impl Compiled {
    #[must_use]
    pub fn new(sql: impl Into<String>, args: Vec<RowValues>) -> Self {
        Self {
            sql: sql.into(),
            args,
        }
    }
}

/// One predicate of the WHERE clause.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub(crate) sql: String,
    pub(crate) args: Vec<RowValues>,
}

/// What an INSERT does when a row collides with an existing one.
#[derive(Debug, Clone, PartialEq)]
pub struct OnConflict {
    /// Conflict target; empty means "any constraint".
    pub columns: Vec<String>,
    pub action: ConflictAction,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConflictAction {
    /// Skip the conflicting row silently.
    DoNothing,
    /// Overwrite the listed columns with the incoming values.
    Update(Vec<String>),
}

impl OnConflict {
    #[must_use]
    pub fn do_nothing<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            action: ConflictAction::DoNothing,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Statement {
    table: Option<String>,
    primary_key: Option<String>,
    conditions: Vec<Condition>,
    selects: Vec<String>,
    order: Vec<String>,
    limit: Option<i64>,
    offset: Option<i64>,
    on_conflict: Option<OnConflict>,
    raw: Option<Compiled>,
}

impl Statement {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Target table; later calls win.
    #[must_use]
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Identity column used for default ordering (`"id"` when unset).
    #[must_use]
    pub fn primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_key = Some(column.into());
        self
    }

    /// Add a raw predicate with `?` placeholders. Predicates are ANDed.
    #[must_use]
    pub fn where_raw(mut self, sql: impl Into<String>, args: Vec<RowValues>) -> Self {
        self.conditions.push(Condition {
            sql: format!("({})", sql.into()),
            args,
        });
        self
    }

    /// Add an equality predicate on `column`.
    #[must_use]
    pub fn where_eq(mut self, column: &str, value: impl Into<RowValues>) -> Self {
        self.conditions.push(Condition {
            sql: format!("{} = ?", quote_ident(column)),
            args: vec![value.into()],
        });
        self
    }

    /// Append columns or expressions to the projection.
    #[must_use]
    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selects.extend(columns.into_iter().map(Into::into));
        self
    }

    /// Replace the projection with `*`.
    #[must_use]
    pub fn select_all(mut self) -> Self {
        self.selects = vec!["*".to_owned()];
        self
    }

    /// Append an ORDER BY expression (e.g. `"age desc"`).
    #[must_use]
    pub fn order_by(mut self, expr: impl Into<String>) -> Self {
        self.order.push(expr.into());
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }

    #[must_use]
    pub fn on_conflict(mut self, on_conflict: OnConflict) -> Self {
        self.on_conflict = Some(on_conflict);
        self
    }

    /// Replace the generated statement with literal SQL.
    #[must_use]
    pub fn raw(mut self, sql: impl Into<String>, args: Vec<RowValues>) -> Self {
        self.raw = Some(Compiled::new(sql, args));
        self
    }

    #[must_use]
    pub fn table_name(&self) -> Option<&str> {
        self.table.as_deref()
    }

    #[must_use]
    pub fn primary_key_column(&self) -> &str {
        self.primary_key.as_deref().unwrap_or("id")
    }

    #[must_use]
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    #[must_use]
    pub fn has_conditions(&self) -> bool {
        !self.conditions.is_empty()
    }

    #[must_use]
    pub fn selects(&self) -> &[String] {
        &self.selects
    }

    #[must_use]
    pub fn order(&self) -> &[String] {
        &self.order
    }

    #[must_use]
    pub fn limit_value(&self) -> Option<i64> {
        self.limit
    }

    #[must_use]
    pub fn offset_value(&self) -> Option<i64> {
        self.offset
    }

    #[must_use]
    pub fn conflict(&self) -> Option<&OnConflict> {
        self.on_conflict.as_ref()
    }

    #[must_use]
    pub fn raw_sql(&self) -> Option<&Compiled> {
        self.raw.as_ref()
    }

    /// Fill in the table only when nothing bound one yet.
    pub(crate) fn with_default_table(mut self, table: &str, primary_key: &str) -> Self {
        if self.table.is_none() {
            self.table = Some(table.to_owned());
            self.primary_key = Some(primary_key.to_owned());
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_calls_accumulate_in_order() {
        let stmt = Statement::new()
            .table("test_users")
            .where_eq("id", 1)
            .where_raw("age > ? OR age < ?", vec![RowValues::Int(10), RowValues::Int(2)])
            .limit(2)
            .offset(4);

        assert_eq!(stmt.table_name(), Some("test_users"));
        assert_eq!(stmt.conditions().len(), 2);
        assert_eq!(stmt.conditions()[0].sql, "\"id\" = ?");
        assert_eq!(stmt.conditions()[1].sql, "(age > ? OR age < ?)");
        assert_eq!(stmt.limit_value(), Some(2));
        assert_eq!(stmt.offset_value(), Some(4));
        assert_eq!(stmt.primary_key_column(), "id");
    }

    #[test]
    fn default_table_does_not_override_binding() {
        let bound = Statement::new()
            .table("accounts")
            .with_default_table("test_users", "id");
        assert_eq!(bound.table_name(), Some("accounts"));

        let unbound = Statement::new().with_default_table("test_users", "uid");
        assert_eq!(unbound.table_name(), Some("test_users"));
        assert_eq!(unbound.primary_key_column(), "uid");
    }
}
