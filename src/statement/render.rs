use std::fmt::Write;

use crate::error::SqlHandleError;
use crate::types::{Dialect, RowValues};

use super::{Compiled, ConflictAction, OnConflict, Statement};

/// How a SELECT picks its rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SelectKind {
    /// All matching rows.
    Find,
    /// One row, ordered by primary key unless an order was given.
    First,
    /// One row in engine order.
    Take,
}

/// Quote an identifier, keeping `*` and dotted qualifiers intact.
///
/// ```rust
/// use sql_handle::statement::quote_ident;
///
/// assert_eq!(quote_ident("test_users.id"), r#""test_users"."id""#);
/// assert_eq!(quote_ident("*"), "*");
/// ```
#[must_use]
pub fn quote_ident(ident: &str) -> String {
    ident
        .split('.')
        .map(|part| {
            if part == "*" {
                part.to_owned()
            } else {
                format!("\"{}\"", part.replace('"', "\"\""))
            }
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// Quote plain identifiers; leave expressions such as `count(*)` alone.
fn projection_item(item: &str) -> String {
    let plain = item
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '*');
    if plain {
        quote_ident(item)
    } else {
        item.to_owned()
    }
}

fn table_of(stmt: &Statement) -> Result<&str, SqlHandleError> {
    stmt.table_name().ok_or(SqlHandleError::MissingTable)
}

fn push_where(sql: &mut String, args: &mut Vec<RowValues>, stmt: &Statement) {
    if !stmt.has_conditions() {
        return;
    }
    sql.push_str(" WHERE ");
    for (i, condition) in stmt.conditions().iter().enumerate() {
        if i > 0 {
            sql.push_str(" AND ");
        }
        sql.push_str(&condition.sql);
        args.extend(condition.args.iter().cloned());
    }
}

fn push_order(sql: &mut String, stmt: &Statement) {
    if !stmt.order().is_empty() {
        sql.push_str(" ORDER BY ");
        sql.push_str(&stmt.order().join(", "));
    }
}

fn push_limit_offset(sql: &mut String, dialect: Dialect, limit: Option<i64>, offset: Option<i64>) {
    let offset = offset.filter(|o| *o > 0);
    match (limit, offset) {
        (Some(limit), _) => {
            let _ = write!(sql, " LIMIT {limit}");
        }
        (None, Some(_)) if offset_needs_limit(dialect) => sql.push_str(" LIMIT -1"),
        _ => {}
    }
    if let Some(offset) = offset {
        let _ = write!(sql, " OFFSET {offset}");
    }
}

/// SQLite only accepts OFFSET after a LIMIT.
fn offset_needs_limit(dialect: Dialect) -> bool {
    match dialect {
        #[cfg(feature = "sqlite")]
        Dialect::Sqlite => true,
        #[cfg(feature = "postgres")]
        Dialect::Postgres => false,
    }
}

/// SELECT for find/first/take lookups.
pub(crate) fn render_select(
    stmt: &Statement,
    dialect: Dialect,
    kind: SelectKind,
) -> Result<Compiled, SqlHandleError> {
    let table = table_of(stmt)?;
    let mut sql = String::from("SELECT ");
    if stmt.selects().is_empty() {
        sql.push('*');
    } else {
        let items: Vec<String> = stmt.selects().iter().map(|s| projection_item(s)).collect();
        sql.push_str(&items.join(", "));
    }
    let _ = write!(sql, " FROM {}", quote_ident(table));

    let mut args = Vec::new();
    push_where(&mut sql, &mut args, stmt);

    if kind == SelectKind::First && stmt.order().is_empty() {
        let _ = write!(
            sql,
            " ORDER BY {}.{}",
            quote_ident(table),
            quote_ident(stmt.primary_key_column())
        );
    } else {
        push_order(&mut sql, stmt);
    }

    let limit = match kind {
        SelectKind::Find => stmt.limit_value(),
        SelectKind::First | SelectKind::Take => Some(1),
    };
    push_limit_offset(&mut sql, dialect, limit, stmt.offset_value());
    Ok(Compiled { sql, args })
}

/// Single-column SELECT; ordering and paging apply as for find.
pub(crate) fn render_pluck(
    stmt: &Statement,
    dialect: Dialect,
    column: &str,
) -> Result<Compiled, SqlHandleError> {
    let table = table_of(stmt)?;
    let mut sql = format!("SELECT {} FROM {}", projection_item(column), quote_ident(table));
    let mut args = Vec::new();
    push_where(&mut sql, &mut args, stmt);
    push_order(&mut sql, stmt);
    push_limit_offset(&mut sql, dialect, stmt.limit_value(), stmt.offset_value());
    Ok(Compiled { sql, args })
}

/// COUNT(*) over the matching rows. Paging and ordering are ignored.
pub(crate) fn render_count(stmt: &Statement) -> Result<Compiled, SqlHandleError> {
    let table = table_of(stmt)?;
    let mut sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
    let mut args = Vec::new();
    push_where(&mut sql, &mut args, stmt);
    Ok(Compiled { sql, args })
}

/// Wrap a compiled lookup into an existence check.
pub(crate) fn render_exists(inner: Compiled) -> Compiled {
    Compiled {
        sql: format!("SELECT EXISTS({})", inner.sql),
        args: inner.args,
    }
}

fn push_conflict(sql: &mut String, on_conflict: &OnConflict) {
    sql.push_str(" ON CONFLICT");
    if !on_conflict.columns.is_empty() {
        let targets: Vec<String> = on_conflict.columns.iter().map(|c| quote_ident(c)).collect();
        let _ = write!(sql, " ({})", targets.join(", "));
    }
    match &on_conflict.action {
        ConflictAction::DoNothing => sql.push_str(" DO NOTHING"),
        ConflictAction::Update(columns) if columns.is_empty() => sql.push_str(" DO NOTHING"),
        ConflictAction::Update(columns) => {
            let sets: Vec<String> = columns
                .iter()
                .map(|c| {
                    let quoted = quote_ident(c);
                    format!("{quoted} = excluded.{quoted}")
                })
                .collect();
            let _ = write!(sql, " DO UPDATE SET {}", sets.join(", "));
        }
    }
}

/// INSERT of one row, returning the identity column.
pub(crate) fn render_insert(
    stmt: &Statement,
    values: &[(String, RowValues)],
) -> Result<Compiled, SqlHandleError> {
    let table = table_of(stmt)?;
    let mut sql = format!("INSERT INTO {}", quote_ident(table));
    if values.is_empty() {
        sql.push_str(" DEFAULT VALUES");
    } else {
        let columns: Vec<String> = values.iter().map(|(c, _)| quote_ident(c)).collect();
        let placeholders = vec!["?"; values.len()];
        let _ = write!(
            sql,
            " ({}) VALUES ({})",
            columns.join(", "),
            placeholders.join(", ")
        );
        if let Some(on_conflict) = stmt.conflict() {
            push_conflict(&mut sql, on_conflict);
        }
    }
    let _ = write!(sql, " RETURNING {}", quote_ident(stmt.primary_key_column()));
    Ok(Compiled {
        sql,
        args: values.iter().map(|(_, v)| v.clone()).collect(),
    })
}

/// INSERT that overwrites every non-key column when the key already exists.
pub(crate) fn render_upsert(
    stmt: &Statement,
    values: &[(String, RowValues)],
) -> Result<Compiled, SqlHandleError> {
    let pk = stmt.primary_key_column().to_owned();
    let updates: Vec<String> = values
        .iter()
        .map(|(c, _)| c.clone())
        .filter(|c| *c != pk)
        .collect();
    let upsert = stmt.clone().on_conflict(OnConflict {
        columns: vec![pk],
        action: ConflictAction::Update(updates),
    });
    render_insert(&upsert, values)
}

/// UPDATE of the matching rows. Refuses to run without a WHERE clause.
pub(crate) fn render_update(
    stmt: &Statement,
    assignments: &[(String, RowValues)],
) -> Result<Compiled, SqlHandleError> {
    let table = table_of(stmt)?;
    if !stmt.has_conditions() {
        return Err(SqlHandleError::MissingWhereClause);
    }
    let sets: Vec<String> = assignments
        .iter()
        .map(|(c, _)| format!("{} = ?", quote_ident(c)))
        .collect();
    let mut sql = format!("UPDATE {} SET {}", quote_ident(table), sets.join(", "));
    let mut args: Vec<RowValues> = assignments.iter().map(|(_, v)| v.clone()).collect();
    push_where(&mut sql, &mut args, stmt);
    Ok(Compiled { sql, args })
}

/// DELETE of the matching rows. Refuses to run without a WHERE clause.
pub(crate) fn render_delete(stmt: &Statement) -> Result<Compiled, SqlHandleError> {
    let table = table_of(stmt)?;
    if !stmt.has_conditions() {
        return Err(SqlHandleError::MissingWhereClause);
    }
    let mut sql = format!("DELETE FROM {}", quote_ident(table));
    let mut args = Vec::new();
    push_where(&mut sql, &mut args, stmt);
    Ok(Compiled { sql, args })
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;

    fn users() -> Statement {
        Statement::new().table("test_users")
    }

    #[test]
    fn first_orders_by_primary_key() {
        let c = render_select(&users().where_eq("id", 1), Dialect::Sqlite, SelectKind::First)
            .unwrap();
        assert_eq!(
            c.sql,
            r#"SELECT * FROM "test_users" WHERE "id" = ? ORDER BY "test_users"."id" LIMIT 1"#
        );
        assert_eq!(c.args, vec![RowValues::Int(1)]);
    }

    #[test]
    fn take_keeps_engine_order() {
        let c = render_select(&users().select(["*"]), Dialect::Sqlite, SelectKind::Take).unwrap();
        assert_eq!(c.sql, r#"SELECT * FROM "test_users" LIMIT 1"#);
    }

    #[test]
    fn find_applies_paging() {
        let stmt = users().order_by("age desc").limit(20).offset(40);
        let c = render_select(&stmt, Dialect::Sqlite, SelectKind::Find).unwrap();
        assert_eq!(
            c.sql,
            r#"SELECT * FROM "test_users" ORDER BY age desc LIMIT 20 OFFSET 40"#
        );
    }

    #[test]
    fn sqlite_offset_without_limit() {
        let c = render_select(&users().offset(5), Dialect::Sqlite, SelectKind::Find).unwrap();
        assert_eq!(c.sql, r#"SELECT * FROM "test_users" LIMIT -1 OFFSET 5"#);
    }

    #[test]
    fn count_ignores_paging() {
        let c = render_count(&users().limit(2).offset(2).where_eq("age", 3)).unwrap();
        assert_eq!(c.sql, r#"SELECT COUNT(*) FROM "test_users" WHERE "age" = ?"#);
    }

    #[test]
    fn insert_with_conflict_skip() {
        let stmt = users().on_conflict(OnConflict::do_nothing(["nickname"]));
        let values = vec![
            ("nickname".to_owned(), RowValues::from("hello")),
            ("age".to_owned(), RowValues::Int(3)),
        ];
        let c = render_insert(&stmt, &values).unwrap();
        assert_eq!(
            c.sql,
            r#"INSERT INTO "test_users" ("nickname", "age") VALUES (?, ?) ON CONFLICT ("nickname") DO NOTHING RETURNING "id""#
        );
        assert_eq!(c.args.len(), 2);
    }

    #[test]
    fn upsert_updates_non_key_columns() {
        let values = vec![
            ("id".to_owned(), RowValues::Int(9)),
            ("nickname".to_owned(), RowValues::from("x")),
        ];
        let c = render_upsert(&users(), &values).unwrap();
        assert_eq!(
            c.sql,
            r#"INSERT INTO "test_users" ("id", "nickname") VALUES (?, ?) ON CONFLICT ("id") DO UPDATE SET "nickname" = excluded."nickname" RETURNING "id""#
        );
    }

    #[test]
    fn update_and_delete_need_conditions() {
        let assignments = vec![("nickname".to_owned(), RowValues::from("x"))];
        assert!(matches!(
            render_update(&users(), &assignments),
            Err(SqlHandleError::MissingWhereClause)
        ));
        assert!(matches!(
            render_delete(&users()),
            Err(SqlHandleError::MissingWhereClause)
        ));

        let c = render_update(&users().where_eq("id", 1), &assignments).unwrap();
        assert_eq!(c.sql, r#"UPDATE "test_users" SET "nickname" = ? WHERE "id" = ?"#);
        assert_eq!(c.args, vec![RowValues::from("x"), RowValues::Int(1)]);
    }

    #[test]
    fn exists_wraps_compiled_lookup() {
        let inner = render_select(&users().where_eq("id", 1).select(["*"]), Dialect::Sqlite, SelectKind::Take)
            .unwrap();
        let c = render_exists(inner);
        assert_eq!(
            c.sql,
            r#"SELECT EXISTS(SELECT * FROM "test_users" WHERE "id" = ? LIMIT 1)"#
        );
    }

    #[test]
    fn missing_table_is_reported() {
        assert!(matches!(
            render_count(&Statement::new()),
            Err(SqlHandleError::MissingTable)
        ));
    }
}
