use std::borrow::Cow;

mod lexer;

use lexer::{
    State, is_block_comment_end, is_block_comment_start, is_line_comment_start, matches_tag,
    scan_digits, try_start_dollar_quote,
};

use crate::types::Dialect;

/// Target placeholder style for translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// PostgreSQL-style placeholders like `$1`.
    Postgres,
    /// SQLite-style placeholders like `?` or `?1`.
    Sqlite,
}

impl From<Dialect> for PlaceholderStyle {
    fn from(dialect: Dialect) -> Self {
        match dialect {
            #[cfg(feature = "sqlite")]
            Dialect::Sqlite => PlaceholderStyle::Sqlite,
            #[cfg(feature = "postgres")]
            Dialect::Postgres => PlaceholderStyle::Postgres,
        }
    }
}

/// Rewrite bind placeholders for the target dialect.
///
/// Statements are rendered with bare `?` placeholders. For Postgres every bare
/// `?` becomes the next `$N` and `?N` becomes `$N`; for SQLite `$N` becomes
/// `?N` and bare `?` is left alone. Quoted strings, quoted identifiers,
/// comments, and dollar-quoted blocks are skipped.
///
/// ```rust
/// use sql_handle::translation::{PlaceholderStyle, bind_placeholders};
///
/// let sql = "SELECT EXISTS(SELECT * FROM t WHERE a = ? AND b = '?')";
/// assert_eq!(
///     bind_placeholders(sql, PlaceholderStyle::Postgres),
///     "SELECT EXISTS(SELECT * FROM t WHERE a = $1 AND b = '?')"
/// );
/// ```
/// Returns a borrowed `Cow` when no changes are needed.
#[must_use]
pub fn bind_placeholders(sql: &str, target: PlaceholderStyle) -> Cow<'_, str> {
    let mut out: Option<String> = None;
    let mut copied = 0;
    let mut next_bare = 1_usize;
    let mut state = State::Normal;
    let mut idx = 0;
    let bytes = sql.as_bytes();

    while idx < bytes.len() {
        let b = bytes[idx];
        match state {
            State::Normal => match b {
                b'\'' | b'"' => state = State::Quoted(b),
                _ if is_line_comment_start(bytes, idx) => state = State::LineComment,
                _ if is_block_comment_start(bytes, idx) => state = State::BlockComment(1),
                b'$' => {
                    if let Some((tag, advance)) = try_start_dollar_quote(bytes, idx) {
                        state = State::DollarQuoted(tag);
                        idx = advance;
                    } else if target == PlaceholderStyle::Sqlite
                        && let Some((digits_end, digits)) = scan_digits(bytes, idx + 1)
                    {
                        let buf = out.get_or_insert_with(|| String::with_capacity(sql.len()));
                        buf.push_str(&sql[copied..idx]);
                        buf.push('?');
                        buf.push_str(digits);
                        copied = digits_end;
                        idx = digits_end - 1;
                    }
                }
                b'?' if target == PlaceholderStyle::Postgres => {
                    let buf = out.get_or_insert_with(|| String::with_capacity(sql.len() + 8));
                    buf.push_str(&sql[copied..idx]);
                    buf.push('$');
                    if let Some((digits_end, digits)) = scan_digits(bytes, idx + 1) {
                        buf.push_str(digits);
                        copied = digits_end;
                        idx = digits_end - 1;
                    } else {
                        buf.push_str(&next_bare.to_string());
                        next_bare += 1;
                        copied = idx + 1;
                    }
                }
                _ => {}
            },
            State::Quoted(quote) if b == quote => {
                // a doubled quote is an escaped quote
                if bytes.get(idx + 1) == Some(&quote) {
                    idx += 1;
                } else {
                    state = State::Normal;
                }
            }
            State::Quoted(_) => {}
            State::LineComment => {
                if b == b'\n' {
                    state = State::Normal;
                }
            }
            State::BlockComment(depth) => {
                if is_block_comment_start(bytes, idx) {
                    state = State::BlockComment(depth + 1);
                    idx += 1;
                } else if is_block_comment_end(bytes, idx) {
                    idx += 1;
                    if depth == 1 {
                        state = State::Normal;
                    } else {
                        state = State::BlockComment(depth - 1);
                    }
                }
            }
            State::DollarQuoted(ref tag) => {
                if b == b'$' && matches_tag(bytes, idx, tag) {
                    let tag_len = tag.len();
                    state = State::Normal;
                    idx += tag_len + 1;
                }
            }
        }

        idx += 1;
    }

    match out {
        Some(mut buf) => {
            buf.push_str(&sql[copied..]);
            Cow::Owned(buf)
        }
        None => Cow::Borrowed(sql),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_bare_placeholders_for_postgres() {
        let sql = "select * from t where a = ? and b = ?";
        let res = bind_placeholders(sql, PlaceholderStyle::Postgres);
        assert_eq!(res, "select * from t where a = $1 and b = $2");
    }

    #[test]
    fn keeps_numbered_placeholders_for_postgres() {
        let sql = "select * from t where a = ?1 and b = ?2";
        let res = bind_placeholders(sql, PlaceholderStyle::Postgres);
        assert_eq!(res, "select * from t where a = $1 and b = $2");
    }

    #[test]
    fn translates_postgres_to_sqlite() {
        let sql = "insert into t values($1, $2)";
        let res = bind_placeholders(sql, PlaceholderStyle::Sqlite);
        assert_eq!(res, "insert into t values(?1, ?2)");
    }

    #[test]
    fn bare_placeholders_stay_for_sqlite() {
        let sql = r#"SELECT * FROM "test_users" WHERE "id" = ?"#;
        let res = bind_placeholders(sql, PlaceholderStyle::Sqlite);
        assert!(matches!(res, Cow::Borrowed(_)));
    }

    #[test]
    fn skips_inside_literals_and_comments() {
        let sql = "select '?', \"a?\", ? -- ?\n/* ? */ from t where a = ?";
        let res = bind_placeholders(sql, PlaceholderStyle::Postgres);
        assert_eq!(res, "select '?', \"a?\", $1 -- ?\n/* ? */ from t where a = $2");
    }

    #[test]
    fn skips_dollar_quoted_blocks() {
        let sql = "$foo$ select $1 from t $foo$ where a = $1";
        let res = bind_placeholders(sql, PlaceholderStyle::Sqlite);
        assert_eq!(res, "$foo$ select $1 from t $foo$ where a = ?1");
    }

    #[test]
    fn preserves_multibyte_text() {
        let sql = "select 'héllo', ? from t where name = 'ü?'";
        let res = bind_placeholders(sql, PlaceholderStyle::Postgres);
        assert_eq!(res, "select 'héllo', $1 from t where name = 'ü?'");
    }
}
