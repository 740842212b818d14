//! Placeholder rewriting and parameter binding.
//!
//! Statements are written with `@name` placeholders for every backend. Before execution the
//! placeholders are rewritten into the driver's native form and the referenced values are
//! bound in the matching order:
//!
//! - SQLite: `?N`, a repeated name reuses its argument
//! - PostgreSQL: `$N`, a repeated name reuses its argument
//! - MySQL: `?`, one bind per occurrence
//!
//! Statements are tokenized with `sqlparser` under the backend's dialect. String literals,
//! quoted identifiers, comments, `@@system` variables and names that are not in the parameter
//! set are copied through untouched.

use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, ParameterSet, SqlValue};
use sqlparser::dialect::{Dialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::tokenizer::{Location, Token, TokenWithSpan, Tokenizer};
use sqlx::mysql::MySqlArguments;
use sqlx::postgres::PgArguments;
use sqlx::sqlite::SqliteArguments;
use sqlx::{MySql, Postgres, Sqlite};

/// Statement text in native placeholder form plus the values to bind, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeStatement<'a> {
    pub sql: String,
    pub bindings: Vec<&'a SqlValue>,
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn dialect_for(db: DatabaseType) -> Box<dyn Dialect> {
    match db {
        DatabaseType::PostgreSQL => Box::new(PostgreSqlDialect {}),
        DatabaseType::MySQL => Box::new(MySqlDialect {}),
        DatabaseType::SQLite => Box::new(SQLiteDialect {}),
    }
}

/// A `@name` reference in the token stream, as tokenizer locations.
struct PlaceholderSpan {
    start: Location,
    end: Location,
    name: String,
}

/// Collect unquoted `@name` references, skipping `@@system` variables.
///
/// MySQL reads `@name` as a single word; the other dialects yield an `@` sign followed by a
/// word, or a placeholder token.
fn placeholder_spans(tokens: &[TokenWithSpan]) -> Vec<PlaceholderSpan> {
    let mut spans = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        let current = &tokens[i];
        match &current.token {
            Token::Word(word) if word.quote_style.is_none() && word.value.starts_with('@') => {
                if let Some(name) = word.value.strip_prefix('@').filter(|n| !n.starts_with('@')) {
                    spans.push(PlaceholderSpan {
                        start: current.span.start,
                        end: current.span.end,
                        name: name.to_string(),
                    });
                }
            }
            Token::Placeholder(text) if text.starts_with('@') && !text.starts_with("@@") => {
                spans.push(PlaceholderSpan {
                    start: current.span.start,
                    end: current.span.end,
                    name: text[1..].to_string(),
                });
            }
            Token::AtSign => {
                let system_variable = i > 0 && matches!(tokens[i - 1].token, Token::AtSign);
                if let Some(next) = tokens.get(i + 1) {
                    if let Token::Word(word) = &next.token {
                        if word.quote_style.is_none() && !system_variable {
                            spans.push(PlaceholderSpan {
                                start: current.span.start,
                                end: next.span.end,
                                name: word.value.clone(),
                            });
                            i += 2;
                            continue;
                        }
                    }
                }
            }
            _ => {}
        }
        i += 1;
    }
    spans
}

/// Byte offset of every line start in `sql`.
fn line_starts(sql: &str) -> Vec<usize> {
    std::iter::once(0)
        .chain(sql.match_indices('\n').map(|(i, _)| i + 1))
        .collect()
}

/// Convert a 1-based line/column (in characters) into a byte offset.
fn byte_offset(sql: &str, lines: &[usize], location: Location) -> Option<usize> {
    let line = usize::try_from(location.line).ok()?.checked_sub(1)?;
    let column = usize::try_from(location.column).ok()?.checked_sub(1)?;
    let line_start = *lines.get(line)?;
    let rest = &sql[line_start..];
    rest.char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(rest.len()))
        .nth(column)
        .map(|i| line_start + i)
}

/// Rewrite `@name` placeholders into the native form for `db`.
///
/// The statement is tokenized with the backend's dialect, so literals (including PostgreSQL
/// dollar-quoted and `E'...'` strings), quoted identifiers and comments are never touched.
/// Only the placeholder text is replaced; everything else is copied byte for byte.
pub fn rewrite_placeholders<'a>(
    sql: &str,
    params: &'a ParameterSet,
    db: DatabaseType,
) -> DbResult<NativeStatement<'a>> {
    let dialect = dialect_for(db);
    let tokens = Tokenizer::new(dialect.as_ref(), sql)
        .with_unescape(false)
        .tokenize_with_location()
        .map_err(|e| DbError::invalid_input(format!("Could not tokenize statement: {}", e)))?;

    let lines = line_starts(sql);
    let mut out = String::with_capacity(sql.len() + 8);
    let mut bindings: Vec<&'a SqlValue> = Vec::new();
    // name (lowercased) -> 1-based argument position
    let mut positions: Vec<(String, usize)> = Vec::new();
    let mut copied = 0;

    for span in placeholder_spans(&tokens) {
        let Some(param) = params.get(&span.name) else {
            continue;
        };
        let (Some(start), Some(end)) = (
            byte_offset(sql, &lines, span.start),
            byte_offset(sql, &lines, span.end),
        ) else {
            continue;
        };
        if start < copied || end < start {
            continue;
        }

        out.push_str(&sql[copied..start]);
        match db {
            DatabaseType::MySQL => {
                out.push('?');
                bindings.push(&param.value);
            }
            DatabaseType::PostgreSQL | DatabaseType::SQLite => {
                let key = span.name.to_ascii_lowercase();
                let position = match positions.iter().find(|(n, _)| *n == key) {
                    Some((_, pos)) => *pos,
                    None => {
                        bindings.push(&param.value);
                        positions.push((key, bindings.len()));
                        bindings.len()
                    }
                };
                let marker = if db == DatabaseType::PostgreSQL {
                    '$'
                } else {
                    '?'
                };
                out.push(marker);
                out.push_str(&position.to_string());
            }
        }
        copied = end;
    }

    out.push_str(&sql[copied..]);
    Ok(NativeStatement { sql: out, bindings })
}

/// Build `CALL name(@p1, @p2, ...)` with every parameter in order.
pub fn procedure_call_text(
    procedure: &str,
    params: &ParameterSet,
    db: DatabaseType,
) -> DbResult<String> {
    if !db.supports_stored_procedures() {
        return Err(DbError::invalid_input(format!(
            "{} does not support stored procedures",
            db.display_name()
        )));
    }

    let procedure = procedure.trim();
    let valid = !procedure.is_empty()
        && procedure
            .bytes()
            .all(|b| is_ident_byte(b) || matches!(b, b'.' | b'`' | b'"'));
    if !valid {
        return Err(DbError::invalid_input(format!(
            "Invalid stored procedure name: '{}'",
            procedure
        )));
    }

    let args: Vec<String> = params.iter().map(|p| format!("@{}", p.name)).collect();
    Ok(format!("CALL {}({})", procedure, args.join(", ")))
}

/// PostgreSQL and SQLite take decimals as floating point; anything that is not a finite
/// number (including `inf` and `NaN`) is sent as text.
pub(crate) fn decimal_as_f64(text: &str) -> Option<f64> {
    text.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Bind a value to a MySQL query.
pub(crate) fn bind_mysql_value<'q>(
    query: sqlx::query::Query<'q, MySql, MySqlArguments>,
    value: &'q SqlValue,
) -> sqlx::query::Query<'q, MySql, MySqlArguments> {
    match value {
        SqlValue::Null => query.bind(None::<String>),
        SqlValue::Bool(v) => query.bind(*v),
        SqlValue::TinyInt(v) => query.bind(*v),
        SqlValue::SmallInt(v) => query.bind(*v),
        SqlValue::Int(v) => query.bind(*v),
        SqlValue::BigInt(v) => query.bind(*v),
        // MySQL converts the string exactly
        SqlValue::Decimal(v) => query.bind(v.as_str()),
        SqlValue::Float(v) => query.bind(*v),
        SqlValue::Real(v) => query.bind(*v),
        SqlValue::DateTime(v) => query.bind(*v),
        SqlValue::Text(v) => query.bind(v.as_str()),
        SqlValue::Bytes(v) => query.bind(v.as_slice()),
    }
}

/// Bind a value to a PostgreSQL query.
pub(crate) fn bind_postgres_value<'q>(
    query: sqlx::query::Query<'q, Postgres, PgArguments>,
    value: &'q SqlValue,
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    match value {
        SqlValue::Null => query.bind(None::<String>),
        SqlValue::Bool(v) => query.bind(*v),
        // No unsigned single-byte type in PostgreSQL
        SqlValue::TinyInt(v) => query.bind(i16::from(*v)),
        SqlValue::SmallInt(v) => query.bind(*v),
        SqlValue::Int(v) => query.bind(*v),
        SqlValue::BigInt(v) => query.bind(*v),
        SqlValue::Decimal(v) => match decimal_as_f64(v) {
            Some(f) => query.bind(f),
            None => query.bind(v.as_str()),
        },
        SqlValue::Float(v) => query.bind(*v),
        SqlValue::Real(v) => query.bind(*v),
        SqlValue::DateTime(v) => query.bind(*v),
        SqlValue::Text(v) => query.bind(v.as_str()),
        SqlValue::Bytes(v) => query.bind(v.as_slice()),
    }
}

/// Bind a value to a SQLite query.
pub(crate) fn bind_sqlite_value<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &'q SqlValue,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        SqlValue::Null => query.bind(None::<String>),
        SqlValue::Bool(v) => query.bind(*v),
        SqlValue::TinyInt(v) => query.bind(*v),
        SqlValue::SmallInt(v) => query.bind(*v),
        SqlValue::Int(v) => query.bind(*v),
        SqlValue::BigInt(v) => query.bind(*v),
        SqlValue::Decimal(v) => match decimal_as_f64(v) {
            Some(f) => query.bind(f),
            None => query.bind(v.as_str()),
        },
        SqlValue::Float(v) => query.bind(*v),
        SqlValue::Real(v) => query.bind(*v),
        SqlValue::DateTime(v) => query.bind(*v),
        SqlValue::Text(v) => query.bind(v.as_str()),
        SqlValue::Bytes(v) => query.bind(v.as_slice()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ParameterSet {
        ParameterSet::new().with("Id", 7).with("name", "x")
    }

    #[test]
    fn test_sqlite_numbered_placeholders() {
        let params = params();
        let stmt = rewrite_placeholders(
            "SELECT * FROM t WHERE id = @Id AND name = @name OR parent = @Id",
            &params,
            DatabaseType::SQLite,
        )
        .unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT * FROM t WHERE id = ?1 AND name = ?2 OR parent = ?1"
        );
        assert_eq!(stmt.bindings.len(), 2);
        assert_eq!(*stmt.bindings[0], SqlValue::Int(7));
    }

    #[test]
    fn test_postgres_dollar_placeholders() {
        let params = params();
        let stmt = rewrite_placeholders(
            "UPDATE t SET name = @name WHERE id = @id",
            &params,
            DatabaseType::PostgreSQL,
        )
        .unwrap();
        assert_eq!(stmt.sql, "UPDATE t SET name = $1 WHERE id = $2");
        assert_eq!(*stmt.bindings[0], SqlValue::Text("x".into()));
    }

    #[test]
    fn test_mysql_binds_each_occurrence() {
        let params = params();
        let stmt = rewrite_placeholders(
            "SELECT @Id, @name, @Id",
            &params,
            DatabaseType::MySQL,
        )
        .unwrap();
        assert_eq!(stmt.sql, "SELECT ?, ?, ?");
        assert_eq!(stmt.bindings.len(), 3);
        assert_eq!(*stmt.bindings[2], SqlValue::Int(7));
    }

    #[test]
    fn test_skips_literals_comments_and_system_variables() {
        let params = params();
        let sql = "SELECT '@Id', \"@Id\", `@Id`, @@ROWCOUNT -- @Id\n/* @Id */ , @Id";
        let stmt = rewrite_placeholders(sql, &params, DatabaseType::SQLite).unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT '@Id', \"@Id\", `@Id`, @@ROWCOUNT -- @Id\n/* @Id */ , ?1"
        );
        assert_eq!(stmt.bindings.len(), 1);
    }

    #[test]
    fn test_escaped_quotes_inside_literals() {
        let params = params();
        let stmt = rewrite_placeholders(
            "SELECT 'O''Brien @Id', @Id",
            &params,
            DatabaseType::PostgreSQL,
        )
        .unwrap();
        assert_eq!(stmt.sql, "SELECT 'O''Brien @Id', $1");

        let stmt = rewrite_placeholders(
            "SELECT 'it\\'s @Id', @Id",
            &params,
            DatabaseType::MySQL,
        )
        .unwrap();
        assert_eq!(stmt.sql, "SELECT 'it\\'s @Id', ?");
    }

    #[test]
    fn test_postgres_dollar_quoted_and_escape_strings() {
        let params = params();
        let stmt = rewrite_placeholders(
            "SELECT $$@Id$$, $tag$ @name $tag$, E'it\\'s @Id', @Id",
            &params,
            DatabaseType::PostgreSQL,
        )
        .unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT $$@Id$$, $tag$ @name $tag$, E'it\\'s @Id', $1"
        );
        assert_eq!(stmt.bindings.len(), 1);
        assert_eq!(*stmt.bindings[0], SqlValue::Int(7));
    }

    #[test]
    fn test_placeholders_on_later_lines() {
        let params = params();
        let stmt = rewrite_placeholders(
            "SELECT 'é'\n  , @name\nFROM t\nWHERE id = @id",
            &params,
            DatabaseType::SQLite,
        )
        .unwrap();
        assert_eq!(stmt.sql, "SELECT 'é'\n  , ?1\nFROM t\nWHERE id = ?2");
    }

    #[test]
    fn test_unterminated_literal_is_invalid_input() {
        let err = rewrite_placeholders("SELECT 'open @Id", &params(), DatabaseType::SQLite)
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidInput { .. }));
    }

    #[test]
    fn test_decimal_binding_requires_finite_number() {
        assert_eq!(decimal_as_f64(" 12.50 "), Some(12.5));
        assert_eq!(decimal_as_f64("inf"), None);
        assert_eq!(decimal_as_f64("NaN"), None);
        assert_eq!(decimal_as_f64("twelve"), None);
    }

    #[test]
    fn test_unknown_names_are_left_alone() {
        let params = params();
        let stmt = rewrite_placeholders(
            "SET @counter = @Id + 1; SELECT @Identity",
            &params,
            DatabaseType::MySQL,
        )
        .unwrap();
        assert_eq!(stmt.sql, "SET @counter = ? + 1; SELECT @Identity");
        assert_eq!(stmt.bindings.len(), 1);
    }

    #[test]
    fn test_unreferenced_parameters_are_not_bound() {
        let params = params();
        let stmt = rewrite_placeholders("SELECT 1", &params, DatabaseType::SQLite).unwrap();
        assert_eq!(stmt.sql, "SELECT 1");
        assert!(stmt.bindings.is_empty());
    }

    #[test]
    fn test_non_ascii_text_is_preserved() {
        let params = params();
        let stmt = rewrite_placeholders(
            "SELECT '中文' AS label, @name",
            &params,
            DatabaseType::SQLite,
        )
        .unwrap();
        assert_eq!(stmt.sql, "SELECT '中文' AS label, ?1");
    }

    #[test]
    fn test_procedure_call_text() {
        let params = ParameterSet::new().with("a", 1).with("b", "two");
        assert_eq!(
            procedure_call_text("sp_do", &params, DatabaseType::MySQL).unwrap(),
            "CALL sp_do(@a, @b)"
        );
        assert_eq!(
            procedure_call_text("app.refresh", &ParameterSet::new(), DatabaseType::PostgreSQL)
                .unwrap(),
            "CALL app.refresh()"
        );
    }

    #[test]
    fn test_procedure_call_rejected() {
        let params = ParameterSet::new();
        let err = procedure_call_text("sp_do", &params, DatabaseType::SQLite).unwrap_err();
        assert!(matches!(err, DbError::InvalidInput { .. }));

        let err =
            procedure_call_text("x; DROP TABLE t", &params, DatabaseType::MySQL).unwrap_err();
        assert!(matches!(err, DbError::InvalidInput { .. }));
    }
}
