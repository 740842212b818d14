//! Integration tests for the statement executor result shapes on SQLite.

use db_txn_executor::BlockingRuntime;
use db_txn_executor::db::{JsonRow, SqlExecution};
use db_txn_executor::error::DbError;
use db_txn_executor::models::{ExecutionContext, ParameterSet, SqlValue, StatementInvocation};
use serde_json::json;
use std::time::Duration;
use tempfile::NamedTempFile;

async fn seeded() -> (NamedTempFile, ExecutionContext) {
    let temp_file = NamedTempFile::new().unwrap();
    let db_path = temp_file.path().to_str().unwrap().to_string();
    let ctx = ExecutionContext::new(format!("sqlite:{}", db_path));

    for sql in [
        "CREATE TABLE products (id INTEGER PRIMARY KEY, name TEXT NOT NULL, price REAL, active BOOLEAN, notes TEXT)",
        "INSERT INTO products (name, price, active, notes) VALUES ('Widget', 9.5, 1, NULL)",
        "INSERT INTO products (name, price, active, notes) VALUES ('Gadget', 20.0, 0, 'fragile')",
        "INSERT INTO products (name, price, active, notes) VALUES ('Doohickey', 3.25, 1, '日本語')",
    ] {
        SqlExecution::new(
            ctx.clone(),
            StatementInvocation::text(sql, ParameterSet::new()),
        )
        .execute()
        .await
        .unwrap();
    }
    (temp_file, ctx)
}

fn text(sql: &str, params: ParameterSet) -> StatementInvocation {
    StatementInvocation::text(sql, params)
}

#[tokio::test]
async fn test_query_returns_typed_rows() {
    let (_file, ctx) = seeded().await;

    let rows = SqlExecution::new(
        ctx,
        text(
            "SELECT id, name, price, active, notes FROM products WHERE price > @min ORDER BY id",
            ParameterSet::new().with("min", 5),
        ),
    )
    .query()
    .await
    .unwrap();

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["name"], json!("Widget"));
    assert_eq!(rows[0]["price"], json!(9.5));
    assert_eq!(rows[0]["active"], json!(true));
    assert_eq!(rows[0]["notes"], json!(null));
    assert_eq!(rows[1]["active"], json!(false));
    assert_eq!(rows[1]["notes"], json!("fragile"));

    // Column order follows the select list
    let columns: Vec<_> = rows[0].keys().cloned().collect();
    assert_eq!(columns, vec!["id", "name", "price", "active", "notes"]);
}

#[tokio::test]
async fn test_first_or_default() {
    let (_file, ctx) = seeded().await;

    let row = SqlExecution::new(
        ctx.clone(),
        text(
            "SELECT name, notes FROM products WHERE id = @id",
            ParameterSet::new().with("@id", 3),
        ),
    )
    .first_or_default()
    .await
    .unwrap()
    .unwrap();
    assert_eq!(row["notes"], json!("日本語"));

    let missing = SqlExecution::new(
        ctx,
        text(
            "SELECT name FROM products WHERE id = @id",
            ParameterSet::new().with("id", 999),
        ),
    )
    .first_or_default()
    .await
    .unwrap();
    assert!(missing.is_none());
}

#[tokio::test]
async fn test_scalar_variants() {
    let (_file, ctx) = seeded().await;

    let total = SqlExecution::new(
        ctx.clone(),
        text("SELECT COUNT(*) FROM products", ParameterSet::new()),
    )
    .execute_scalar()
    .await
    .unwrap();
    assert_eq!(total, json!(3));

    let doubled = SqlExecution::new(
        ctx.clone(),
        text("SELECT @a + @A AS s", ParameterSet::new().with("a", 21)),
    )
    .execute_scalar()
    .await
    .unwrap();
    assert_eq!(doubled, json!(42));

    let none = SqlExecution::new(
        ctx,
        text(
            "SELECT name FROM products WHERE id < @id",
            ParameterSet::new().with("id", 0),
        ),
    )
    .execute_scalar()
    .await
    .unwrap();
    assert_eq!(none, json!(null));
}

#[tokio::test]
async fn test_placeholders_inside_literals_are_untouched() {
    let (_file, ctx) = seeded().await;

    let value = SqlExecution::new(
        ctx,
        text(
            "SELECT '@name' || ' ' || @name -- @name in a comment",
            ParameterSet::new().with("name", "Widget"),
        ),
    )
    .execute_scalar()
    .await
    .unwrap();
    assert_eq!(value, json!("@name Widget"));
}

#[tokio::test]
async fn test_query_multiple_returns_one_set_per_statement() {
    let (_file, ctx) = seeded().await;

    let sets = SqlExecution::new(
        ctx,
        text(
            "SELECT name FROM products WHERE id = 1; SELECT id FROM products ORDER BY id",
            ParameterSet::new(),
        ),
    )
    .query_multiple()
    .await
    .unwrap();

    assert_eq!(sets.len(), 2);
    assert_eq!(sets[0].len(), 1);
    assert_eq!(sets[0][0]["name"], json!("Widget"));
    assert_eq!(sets[1].len(), 3);
}

#[tokio::test]
async fn test_read_rows_streams_in_order() {
    let (_file, ctx) = seeded().await;

    let mut names = Vec::new();
    let count = SqlExecution::new(
        ctx,
        text("SELECT name FROM products ORDER BY id", ParameterSet::new()),
    )
    .read_rows(|row| {
        names.push(row["name"].as_str().unwrap_or_default().to_string());
        Ok(())
    })
    .await
    .unwrap();

    assert_eq!(count, 3);
    assert_eq!(names, vec!["Widget", "Gadget", "Doohickey"]);
}

#[tokio::test]
async fn test_read_rows_stops_on_callback_error() {
    let (_file, ctx) = seeded().await;

    let mut seen = 0;
    let result = SqlExecution::new(
        ctx,
        text("SELECT name FROM products ORDER BY id", ParameterSet::new()),
    )
    .read_rows(|_row| {
        seen += 1;
        if seen == 2 {
            return Err(DbError::invalid_input("stop reading"));
        }
        Ok(())
    })
    .await;

    assert!(matches!(result, Err(DbError::InvalidInput { .. })));
    assert_eq!(seen, 2);
}

#[tokio::test]
async fn test_blank_statement_does_nothing() {
    let ctx = ExecutionContext::new("sqlite::memory:");

    let affected = SqlExecution::new(ctx.clone(), text("   ", ParameterSet::new()))
        .execute()
        .await
        .unwrap();
    assert_eq!(affected, 0);

    let rows = SqlExecution::new(ctx, text("", ParameterSet::new()))
        .query()
        .await
        .unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn test_stored_procedure_rejected_on_sqlite() {
    let ctx = ExecutionContext::new("sqlite::memory:");
    let result = SqlExecution::new(
        ctx,
        StatementInvocation::procedure("refresh_totals", ParameterSet::new().with("id", 1)),
    )
    .execute()
    .await;
    assert!(matches!(result, Err(DbError::InvalidInput { .. })));
}

#[tokio::test]
async fn test_timeout_is_reported() {
    let ctx = ExecutionContext::new("sqlite::memory:").with_timeout(Duration::from_millis(50));
    // Recursive CTE that runs far longer than the timeout
    let result = SqlExecution::new(
        ctx,
        text(
            "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 20000000) \
             SELECT MAX(x) FROM c",
            ParameterSet::new(),
        ),
    )
    .execute_scalar()
    .await;
    assert!(matches!(result, Err(DbError::Timeout { .. })));
}

#[tokio::test]
async fn test_null_and_binary_parameters() {
    let ctx = ExecutionContext::new("sqlite::memory:");
    let row = SqlExecution::new(
        ctx,
        text(
            "SELECT @missing AS missing, @blob AS blob",
            ParameterSet::new()
                .with("missing", SqlValue::Null)
                .with("blob", vec![1u8, 2, 3]),
        ),
    )
    .first_or_default()
    .await
    .unwrap()
    .unwrap();
    assert_eq!(row["missing"], json!(null));
    assert_eq!(row["blob"], json!("AQID"));
}

#[test]
fn test_blocking_runtime_runs_outside_async() {
    let temp_file = NamedTempFile::new().unwrap();
    let db_path = temp_file.path().to_str().unwrap().to_string();
    let ctx = ExecutionContext::new(format!("sqlite:{}", db_path));

    let rt = BlockingRuntime::new().unwrap();
    rt.execute(SqlExecution::new(
        ctx.clone(),
        text("CREATE TABLE t (v INTEGER)", ParameterSet::new()),
    ))
    .unwrap();
    rt.execute(SqlExecution::new(
        ctx.clone(),
        text("INSERT INTO t (v) VALUES (@v)", ParameterSet::new().with("v", 7)),
    ))
    .unwrap();

    let sets = rt
        .query_multiple(SqlExecution::new(
            ctx,
            text("SELECT v FROM t", ParameterSet::new()),
        ))
        .unwrap();
    let expected: JsonRow = serde_json::from_value(json!({"v": 7})).unwrap();
    assert_eq!(sets, vec![vec![expected]]);
}
