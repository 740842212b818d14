//! Human-readable rendering of a statement with its parameter values.
//!
//! The output declares every parameter as a T-SQL style variable followed by the statement
//! text, so it can be pasted into a query window when reading logs. It is never executed.

use crate::db::params::decimal_as_f64;
use crate::models::{ParameterSet, SqlParam, SqlValue};
use base64::{Engine as _, engine::general_purpose::STANDARD};

const TEXT_TYPE: &str = "NVARCHAR(MAX)";

/// Render `DECLARE` lines for `params`, a blank line, then `sql` verbatim.
///
/// A blank statement renders as an empty string. Without parameters the output is the blank
/// line followed by the statement.
pub fn build_final_query(sql: &str, params: &ParameterSet) -> String {
    if sql.trim().is_empty() {
        return String::new();
    }

    let mut out = String::with_capacity(sql.len() + params.len() * 48);
    for param in params {
        out.push_str(&declare_line(param));
        out.push('\n');
    }
    out.push('\n');
    out.push_str(sql);
    out
}

fn declare_line(param: &SqlParam) -> String {
    let (inferred, literal) = type_and_literal(&param.value);
    let sql_type = param.declared_type.as_deref().unwrap_or(inferred);
    format!("DECLARE @{} {} = {};", param.name, sql_type, literal)
}

fn quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

fn type_and_literal(value: &SqlValue) -> (&'static str, String) {
    match value {
        SqlValue::Null => (TEXT_TYPE, "NULL".to_string()),
        SqlValue::Bool(v) => ("BIT", if *v { "1" } else { "0" }.to_string()),
        SqlValue::TinyInt(v) => ("TINYINT", v.to_string()),
        SqlValue::SmallInt(v) => ("SMALLINT", v.to_string()),
        SqlValue::Int(v) => ("INT", v.to_string()),
        SqlValue::BigInt(v) => ("BIGINT", v.to_string()),
        SqlValue::Decimal(v) => {
            let literal = match decimal_as_f64(v) {
                Some(_) => v.trim().to_string(),
                None => quote(v),
            };
            ("DECIMAL(18, 4)", literal)
        }
        SqlValue::Float(v) => ("FLOAT", float_literal(*v)),
        SqlValue::Real(v) => ("REAL", float_literal(f64::from(*v))),
        SqlValue::DateTime(v) => (
            "DATETIME",
            quote(&v.format("%Y-%m-%d %H:%M:%S%.3f").to_string()),
        ),
        SqlValue::Text(v) => (TEXT_TYPE, quote(v)),
        SqlValue::Bytes(v) => (TEXT_TYPE, quote(&STANDARD.encode(v))),
    }
}

fn float_literal(v: f64) -> String {
    if v.is_finite() {
        v.to_string()
    } else {
        quote(&v.to_string())
    }
}
