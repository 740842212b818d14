//! Row decoding into JSON values.
//!
//! Type conversion uses a two-phase approach:
//! 1. `TypeCategory` classifies column types into logical categories
//! 2. Database-specific decoders handle the actual value extraction
//!
//! SQLite columns are loosely typed, so SQLite values are classified by the type of the
//! value actually stored rather than the declared column type.

use crate::models::DatabaseType;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Row, Type, TypeInfo, ValueRef};
use uuid::Uuid;

/// A decoded row, keyed by column name in select order.
pub type JsonRow = serde_json::Map<String, JsonValue>;

// =============================================================================
// Type Classification
// =============================================================================

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Temporal,
    Text,
    Binary,
    Json,
    Uuid,
    Null,
    Unknown,
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, db: DatabaseType) -> TypeCategory {
    let lower = type_name.to_lowercase();

    if lower == "null" {
        return TypeCategory::Null;
    }

    // Decimal/Numeric - check first as it overlaps with "numeric" in float checks
    if lower.contains("decimal") || lower.contains("numeric") {
        // SQLite's NUMERIC is actually a float
        if db == DatabaseType::SQLite && lower == "numeric" {
            return TypeCategory::Float;
        }
        return TypeCategory::Decimal;
    }

    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }

    if lower.contains("timestamp")
        || lower.contains("datetime")
        || lower == "date"
        || lower == "time"
        || lower == "timetz"
    {
        // SQLite stores dates as text
        if db == DatabaseType::SQLite {
            return TypeCategory::Text;
        }
        return TypeCategory::Temporal;
    }

    if lower.contains("int") || lower.contains("serial") || lower.contains("tiny") {
        return TypeCategory::Integer;
    }

    if lower.contains("float")
        || lower.contains("double")
        || lower == "real"
        || lower == "float4"
        || lower == "float8"
    {
        return TypeCategory::Float;
    }

    if lower == "json" || lower == "jsonb" {
        return TypeCategory::Json;
    }

    if lower == "uuid" {
        return TypeCategory::Uuid;
    }

    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return TypeCategory::Binary;
    }

    if lower.contains("char") || lower.contains("text") {
        return TypeCategory::Text;
    }

    TypeCategory::Unknown
}

// =============================================================================
// Decimal Type Support
// =============================================================================

/// Wrapper type for raw DECIMAL/NUMERIC values as strings.
/// This preserves the exact database representation.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("decimal") || name.contains("numeric")
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::MySql>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        <String as Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("numeric") || name.contains("decimal")
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::Postgres>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

// =============================================================================
// Value Helpers
// =============================================================================

/// Encode binary data as a base64 JSON string.
pub fn encode_binary_value(bytes: &[u8]) -> JsonValue {
    use base64::{Engine as _, engine::general_purpose::STANDARD};

    JsonValue::String(STANDARD.encode(bytes))
}

fn float_value(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

fn text_value(v: String, type_name: &str) -> JsonValue {
    if type_name.to_lowercase().contains("json") {
        if let Ok(json) = serde_json::from_str::<JsonValue>(&v) {
            return json;
        }
    }
    JsonValue::String(v)
}

// =============================================================================
// Row to JSON Trait
// =============================================================================

/// Trait for converting database rows to JSON.
pub trait RowToJson {
    fn column_names(&self) -> Vec<String>;

    /// Decode a single column; undecodable values become `Null`.
    fn column_value(&self, idx: usize) -> JsonValue;

    fn to_json_map(&self) -> JsonRow {
        self.column_names()
            .into_iter()
            .enumerate()
            .map(|(idx, name)| (name, self.column_value(idx)))
            .collect()
    }

    /// First column of the row, or `Null` for a row without columns.
    fn first_value(&self) -> JsonValue {
        if self.column_names().is_empty() {
            JsonValue::Null
        } else {
            self.column_value(0)
        }
    }
}

impl RowToJson for MySqlRow {
    fn column_names(&self) -> Vec<String> {
        self.columns().iter().map(|c| c.name().to_string()).collect()
    }

    fn column_value(&self, idx: usize) -> JsonValue {
        let Some(col) = self.columns().get(idx) else {
            return JsonValue::Null;
        };
        let type_name = col.type_info().name();
        decode_mysql(
            self,
            idx,
            type_name,
            categorize_type(type_name, DatabaseType::MySQL),
        )
    }
}

impl RowToJson for PgRow {
    fn column_names(&self) -> Vec<String> {
        self.columns().iter().map(|c| c.name().to_string()).collect()
    }

    fn column_value(&self, idx: usize) -> JsonValue {
        let Some(col) = self.columns().get(idx) else {
            return JsonValue::Null;
        };
        let type_name = col.type_info().name();
        decode_postgres(
            self,
            idx,
            type_name,
            categorize_type(type_name, DatabaseType::PostgreSQL),
        )
    }
}

impl RowToJson for SqliteRow {
    fn column_names(&self) -> Vec<String> {
        self.columns().iter().map(|c| c.name().to_string()).collect()
    }

    fn column_value(&self, idx: usize) -> JsonValue {
        let Some(col) = self.columns().get(idx) else {
            return JsonValue::Null;
        };
        decode_sqlite(self, idx, col.type_info().name())
    }
}

// =============================================================================
// Database-Specific Decoders
// =============================================================================

/// Try each Rust type in order and convert the first one the column decodes as.
macro_rules! first_decoded {
    ($row:expr, $idx:expr, $($ty:ty => $to_json:expr),+ $(,)?) => {{
        let mut value = None;
        $(
            if value.is_none() {
                if let Ok(Some(v)) = $row.try_get::<Option<$ty>, _>($idx) {
                    value = Some(($to_json)(v));
                }
            }
        )+
        value.unwrap_or_else(|| {
            tracing::debug!(column = $idx, "No decoder matched column value");
            JsonValue::Null
        })
    }};
}

/// Decoder for a strictly typed server backend. Integer widths are tried narrowest
/// first; `fallback` lists extra types tried after text and bytes.
macro_rules! server_decoder {
    (
        $name:ident, $row:ty,
        integers: [$($int:ty),+],
        fallback: [$($extra:ty => $extra_json:expr),*]
    ) => {
        fn $name(row: &$row, idx: usize, type_name: &str, category: TypeCategory) -> JsonValue {
            match row.try_get_raw(idx) {
                Ok(raw) if !raw.is_null() => {}
                _ => return JsonValue::Null,
            }

            match category {
                TypeCategory::Null => JsonValue::Null,
                TypeCategory::Decimal => {
                    first_decoded!(row, idx, RawDecimal => |v: RawDecimal| JsonValue::String(v.0))
                }
                TypeCategory::Integer => {
                    first_decoded!(row, idx, $($int => |v: $int| JsonValue::from(v)),+)
                }
                TypeCategory::Boolean => first_decoded!(row, idx, bool => JsonValue::Bool),
                TypeCategory::Float => first_decoded!(
                    row,
                    idx,
                    f64 => float_value,
                    f32 => |v: f32| float_value(f64::from(v)),
                ),
                TypeCategory::Temporal => first_decoded!(
                    row,
                    idx,
                    NaiveDateTime => |v: NaiveDateTime| JsonValue::String(v.to_string()),
                    DateTime<Utc> => |v: DateTime<Utc>| JsonValue::String(v.to_rfc3339()),
                    NaiveDate => |v: NaiveDate| JsonValue::String(v.to_string()),
                    NaiveTime => |v: NaiveTime| JsonValue::String(v.to_string()),
                ),
                TypeCategory::Binary => {
                    first_decoded!(row, idx, Vec<u8> => |v: Vec<u8>| encode_binary_value(&v))
                }
                TypeCategory::Json => first_decoded!(
                    row,
                    idx,
                    JsonValue => |v: JsonValue| v,
                    String => |v: String| text_value(v, type_name),
                ),
                // Binary collations report VARBINARY for computed text columns
                _ => first_decoded!(
                    row,
                    idx,
                    String => |v: String| text_value(v, type_name),
                    Vec<u8> => |v: Vec<u8>| encode_binary_value(&v)
                    $(, $extra => $extra_json)*
                ),
            }
        }
    };
}

server_decoder!(
    decode_mysql, MySqlRow,
    integers: [i8, i16, i32, i64, u8, u16, u32, u64],
    fallback: []
);

server_decoder!(
    decode_postgres, PgRow,
    integers: [i16, i32, i64],
    fallback: [Uuid => |v: Uuid| JsonValue::String(v.to_string())]
);

fn decode_sqlite(row: &SqliteRow, idx: usize, declared_type: &str) -> JsonValue {
    let runtime_type = match row.try_get_raw(idx) {
        Ok(raw) if raw.is_null() => return JsonValue::Null,
        Ok(raw) => raw.type_info().name().to_string(),
        Err(_) => return JsonValue::Null,
    };

    let declared = categorize_type(declared_type, DatabaseType::SQLite);
    let category = match categorize_type(&runtime_type, DatabaseType::SQLite) {
        // Booleans are stored as integers
        TypeCategory::Integer if declared == TypeCategory::Boolean => TypeCategory::Boolean,
        other => other,
    };

    match category {
        TypeCategory::Integer => first_decoded!(row, idx, i64 => |v: i64| JsonValue::from(v)),
        TypeCategory::Boolean => first_decoded!(row, idx, bool => JsonValue::Bool),
        TypeCategory::Float | TypeCategory::Decimal => first_decoded!(row, idx, f64 => float_value),
        TypeCategory::Binary => {
            first_decoded!(row, idx, Vec<u8> => |v: Vec<u8>| encode_binary_value(&v))
        }
        _ => first_decoded!(row, idx, String => |v: String| text_value(v, declared_type)),
    }
}
