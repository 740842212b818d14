//! Statement parameters.
//!
//! Parameters are first-class data: an ordered list of name, value and optional declared
//! SQL type. The same list drives driver binding and the diagnostic rendering.

use chrono::NaiveDateTime;
use serde::Serialize;
use serde_json::Value as JsonValue;

/// A typed parameter value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Bool(bool),
    TinyInt(u8),
    SmallInt(i16),
    Int(i32),
    BigInt(i64),
    /// Fixed-point value kept in its textual form to avoid precision loss
    Decimal(String),
    Float(f64),
    Real(f32),
    DateTime(NaiveDateTime),
    Text(String),
    /// Binary data (base64 encoded in JSON)
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
}

impl SqlValue {
    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this value for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::TinyInt(_) => "tinyint",
            Self::SmallInt(_) => "smallint",
            Self::Int(_) => "int",
            Self::BigInt(_) => "bigint",
            Self::Decimal(_) => "decimal",
            Self::Float(_) => "float",
            Self::Real(_) => "real",
            Self::DateTime(_) => "datetime",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
        }
    }
}

/// Custom serialization for binary data as base64.
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Serialize, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }
}

macro_rules! impl_from_value {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for SqlValue {
                fn from(value: $ty) -> Self {
                    Self::$variant(value)
                }
            }
        )*
    };
}

impl_from_value! {
    bool => Bool,
    u8 => TinyInt,
    i16 => SmallInt,
    i32 => Int,
    i64 => BigInt,
    f64 => Float,
    f32 => Real,
    NaiveDateTime => DateTime,
    String => Text,
    Vec<u8> => Bytes,
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<&[u8]> for SqlValue {
    fn from(value: &[u8]) -> Self {
        Self::Bytes(value.to_vec())
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl From<JsonValue> for SqlValue {
    /// Integers narrow to the smallest of `Int`/`BigInt` that fits; unsigned values beyond
    /// `i64` become `Decimal`. Arrays and objects are passed as their JSON text.
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Bool(b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    i32::try_from(i).map_or(Self::BigInt(i), Self::Int)
                } else if n.is_u64() {
                    Self::Decimal(n.to_string())
                } else {
                    n.as_f64().map_or(Self::Null, Self::Float)
                }
            }
            JsonValue::String(s) => Self::Text(s),
            other => Self::Text(other.to_string()),
        }
    }
}

/// One named parameter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SqlParam {
    /// Stored without the leading `@`
    pub name: String,
    pub value: SqlValue,
    /// Overrides the type inferred from `value` in diagnostic output
    #[serde(skip_serializing_if = "Option::is_none")]
    pub declared_type: Option<String>,
}

/// Ordered set of named parameters with unique names.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ParameterSet {
    params: Vec<SqlParam>,
}

fn normalize_name(name: &str) -> String {
    name.trim().trim_start_matches('@').to_string()
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter, builder style.
    pub fn with(mut self, name: impl AsRef<str>, value: impl Into<SqlValue>) -> Self {
        self.add(name, value);
        self
    }

    /// Add a parameter with an explicit SQL type, builder style.
    pub fn with_typed(
        mut self,
        name: impl AsRef<str>,
        value: impl Into<SqlValue>,
        declared_type: impl Into<String>,
    ) -> Self {
        self.insert(SqlParam {
            name: normalize_name(name.as_ref()),
            value: value.into(),
            declared_type: Some(declared_type.into()),
        });
        self
    }

    /// Add a parameter. An existing parameter with the same name is replaced in place.
    pub fn add(&mut self, name: impl AsRef<str>, value: impl Into<SqlValue>) -> &mut Self {
        self.insert(SqlParam {
            name: normalize_name(name.as_ref()),
            value: value.into(),
            declared_type: None,
        });
        self
    }

    fn insert(&mut self, param: SqlParam) {
        match self
            .params
            .iter_mut()
            .find(|existing| existing.name.eq_ignore_ascii_case(&param.name))
        {
            Some(existing) => *existing = param,
            None => self.params.push(param),
        }
    }

    /// Look up a parameter by name (with or without `@`, case-insensitive).
    pub fn get(&self, name: &str) -> Option<&SqlParam> {
        let name = normalize_name(name);
        self.params
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(&name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SqlParam> {
        self.params.iter()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

impl<'a> IntoIterator for &'a ParameterSet {
    type Item = &'a SqlParam;
    type IntoIter = std::slice::Iter<'a, SqlParam>;

    fn into_iter(self) -> Self::IntoIter {
        self.params.iter()
    }
}

impl<K: AsRef<str>, V: Into<SqlValue>> FromIterator<(K, V)> for ParameterSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut set = Self::new();
        for (name, value) in iter {
            set.add(name, value);
        }
        set
    }
}

/// How the statement text is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    #[default]
    Text,
    /// The text is a procedure name, invoked with every parameter in order
    StoredProcedure,
}
