//! Owned, dialect-independent bound-parameter values.
//!
//! Compiled statements carry their parameters as [`SqlValue`]s so that the
//! fragment/compiler layer stays driver-agnostic: a driver adapter (see the
//! `pg` module) translates them to its wire representation at execution time.

use crate::error::{OrmError, OrmResult};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use uuid::Uuid;

/// A bound parameter value.
///
/// `Null` still occupies a placeholder slot when compiled; whether a missing
/// value becomes a default substitution or an error is the statement
/// builder's decision, not this layer's.
///
/// Serializes untagged, so a parameter list reads as plain JSON values in
/// logs and statement snapshots.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
    Uuid(Uuid),
    Timestamp(DateTime<Utc>),
    Date(NaiveDate),
}

impl SqlValue {
    /// Whether this value is SQL NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Convert to a JSON value for the planner's row reducer.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            SqlValue::Null => serde_json::Value::Null,
            SqlValue::Bool(b) => serde_json::Value::Bool(*b),
            SqlValue::Int(i) => serde_json::Value::from(*i),
            SqlValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            SqlValue::Text(s) => serde_json::Value::String(s.clone()),
            SqlValue::Bytes(b) => serde_json::Value::String(
                b.iter().map(|x| format!("{x:02x}")).collect::<String>(),
            ),
            SqlValue::Json(v) => v.clone(),
            SqlValue::Uuid(u) => serde_json::Value::String(u.to_string()),
            SqlValue::Timestamp(t) => serde_json::Value::String(t.to_rfc3339()),
            SqlValue::Date(d) => serde_json::Value::String(d.to_string()),
        }
    }

    /// Parse this value as a JSON document.
    ///
    /// Drivers return relation columns produced by `for json` subqueries as a
    /// single text value; `Json` values pass through unchanged.
    pub fn parse_json(&self, column: &str) -> OrmResult<serde_json::Value> {
        match self {
            SqlValue::Null => Ok(serde_json::Value::Null),
            SqlValue::Json(v) => Ok(v.clone()),
            SqlValue::Text(s) => serde_json::from_str(s)
                .map_err(|e| OrmError::decode(column, format!("invalid JSON: {e}"))),
            other => Err(OrmError::decode(
                column,
                format!("expected JSON text, got {other:?}"),
            )),
        }
    }
}

macro_rules! impl_from_scalar {
    ($($ty:ty => $variant:ident $(as $cast:ty)?),+ $(,)?) => {
        $(
            impl From<$ty> for SqlValue {
                fn from(v: $ty) -> Self {
                    SqlValue::$variant(v $(as $cast)?)
                }
            }
        )+
    };
}

impl_from_scalar! {
    bool => Bool,
    i16 => Int as i64,
    i32 => Int as i64,
    i64 => Int,
    f32 => Float as f64,
    f64 => Float,
    String => Text,
    Vec<u8> => Bytes,
    serde_json::Value => Json,
    Uuid => Uuid,
    DateTime<Utc> => Timestamp,
    NaiveDate => Date,
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl<T> From<Option<T>> for SqlValue
where
    T: Into<SqlValue>,
{
    fn from(v: Option<T>) -> Self {
        v.map_or(SqlValue::Null, Into::into)
    }
}
