//! Value model and server type mapping.
//!
//! Result cells arrive as text. [`TypeMapper`] decides which native
//! [`ValueKind`] a server type maps to, how its column is aligned and how the
//! raw text decodes into a [`Value`].

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::Serialize;

use crate::protocol::oid;

/// Native kind of a result column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Int,
    UInt,
    BigInt,
    Float,
    Bool,
    Char,
    Date,
    Time,
    DateTime,
    Text,
}

/// A nullable typed cell value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Int(i32),
    UInt(u32),
    BigInt(i64),
    Float(f64),
    Bool(bool),
    Char(char),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Kind of a non-null value.
    pub fn kind(&self) -> Option<ValueKind> {
        Some(match self {
            Value::Null => return None,
            Value::Int(_) => ValueKind::Int,
            Value::UInt(_) => ValueKind::UInt,
            Value::BigInt(_) => ValueKind::BigInt,
            Value::Float(_) => ValueKind::Float,
            Value::Bool(_) => ValueKind::Bool,
            Value::Char(_) => ValueKind::Char,
            Value::Date(_) => ValueKind::Date,
            Value::Time(_) => ValueKind::Time,
            Value::DateTime(_) => ValueKind::DateTime,
            Value::Text(_) => ValueKind::Text,
        })
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Int(v) => write!(f, "{}", v),
            Value::UInt(v) => write!(f, "{}", v),
            Value::BigInt(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Char(v) => write!(f, "{}", v),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::Time(t) => write!(f, "{}", t.format("%H:%M:%S%.3f")),
            Value::DateTime(dt) => {
                if dt.time().num_seconds_from_midnight() == 0 && dt.time().nanosecond() == 0 {
                    write!(f, "{}", dt.format("%Y-%m-%d"))
                } else {
                    write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S%.3f"))
                }
            }
            Value::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Display alignment of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Alignment {
    Left,
    Right,
}

/// Maps server type ids to native kinds and decodes text cells.
pub trait TypeMapper: Send + Sync {
    fn value_kind(&self, type_id: u32) -> ValueKind;

    /// Numeric types are right-aligned.
    fn is_numeric_type(&self, type_id: u32) -> bool;

    /// Types whose literals need no quoting.
    fn is_unquoted_type(&self, type_id: u32) -> bool;

    fn alignment(&self, type_id: u32) -> Alignment {
        if self.is_numeric_type(type_id) {
            Alignment::Right
        } else {
            Alignment::Left
        }
    }

    /// Decimal digits of a fixed-point column, if the type carries them.
    fn decimal_digits(&self, type_id: u32, type_modifier: i32) -> Option<u16>;

    /// Decode a non-null text cell.
    fn decode(&self, type_id: u32, raw: &[u8]) -> Value;

    /// Render a value as an SQL literal.
    fn literal(&self, value: &Value) -> String {
        match value {
            Value::Null => "NULL".to_string(),
            // bare NaN or inf would parse as identifiers
            Value::Float(f) if f.is_nan() => "'NaN'".to_string(),
            Value::Float(f) if f.is_infinite() => {
                if *f > 0.0 { "'Infinity'" } else { "'-Infinity'" }.to_string()
            }
            Value::Int(_)
            | Value::UInt(_)
            | Value::BigInt(_)
            | Value::Float(_)
            | Value::Bool(_) => value.to_string(),
            other => format!("'{}'", other.to_string().replace('\'', "''")),
        }
    }
}

/// PostgreSQL text-format type mapping.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgTypeMapper;

impl TypeMapper for PgTypeMapper {
    fn value_kind(&self, type_id: u32) -> ValueKind {
        match type_id {
            oid::INT2 | oid::INT4 => ValueKind::Int,
            oid::OID | oid::REGPROC | oid::XID | oid::CID => ValueKind::UInt,
            oid::INT8 | oid::ABSTIME => ValueKind::BigInt,
            oid::FLOAT4 | oid::FLOAT8 => ValueKind::Float,
            oid::BOOL => ValueKind::Bool,
            oid::CHAR => ValueKind::Char,
            oid::DATE => ValueKind::Date,
            oid::TIME => ValueKind::Time,
            oid::TIMESTAMP | oid::TIMESTAMPTZ => ValueKind::DateTime,
            _ => ValueKind::Text,
        }
    }

    fn is_numeric_type(&self, type_id: u32) -> bool {
        matches!(
            type_id,
            oid::INT2
                | oid::INT4
                | oid::INT8
                | oid::OID
                | oid::TID
                | oid::XID
                | oid::CID
                | oid::FLOAT4
                | oid::FLOAT8
                | oid::NUMERIC
        )
    }

    fn is_unquoted_type(&self, type_id: u32) -> bool {
        type_id == oid::BOOL || self.is_numeric_type(type_id)
    }

    fn decimal_digits(&self, type_id: u32, type_modifier: i32) -> Option<u16> {
        // numeric typmod packs ((precision << 16) | scale) + VARHDRSZ
        (type_id == oid::NUMERIC && type_modifier != -1)
            .then(|| (type_modifier.wrapping_sub(4) & 0xffff) as u16)
    }

    fn decode(&self, type_id: u32, raw: &[u8]) -> Value {
        let text = String::from_utf8_lossy(raw);
        let parsed = match self.value_kind(type_id) {
            ValueKind::Int => text.parse().ok().map(Value::Int),
            ValueKind::UInt => text.parse().ok().map(Value::UInt),
            ValueKind::BigInt => text.parse().ok().map(Value::BigInt),
            ValueKind::Float => parse_float(&text).map(Value::Float),
            ValueKind::Bool => Some(Value::Bool(raw.first() == Some(&b't'))),
            ValueKind::Char => text.chars().next().map(Value::Char),
            ValueKind::Date => NaiveDate::parse_from_str(&text, "%Y-%m-%d")
                .ok()
                .map(Value::Date),
            ValueKind::Time => NaiveTime::parse_from_str(&text, "%H:%M:%S%.f")
                .ok()
                .map(Value::Time),
            ValueKind::DateTime => {
                NaiveDateTime::parse_from_str(strip_utc_offset(&text), "%Y-%m-%d %H:%M:%S%.f")
                    .ok()
                    .map(Value::DateTime)
            }
            ValueKind::Text => None,
        };
        parsed.unwrap_or_else(|| Value::Text(text.into_owned()))
    }
}

fn parse_float(text: &str) -> Option<f64> {
    match text {
        "NaN" => Some(f64::NAN),
        "Infinity" => Some(f64::INFINITY),
        "-Infinity" => Some(f64::NEG_INFINITY),
        _ => text.parse().ok(),
    }
}

/// Drop the `+HH[:MM]` / `-HH[:MM]` suffix of a timestamptz, keeping the
/// wall-clock time the server rendered in its session time zone.
fn strip_utc_offset(text: &str) -> &str {
    match text.rfind(['+', '-']) {
        // the date part has dashes too
        Some(pos) if pos > 10 => &text[..pos],
        _ => text,
    }
}
