//! Query parameter list.
//!
//! Parameters travel in text format: each value is its textual
//! representation (or SQL NULL) plus its byte length.

use crate::types::Value;

/// Ordered, text-encoded query parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamList {
    values: Vec<Option<Vec<u8>>>,
    lengths: Vec<i32>,
}

impl ParamList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a list from typed values.
    pub fn from_values(values: &[Value]) -> Self {
        let mut list = Self::new();
        for value in values {
            list.add(value);
        }
        list
    }

    /// Append one value.
    pub fn add(&mut self, value: &Value) {
        let encoded = encode_text(value);
        self.lengths
            .push(encoded.as_ref().map(|v| v.len() as i32).unwrap_or(0));
        self.values.push(encoded);
    }

    pub fn values(&self) -> &[Option<Vec<u8>>] {
        &self.values
    }

    /// Byte lengths, 0 for NULL.
    pub fn lengths(&self) -> &[i32] {
        &self.lengths
    }

    pub fn count(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
        self.lengths.clear();
    }
}

fn encode_text(value: &Value) -> Option<Vec<u8>> {
    let text = match value {
        Value::Null => return None,
        Value::Int(n) => itoa::Buffer::new().format(*n).to_string(),
        Value::UInt(n) => itoa::Buffer::new().format(*n).to_string(),
        Value::BigInt(n) => itoa::Buffer::new().format(*n).to_string(),
        Value::Float(f) if f.is_nan() => "NaN".to_string(),
        Value::Float(f) if f.is_infinite() => {
            (if *f > 0.0 { "Infinity" } else { "-Infinity" }).to_string()
        }
        Value::Float(f) => ryu::Buffer::new().format_finite(*f).to_string(),
        Value::Bool(b) => (if *b { "t" } else { "f" }).to_string(),
        Value::Char(c) => c.to_string(),
        Value::Date(d) => d.format("%Y-%m-%d").to_string(),
        Value::Time(t) => t.format("%H:%M:%S%.f").to_string(),
        Value::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
        Value::Text(s) => s.clone(),
    };
    Some(text.into_bytes())
}
