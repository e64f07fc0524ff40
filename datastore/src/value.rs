//! Typed scalar values that flow between the tokenizer, the parse tree, the
//! SQL generator, and row scanning. One enum is shared across all three so a
//! literal parsed out of a URL and a value read back out of a database row
//! can be compared and rendered identically regardless of backend.

use std::cmp::Ordering;
use std::fmt;

use enum_as_inner::EnumAsInner;
use serde_json::Value as JsonValue;
use time::{Date, OffsetDateTime, Time};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, EnumAsInner)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(Date),
    Time(Time),
    DateTime(OffsetDateTime),
    Duration(time::Duration),
    Guid(Uuid),
}

impl SqlValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Int(_) => "integer",
            Self::Float(_) => "float",
            Self::Text(_) => "string",
            Self::Date(_) => "date",
            Self::Time(_) => "time",
            Self::DateTime(_) => "datetime",
            Self::Duration(_) => "duration",
            Self::Guid(_) => "guid",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Numeric ordering/equality spanning `Int` and `Float`; used by the
    /// in-memory `$compute`/`$search` evaluator, which never touches the
    /// database and so cannot rely on a backend's own coercion rules.
    pub fn partial_cmp_numeric(&self, other: &Self) -> Option<Ordering> {
        let (a, b) = (self.as_f64()?, other.as_f64()?);
        a.partial_cmp(&b)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Null => JsonValue::Null,
            Self::Bool(b) => JsonValue::Bool(*b),
            Self::Int(i) => JsonValue::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Self::Text(s) => JsonValue::String(s.clone()),
            Self::Date(d) => JsonValue::String(d.to_string()),
            Self::Time(t) => JsonValue::String(t.to_string()),
            Self::DateTime(dt) => JsonValue::String(
                dt.format(&time::format_description::well_known::Rfc3339)
                    .unwrap_or_else(|_| dt.to_string()),
            ),
            Self::Duration(d) => JsonValue::String(format_duration(*d)),
            Self::Guid(g) => JsonValue::String(g.to_string()),
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(n) => write!(f, "{n}"),
            Self::Text(s) => write!(f, "{s}"),
            Self::Date(d) => write!(f, "{d}"),
            Self::Time(t) => write!(f, "{t}"),
            Self::DateTime(dt) => write!(f, "{dt}"),
            Self::Duration(d) => write!(f, "{}", format_duration(*d)),
            Self::Guid(g) => write!(f, "{g}"),
        }
    }
}

fn format_duration(d: time::Duration) -> String {
    let total_seconds = d.whole_seconds();
    let sign = if total_seconds < 0 { "-" } else { "" };
    let secs = total_seconds.abs();
    format!("{sign}P{}DT{}H{}M{}S", secs / 86400, (secs % 86400) / 3600, (secs % 3600) / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_comparison_crosses_int_and_float() {
        let a = SqlValue::Int(3);
        let b = SqlValue::Float(3.0);
        assert_eq!(a.partial_cmp_numeric(&b), Some(Ordering::Equal));
    }

    #[test]
    fn null_json_round_trips() {
        assert_eq!(SqlValue::Null.to_json(), JsonValue::Null);
    }
}
