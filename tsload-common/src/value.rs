use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors produced while interpreting declared types and raw values.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseValueError {
    #[error("{0} is not a valid ValueType")]
    UnknownType(String),
    #[error("'{value}' cannot be parsed as {value_type}")]
    InvalidValue {
        value: String,
        value_type: ValueType,
    },
}

/// The closed set of column types a source may declare for tags and fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    String,
    Float32,
    Float64,
    Int32,
    Int64,
}

impl ValueType {
    /// Convert a raw serialized value into a typed `Value`.
    /// An empty raw value is a NULL of this type.
    pub fn parse(&self, raw: &str) -> Result<Value, ParseValueError> {
        if raw.is_empty() {
            return Ok(Value::Null(Some(*self)));
        }

        let invalid = || ParseValueError::InvalidValue {
            value: raw.to_owned(),
            value_type: *self,
        };

        match self {
            ValueType::String => Ok(Value::String(raw.to_owned())),
            ValueType::Float32 => raw.parse().map(Value::Float32).map_err(|_| invalid()),
            ValueType::Float64 => raw.parse().map(Value::Float64).map_err(|_| invalid()),
            ValueType::Int32 => raw.parse().map(Value::Int32).map_err(|_| invalid()),
            ValueType::Int64 => raw.parse().map(Value::Int64).map_err(|_| invalid()),
        }
    }

    pub fn is_numeric(&self) -> bool {
        !matches!(self, ValueType::String)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::String => "string",
            ValueType::Float32 => "float32",
            ValueType::Float64 => "float64",
            ValueType::Int32 => "int32",
            ValueType::Int64 => "int64",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Allow casting ValueType from the type names used in source headers.
impl FromStr for ValueType {
    type Err = ParseValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "string" => Ok(ValueType::String),
            "float32" => Ok(ValueType::Float32),
            "float64" => Ok(ValueType::Float64),
            "int32" => Ok(ValueType::Int32),
            "int64" => Ok(ValueType::Int64),
            invalid => Err(ParseValueError::UnknownType(invalid.to_owned())),
        }
    }
}

/// A single cell ready to be written to a store.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// A NULL, carrying the declared type when one is known so adapters can bind it.
    Null(Option<ValueType>),
    String(String),
    Float32(f32),
    Float64(f64),
    Int32(i32),
    Int64(i64),
    Timestamp(DateTime<Utc>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null(_))
    }
}

/// Canonical text of a value: NULL is empty and numbers use their shortest round-trip
/// form, so `1.50` and `1.5` render the same once parsed.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null(_) => Ok(()),
            Value::String(s) => f.write_str(s),
            Value::Float32(v) => write!(f, "{}", v),
            Value::Float64(v) => write!(f, "{}", v),
            Value::Int32(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}", v),
            Value::Timestamp(ts) => f.write_str(&ts.to_rfc3339()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_type_from_str() {
        assert_eq!("string".parse::<ValueType>(), Ok(ValueType::String));
        assert_eq!("float32".parse::<ValueType>(), Ok(ValueType::Float32));
        assert_eq!("int64".parse::<ValueType>(), Ok(ValueType::Int64));
        assert_eq!(
            "decimal".parse::<ValueType>(),
            Err(ParseValueError::UnknownType("decimal".to_owned()))
        );
    }

    #[test]
    fn test_parse_values() {
        assert_eq!(ValueType::Float64.parse("1.5"), Ok(Value::Float64(1.5)));
        assert_eq!(ValueType::Int32.parse("-7"), Ok(Value::Int32(-7)));
        assert_eq!(
            ValueType::String.parse("truck_1"),
            Ok(Value::String("truck_1".to_owned()))
        );
        assert_eq!(
            ValueType::Float32.parse(""),
            Ok(Value::Null(Some(ValueType::Float32)))
        );
    }

    #[test]
    fn test_parse_rejects_mismatched_values() {
        assert_eq!(
            ValueType::Int64.parse("12.5"),
            Err(ParseValueError::InvalidValue {
                value: "12.5".to_owned(),
                value_type: ValueType::Int64,
            })
        );
        assert!(ValueType::Float64.parse("fast").is_err());
    }

    #[test]
    fn test_display_is_canonical() {
        let parsed = |t: ValueType, raw: &str| t.parse(raw).unwrap().to_string();

        assert_eq!(parsed(ValueType::Float64, "1.50"), "1.5");
        assert_eq!(parsed(ValueType::Float32, "12.0"), "12");
        assert_eq!(parsed(ValueType::Float32, "12"), "12");
        assert_eq!(parsed(ValueType::Int64, "007"), "7");
        assert_eq!(parsed(ValueType::String, "truck 1"), "truck 1");
        assert_eq!(Value::Null(Some(ValueType::String)).to_string(), "");
    }
}
