use chrono::{NaiveDate, NaiveDateTime};
use std::fmt;

use crate::blob::Blob;
use crate::error::DbError;

/// The closed set of bindable and retrievable scalar types.
///
/// Drivers map each member onto the backend's wire type; the mapping is part
/// of the driver contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Integer,
    Long,
    Float,
    Double,
    Varchar,
    Date,
    Timestamp,
    Boolean,
    Blob,
    Null,
}

/// SQL-standard transaction isolation levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// The SQL clause naming this level.
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// A database value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Varchar(String),
    Bool(bool),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    Blob(Blob),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Null => ValueType::Null,
            Value::Int(_) => ValueType::Integer,
            Value::Long(_) => ValueType::Long,
            Value::Float(_) => ValueType::Float,
            Value::Double(_) => ValueType::Double,
            Value::Varchar(_) => ValueType::Varchar,
            Value::Bool(_) => ValueType::Boolean,
            Value::Date(_) => ValueType::Date,
            Value::Timestamp(_) => ValueType::Timestamp,
            Value::Blob(_) => ValueType::Blob,
        }
    }

    /// Coerce to i32. NULL yields 0; numeric arms convert; VARCHAR parses.
    pub fn as_i32(&self) -> Result<i32, DbError> {
        match self {
            Value::Null => Ok(0),
            Value::Int(v) => Ok(*v),
            Value::Long(v) => i32::try_from(*v)
                .map_err(|_| DbError::protocol(format!("value {v} does not fit in an INTEGER"))),
            Value::Float(v) => Ok(*v as i32),
            Value::Double(v) => Ok(*v as i32),
            Value::Bool(v) => Ok(i32::from(*v)),
            Value::Varchar(s) => s
                .trim()
                .parse()
                .map_err(|_| DbError::protocol(format!("cannot read '{s}' as an INTEGER"))),
            other => Err(conversion_error(other, "INTEGER")),
        }
    }

    pub fn as_i64(&self) -> Result<i64, DbError> {
        match self {
            Value::Null => Ok(0),
            Value::Int(v) => Ok(i64::from(*v)),
            Value::Long(v) => Ok(*v),
            Value::Float(v) => Ok(*v as i64),
            Value::Double(v) => Ok(*v as i64),
            Value::Bool(v) => Ok(i64::from(*v)),
            Value::Varchar(s) => s
                .trim()
                .parse()
                .map_err(|_| DbError::protocol(format!("cannot read '{s}' as a LONG"))),
            other => Err(conversion_error(other, "LONG")),
        }
    }

    pub fn as_f32(&self) -> Result<f32, DbError> {
        Ok(self.as_f64()? as f32)
    }

    pub fn as_f64(&self) -> Result<f64, DbError> {
        match self {
            Value::Null => Ok(0.0),
            Value::Int(v) => Ok(f64::from(*v)),
            Value::Long(v) => Ok(*v as f64),
            Value::Float(v) => Ok(f64::from(*v)),
            Value::Double(v) => Ok(*v),
            Value::Bool(v) => Ok(f64::from(u8::from(*v))),
            Value::Varchar(s) => s
                .trim()
                .parse()
                .map_err(|_| DbError::protocol(format!("cannot read '{s}' as a DOUBLE"))),
            other => Err(conversion_error(other, "DOUBLE")),
        }
    }

    /// Coerce to text. NULL yields the empty string.
    pub fn as_string(&self) -> Result<String, DbError> {
        match self {
            Value::Null => Ok(String::new()),
            Value::Int(v) => Ok(v.to_string()),
            Value::Long(v) => Ok(v.to_string()),
            Value::Float(v) => Ok(v.to_string()),
            Value::Double(v) => Ok(v.to_string()),
            Value::Varchar(s) => Ok(s.clone()),
            Value::Bool(v) => Ok(if *v { "true" } else { "false" }.to_string()),
            Value::Date(d) => Ok(d.format("%Y-%m-%d").to_string()),
            Value::Timestamp(t) => Ok(t.format("%Y-%m-%d %H:%M:%S").to_string()),
            Value::Blob(_) => Err(conversion_error(self, "VARCHAR")),
        }
    }

    /// Coerce to bool. NULL yields false; "1"/"true" (any case) are true.
    pub fn as_bool(&self) -> Result<bool, DbError> {
        match self {
            Value::Null => Ok(false),
            Value::Bool(v) => Ok(*v),
            Value::Int(v) => Ok(*v != 0),
            Value::Long(v) => Ok(*v != 0),
            Value::Float(v) => Ok(*v != 0.0),
            Value::Double(v) => Ok(*v != 0.0),
            Value::Varchar(s) => {
                let s = s.trim();
                Ok(s == "1" || s.eq_ignore_ascii_case("true"))
            }
            other => Err(conversion_error(other, "BOOLEAN")),
        }
    }

    /// DATE, or `None` when NULL. VARCHAR parses as `%Y-%m-%d`.
    pub fn as_date(&self) -> Result<Option<NaiveDate>, DbError> {
        match self {
            Value::Null => Ok(None),
            Value::Date(d) => Ok(Some(*d)),
            Value::Timestamp(t) => Ok(Some(t.date())),
            Value::Varchar(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                .map(Some)
                .map_err(|_| DbError::protocol(format!("cannot read '{s}' as a DATE"))),
            other => Err(conversion_error(other, "DATE")),
        }
    }

    /// TIMESTAMP, or `None` when NULL.
    pub fn as_timestamp(&self) -> Result<Option<NaiveDateTime>, DbError> {
        match self {
            Value::Null => Ok(None),
            Value::Timestamp(t) => Ok(Some(*t)),
            Value::Date(d) => Ok(d.and_hms_opt(0, 0, 0)),
            Value::Varchar(s) => {
                let s = s.trim();
                NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
                    .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S"))
                    .map(Some)
                    .map_err(|_| DbError::protocol(format!("cannot read '{s}' as a TIMESTAMP")))
            }
            other => Err(conversion_error(other, "TIMESTAMP")),
        }
    }

    /// BLOB handle, or `None` when NULL. VARCHAR converts to its bytes.
    pub fn as_blob(&self) -> Result<Option<Blob>, DbError> {
        match self {
            Value::Null => Ok(None),
            Value::Blob(b) => Ok(Some(b.clone())),
            Value::Varchar(s) => Ok(Some(Blob::from_bytes(s.clone().into_bytes()))),
            other => Err(conversion_error(other, "BLOB")),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Blob(b) => write!(f, "{b:?}"),
            other => match other.as_string() {
                Ok(s) => f.write_str(&s),
                Err(_) => f.write_str("<?>"),
            },
        }
    }
}

fn conversion_error(value: &Value, target: &str) -> DbError {
    DbError::protocol(format!(
        "cannot convert {:?} column to {target}",
        value.value_type()
    ))
}

#[cfg(test)]
mod tests {
    use super::{IsolationLevel, Value};

    #[test]
    fn null_coerces_to_type_zero() {
        assert_eq!(Value::Null.as_i32().unwrap(), 0);
        assert_eq!(Value::Null.as_i64().unwrap(), 0);
        assert_eq!(Value::Null.as_f64().unwrap(), 0.0);
        assert_eq!(Value::Null.as_string().unwrap(), "");
        assert!(!Value::Null.as_bool().unwrap());
        assert!(Value::Null.as_date().unwrap().is_none());
        assert!(Value::Null.as_blob().unwrap().is_none());
    }

    #[test]
    fn numeric_coercions_cross_arms() {
        assert_eq!(Value::Long(42).as_i32().unwrap(), 42);
        assert_eq!(Value::Varchar("17".into()).as_i32().unwrap(), 17);
        assert_eq!(Value::Int(3).as_f64().unwrap(), 3.0);
        assert!(Value::Long(i64::MAX).as_i32().is_err());
        assert!(Value::Varchar("xyz".into()).as_i64().is_err());
    }

    #[test]
    fn boolean_recognizes_common_spellings() {
        assert!(Value::Varchar("1".into()).as_bool().unwrap());
        assert!(Value::Varchar("TRUE".into()).as_bool().unwrap());
        assert!(!Value::Varchar("0".into()).as_bool().unwrap());
        assert!(Value::Int(7).as_bool().unwrap());
    }

    #[test]
    fn temporal_parsing_from_text() {
        let date = Value::Varchar("2024-02-29".into()).as_date().unwrap();
        assert_eq!(date.unwrap().to_string(), "2024-02-29");

        let ts = Value::Varchar("2024-02-29 12:30:00".into())
            .as_timestamp()
            .unwrap();
        assert!(ts.is_some());
    }

    #[test]
    fn isolation_levels_render_sql_clauses() {
        assert_eq!(IsolationLevel::RepeatableRead.as_sql(), "REPEATABLE READ");
        assert_eq!(IsolationLevel::Serializable.as_sql(), "SERIALIZABLE");
    }
}
