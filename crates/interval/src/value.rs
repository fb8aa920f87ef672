use std::fmt;

/// Longest string payload an extra entry can describe with its one-byte size.
pub const MAX_STRING_LEN: usize = u8::MAX as usize;

pub(crate) const TAG_INT: u8 = 0;
pub(crate) const TAG_STRING: u8 = 1;
pub(crate) const TAG_LONG: u8 = 2;
pub(crate) const TAG_DOUBLE: u8 = 3;
pub(crate) const TAG_NULL: u8 = 0xFF;

/// The value an attribute holds over an interval.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i32),
    Long(i64),
    Double(f64),
    String(String),
}

impl Value {
    /// Type tag written in the data entry.
    pub fn type_tag(&self) -> u8 {
        match self {
            Value::Null => TAG_NULL,
            Value::Int(_) => TAG_INT,
            Value::Long(_) => TAG_LONG,
            Value::Double(_) => TAG_DOUBLE,
            Value::String(_) => TAG_STRING,
        }
    }

    /// Bytes this value needs in the extra area of a node.
    pub fn extra_size(&self) -> usize {
        match self {
            Value::Null | Value::Int(_) => 0,
            Value::Long(_) | Value::Double(_) => 8,
            // size byte + payload + terminator
            Value::String(s) => s.len() + 2,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("nullValue"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Long(v) => write!(f, "{v}L"),
            Value::Double(v) => write!(f, "{v}"),
            Value::String(s) => write!(f, "\"{s}\""),
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}
