//! Value types stored in rows and index keys

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Column type of a table field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Int,
    UInt,
    Bool,
    Float,
    Char,
    Str,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Int => "int",
            ValueType::UInt => "uint",
            ValueType::Bool => "bool",
            ValueType::Float => "float",
            ValueType::Char => "char",
            ValueType::Str => "string",
        };
        f.write_str(name)
    }
}

/// A single field value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int(i64),
    UInt(u64),
    Bool(bool),
    Float(f64),
    Char(char),
    Str(String),
}

impl Value {
    /// Create a string value
    pub fn string<S: Into<String>>(s: S) -> Self {
        Value::Str(s.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Column type of this value, `None` for null
    pub fn value_type(&self) -> Option<ValueType> {
        match self {
            Value::Null => None,
            Value::Int(_) => Some(ValueType::Int),
            Value::UInt(_) => Some(ValueType::UInt),
            Value::Bool(_) => Some(ValueType::Bool),
            Value::Float(_) => Some(ValueType::Float),
            Value::Char(_) => Some(ValueType::Char),
            Value::Str(_) => Some(ValueType::Str),
        }
    }

    /// Check that this value may be stored in a field of the given type
    pub fn fits(&self, value_type: ValueType) -> bool {
        match self.value_type() {
            None => true,
            Some(t) => t == value_type,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::UInt(a), Value::UInt(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => float_bits(*a) == float_bits(*b),
            (Value::Char(a), Value::Char(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Int(v) => v.hash(state),
            Value::UInt(v) => v.hash(state),
            Value::Bool(v) => v.hash(state),
            Value::Float(v) => float_bits(*v).hash(state),
            Value::Char(v) => v.hash(state),
            Value::Str(v) => v.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Int(v) => write!(f, "{}", v),
            Value::UInt(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Char(v) => write!(f, "'{}'", v),
            Value::Str(v) => write!(f, "'{}'", v),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<char> for Value {
    fn from(v: char) -> Self {
        Value::Char(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

/// Float wrapper with a total order, usable as an ordered map key
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FloatKey(pub f64);

impl PartialEq for FloatKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FloatKey {}

impl PartialOrd for FloatKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FloatKey {
    fn cmp(&self, other: &Self) -> Ordering {
        unsigned_zero(self.0).total_cmp(&unsigned_zero(other.0))
    }
}

impl Hash for FloatKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        float_bits(self.0).hash(state);
    }
}

/// -0.0 and 0.0 are the same key
fn unsigned_zero(v: f64) -> f64 {
    if v == 0.0 { 0.0 } else { v }
}

fn float_bits(v: f64) -> u64 {
    unsigned_zero(v).to_bits()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeSet, HashSet};

    #[test]
    fn test_float_key_ordering() {
        let keys: BTreeSet<FloatKey> = [3.5, -1.0, 0.25, 100.0]
            .into_iter()
            .map(FloatKey)
            .collect();
        let ordered: Vec<f64> = keys.into_iter().map(|k| k.0).collect();
        assert_eq!(ordered, vec![-1.0, 0.25, 3.5, 100.0]);
    }

    #[test]
    fn test_value_hash_eq_consistency() {
        let mut set = HashSet::new();
        set.insert(Value::Float(1.5));
        set.insert(Value::string("abc"));
        set.insert(Value::Int(7));

        assert!(set.contains(&Value::Float(1.5)));
        assert!(set.contains(&Value::Str("abc".to_string())));
        assert!(!set.contains(&Value::UInt(7)));
    }

    #[test]
    fn test_signed_zero_is_one_key() {
        assert_eq!(Value::Float(-0.0), Value::Float(0.0));
        let mut set = HashSet::new();
        set.insert(Value::Float(0.0));
        assert!(set.contains(&Value::Float(-0.0)));

        assert_eq!(FloatKey(-0.0), FloatKey(0.0));
        let keys: BTreeSet<FloatKey> = [0.0, -0.0, -1.0].into_iter().map(FloatKey).collect();
        assert_eq!(keys.len(), 2);
        let hashed: HashSet<FloatKey> = [0.0, -0.0].into_iter().map(FloatKey).collect();
        assert_eq!(hashed.len(), 1);
    }

    #[test]
    fn test_value_fits_type() {
        assert!(Value::Int(1).fits(ValueType::Int));
        assert!(!Value::Int(1).fits(ValueType::UInt));
        assert!(Value::Null.fits(ValueType::Str));
    }
}
