//! Scalar key types an index can be built over

use infini_value::{FloatKey, Value, ValueType};
use std::borrow::Cow;
use std::fmt::Debug;
use std::hash::Hash;

/// A field value usable as an index key
///
/// Keys must be totally ordered (ordered indices) and hashable (unordered
/// indices and per-key lock queues).
pub trait IndexKey: Ord + Hash + Clone + Debug + Send + 'static {
    const VALUE_TYPE: ValueType;

    fn from_value(value: &Value) -> Option<Self>;

    fn to_value(&self) -> Value;

    /// Text form for pattern scans, `None` for non-textual keys
    fn text(&self) -> Option<Cow<'_, str>> {
        None
    }
}

macro_rules! scalar_key {
    ($ty:ty, $variant:ident) => {
        impl IndexKey for $ty {
            const VALUE_TYPE: ValueType = ValueType::$variant;

            fn from_value(value: &Value) -> Option<Self> {
                match value {
                    Value::$variant(v) => Some(*v),
                    _ => None,
                }
            }

            fn to_value(&self) -> Value {
                Value::$variant(*self)
            }
        }
    };
}

scalar_key!(i64, Int);
scalar_key!(u64, UInt);
scalar_key!(bool, Bool);

impl IndexKey for FloatKey {
    const VALUE_TYPE: ValueType = ValueType::Float;

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Float(v) => Some(FloatKey(*v)),
            _ => None,
        }
    }

    fn to_value(&self) -> Value {
        Value::Float(self.0)
    }
}

impl IndexKey for char {
    const VALUE_TYPE: ValueType = ValueType::Char;

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Char(c) => Some(*c),
            _ => None,
        }
    }

    fn to_value(&self) -> Value {
        Value::Char(*self)
    }

    fn text(&self) -> Option<Cow<'_, str>> {
        Some(Cow::Owned(self.to_string()))
    }
}

impl IndexKey for String {
    const VALUE_TYPE: ValueType = ValueType::Str;

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Str(s) => Some(s.clone()),
            _ => None,
        }
    }

    fn to_value(&self) -> Value {
        Value::Str(self.clone())
    }

    fn text(&self) -> Option<Cow<'_, str>> {
        Some(Cow::Borrowed(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversion_checks_type() {
        assert_eq!(i64::from_value(&Value::Int(-4)), Some(-4));
        assert_eq!(i64::from_value(&Value::UInt(4)), None);
        assert_eq!(String::from_value(&Value::Null), None);
        assert_eq!(
            FloatKey::from_value(&Value::Float(1.5)).map(|k| k.to_value()),
            Some(Value::Float(1.5))
        );
    }

    #[test]
    fn test_only_textual_keys_have_text() {
        assert_eq!("abc".to_string().text().as_deref(), Some("abc"));
        assert_eq!('x'.text().as_deref(), Some("x"));
        assert!(7i64.text().is_none());
        assert!(true.text().is_none());
    }
}
