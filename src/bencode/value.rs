use bytes::Bytes;
use std::collections::BTreeMap;

/// A bencode value.
///
/// Bencode has four data types: integers, byte strings, lists, and
/// dictionaries. Dictionary keys are byte strings and are emitted in sorted
/// order, which `BTreeMap` gives us for free.
///
/// # Examples
///
/// ```
/// use rdht::bencode::Value;
///
/// let int = Value::Integer(42);
/// let string = Value::string("hello");
///
/// assert_eq!(int.as_integer(), Some(42));
/// assert_eq!(string.as_str(), Some("hello"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// A signed 64-bit integer.
    Integer(i64),
    /// A byte string (may or may not be valid UTF-8).
    Bytes(Bytes),
    /// An ordered list of values.
    List(Vec<Value>),
    /// A dictionary with byte string keys.
    Dict(BTreeMap<Bytes, Value>),
}

/// Generates the borrowing accessor for one variant.
macro_rules! accessor {
    ($(#[$doc:meta])* $name:ident, $variant:ident, $inner:ty) => {
        $(#[$doc])*
        pub fn $name(&self) -> Option<&$inner> {
            if let Value::$variant(inner) = self {
                Some(inner)
            } else {
                None
            }
        }
    };
}

impl Value {
    /// Creates a byte string value from a UTF-8 string.
    pub fn string(s: &str) -> Self {
        Self::bytes(s.as_bytes())
    }

    /// Creates a byte string value from a byte slice.
    pub fn bytes(b: &[u8]) -> Self {
        Value::Bytes(Bytes::copy_from_slice(b))
    }

    /// Returns the value as an integer, if it is one.
    pub fn as_integer(&self) -> Option<i64> {
        if let Value::Integer(i) = self {
            Some(*i)
        } else {
            None
        }
    }

    accessor!(
        /// Returns the value as a byte string, if it is one.
        as_bytes,
        Bytes,
        Bytes
    );

    accessor!(
        /// Returns the value as a list, if it is one.
        as_list,
        List,
        Vec<Value>
    );

    accessor!(
        /// Returns the value as a dictionary reference, if it is one.
        as_dict,
        Dict,
        BTreeMap<Bytes, Value>
    );

    /// Returns the value as a UTF-8 string, if it is a byte string holding
    /// valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(self.as_bytes()?).ok()
    }

    /// Consumes the value and returns the dictionary, if it is one.
    pub fn into_dict(self) -> Option<BTreeMap<Bytes, Value>> {
        if let Value::Dict(d) = self {
            Some(d)
        } else {
            None
        }
    }

    /// Looks up a key in this value if it is a dictionary.
    ///
    /// ```
    /// use rdht::bencode::decode;
    ///
    /// let value = decode(b"d3:foo3:bare").unwrap();
    /// assert_eq!(value.get(b"foo").and_then(|v| v.as_str()), Some("bar"));
    /// assert_eq!(value.get(b"missing"), None);
    /// ```
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        match self {
            Value::Dict(d) => d.get(key),
            _ => None,
        }
    }
}

/// Generates the wrapping conversion for one variant.
macro_rules! from_impl {
    ($ty:ty, $variant:ident) => {
        impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::$variant(v)
            }
        }
    };
}

from_impl!(i64, Integer);
from_impl!(Bytes, Bytes);
from_impl!(Vec<Value>, List);
from_impl!(BTreeMap<Bytes, Value>, Dict);

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}
