//! Dynamically typed D-Bus values.
//!
//! [`Value`] is what the decoder produces for variants and what callers use
//! to build heterogeneous containers such as `a{sv}` property maps.

use serde::Serialize;
use serde::ser::{SerializeMap, SerializeSeq};

use crate::error::{Error, Result};
use crate::signature::{ObjectPath, Signature, Type};

/// Any D-Bus value, tagged with its type.
#[derive(Debug, Clone, PartialEq)]
#[allow(clippy::exhaustive_enums)]
pub enum Value {
    /// `y`
    Byte(u8),
    /// `b`
    Bool(bool),
    /// `n`
    Int16(i16),
    /// `q`
    UInt16(u16),
    /// `i`
    Int32(i32),
    /// `u`
    UInt32(u32),
    /// `x`
    Int64(i64),
    /// `t`
    UInt64(u64),
    /// `d`
    Double(f64),
    /// `s`
    Str(String),
    /// `o`
    ObjectPath(ObjectPath),
    /// `g`
    Signature(Signature),
    /// `h`: index into the message's attached descriptors.
    UnixFd(u32),
    /// `v`: a value carrying its own signature.
    Variant(Box<Self>),
    /// `aT`
    Array(Array),
    /// `a{KV}`
    Dict(Dict),
    /// `(…)`
    Struct(Vec<Self>),
}

impl Value {
    /// Returns the complete type of this value.
    pub fn ty(&self) -> Type {
        match self {
            Self::Byte(_) => Type::Byte,
            Self::Bool(_) => Type::Bool,
            Self::Int16(_) => Type::Int16,
            Self::UInt16(_) => Type::UInt16,
            Self::Int32(_) => Type::Int32,
            Self::UInt32(_) => Type::UInt32,
            Self::Int64(_) => Type::Int64,
            Self::UInt64(_) => Type::UInt64,
            Self::Double(_) => Type::Double,
            Self::Str(_) => Type::Str,
            Self::ObjectPath(_) => Type::ObjectPath,
            Self::Signature(_) => Type::Signature,
            Self::UnixFd(_) => Type::UnixFd,
            Self::Variant(_) => Type::Variant,
            Self::Array(a) => Type::Array(Box::new(a.element.clone())),
            Self::Dict(d) => Type::Dict(Box::new(d.key.clone()), Box::new(d.value.clone())),
            Self::Struct(fields) => Type::Struct(fields.iter().map(Self::ty).collect()),
        }
    }

    /// Returns the signature of this value.
    pub fn signature(&self) -> Signature {
        Signature::from(self.ty())
    }

    /// Wraps this value in a variant.
    pub fn into_variant(self) -> Self {
        Self::Variant(Box::new(self))
    }

    /// Strips any number of variant wrappers.
    pub fn flatten(&self) -> &Self {
        let mut v = self;
        while let Self::Variant(inner) = v {
            v = inner;
        }
        v
    }

    /// Returns the string payload of `s`, `o` or `g` values.
    pub fn as_str(&self) -> Option<&str> {
        match self.flatten() {
            Self::Str(s) => Some(s),
            Self::ObjectPath(p) => Some(p.as_str()),
            Self::Signature(g) => Some(g.as_str()),
            _ => None,
        }
    }

    /// Returns any unsigned integer payload widened to `u64`.
    pub fn as_u64(&self) -> Option<u64> {
        match *self.flatten() {
            Self::Byte(n) => Some(u64::from(n)),
            Self::UInt16(n) => Some(u64::from(n)),
            Self::UInt32(n) => Some(u64::from(n)),
            Self::UInt64(n) => Some(n),
            _ => None,
        }
    }

    /// Returns any signed integer payload widened to `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        match *self.flatten() {
            Self::Int16(n) => Some(i64::from(n)),
            Self::Int32(n) => Some(i64::from(n)),
            Self::Int64(n) => Some(n),
            _ => None,
        }
    }

    /// Returns the boolean payload.
    pub fn as_bool(&self) -> Option<bool> {
        match *self.flatten() {
            Self::Bool(b) => Some(b),
            _ => None,
        }
    }
}

/// A homogeneous array that remembers its element type.
#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    /// Element type; needed to sign empty arrays.
    element: Type,
    /// Elements, all of type `element`.
    items: Vec<Value>,
}

impl Array {
    /// Creates an array, checking every item against `element`.
    pub fn new(element: Type, items: Vec<Value>) -> Result<Self> {
        if let Some(bad) = items.iter().find(|v| v.ty() != element) {
            return Err(Error::TypeMismatch(bad.signature().to_string()));
        }
        Ok(Self { element, items })
    }

    /// Creates an empty array of `element`.
    pub const fn empty(element: Type) -> Self {
        Self {
            element,
            items: Vec::new(),
        }
    }

    /// Element type.
    pub const fn element(&self) -> &Type {
        &self.element
    }

    /// Elements.
    pub fn items(&self) -> &[Value] {
        &self.items
    }

    /// Consumes the array, returning its elements.
    pub fn into_items(self) -> Vec<Value> {
        self.items
    }

    /// Appends an element after checking its type.
    pub fn push(&mut self, item: Value) -> Result<()> {
        if item.ty() != self.element {
            return Err(Error::TypeMismatch(item.signature().to_string()));
        }
        self.items.push(item);
        Ok(())
    }
}

/// An ordered dictionary (`a{KV}`).
#[derive(Debug, Clone, PartialEq)]
pub struct Dict {
    /// Key type; always a basic type.
    key: Type,
    /// Value type.
    value: Type,
    /// Entries in wire order.
    entries: Vec<(Value, Value)>,
}

impl Dict {
    /// Creates an empty dictionary.
    pub fn new(key: Type, value: Type) -> Result<Self> {
        if !key.is_basic() {
            return Err(Error::TypeMismatch(key.to_string()));
        }
        Ok(Self {
            key,
            value,
            entries: Vec::new(),
        })
    }

    /// Creates an `a{sv}` dictionary from name/value pairs.
    ///
    /// Each value is wrapped in a variant.
    pub fn from_properties<I, K>(props: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Self {
            key: Type::Str,
            value: Type::Variant,
            entries: props
                .into_iter()
                .map(|(k, v)| (Value::Str(k.into()), v.into_variant()))
                .collect(),
        }
    }

    /// Key type.
    pub const fn key_type(&self) -> &Type {
        &self.key
    }

    /// Value type.
    pub const fn value_type(&self) -> &Type {
        &self.value
    }

    /// Entries in wire order.
    pub fn entries(&self) -> &[(Value, Value)] {
        &self.entries
    }

    /// Consumes the dictionary, returning its entries.
    pub fn into_entries(self) -> Vec<(Value, Value)> {
        self.entries
    }

    /// Appends an entry after checking both types.
    pub fn insert(&mut self, key: Value, value: Value) -> Result<()> {
        if key.ty() != self.key {
            return Err(Error::TypeMismatch(key.signature().to_string()));
        }
        if value.ty() != self.value {
            return Err(Error::TypeMismatch(value.signature().to_string()));
        }
        self.entries.push((key, value));
        Ok(())
    }

    /// Looks up an entry whose key is the string `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v)
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Self::$variant(v)
                }
            }
        )*
    };
}

impl_from! {
    u8 => Byte,
    bool => Bool,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    i64 => Int64,
    u64 => UInt64,
    f64 => Double,
    String => Str,
    ObjectPath => ObjectPath,
    Signature => Signature,
    Array => Array,
    Dict => Dict,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_owned())
    }
}

impl Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Byte(n) => s.serialize_u8(*n),
            Self::Bool(b) => s.serialize_bool(*b),
            Self::Int16(n) => s.serialize_i16(*n),
            Self::UInt16(n) => s.serialize_u16(*n),
            Self::Int32(n) => s.serialize_i32(*n),
            Self::UInt32(n) | Self::UnixFd(n) => s.serialize_u32(*n),
            Self::Int64(n) => s.serialize_i64(*n),
            Self::UInt64(n) => s.serialize_u64(*n),
            Self::Double(n) => s.serialize_f64(*n),
            Self::Str(v) => s.serialize_str(v),
            Self::ObjectPath(p) => p.serialize(s),
            Self::Signature(g) => g.serialize(s),
            Self::Variant(inner) => inner.serialize(s),
            Self::Array(a) => {
                let mut seq = s.serialize_seq(Some(a.items.len()))?;
                for item in &a.items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Self::Struct(fields) => {
                let mut seq = s.serialize_seq(Some(fields.len()))?;
                for f in fields {
                    seq.serialize_element(f)?;
                }
                seq.end()
            }
            Self::Dict(d) => {
                let mut map = s.serialize_map(Some(d.entries.len()))?;
                for (k, v) in &d.entries {
                    match k.as_str() {
                        Some(key) => map.serialize_entry(key, v)?,
                        None => map.serialize_entry(&DisplayKey(k), v)?,
                    }
                }
                map.end()
            }
        }
    }
}

/// Renders a non-string basic dict key as a map key string.
struct DisplayKey<'a>(&'a Value);

impl Serialize for DisplayKey<'_> {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        let text = match *self.0 {
            Value::Byte(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int16(n) => n.to_string(),
            Value::UInt16(n) => n.to_string(),
            Value::Int32(n) => n.to_string(),
            Value::UInt32(n) | Value::UnixFd(n) => n.to_string(),
            Value::Int64(n) => n.to_string(),
            Value::UInt64(n) => n.to_string(),
            Value::Double(n) => n.to_string(),
            _ => String::new(),
        };
        s.serialize_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signatures_of_containers() {
        let arr = Array::new(Type::Str, vec!["a".into(), "b".into()]).unwrap();
        assert_eq!(Value::Array(arr).signature(), "as");

        let props = Dict::from_properties([("Name", Value::from("x")), ("Count", 5u32.into())]);
        assert_eq!(Value::Dict(props).signature(), "a{sv}");

        let st = Value::Struct(vec![1i32.into(), Value::from("s").into_variant()]);
        assert_eq!(st.signature(), "(iv)");
    }

    #[test]
    fn empty_array_keeps_element_type() {
        let arr = Array::empty(Type::Struct(vec![Type::Str, Type::UInt32]));
        assert_eq!(Value::Array(arr).signature(), "a(su)");
    }

    #[test]
    fn array_rejects_mixed_items() {
        let err = Array::new(Type::Int32, vec![1i32.into(), "x".into()]).unwrap_err();
        assert_eq!(err, Error::TypeMismatch("s".into()));
    }

    #[test]
    fn dict_lookup_and_flatten() {
        let props = Dict::from_properties([("Count", Value::UInt32(5))]);
        assert_eq!(props.get("Count").and_then(Value::as_u64), Some(5));
        assert!(props.get("Missing").is_none());
    }

    #[test]
    fn serializes_to_json() {
        let props = Dict::from_properties([
            ("Name", Value::from("x")),
            ("Tags", Value::Array(Array::new(Type::Str, vec!["a".into()]).unwrap())),
        ]);
        let json = serde_json::to_value(Value::Dict(props)).unwrap();
        assert_eq!(json, serde_json::json!({"Name": "x", "Tags": ["a"]}));
    }
}
