//! Type signatures and object paths.
//!
//! A [`Signature`] is a validated string of type codes, for example `a{sv}`
//! or `(iis)`. Parsing it yields a sequence of [`Type`] trees that drive the
//! dynamic decoder. An [`ObjectPath`] names an object on the bus.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::error::{Error, Result};

/// Maximum signature length in bytes.
pub const MAX_SIGNATURE_LEN: usize = 255;

/// Maximum array nesting (and, separately, struct nesting) in a signature.
pub const MAX_DEPTH: usize = 32;

/// A single complete D-Bus type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(clippy::exhaustive_enums)]
pub enum Type {
    /// `y`: unsigned 8-bit integer.
    Byte,
    /// `b`: boolean, marshaled as a 32-bit 0 or 1.
    Bool,
    /// `n`: signed 16-bit integer.
    Int16,
    /// `q`: unsigned 16-bit integer.
    UInt16,
    /// `i`: signed 32-bit integer.
    Int32,
    /// `u`: unsigned 32-bit integer.
    UInt32,
    /// `x`: signed 64-bit integer.
    Int64,
    /// `t`: unsigned 64-bit integer.
    UInt64,
    /// `d`: IEEE 754 double.
    Double,
    /// `s`: UTF-8 string.
    Str,
    /// `o`: object path.
    ObjectPath,
    /// `g`: signature.
    Signature,
    /// `v`: variant.
    Variant,
    /// `h`: index into the message's attached file descriptors.
    UnixFd,
    /// `aT`: array of one element type.
    Array(Box<Self>),
    /// `a{KV}`: array of dict entries.
    Dict(Box<Self>, Box<Self>),
    /// `(…)`: struct of one or more fields.
    Struct(Vec<Self>),
}

impl Type {
    /// Alignment of the first byte of a value of this type.
    pub const fn alignment(&self) -> usize {
        match self {
            Self::Byte | Self::Signature | Self::Variant => 1,
            Self::Int16 | Self::UInt16 => 2,
            Self::Bool
            | Self::Int32
            | Self::UInt32
            | Self::Str
            | Self::ObjectPath
            | Self::UnixFd
            | Self::Array(_)
            | Self::Dict(..) => 4,
            Self::Int64 | Self::UInt64 | Self::Double | Self::Struct(_) => 8,
        }
    }

    /// Returns `true` for types allowed as dict keys.
    pub const fn is_basic(&self) -> bool {
        !matches!(
            self,
            Self::Variant | Self::Array(_) | Self::Dict(..) | Self::Struct(_)
        )
    }

    /// Alignment of the elements of an array of this type.
    ///
    /// Dict entries are always 8-byte aligned.
    pub const fn element_alignment(&self) -> Option<usize> {
        match self {
            Self::Array(elem) => Some(elem.alignment()),
            Self::Dict(..) => Some(8),
            _ => None,
        }
    }

    /// Appends this type's signature text to `out`.
    pub fn write_signature(&self, out: &mut String) {
        match self {
            Self::Byte => out.push('y'),
            Self::Bool => out.push('b'),
            Self::Int16 => out.push('n'),
            Self::UInt16 => out.push('q'),
            Self::Int32 => out.push('i'),
            Self::UInt32 => out.push('u'),
            Self::Int64 => out.push('x'),
            Self::UInt64 => out.push('t'),
            Self::Double => out.push('d'),
            Self::Str => out.push('s'),
            Self::ObjectPath => out.push('o'),
            Self::Signature => out.push('g'),
            Self::Variant => out.push('v'),
            Self::UnixFd => out.push('h'),
            Self::Array(elem) => {
                out.push('a');
                elem.write_signature(out);
            }
            Self::Dict(key, value) => {
                out.push_str("a{");
                key.write_signature(out);
                value.write_signature(out);
                out.push('}');
            }
            Self::Struct(fields) => {
                out.push('(');
                for f in fields {
                    f.write_signature(out);
                }
                out.push(')');
            }
        }
    }

    /// Parses a signature holding exactly one complete type.
    pub fn parse_single(text: &str) -> Result<Self> {
        let mut p = Parser::new(text);
        let ty = p.next_type()?;
        if !p.is_done() {
            return Err(p.invalid("expected a single complete type"));
        }
        Ok(ty)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = String::new();
        self.write_signature(&mut s);
        f.write_str(&s)
    }
}

/// Recursive-descent parser over signature bytes.
struct Parser<'a> {
    /// The full signature (for error messages).
    text: &'a str,
    /// Cursor into `text`.
    pos: usize,
    /// Current array nesting.
    arrays: usize,
    /// Current struct nesting.
    structs: usize,
}

impl<'a> Parser<'a> {
    const fn new(text: &'a str) -> Self {
        Self {
            text,
            pos: 0,
            arrays: 0,
            structs: 0,
        }
    }

    const fn is_done(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn peek(&self) -> Option<u8> {
        self.text.as_bytes().get(self.pos).copied()
    }

    fn invalid(&self, reason: &'static str) -> Error {
        Error::InvalidSignature {
            signature: self.text.to_owned(),
            reason,
        }
    }

    fn all(mut self) -> Result<Vec<Type>> {
        let mut out = Vec::new();
        while !self.is_done() {
            out.push(self.next_type()?);
        }
        Ok(out)
    }

    fn next_type(&mut self) -> Result<Type> {
        let Some(code) = self.peek() else {
            return Err(self.invalid("incomplete type"));
        };
        self.pos += 1;
        let ty = match code {
            b'y' => Type::Byte,
            b'b' => Type::Bool,
            b'n' => Type::Int16,
            b'q' => Type::UInt16,
            b'i' => Type::Int32,
            b'u' => Type::UInt32,
            b'x' => Type::Int64,
            b't' => Type::UInt64,
            b'd' => Type::Double,
            b's' => Type::Str,
            b'o' => Type::ObjectPath,
            b'g' => Type::Signature,
            b'v' => Type::Variant,
            b'h' => Type::UnixFd,
            b'a' => self.array()?,
            b'(' => self.structure()?,
            b'{' => return Err(self.invalid("dict entry outside of an array")),
            b')' | b'}' => return Err(self.invalid("unbalanced closing bracket")),
            other => return Err(Error::UnknownType(char::from(other))),
        };
        Ok(ty)
    }

    fn array(&mut self) -> Result<Type> {
        self.arrays += 1;
        if self.arrays > MAX_DEPTH {
            return Err(Error::TooDeep);
        }
        let ty = if self.peek() == Some(b'{') {
            self.pos += 1;
            let key = self.next_type()?;
            if !key.is_basic() {
                return Err(self.invalid("dict key must be a basic type"));
            }
            let value = self.next_type()?;
            match self.peek() {
                Some(b'}') => self.pos += 1,
                None => return Err(self.invalid("unterminated dict entry")),
                Some(_) => return Err(self.invalid("dict entry must hold exactly two types")),
            }
            Type::Dict(Box::new(key), Box::new(value))
        } else {
            Type::Array(Box::new(self.next_type()?))
        };
        self.arrays -= 1;
        Ok(ty)
    }

    fn structure(&mut self) -> Result<Type> {
        self.structs += 1;
        if self.structs > MAX_DEPTH {
            return Err(Error::TooDeep);
        }
        let mut fields = Vec::new();
        loop {
            match self.peek() {
                Some(b')') => {
                    self.pos += 1;
                    break;
                }
                None => return Err(self.invalid("unterminated struct")),
                Some(_) => fields.push(self.next_type()?),
            }
        }
        if fields.is_empty() {
            return Err(self.invalid("empty struct"));
        }
        self.structs -= 1;
        Ok(Type::Struct(fields))
    }
}

/// A validated D-Bus type signature: zero or more complete types.
#[derive(Debug, Clone, Default)]
pub struct Signature {
    /// Signature text.
    text: String,
    /// Parsed types, in order.
    types: Vec<Type>,
}

impl Signature {
    /// Validates and wraps a signature string.
    pub fn new(text: impl Into<String>) -> Result<Self> {
        let text = text.into();
        if text.len() > MAX_SIGNATURE_LEN {
            return Err(Error::InvalidSignature {
                signature: text,
                reason: "longer than 255 bytes",
            });
        }
        let types = Parser::new(&text).all()?;
        Ok(Self { text, types })
    }

    /// The empty signature (a message with no body).
    pub const fn empty() -> Self {
        Self {
            text: String::new(),
            types: Vec::new(),
        }
    }

    /// Builds a signature from a list of complete types.
    pub fn from_types(types: &[Type]) -> Result<Self> {
        let mut text = String::new();
        for t in types {
            t.write_signature(&mut text);
        }
        if text.len() > MAX_SIGNATURE_LEN {
            return Err(Error::InvalidSignature {
                signature: text,
                reason: "longer than 255 bytes",
            });
        }
        Ok(Self {
            text,
            types: types.to_vec(),
        })
    }

    /// Returns the signature text.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Returns the parsed types.
    pub fn types(&self) -> &[Type] {
        &self.types
    }

    /// Returns `true` for the empty signature.
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

impl PartialEq for Signature {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

impl Eq for Signature {}

impl Hash for Signature {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.text.hash(state);
    }
}

impl PartialEq<str> for Signature {
    fn eq(&self, other: &str) -> bool {
        self.text == other
    }
}

impl PartialEq<&str> for Signature {
    fn eq(&self, other: &&str) -> bool {
        self.text == *other
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl FromStr for Signature {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<&str> for Signature {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl From<Type> for Signature {
    fn from(ty: Type) -> Self {
        let mut text = String::new();
        ty.write_signature(&mut text);
        Self {
            text,
            types: vec![ty],
        }
    }
}

impl serde::Serialize for Signature {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&self.text)
    }
}

/// A validated object path such as `/org/freedesktop/DBus`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectPath(String);

impl ObjectPath {
    /// Validates and wraps an object path.
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        if is_valid_path(&path) {
            Ok(Self(path))
        } else {
            Err(Error::InvalidObjectPath(path))
        }
    }

    /// The root path `/`.
    pub fn root() -> Self {
        Self("/".to_owned())
    }

    /// Returns the path text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` for `/`.
    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Appends one or more `/`-separated elements.
    pub fn join(&self, child: &str) -> Result<Self> {
        let child = child.trim_start_matches('/');
        if self.is_root() {
            Self::new(format!("/{child}"))
        } else {
            Self::new(format!("{}/{child}", self.0))
        }
    }

    /// Returns `true` if `other` is this path or lies beneath it.
    pub fn is_ancestor_of(&self, other: &Self) -> bool {
        if self.is_root() || self.0 == other.0 {
            return true;
        }
        other
            .0
            .strip_prefix(&self.0)
            .is_some_and(|rest| rest.starts_with('/'))
    }
}

fn is_valid_path(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    let Some(rest) = path.strip_prefix('/') else {
        return false;
    };
    rest.split('/').all(|elem| {
        !elem.is_empty()
            && elem
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_')
    })
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ObjectPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<&str> for ObjectPath {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl AsRef<str> for ObjectPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for ObjectPath {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_containers() {
        let sig = Signature::new("a{sa(iv)}uay").unwrap();
        assert_eq!(sig.types().len(), 3);
        assert_eq!(
            sig.types()[0],
            Type::Dict(
                Box::new(Type::Str),
                Box::new(Type::Array(Box::new(Type::Struct(vec![
                    Type::Int32,
                    Type::Variant
                ]))))
            )
        );
        assert_eq!(sig.types()[2], Type::Array(Box::new(Type::Byte)));
    }

    #[test]
    fn rendering_matches_source() {
        for text in ["", "s", "a{sv}", "(ia(ss)h)", "aay", "a{oa{sa{sv}}}"] {
            let sig = Signature::new(text).unwrap();
            assert_eq!(Signature::from_types(sig.types()).unwrap(), sig);
        }
    }

    #[test]
    fn rejects_unknown_codes() {
        assert_eq!(Signature::new("sz"), Err(Error::UnknownType('z')));
    }

    #[test]
    fn rejects_unbalanced_brackets() {
        for bad in ["(i", "i)", "a{sv", "{sv}", "a{s}", "a{svs}", "()", "a", "a{vs}"] {
            assert!(
                matches!(Signature::new(bad), Err(Error::InvalidSignature { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn enforces_nesting_limit() {
        let deep = "a".repeat(MAX_DEPTH + 1) + "y";
        assert_eq!(Signature::new(deep), Err(Error::TooDeep));
        let ok = "a".repeat(MAX_DEPTH) + "y";
        assert!(Signature::new(ok).is_ok());
    }

    #[test]
    fn single_type_for_variants() {
        assert_eq!(Type::parse_single("as").unwrap().to_string(), "as");
        assert!(Type::parse_single("ss").is_err());
        assert!(Type::parse_single("").is_err());
    }

    #[test]
    fn alignment_table() {
        assert_eq!(Type::Byte.alignment(), 1);
        assert_eq!(Type::Int16.alignment(), 2);
        assert_eq!(Type::Bool.alignment(), 4);
        assert_eq!(Type::Str.alignment(), 4);
        assert_eq!(Type::Double.alignment(), 8);
        assert_eq!(Type::Struct(vec![Type::Byte]).alignment(), 8);
        assert_eq!(
            Type::Dict(Box::new(Type::Str), Box::new(Type::Variant)).element_alignment(),
            Some(8)
        );
    }

    #[test]
    fn object_path_validation() {
        for good in ["/", "/a", "/org/freedesktop/DBus", "/a_b/c1"] {
            assert!(ObjectPath::new(good).is_ok(), "{good}");
        }
        for bad in ["", "a", "/a/", "//", "/a//b", "/a-b", "/ä"] {
            assert!(ObjectPath::new(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn object_path_join_and_ancestry() {
        let root = ObjectPath::root();
        let app = root.join("app").unwrap();
        assert_eq!(app.as_str(), "/app");
        let item = app.join("items/one").unwrap();
        assert_eq!(item.as_str(), "/app/items/one");
        assert!(root.is_ancestor_of(&item));
        assert!(app.is_ancestor_of(&item));
        assert!(app.is_ancestor_of(&app));
        assert!(!app.is_ancestor_of(&ObjectPath::new("/apple").unwrap()));
    }
}
