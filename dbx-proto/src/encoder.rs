//! Append-only D-Bus marshaler.
//!
//! Every `add_*` call first pads the buffer with zero bytes so the value
//! starts at its natural alignment, then appends the little-endian bytes.
//! Offsets are measured from the start of the buffer, which must itself sit
//! at an 8-byte boundary of the enclosing message (true for both the header
//! and the body).

use std::os::fd::OwnedFd;

use crate::align::padding;
use crate::error::{Error, Result};
use crate::message::Body;
use crate::signature::{ObjectPath, Signature};
use crate::value::Value;

/// Maximum array payload in bytes.
pub const MAX_ARRAY_LEN: usize = 64 * 1024 * 1024;

/// Byte builder for message headers and bodies.
#[derive(Debug, Default)]
pub struct Encoder {
    /// Bytes written so far.
    buf: Vec<u8>,
    /// Descriptors referenced by `h` values, in index order.
    fds: Vec<OwnedFd>,
}

impl Encoder {
    /// Creates an empty encoder.
    pub const fn new() -> Self {
        Self {
            buf: Vec::new(),
            fds: Vec::new(),
        }
    }

    /// Current write position.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns `true` if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes written so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Writes zero bytes up to the next multiple of `alignment`.
    pub fn pad(&mut self, alignment: usize) {
        let n = padding(self.buf.len(), alignment);
        self.buf.resize(self.buf.len() + n, 0);
    }

    /// `y`
    pub fn add_byte(&mut self, v: u8) {
        self.buf.push(v);
    }

    /// `b`, marshaled as a 32-bit 0 or 1.
    pub fn add_bool(&mut self, v: bool) {
        self.add_u32(u32::from(v));
    }

    /// `n`
    pub fn add_i16(&mut self, v: i16) {
        self.pad(2);
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// `q`
    pub fn add_u16(&mut self, v: u16) {
        self.pad(2);
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// `i`
    pub fn add_i32(&mut self, v: i32) {
        self.pad(4);
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// `u`
    pub fn add_u32(&mut self, v: u32) {
        self.pad(4);
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// `x`
    pub fn add_i64(&mut self, v: i64) {
        self.pad(8);
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// `t`
    pub fn add_u64(&mut self, v: u64) {
        self.pad(8);
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// `d`
    pub fn add_f64(&mut self, v: f64) {
        self.pad(8);
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// `s`: 32-bit length, UTF-8 bytes, NUL terminator.
    pub fn add_str(&mut self, v: &str) -> Result<()> {
        if v.as_bytes().contains(&0) {
            return Err(Error::InteriorNul);
        }
        let len = u32::try_from(v.len()).map_err(|_| Error::ArrayTooLong(v.len()))?;
        self.add_u32(len);
        self.buf.extend_from_slice(v.as_bytes());
        self.buf.push(0);
        Ok(())
    }

    /// `o`: same layout as a string.
    pub fn add_object_path(&mut self, v: &ObjectPath) {
        let len = u32::try_from(v.as_str().len()).unwrap_or(u32::MAX);
        self.add_u32(len);
        self.buf.extend_from_slice(v.as_str().as_bytes());
        self.buf.push(0);
    }

    /// `g`: 8-bit length, ASCII bytes, NUL terminator.
    pub fn add_signature(&mut self, v: &Signature) -> Result<()> {
        let len = u8::try_from(v.as_str().len()).map_err(|_| Error::InvalidSignature {
            signature: v.as_str().to_owned(),
            reason: "longer than 255 bytes",
        })?;
        self.buf.push(len);
        self.buf.extend_from_slice(v.as_str().as_bytes());
        self.buf.push(0);
        Ok(())
    }

    /// `h`: attaches `fd` to the message and writes its index.
    pub fn add_unix_fd(&mut self, fd: OwnedFd) -> u32 {
        #[allow(clippy::cast_possible_truncation)]
        let index = self.fds.len() as u32;
        self.fds.push(fd);
        self.add_u32(index);
        index
    }

    /// `a…`: writes a length-prefixed array whose elements `f` appends.
    ///
    /// The length excludes the padding between the length word and the
    /// first element; that padding is present even for empty arrays.
    pub fn add_array<F>(&mut self, element_alignment: usize, f: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        self.pad(4);
        let len_at = self.buf.len();
        self.buf.extend_from_slice(&[0; 4]);
        self.pad(element_alignment);
        let start = self.buf.len();
        f(self)?;
        let len = self.buf.len() - start;
        if len > MAX_ARRAY_LEN {
            return Err(Error::ArrayTooLong(len));
        }
        #[allow(clippy::cast_possible_truncation)]
        self.buf[len_at..len_at + 4].copy_from_slice(&(len as u32).to_le_bytes());
        Ok(())
    }

    /// `(…)`: always 8-byte aligned regardless of the first field.
    pub fn add_struct<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        self.pad(8);
        f(self)
    }

    /// `{…}`: one dict entry; `f` writes the key then the value.
    pub fn add_dict_entry<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        self.add_struct(f)
    }

    /// `a{…}`: an array of dict entries written by `f`.
    pub fn add_dict<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        self.add_array(8, f)
    }

    /// One `{sv}` entry of a property map.
    pub fn add_property(&mut self, name: &str, value: &Value) -> Result<()> {
        self.add_dict_entry(|e| {
            e.add_str(name)?;
            e.add_variant(value)
        })
    }

    /// `v`: the value's signature followed by the value.
    ///
    /// An existing [`Value::Variant`] is written as a variant of a variant.
    pub fn add_variant(&mut self, value: &Value) -> Result<()> {
        self.add_signature(&Signature::from_types(&[value.ty()])?)?;
        self.add_value(value)
    }

    /// Writes any value according to its own type.
    ///
    /// [`Value::UnixFd`] writes the index as-is; the descriptor itself must
    /// be attached with [`Encoder::add_unix_fd`] or [`Encoder::attach_fd`].
    pub fn add_value(&mut self, value: &Value) -> Result<()> {
        match value {
            Value::Byte(v) => self.add_byte(*v),
            Value::Bool(v) => self.add_bool(*v),
            Value::Int16(v) => self.add_i16(*v),
            Value::UInt16(v) => self.add_u16(*v),
            Value::Int32(v) => self.add_i32(*v),
            Value::UInt32(v) | Value::UnixFd(v) => self.add_u32(*v),
            Value::Int64(v) => self.add_i64(*v),
            Value::UInt64(v) => self.add_u64(*v),
            Value::Double(v) => self.add_f64(*v),
            Value::Str(v) => self.add_str(v)?,
            Value::ObjectPath(v) => self.add_object_path(v),
            Value::Signature(v) => self.add_signature(v)?,
            Value::Variant(inner) => self.add_variant(inner)?,
            Value::Array(a) => self.add_array(a.element().alignment(), |e| {
                a.items().iter().try_for_each(|item| e.add_value(item))
            })?,
            Value::Dict(d) => self.add_dict(|e| {
                d.entries().iter().try_for_each(|(k, v)| {
                    e.add_dict_entry(|e| {
                        e.add_value(k)?;
                        e.add_value(v)
                    })
                })
            })?,
            Value::Struct(fields) => {
                self.add_struct(|e| fields.iter().try_for_each(|f| e.add_value(f)))?;
            }
        }
        Ok(())
    }

    /// Attaches a descriptor without writing anything; returns its index.
    pub fn attach_fd(&mut self, fd: OwnedFd) -> u32 {
        #[allow(clippy::cast_possible_truncation)]
        let index = self.fds.len() as u32;
        self.fds.push(fd);
        index
    }

    /// Finishes the buffer as a message body with the given signature.
    pub fn finish(self, signature: Signature) -> Body {
        Body::from_parts(signature, self.buf, self.fds)
    }

    /// Consumes the encoder, returning bytes and attached descriptors.
    pub fn into_parts(self) -> (Vec<u8>, Vec<OwnedFd>) {
        (self.buf, self.fds)
    }
}
