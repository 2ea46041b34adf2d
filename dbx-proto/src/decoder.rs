//! Cursor-based D-Bus unmarshaling.
//!
//! A [`Decoder`] borrows the body bytes and mirrors every [`Encoder`]
//! primitive. Reads align the cursor first and reject non-zero padding.
//!
//! [`Encoder`]: crate::encoder::Encoder

use crate::align::align_up;
use crate::encoder::MAX_ARRAY_LEN;
use crate::error::{Error, Result};
use crate::signature::{MAX_DEPTH, ObjectPath, Signature, Type};
use crate::value::{Array, Dict, Value};

/// Maximum number of fields in a dynamically decoded struct.
pub const MAX_STRUCT_FIELDS: usize = 16;

/// Reads values out of a borrowed buffer.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    /// Message-relative bytes; alignment is computed from offset 0.
    buf: &'a [u8],
    /// Read cursor.
    pos: usize,
    /// Body signature, if decoding a body.
    signature: Option<&'a Signature>,
    /// Number of descriptors attached to the message.
    fds: usize,
    /// Current container nesting, variants included.
    depth: usize,
}

impl<'a> Decoder<'a> {
    /// Decodes raw bytes with no signature or descriptors.
    pub const fn new(buf: &'a [u8]) -> Self {
        Self::at(buf, 0)
    }

    /// Decodes raw bytes starting at `pos`.
    pub const fn at(buf: &'a [u8], pos: usize) -> Self {
        Self {
            buf,
            pos,
            signature: None,
            fds: 0,
            depth: 0,
        }
    }

    /// Decodes a message body described by `signature`.
    pub const fn for_body(buf: &'a [u8], signature: &'a Signature, fds: usize) -> Self {
        Self {
            buf,
            pos: 0,
            signature: Some(signature),
            fds,
            depth: 0,
        }
    }

    /// Current cursor.
    pub const fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left after the cursor.
    pub const fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    /// Returns `true` once every byte has been consumed.
    pub const fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Fails with [`Error::SignatureMismatch`] unless the body signature is
    /// exactly `expected`.
    pub fn assert_signature(&self, expected: &str) -> Result<()> {
        let actual = self.signature.map_or("", Signature::as_str);
        if actual == expected {
            Ok(())
        } else {
            Err(Error::SignatureMismatch {
                expected: expected.to_owned(),
                actual: actual.to_owned(),
            })
        }
    }

    /// Skips to `alignment`, checking that the skipped bytes are zero.
    pub fn align(&mut self, alignment: usize) -> Result<()> {
        let next = align_up(self.pos, alignment);
        let pad = self.buf.get(self.pos..next).ok_or(Error::UnexpectedEof)?;
        if let Some(i) = pad.iter().position(|&b| b != 0) {
            return Err(Error::NonZeroPadding(self.pos + i));
        }
        self.pos = next;
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(Error::UnexpectedEof)?;
        let bytes = self.buf.get(self.pos..end).ok_or(Error::UnexpectedEof)?;
        self.pos = end;
        Ok(bytes)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.align(N)?;
        let bytes = self.take(N)?;
        let mut out = [0; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn enter(&mut self) -> Result<()> {
        if self.depth >= 2 * MAX_DEPTH {
            return Err(Error::TooDeep);
        }
        self.depth += 1;
        Ok(())
    }

    const fn leave(&mut self) {
        self.depth -= 1;
    }

    /// Runs `f` one container level deeper, restoring the depth even when
    /// `f` fails.
    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.enter()?;
        let out = f(self);
        self.leave();
        out
    }

    /// `y`
    pub fn get_byte(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// `b`: anything other than 0 or 1 is rejected.
    pub fn get_bool(&mut self) -> Result<bool> {
        match self.get_u32()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(Error::InvalidBool(other)),
        }
    }

    /// `n`
    pub fn get_i16(&mut self) -> Result<i16> {
        self.take_array().map(i16::from_le_bytes)
    }

    /// `q`
    pub fn get_u16(&mut self) -> Result<u16> {
        self.take_array().map(u16::from_le_bytes)
    }

    /// `i`
    pub fn get_i32(&mut self) -> Result<i32> {
        self.take_array().map(i32::from_le_bytes)
    }

    /// `u`
    pub fn get_u32(&mut self) -> Result<u32> {
        self.take_array().map(u32::from_le_bytes)
    }

    /// `x`
    pub fn get_i64(&mut self) -> Result<i64> {
        self.take_array().map(i64::from_le_bytes)
    }

    /// `t`
    pub fn get_u64(&mut self) -> Result<u64> {
        self.take_array().map(u64::from_le_bytes)
    }

    /// `d`
    pub fn get_f64(&mut self) -> Result<f64> {
        self.take_array().map(f64::from_le_bytes)
    }

    /// `s`: borrowed from the buffer.
    pub fn get_str(&mut self) -> Result<&'a str> {
        let len = self.get_u32()? as usize;
        self.terminated(len)
    }

    /// `o`
    pub fn get_object_path(&mut self) -> Result<ObjectPath> {
        ObjectPath::new(self.get_str()?)
    }

    /// `g`
    pub fn get_signature(&mut self) -> Result<Signature> {
        let len = usize::from(self.get_byte()?);
        Signature::new(self.terminated(len)?)
    }

    /// `h`: the descriptor index, checked against the attached count.
    pub fn get_unix_fd(&mut self) -> Result<u32> {
        let index = self.get_u32()?;
        if index as usize >= self.fds {
            return Err(Error::FdOutOfRange {
                index,
                count: self.fds,
            });
        }
        Ok(index)
    }

    /// Reads `len` bytes of UTF-8 followed by a NUL.
    fn terminated(&mut self, len: usize) -> Result<&'a str> {
        let bytes = self.take(len)?;
        if self.get_byte()? != 0 || bytes.contains(&0) {
            return Err(Error::InvalidString);
        }
        std::str::from_utf8(bytes).map_err(|_| Error::InvalidString)
    }

    /// `a…`: runs `f` once per element until the declared length is used up.
    ///
    /// `f` must consume exactly one element per call.
    pub fn get_array<F>(&mut self, element_alignment: usize, mut f: F) -> Result<()>
    where
        F: FnMut(&mut Self) -> Result<()>,
    {
        let len = self.get_u32()? as usize;
        if len > MAX_ARRAY_LEN {
            return Err(Error::ArrayTooLong(len));
        }
        self.align(element_alignment)?;
        let start = self.pos;
        let end = start + len;
        if end > self.buf.len() {
            return Err(Error::UnexpectedEof);
        }
        self.nested(|d| {
            while d.pos - start < len {
                let before = d.pos;
                f(d)?;
                // An element that reads nothing would loop forever.
                if d.pos > end || d.pos == before {
                    return Err(Error::ArrayOverrun);
                }
            }
            Ok(())
        })
    }

    /// `a{…}`: an array whose elements are 8-byte aligned dict entries.
    pub fn get_dict<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(&mut Self) -> Result<()>,
    {
        self.get_array(8, |d| d.get_dict_entry(&mut f))
    }

    /// `{…}`: aligns to 8, then `f` reads the key and value.
    pub fn get_dict_entry<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        self.get_struct(f)
    }

    /// `(…)`: aligns to 8, then `f` reads the fields.
    pub fn get_struct<F, T>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        self.align(8)?;
        self.nested(f)
    }

    /// `v`: reads the embedded signature, then the value it describes.
    pub fn get_variant(&mut self) -> Result<Value> {
        let len = usize::from(self.get_byte()?);
        let ty = Type::parse_single(self.terminated(len)?)?;
        self.nested(|d| d.get_value(&ty))
    }

    /// Reads one value of type `ty`.
    pub fn get_value(&mut self, ty: &Type) -> Result<Value> {
        Ok(match ty {
            Type::Byte => Value::Byte(self.get_byte()?),
            Type::Bool => Value::Bool(self.get_bool()?),
            Type::Int16 => Value::Int16(self.get_i16()?),
            Type::UInt16 => Value::UInt16(self.get_u16()?),
            Type::Int32 => Value::Int32(self.get_i32()?),
            Type::UInt32 => Value::UInt32(self.get_u32()?),
            Type::Int64 => Value::Int64(self.get_i64()?),
            Type::UInt64 => Value::UInt64(self.get_u64()?),
            Type::Double => Value::Double(self.get_f64()?),
            Type::Str => Value::Str(self.get_str()?.to_owned()),
            Type::ObjectPath => Value::ObjectPath(self.get_object_path()?),
            Type::Signature => Value::Signature(self.get_signature()?),
            Type::UnixFd => Value::UnixFd(self.get_unix_fd()?),
            Type::Variant => Value::Variant(Box::new(self.get_variant()?)),
            Type::Array(elem) => {
                let mut items = Vec::new();
                self.get_array(elem.alignment(), |d| {
                    items.push(d.get_value(elem)?);
                    Ok(())
                })?;
                Value::Array(Array::new((**elem).clone(), items)?)
            }
            Type::Dict(key, value) => {
                let mut dict = Dict::new((**key).clone(), (**value).clone())?;
                self.get_dict(|d| {
                    let k = d.get_value(key)?;
                    let v = d.get_value(value)?;
                    dict.insert(k, v)
                })?;
                Value::Dict(dict)
            }
            Type::Struct(fields) => {
                if fields.len() > MAX_STRUCT_FIELDS {
                    return Err(Error::StructTooWide(fields.len()));
                }
                let values = self.get_struct(|d| {
                    fields.iter().map(|f| d.get_value(f)).collect::<Result<Vec<_>>>()
                })?;
                Value::Struct(values)
            }
        })
    }

    /// Decodes the remaining body following its signature.
    pub fn get_values(&mut self) -> Result<Vec<Value>> {
        let Some(signature) = self.signature else {
            return Ok(Vec::new());
        };
        signature.types().iter().map(|t| self.get_value(t)).collect()
    }
}
