//! Statically typed arguments.
//!
//! [`Arg`] ties a Rust type to its D-Bus type and to the encoder/decoder
//! calls that marshal it. [`Args`] does the same for a whole message body,
//! written as a tuple of arguments.

use std::collections::{BTreeMap, HashMap};
use std::hash::{BuildHasher, Hash};

use crate::decoder::Decoder;
use crate::encoder::Encoder;
use crate::error::Result;
use crate::signature::{ObjectPath, Signature, Type};
use crate::value::Value;

/// A value with a fixed D-Bus type.
pub trait Arg: Sized {
    /// The D-Bus type of every value of `Self`.
    fn ty() -> Type;

    /// Appends `self` at the encoder's position.
    fn encode(&self, enc: &mut Encoder) -> Result<()>;

    /// Reads one value at the decoder's position.
    fn decode(dec: &mut Decoder<'_>) -> Result<Self>;

    /// Single-type signature of `Self`.
    fn signature() -> Signature {
        Signature::from(Self::ty())
    }
}

/// A sequence of top-level arguments forming a message body.
pub trait Args: Sized {
    /// Types of the arguments, in order.
    fn types() -> Vec<Type>;

    /// Appends every argument.
    fn encode_args(&self, enc: &mut Encoder) -> Result<()>;

    /// Reads every argument.
    fn decode_args(dec: &mut Decoder<'_>) -> Result<Self>;

    /// Body signature.
    fn body_signature() -> Result<Signature> {
        Signature::from_types(&Self::types())
    }
}

macro_rules! impl_primitive {
    ($($ty:ty => $variant:ident, $add:ident, $get:ident);* $(;)?) => {
        $(
            impl Arg for $ty {
                fn ty() -> Type {
                    Type::$variant
                }

                fn encode(&self, enc: &mut Encoder) -> Result<()> {
                    enc.$add(*self);
                    Ok(())
                }

                fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
                    dec.$get()
                }
            }
        )*
    };
}

impl_primitive! {
    u8 => Byte, add_byte, get_byte;
    bool => Bool, add_bool, get_bool;
    i16 => Int16, add_i16, get_i16;
    u16 => UInt16, add_u16, get_u16;
    i32 => Int32, add_i32, get_i32;
    u32 => UInt32, add_u32, get_u32;
    i64 => Int64, add_i64, get_i64;
    u64 => UInt64, add_u64, get_u64;
    f64 => Double, add_f64, get_f64;
}

impl Arg for String {
    fn ty() -> Type {
        Type::Str
    }

    fn encode(&self, enc: &mut Encoder) -> Result<()> {
        enc.add_str(self)
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        dec.get_str().map(str::to_owned)
    }
}

impl Arg for ObjectPath {
    fn ty() -> Type {
        Type::ObjectPath
    }

    fn encode(&self, enc: &mut Encoder) -> Result<()> {
        enc.add_object_path(self);
        Ok(())
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        dec.get_object_path()
    }
}

impl Arg for Signature {
    fn ty() -> Type {
        Type::Signature
    }

    fn encode(&self, enc: &mut Encoder) -> Result<()> {
        enc.add_signature(self)
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        dec.get_signature()
    }
}

/// A [`Value`] argument is always marshaled as a variant.
impl Arg for Value {
    fn ty() -> Type {
        Type::Variant
    }

    fn encode(&self, enc: &mut Encoder) -> Result<()> {
        enc.add_variant(self)
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        dec.get_variant()
    }
}

impl<T: Arg> Arg for Vec<T> {
    fn ty() -> Type {
        Type::Array(Box::new(T::ty()))
    }

    fn encode(&self, enc: &mut Encoder) -> Result<()> {
        enc.add_array(T::ty().alignment(), |e| {
            self.iter().try_for_each(|item| item.encode(e))
        })
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let mut items = Vec::new();
        dec.get_array(T::ty().alignment(), |d| {
            items.push(T::decode(d)?);
            Ok(())
        })?;
        Ok(items)
    }
}

fn encode_entries<'a, K, V, I>(enc: &mut Encoder, entries: I) -> Result<()>
where
    K: Arg + 'a,
    V: Arg + 'a,
    I: IntoIterator<Item = (&'a K, &'a V)>,
{
    enc.add_dict(|e| {
        entries.into_iter().try_for_each(|(k, v)| {
            e.add_dict_entry(|e| {
                k.encode(e)?;
                v.encode(e)
            })
        })
    })
}

fn decode_entries<K: Arg, V: Arg>(
    dec: &mut Decoder<'_>,
    mut insert: impl FnMut(K, V),
) -> Result<()> {
    dec.get_dict(|d| {
        let k = K::decode(d)?;
        let v = V::decode(d)?;
        insert(k, v);
        Ok(())
    })
}

impl<K, V, S> Arg for HashMap<K, V, S>
where
    K: Arg + Eq + Hash,
    V: Arg,
    S: BuildHasher + Default,
{
    fn ty() -> Type {
        Type::Dict(Box::new(K::ty()), Box::new(V::ty()))
    }

    fn encode(&self, enc: &mut Encoder) -> Result<()> {
        encode_entries(enc, self)
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let mut map = Self::default();
        decode_entries(dec, |k, v| {
            map.insert(k, v);
        })?;
        Ok(map)
    }
}

impl<K: Arg + Ord, V: Arg> Arg for BTreeMap<K, V> {
    fn ty() -> Type {
        Type::Dict(Box::new(K::ty()), Box::new(V::ty()))
    }

    fn encode(&self, enc: &mut Encoder) -> Result<()> {
        encode_entries(enc, self)
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let mut map = Self::new();
        decode_entries(dec, |k, v| {
            map.insert(k, v);
        })?;
        Ok(map)
    }
}

impl Args for () {
    fn types() -> Vec<Type> {
        Vec::new()
    }

    fn encode_args(&self, _enc: &mut Encoder) -> Result<()> {
        Ok(())
    }

    fn decode_args(_dec: &mut Decoder<'_>) -> Result<Self> {
        Ok(())
    }
}

macro_rules! impl_tuple {
    ($($name:ident . $idx:tt),+) => {
        impl<$($name: Arg),+> Arg for ($($name,)+) {
            fn ty() -> Type {
                Type::Struct(vec![$($name::ty()),+])
            }

            fn encode(&self, enc: &mut Encoder) -> Result<()> {
                enc.add_struct(|e| {
                    $(self.$idx.encode(e)?;)+
                    Ok(())
                })
            }

            fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
                dec.get_struct(|d| Ok(($($name::decode(d)?,)+)))
            }
        }

        impl<$($name: Arg),+> Args for ($($name,)+) {
            fn types() -> Vec<Type> {
                vec![$($name::ty()),+]
            }

            fn encode_args(&self, enc: &mut Encoder) -> Result<()> {
                $(self.$idx.encode(enc)?;)+
                Ok(())
            }

            fn decode_args(dec: &mut Decoder<'_>) -> Result<Self> {
                Ok(($($name::decode(dec)?,)+))
            }
        }
    };
}

impl_tuple!(A.0);
impl_tuple!(A.0, B.1);
impl_tuple!(A.0, B.1, C.2);
impl_tuple!(A.0, B.1, C.2, D.3);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Body;

    #[test]
    fn signatures_of_composite_types() {
        assert_eq!(<Vec<String>>::signature(), "as");
        assert_eq!(<HashMap<String, Value>>::signature(), "a{sv}");
        assert_eq!(<(u8, Vec<(i32, String)>)>::signature(), "(ya(is))");
        assert_eq!(
            <BTreeMap<ObjectPath, BTreeMap<String, BTreeMap<String, Value>>>>::signature(),
            "a{oa{sa{sv}}}"
        );
        assert_eq!(<(String, u32)>::signature(), "(su)");
        assert_eq!(<(String, u32)>::body_signature().unwrap(), "su");
    }

    #[test]
    fn struct_round_trip_keeps_alignment() {
        let value = (7u8, vec![(1i32, "one".to_owned()), (2, "two".to_owned())]);
        let mut enc = Encoder::new();
        enc.add_byte(0xaa);
        value.encode(&mut enc).unwrap();
        let (bytes, _) = enc.into_parts();
        // The struct starts at the next 8-byte boundary.
        assert_eq!(bytes[8], 7);

        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.get_byte().unwrap(), 0xaa);
        assert_eq!(<(u8, Vec<(i32, String)>)>::decode(&mut dec).unwrap(), value);
        assert!(dec.is_empty());
    }

    #[test]
    fn maps_round_trip() {
        let mut props = BTreeMap::new();
        props.insert("Enabled".to_owned(), Value::Bool(true));
        props.insert("Count".to_owned(), Value::UInt32(3));
        let mut enc = Encoder::new();
        props.encode(&mut enc).unwrap();
        let (bytes, _) = enc.into_parts();
        let decoded = <BTreeMap<String, Value>>::decode(&mut Decoder::new(&bytes)).unwrap();
        assert_eq!(decoded, props);
    }

    #[test]
    fn body_args_round_trip() {
        let body = Body::from_args(&("org.example.Name".to_owned(), 4u32)).unwrap();
        assert_eq!(body.signature(), "su");
        let mut dec = Decoder::for_body(body.data(), body.signature(), 0);
        let (name, flags) = <(String, u32)>::decode_args(&mut dec).unwrap();
        assert_eq!(name, "org.example.Name");
        assert_eq!(flags, 4);
    }
}
