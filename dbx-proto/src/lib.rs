//! D-Bus wire format.
//!
//! Signatures and object paths, the dynamically typed [`Value`] tree, the
//! [`Encoder`]/[`Decoder`] pair with D-Bus alignment rules, and
//! [`Message`] framing. Only little-endian messages are produced and
//! accepted.

pub mod align;
mod arg;
pub mod codec;
mod decoder;
mod encoder;
mod error;
mod message;
mod signature;
mod value;

pub use arg::{Arg, Args};
pub use decoder::{Decoder, MAX_STRUCT_FIELDS};
pub use encoder::{Encoder, MAX_ARRAY_LEN};
pub use error::{Error, Result};
pub use message::{
    Body, FIXED_HEADER_LEN, Flags, FrameLengths, MAX_MESSAGE_LEN, Message, MessageType,
};
pub use signature::{MAX_DEPTH, MAX_SIGNATURE_LEN, ObjectPath, Signature, Type};
pub use value::{Array, Dict, Value};
