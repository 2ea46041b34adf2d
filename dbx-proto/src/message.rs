//! Message headers, bodies and their wire layout.
//!
//! A frame is a 16-byte fixed header, an `a(yv)` array of header fields
//! padded to 8 bytes, then the body:
//!
//! ```text
//! 'l' type flags 1 | body_len:u32 | serial:u32 | fields_len:u32 | fields… | pad | body
//! ```

use std::fmt;
use std::os::fd::OwnedFd;
use std::sync::Mutex;

use crate::align::align_up;
use crate::arg::Args;
use crate::decoder::Decoder;
use crate::encoder::Encoder;
use crate::error::{Error, Result};
use crate::signature::{ObjectPath, Signature, Type};
use crate::value::Value;

/// Length of the fixed part of every header.
pub const FIXED_HEADER_LEN: usize = 16;

/// Maximum total message length (128 MiB).
pub const MAX_MESSAGE_LEN: usize = 128 * 1024 * 1024;

/// Endianness marker for little-endian messages.
const LITTLE_ENDIAN: u8 = b'l';

/// Major protocol version carried in every header.
const PROTOCOL_VERSION: u8 = 1;

/// Header field codes.
mod field {
    pub const PATH: u8 = 1;
    pub const INTERFACE: u8 = 2;
    pub const MEMBER: u8 = 3;
    pub const ERROR_NAME: u8 = 4;
    pub const REPLY_SERIAL: u8 = 5;
    pub const DESTINATION: u8 = 6;
    pub const SENDER: u8 = 7;
    pub const SIGNATURE: u8 = 8;
    pub const UNIX_FDS: u8 = 9;
}

/// Kind of message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
#[repr(u8)]
pub enum MessageType {
    /// A method invocation.
    MethodCall = 1,
    /// A successful reply.
    MethodReturn = 2,
    /// An error reply.
    Error = 3,
    /// A broadcast or unicast signal.
    Signal = 4,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            1 => Ok(Self::MethodCall),
            2 => Ok(Self::MethodReturn),
            3 => Ok(Self::Error),
            4 => Ok(Self::Signal),
            other => Err(Error::UnsupportedMessageType(other)),
        }
    }
}

/// Header flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Flags(u8);

impl Flags {
    /// The sender does not want a reply.
    pub const NO_REPLY_EXPECTED: Self = Self(0x1);
    /// Do not auto-start the destination service.
    pub const NO_AUTO_START: Self = Self(0x2);
    /// The caller is prepared to wait for interactive authorization.
    pub const ALLOW_INTERACTIVE_AUTHORIZATION: Self = Self(0x4);

    /// No flags set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Wraps raw flag bits; unknown bits are kept.
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Raw flag bits.
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Returns `true` if every bit in `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Sets the bits in `other`.
    pub const fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for Flags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// An encoded body: signature, bytes and attached descriptors.
#[derive(Debug, Default)]
pub struct Body {
    /// Describes the layout of `data`.
    signature: Signature,
    /// Marshaled values.
    data: Vec<u8>,
    /// Descriptors referenced by `h` values.
    fds: Vec<OwnedFd>,
}

impl Body {
    /// An empty body.
    pub const fn empty() -> Self {
        Self {
            signature: Signature::empty(),
            data: Vec::new(),
            fds: Vec::new(),
        }
    }

    /// Assembles a body from already-marshaled parts.
    pub const fn from_parts(signature: Signature, data: Vec<u8>, fds: Vec<OwnedFd>) -> Self {
        Self {
            signature,
            data,
            fds,
        }
    }

    /// Encodes `values` one after another, deriving the signature.
    pub fn from_values(values: &[Value]) -> Result<Self> {
        let types: Vec<Type> = values.iter().map(Value::ty).collect();
        let signature = Signature::from_types(&types)?;
        let mut enc = Encoder::new();
        for v in values {
            enc.add_value(v)?;
        }
        Ok(enc.finish(signature))
    }

    /// Encodes a tuple of arguments.
    pub fn from_args<T: Args>(args: &T) -> Result<Self> {
        let signature = T::body_signature()?;
        let mut enc = Encoder::new();
        args.encode_args(&mut enc)?;
        Ok(enc.finish(signature))
    }

    /// Body signature.
    pub const fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Marshaled bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Attached descriptors.
    pub fn fds(&self) -> &[OwnedFd] {
        &self.fds
    }
}

/// A complete D-Bus message.
///
/// Outbound messages are built with the `method_call`/`signal`/`method_return`
/// /`error` constructors and serialized with [`Message::encode_header`];
/// inbound ones come from [`Message::decode`].
pub struct Message {
    /// Message kind.
    message_type: MessageType,
    /// Header flags.
    flags: Flags,
    /// Serial; zero until assigned by the connection.
    serial: u32,
    /// Object path (`o`, field 1).
    path: Option<ObjectPath>,
    /// Interface (`s`, field 2).
    interface: Option<String>,
    /// Member (`s`, field 3).
    member: Option<String>,
    /// Error name (`s`, field 4).
    error_name: Option<String>,
    /// Serial of the call this replies to (`u`, field 5).
    reply_serial: Option<u32>,
    /// Destination bus name (`s`, field 6).
    destination: Option<String>,
    /// Sender bus name (`s`, field 7).
    sender: Option<String>,
    /// Body signature (`g`, field 8).
    signature: Signature,
    /// Body bytes.
    body: Vec<u8>,
    /// Attached descriptors; taken out individually by index.
    fds: Mutex<Vec<Option<OwnedFd>>>,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("type", &self.message_type)
            .field("serial", &self.serial)
            .field("flags", &self.flags)
            .field("path", &self.path)
            .field("interface", &self.interface)
            .field("member", &self.member)
            .field("error_name", &self.error_name)
            .field("reply_serial", &self.reply_serial)
            .field("destination", &self.destination)
            .field("sender", &self.sender)
            .field("signature", &self.signature.as_str())
            .field("body_len", &self.body.len())
            .finish_non_exhaustive()
    }
}

impl Message {
    const fn blank(message_type: MessageType) -> Self {
        Self {
            message_type,
            flags: Flags::empty(),
            serial: 0,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            reply_serial: None,
            destination: None,
            sender: None,
            signature: Signature::empty(),
            body: Vec::new(),
            fds: Mutex::new(Vec::new()),
        }
    }

    /// A method call to `member` on the object at `path`.
    pub fn method_call(path: ObjectPath, member: impl Into<String>) -> Self {
        let mut msg = Self::blank(MessageType::MethodCall);
        msg.path = Some(path);
        msg.member = Some(member.into());
        msg
    }

    /// A signal emitted from `path`.
    pub fn signal(
        path: ObjectPath,
        interface: impl Into<String>,
        member: impl Into<String>,
    ) -> Self {
        let mut msg = Self::blank(MessageType::Signal);
        msg.path = Some(path);
        msg.interface = Some(interface.into());
        msg.member = Some(member.into());
        msg
    }

    /// A successful reply to `call`.
    pub fn method_return(call: &Self) -> Self {
        let mut msg = Self::blank(MessageType::MethodReturn);
        msg.reply_serial = Some(call.serial);
        msg.destination.clone_from(&call.sender);
        msg.flags = Flags::NO_REPLY_EXPECTED;
        msg
    }

    /// An error reply to `call`.
    pub fn error(call: &Self, name: impl Into<String>, message: &str) -> Result<Self> {
        let mut msg = Self::blank(MessageType::Error);
        msg.reply_serial = Some(call.serial);
        msg.destination.clone_from(&call.sender);
        msg.error_name = Some(name.into());
        msg.flags = Flags::NO_REPLY_EXPECTED;
        let mut enc = Encoder::new();
        enc.add_str(message)?;
        Ok(msg.with_body(enc.finish(Signature::from(Type::Str))))
    }

    /// Sets the interface header.
    #[must_use]
    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    /// Sets the destination header.
    #[must_use]
    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Sets the sender header.
    #[must_use]
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// Adds header flags.
    #[must_use]
    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags.insert(flags);
        self
    }

    /// Replaces the body.
    #[must_use]
    pub fn with_body(mut self, body: Body) -> Self {
        self.signature = body.signature;
        self.body = body.data;
        self.fds = Mutex::new(body.fds.into_iter().map(Some).collect());
        self
    }

    /// Assigns the serial. Done by the connection just before sending.
    pub const fn set_serial(&mut self, serial: u32) {
        self.serial = serial;
    }

    /// Message kind.
    pub const fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Header flags.
    pub const fn flags(&self) -> Flags {
        self.flags
    }

    /// Returns `true` if the sender asked for no reply.
    pub const fn no_reply_expected(&self) -> bool {
        self.flags.contains(Flags::NO_REPLY_EXPECTED)
    }

    /// Serial (zero if not yet assigned).
    pub const fn serial(&self) -> u32 {
        self.serial
    }

    /// Object path.
    pub const fn path(&self) -> Option<&ObjectPath> {
        self.path.as_ref()
    }

    /// Interface name.
    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    /// Member name.
    pub fn member(&self) -> Option<&str> {
        self.member.as_deref()
    }

    /// Error name.
    pub fn error_name(&self) -> Option<&str> {
        self.error_name.as_deref()
    }

    /// Serial of the call this message answers.
    pub const fn reply_serial(&self) -> Option<u32> {
        self.reply_serial
    }

    /// Destination bus name.
    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    /// Sender bus name.
    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    /// Body signature.
    pub const fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Body bytes.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Number of attached descriptors (taken ones included).
    pub fn fd_count(&self) -> usize {
        self.fds.lock().map_or(0, |fds| fds.len())
    }

    /// Returns a decoder positioned at the start of the body.
    pub fn decoder(&self) -> Decoder<'_> {
        Decoder::for_body(&self.body, &self.signature, self.fd_count())
    }

    /// Decodes the body as `T` after checking its signature.
    pub fn read_args<T: Args>(&self) -> Result<T> {
        let mut dec = self.decoder();
        dec.assert_signature(T::body_signature()?.as_str())?;
        T::decode_args(&mut dec)
    }

    /// Takes ownership of the descriptor at `index`.
    ///
    /// Each descriptor can be taken once; untaken ones close with the message.
    pub fn take_fd(&self, index: u32) -> Option<OwnedFd> {
        let mut fds = self.fds.lock().ok()?;
        fds.get_mut(usize::try_from(index).ok()?)?.take()
    }

    /// The human-readable text of an error reply (its first string).
    pub fn error_message(&self) -> Option<String> {
        if self.signature.types().first() != Some(&Type::Str) {
            return None;
        }
        self.decoder().get_str().ok().map(str::to_owned)
    }

    /// Checks that the header fields required for this message type are set.
    pub fn validate(&self) -> Result<()> {
        fn non_empty(v: Option<&str>, name: &'static str) -> Result<()> {
            match v {
                Some(s) if !s.is_empty() => Ok(()),
                _ => Err(Error::MissingHeaderField(name)),
            }
        }
        match self.message_type {
            MessageType::MethodCall => {
                self.path.as_ref().ok_or(Error::MissingHeaderField("path"))?;
                non_empty(self.member(), "member")
            }
            MessageType::Signal => {
                self.path.as_ref().ok_or(Error::MissingHeaderField("path"))?;
                non_empty(self.interface(), "interface")?;
                non_empty(self.member(), "member")
            }
            MessageType::Error => {
                non_empty(self.error_name(), "error name")?;
                self.reply_serial
                    .ok_or(Error::MissingHeaderField("reply serial"))
                    .map(drop)
            }
            MessageType::MethodReturn => self
                .reply_serial
                .ok_or(Error::MissingHeaderField("reply serial"))
                .map(drop),
        }
    }

    /// Serializes the fixed header and header fields, padded to 8 bytes.
    ///
    /// The body is sent separately, right after these bytes.
    pub fn encode_header(&self) -> Result<Vec<u8>> {
        if self.serial == 0 {
            return Err(Error::ZeroSerial);
        }
        self.validate()?;
        let body_len = u32::try_from(self.body.len())
            .map_err(|_| Error::MessageTooLong(self.body.len()))?;

        let mut enc = Encoder::new();
        enc.add_byte(LITTLE_ENDIAN);
        enc.add_byte(self.message_type as u8);
        enc.add_byte(self.flags.bits());
        enc.add_byte(PROTOCOL_VERSION);
        enc.add_u32(body_len);
        enc.add_u32(self.serial);
        enc.add_array(8, |e| {
            if let Some(p) = &self.path {
                header_field(e, field::PATH, &Value::ObjectPath(p.clone()))?;
            }
            let strings = [
                (field::INTERFACE, &self.interface),
                (field::MEMBER, &self.member),
                (field::ERROR_NAME, &self.error_name),
                (field::DESTINATION, &self.destination),
                (field::SENDER, &self.sender),
            ];
            for (code, v) in strings {
                if let Some(s) = v {
                    header_field(e, code, &Value::Str(s.clone()))?;
                }
            }
            if let Some(r) = self.reply_serial {
                header_field(e, field::REPLY_SERIAL, &Value::UInt32(r))?;
            }
            if !self.signature.is_empty() {
                header_field(e, field::SIGNATURE, &Value::Signature(self.signature.clone()))?;
            }
            let fds = self.fd_count();
            if fds > 0 {
                #[allow(clippy::cast_possible_truncation)]
                header_field(e, field::UNIX_FDS, &Value::UInt32(fds as u32))?;
            }
            Ok(())
        })?;
        enc.pad(8);

        let total = enc.len() + self.body.len();
        if total > MAX_MESSAGE_LEN {
            return Err(Error::MessageTooLong(total));
        }
        Ok(enc.into_parts().0)
    }

    /// Takes every descriptor not yet taken, in index order.
    ///
    /// [`Message::fd_count`] is unchanged, so the header still announces them.
    pub fn take_fds(&self) -> Vec<OwnedFd> {
        match self.fds.lock() {
            Ok(mut fds) => fds.iter_mut().filter_map(Option::take).collect(),
            Err(poisoned) => poisoned.into_inner().iter_mut().filter_map(Option::take).collect(),
        }
    }

    /// Runs `f` with the attached descriptors.
    pub fn with_fds<R>(&self, f: impl FnOnce(&[Option<OwnedFd>]) -> R) -> R {
        match self.fds.lock() {
            Ok(fds) => f(&fds),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }

    /// Parses a complete frame (header, fields, padding, body).
    ///
    /// `fds` are the descriptors received alongside the frame; extra ones
    /// beyond the `UNIX_FDS` count are closed.
    pub fn decode(frame: Vec<u8>, mut fds: Vec<OwnedFd>) -> Result<Self> {
        let lengths = FrameLengths::parse(&frame)?;
        if frame.len() != lengths.total() {
            return Err(Error::BodyLength {
                declared: lengths.body,
                actual: frame.len().saturating_sub(lengths.body_start()),
            });
        }
        let message_type = MessageType::try_from(frame[1])?;
        let mut msg = Self::blank(message_type);
        msg.flags = Flags::from_bits(frame[2]);
        msg.serial = u32::from_le_bytes([frame[8], frame[9], frame[10], frame[11]]);
        if msg.serial == 0 {
            return Err(Error::ZeroSerial);
        }

        let mut unix_fds = 0u32;
        {
            let header = &frame[..lengths.body_start()];
            let mut dec = Decoder::at(header, FIXED_HEADER_LEN - 4);
            dec.get_array(8, |d| {
                d.align(8)?;
                let code = d.get_byte()?;
                let value = d.get_variant()?;
                msg.set_field(code, value, &mut unix_fds)
            })?;
        }
        msg.validate()?;

        let wanted = usize::try_from(unix_fds).unwrap_or(usize::MAX);
        if fds.len() < wanted {
            return Err(Error::FdOutOfRange {
                index: unix_fds,
                count: fds.len(),
            });
        }
        fds.truncate(wanted);

        let mut frame = frame;
        msg.body = frame.split_off(lengths.body_start());
        msg.fds = Mutex::new(fds.into_iter().map(Some).collect());
        Ok(msg)
    }

    fn set_field(&mut self, code: u8, value: Value, unix_fds: &mut u32) -> Result<()> {
        let bad = || Error::InvalidHeaderField(code);
        match (code, value) {
            (field::PATH, Value::ObjectPath(p)) => self.path = Some(p),
            (field::INTERFACE, Value::Str(s)) => self.interface = Some(s),
            (field::MEMBER, Value::Str(s)) => self.member = Some(s),
            (field::ERROR_NAME, Value::Str(s)) => self.error_name = Some(s),
            (field::REPLY_SERIAL, Value::UInt32(r)) => self.reply_serial = Some(r),
            (field::DESTINATION, Value::Str(s)) => self.destination = Some(s),
            (field::SENDER, Value::Str(s)) => self.sender = Some(s),
            (field::SIGNATURE, Value::Signature(g)) => self.signature = g,
            (field::UNIX_FDS, Value::UInt32(n)) => *unix_fds = n,
            (field::PATH..=field::UNIX_FDS, _) => return Err(bad()),
            // Unknown fields must be ignored.
            _ => {}
        }
        Ok(())
    }
}

/// Appends one `(yv)` header field.
fn header_field(enc: &mut Encoder, code: u8, value: &Value) -> Result<()> {
    enc.add_struct(|e| {
        e.add_byte(code);
        e.add_variant(value)
    })
}

/// Sizes derived from the fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct FrameLengths {
    /// Length of the header-fields array payload.
    pub fields: usize,
    /// Length of the body.
    pub body: usize,
}

impl FrameLengths {
    /// Reads the lengths from the first 16 bytes of a frame.
    ///
    /// Fails on anything that prevents locating the end of the frame; the
    /// stream cannot be resynchronized after such an error.
    pub fn parse(fixed: &[u8]) -> Result<Self> {
        if fixed.len() < FIXED_HEADER_LEN {
            return Err(Error::UnexpectedEof);
        }
        if fixed[0] != LITTLE_ENDIAN {
            return Err(Error::UnsupportedEndianness(fixed[0]));
        }
        if fixed[3] != PROTOCOL_VERSION {
            return Err(Error::UnsupportedVersion(fixed[3]));
        }
        let word = |at: usize| {
            u32::from_le_bytes([fixed[at], fixed[at + 1], fixed[at + 2], fixed[at + 3]]) as usize
        };
        let lengths = Self {
            body: word(4),
            fields: word(12),
        };
        if lengths.total() > MAX_MESSAGE_LEN {
            return Err(Error::MessageTooLong(lengths.total()));
        }
        Ok(lengths)
    }

    /// Offset of the first body byte.
    pub const fn body_start(&self) -> usize {
        align_up(FIXED_HEADER_LEN + self.fields, 8)
    }

    /// Total frame length.
    pub const fn total(&self) -> usize {
        self.body_start() + self.body
    }
}
