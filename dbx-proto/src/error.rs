//! Encode and decode failures.

/// Alias for `Result<T, dbx_proto::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while marshaling or unmarshaling D-Bus data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The buffer ended before the value was complete.
    #[error("unexpected end of message")]
    UnexpectedEof,

    /// A signature contained a code outside the type table.
    #[error("unknown type code {0:?} in signature")]
    UnknownType(char),

    /// A signature was structurally invalid (unbalanced brackets, bad dict).
    #[error("invalid signature {signature:?}: {reason}")]
    InvalidSignature {
        /// The offending signature text.
        signature: String,
        /// What was wrong with it.
        reason: &'static str,
    },

    /// The body signature differs from what the reader expected.
    #[error("signature mismatch: expected {expected:?}, found {actual:?}")]
    SignatureMismatch {
        /// Signature the reader asked for.
        expected: String,
        /// Signature carried by the message.
        actual: String,
    },

    /// A string was not a valid object path.
    #[error("invalid object path {0:?}")]
    InvalidObjectPath(String),

    /// String data was not valid UTF-8 or lacked its NUL terminator.
    #[error("invalid string data")]
    InvalidString,

    /// A string to be encoded contained a NUL byte.
    #[error("string contains an interior NUL byte")]
    InteriorNul,

    /// A boolean was encoded as something other than 0 or 1.
    #[error("invalid boolean value {0}")]
    InvalidBool(u32),

    /// A padding byte was not zero.
    #[error("non-zero padding at offset {0}")]
    NonZeroPadding(usize),

    /// An array payload exceeded the 64 MiB protocol limit.
    #[error("array of {0} bytes exceeds the protocol limit")]
    ArrayTooLong(usize),

    /// An array element ran past the declared array length.
    #[error("array element overruns declared length")]
    ArrayOverrun,

    /// A struct had more fields than the decoder supports.
    #[error("struct with {0} fields exceeds the supported arity")]
    StructTooWide(usize),

    /// Containers nested deeper than the protocol allows.
    #[error("containers nested too deeply")]
    TooDeep,

    /// A value did not match the type it was declared with.
    #[error("value does not match declared type {0:?}")]
    TypeMismatch(String),

    /// The message used big-endian encoding, which is not supported.
    #[error("unsupported endianness marker {0:#04x}")]
    UnsupportedEndianness(u8),

    /// The header announced a protocol version other than 1.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    /// The header carried a message type outside 1..=4.
    #[error("unsupported message type {0}")]
    UnsupportedMessageType(u8),

    /// A message exceeded the 128 MiB protocol limit.
    #[error("message of {0} bytes exceeds the protocol limit")]
    MessageTooLong(usize),

    /// A required header field was absent or empty.
    #[error("missing header field {0}")]
    MissingHeaderField(&'static str),

    /// A header field carried a value of the wrong type.
    #[error("header field {0} has the wrong type")]
    InvalidHeaderField(u8),

    /// The body length did not match the bytes actually present.
    #[error("body length mismatch: header says {declared}, found {actual}")]
    BodyLength {
        /// Length from the fixed header.
        declared: usize,
        /// Bytes actually framed.
        actual: usize,
    },

    /// A unix fd index referred past the descriptors attached to the message.
    #[error("unix fd index {index} out of range ({count} attached)")]
    FdOutOfRange {
        /// Index found in the body.
        index: u32,
        /// Number of descriptors attached.
        count: usize,
    },

    /// The serial has not been assigned yet.
    #[error("message serial is zero")]
    ZeroSerial,
}
