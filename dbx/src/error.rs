//! Error types for dbx operations.

use std::fmt;

/// Alias for `Result<T, dbx::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by connections and their helpers.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// An address string could not be parsed or named no usable transport.
    #[error("invalid address {address:?}: {reason}")]
    InvalidAddress {
        /// The offending address.
        address: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The SASL exchange was rejected or malformed.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// A message could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] dbx_proto::Error),

    /// A reply body did not have the expected signature.
    #[error("signature mismatch: expected {expected:?}, found {actual:?}")]
    SignatureMismatch {
        /// Signature the caller asked for.
        expected: String,
        /// Signature carried by the reply.
        actual: String,
    },

    /// The peer answered with an error reply.
    #[error("{name}: {message}")]
    Remote {
        /// D-Bus error name, e.g. `org.freedesktop.DBus.Error.UnknownMethod`.
        name: String,
        /// Human-readable text; empty when the reply carried none.
        message: String,
    },

    /// A handler is already registered for this path and interface.
    #[error("{interface} is already registered at {path}")]
    AlreadyRegistered {
        /// Object path.
        path: String,
        /// Interface name.
        interface: String,
    },

    /// An argument was rejected before anything was sent.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The connection closed before the operation completed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation was cancelled by its caller.
    #[error("cancelled")]
    Cancelled,

    /// An I/O error on the underlying socket.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns the D-Bus error name of a [`Error::Remote`] reply.
    pub fn remote_name(&self) -> Option<&str> {
        match self {
            Self::Remote { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Flattens proto-level signature mismatches into [`Error::SignatureMismatch`].
    pub(crate) fn from_decode(e: dbx_proto::Error) -> Self {
        match e {
            dbx_proto::Error::SignatureMismatch { expected, actual } => {
                Self::SignatureMismatch { expected, actual }
            }
            other => Self::Protocol(other),
        }
    }
}

/// Well-known D-Bus error names.
pub mod names {
    /// Generic failure; also used when a handler panics.
    pub const FAILED: &str = "org.freedesktop.DBus.Error.Failed";
    /// No handler is registered for the path or interface.
    pub const TARGET_NOT_FOUND: &str = "org.freedesktop.DBus.Error.MethodCallTargetNotFound";
    /// The object exists but has no such method.
    pub const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
    /// The object has no such interface.
    pub const UNKNOWN_INTERFACE: &str = "org.freedesktop.DBus.Error.UnknownInterface";
    /// The interface has no such property.
    pub const UNKNOWN_PROPERTY: &str = "org.freedesktop.DBus.Error.UnknownProperty";
    /// The property cannot be written.
    pub const PROPERTY_READ_ONLY: &str = "org.freedesktop.DBus.Error.PropertyReadOnly";
    /// The call's arguments had the wrong signature.
    pub const INVALID_SIGNATURE: &str = "org.freedesktop.DBus.Error.InvalidSignature";
    /// The call's arguments were well-typed but unacceptable.
    pub const INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
}

/// A failure produced by a method handler, sent back as an error reply.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct MethodError {
    /// D-Bus error name.
    pub name: String,
    /// Human-readable text.
    pub message: String,
}

impl MethodError {
    /// Creates an error with an arbitrary name.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    /// `org.freedesktop.DBus.Error.Failed`.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(names::FAILED, message)
    }

    /// `org.freedesktop.DBus.Error.UnknownMethod` for `member` on `interface`.
    pub fn unknown_method(interface: &str, member: &str) -> Self {
        Self::new(
            names::UNKNOWN_METHOD,
            format!("no method {member} on interface {interface}"),
        )
    }

    /// `org.freedesktop.DBus.Error.UnknownProperty`.
    pub fn unknown_property(interface: &str, name: &str) -> Self {
        Self::new(
            names::UNKNOWN_PROPERTY,
            format!("no property {name} on interface {interface}"),
        )
    }

    /// `org.freedesktop.DBus.Error.PropertyReadOnly`.
    pub fn read_only(name: &str) -> Self {
        Self::new(names::PROPERTY_READ_ONLY, format!("property {name} is read-only"))
    }

    /// `org.freedesktop.DBus.Error.InvalidArgs`.
    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::new(names::INVALID_ARGS, message)
    }
}

impl fmt::Display for MethodError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for MethodError {}

/// Decode failures inside a handler become `InvalidSignature` or `InvalidArgs`.
impl From<dbx_proto::Error> for MethodError {
    fn from(e: dbx_proto::Error) -> Self {
        match e {
            dbx_proto::Error::SignatureMismatch { expected, actual } => Self::new(
                names::INVALID_SIGNATURE,
                format!("expected arguments {expected:?}, got {actual:?}"),
            ),
            other => Self::invalid_args(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_mismatch_maps_to_invalid_signature() {
        let e = MethodError::from(dbx_proto::Error::SignatureMismatch {
            expected: "s".into(),
            actual: "i".into(),
        });
        assert_eq!(e.name, names::INVALID_SIGNATURE);
    }

    #[test]
    fn decode_errors_keep_mismatch_details() {
        let e = Error::from_decode(dbx_proto::Error::SignatureMismatch {
            expected: "as".into(),
            actual: "".into(),
        });
        assert!(matches!(e, Error::SignatureMismatch { ref expected, .. } if expected == "as"));
        assert!(matches!(
            Error::from_decode(dbx_proto::Error::UnexpectedEof),
            Error::Protocol(_)
        ));
    }
}
