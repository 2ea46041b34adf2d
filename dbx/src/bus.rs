//! Calls to the message bus itself (`org.freedesktop.DBus`).

use dbx_proto::{Args, ObjectPath};

use crate::connection::Connection;
use crate::error::{Error, Result};

/// Well-known name of the bus.
pub const BUS_NAME: &str = "org.freedesktop.DBus";
/// Object path of the bus.
pub const BUS_PATH: &str = "/org/freedesktop/DBus";
/// Interface of the bus.
pub const BUS_INTERFACE: &str = "org.freedesktop.DBus";

/// Flags for [`request_name`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct RequestNameFlags(u32);

impl RequestNameFlags {
    /// Let another connection take the name over.
    pub const ALLOW_REPLACEMENT: Self = Self(0x1);
    /// Take the name over if its owner allows replacement.
    pub const REPLACE_EXISTING: Self = Self(0x2);
    /// Fail instead of queueing when the name is taken.
    pub const DO_NOT_QUEUE: Self = Self(0x4);

    /// No flags set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Raw flag bits.
    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for RequestNameFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Outcome of `RequestName`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum RequestNameReply {
    /// The caller now owns the name.
    PrimaryOwner,
    /// The caller was put in the queue for the name.
    InQueue,
    /// The name is owned by someone else.
    Exists,
    /// The caller already owned the name.
    AlreadyOwner,
}

impl TryFrom<u32> for RequestNameReply {
    type Error = Error;

    fn try_from(v: u32) -> Result<Self> {
        match v {
            1 => Ok(Self::PrimaryOwner),
            2 => Ok(Self::InQueue),
            3 => Ok(Self::Exists),
            4 => Ok(Self::AlreadyOwner),
            other => Err(Error::InvalidArgument(format!("unknown RequestName reply {other}"))),
        }
    }
}

/// Outcome of `ReleaseName`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReleaseNameReply {
    /// The name was released.
    Released,
    /// Nobody owns the name.
    NonExistent,
    /// The name is owned by another connection.
    NotOwner,
}

impl TryFrom<u32> for ReleaseNameReply {
    type Error = Error;

    fn try_from(v: u32) -> Result<Self> {
        match v {
            1 => Ok(Self::Released),
            2 => Ok(Self::NonExistent),
            3 => Ok(Self::NotOwner),
            other => Err(Error::InvalidArgument(format!("unknown ReleaseName reply {other}"))),
        }
    }
}

/// Calls `member` on the bus object.
async fn call_bus<A: Args, R: Args>(conn: &Connection, member: &str, args: &A) -> Result<R> {
    let path = ObjectPath::new(BUS_PATH)?;
    conn.call_method(Some(BUS_NAME), &path, BUS_INTERFACE, member, args)
        .await
}

/// `Hello`: registers the connection and returns its unique name.
pub async fn hello(conn: &Connection) -> Result<String> {
    let (name,): (String,) = call_bus(conn, "Hello", &()).await?;
    Ok(name)
}

/// `RequestName`.
pub async fn request_name(conn: &Connection, name: &str, flags: RequestNameFlags) -> Result<RequestNameReply> {
    let (reply,): (u32,) = call_bus(conn, "RequestName", &(name.to_owned(), flags.bits())).await?;
    RequestNameReply::try_from(reply)
}

/// `ReleaseName`.
pub async fn release_name(conn: &Connection, name: &str) -> Result<ReleaseNameReply> {
    let (reply,): (u32,) = call_bus(conn, "ReleaseName", &(name.to_owned(),)).await?;
    ReleaseNameReply::try_from(reply)
}

/// `ListNames`: every name currently on the bus.
pub async fn list_names(conn: &Connection) -> Result<Vec<String>> {
    let (names,): (Vec<String>,) = call_bus(conn, "ListNames", &()).await?;
    Ok(names)
}

/// `GetNameOwner`: unique name owning `name`.
pub async fn get_name_owner(conn: &Connection, name: &str) -> Result<String> {
    let (owner,): (String,) = call_bus(conn, "GetNameOwner", &(name.to_owned(),)).await?;
    Ok(owner)
}

/// `AddMatch`.
pub async fn add_match(conn: &Connection, rule: &str) -> Result<()> {
    call_bus(conn, "AddMatch", &(rule.to_owned(),)).await
}

/// `RemoveMatch`.
pub async fn remove_match(conn: &Connection, rule: &str) -> Result<()> {
    call_bus(conn, "RemoveMatch", &(rule.to_owned(),)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_codes() {
        assert_eq!(RequestNameReply::try_from(1).unwrap(), RequestNameReply::PrimaryOwner);
        assert_eq!(RequestNameReply::try_from(4).unwrap(), RequestNameReply::AlreadyOwner);
        assert!(RequestNameReply::try_from(0).is_err());
        assert_eq!(ReleaseNameReply::try_from(3).unwrap(), ReleaseNameReply::NotOwner);
        assert!(ReleaseNameReply::try_from(5).is_err());
    }

    #[test]
    fn flags_combine() {
        let flags = RequestNameFlags::DO_NOT_QUEUE | RequestNameFlags::REPLACE_EXISTING;
        assert_eq!(flags.bits(), 6);
        assert_eq!(RequestNameFlags::empty().bits(), 0);
    }
}
