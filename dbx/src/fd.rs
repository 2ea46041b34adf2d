//! Owned file descriptors carried by `h` arguments.

use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use dbx_proto::{Decoder, Encoder, Message};

use crate::error::{Error, Result};

/// A descriptor received in, or to be sent with, a message.
///
/// Closed exactly once, on drop, unless converted into another owner.
#[derive(Debug)]
pub struct UnixFd(OwnedFd);

impl UnixFd {
    /// Duplicates a borrowed descriptor so it can be sent.
    pub fn dup(fd: BorrowedFd<'_>) -> Result<Self> {
        Ok(Self(fd.try_clone_to_owned()?))
    }

    /// Attaches the descriptor to `enc` and writes its index.
    pub fn encode(self, enc: &mut Encoder) -> u32 {
        enc.add_unix_fd(self.0)
    }

    /// Reads an `h` index and takes the matching descriptor out of `msg`.
    ///
    /// Each descriptor can be taken once; a second take fails.
    pub fn take(dec: &mut Decoder<'_>, msg: &Message) -> Result<Self> {
        let index = dec.get_unix_fd()?;
        msg.take_fd(index).map(Self).ok_or_else(|| {
            Error::InvalidArgument(format!("descriptor {index} was already taken"))
        })
    }

    /// Releases ownership as a raw descriptor the caller must close.
    pub fn into_raw(self) -> RawFd {
        self.0.into_raw_fd()
    }
}

impl From<OwnedFd> for UnixFd {
    fn from(fd: OwnedFd) -> Self {
        Self(fd)
    }
}

impl From<File> for UnixFd {
    fn from(f: File) -> Self {
        Self(f.into())
    }
}

impl From<UnixStream> for UnixFd {
    fn from(s: UnixStream) -> Self {
        Self(s.into())
    }
}

impl From<UnixFd> for OwnedFd {
    fn from(fd: UnixFd) -> Self {
        fd.0
    }
}

impl From<UnixFd> for File {
    fn from(fd: UnixFd) -> Self {
        fd.0.into()
    }
}

impl From<UnixFd> for UnixStream {
    fn from(fd: UnixFd) -> Self {
        fd.0.into()
    }
}

impl AsFd for UnixFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl AsRawFd for UnixFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}
