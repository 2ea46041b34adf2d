//! Socket calls that carry file descriptors.
//!
//! Thin wrappers over `sendmsg(2)`/`recvmsg(2)` with `SCM_RIGHTS` control
//! messages, plus `shutdown(2)`. All `unsafe` code in the crate is confined
//! to this module.

#![allow(unsafe_code, clippy::missing_docs_in_private_items)]

use std::io::{self, IoSlice};
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

/// Most descriptors the kernel delivers in one message (`SCM_MAX_FD`).
pub const MAX_FDS: usize = 253;

#[cfg(target_os = "linux")]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: libc::c_int = 0;

#[cfg(target_os = "linux")]
const RECV_FLAGS: libc::c_int = libc::MSG_CMSG_CLOEXEC;
#[cfg(not(target_os = "linux"))]
const RECV_FLAGS: libc::c_int = 0;

/// Zeroed control buffer able to hold `n` descriptors, 8-byte aligned.
fn control_buffer(n: usize) -> Vec<u64> {
    #[allow(clippy::cast_possible_truncation)]
    let space = unsafe { libc::CMSG_SPACE((n * mem::size_of::<RawFd>()) as libc::c_uint) } as usize;
    vec![0u64; space.div_ceil(mem::size_of::<u64>())]
}

/// Sends `bufs` as one `sendmsg` call, attaching `fds` as `SCM_RIGHTS`.
///
/// Returns the number of bytes written, which may be short.
pub fn send_with_fds(sock: BorrowedFd<'_>, bufs: &[IoSlice<'_>], fds: &[BorrowedFd<'_>]) -> io::Result<usize> {
    if fds.len() > MAX_FDS {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} descriptors exceed the per-message limit", fds.len()),
        ));
    }
    let raw: Vec<RawFd> = fds.iter().map(AsRawFd::as_raw_fd).collect();
    let mut control = if raw.is_empty() { Vec::new() } else { control_buffer(raw.len()) };

    let n = unsafe {
        let mut hdr: libc::msghdr = mem::zeroed();
        // IoSlice is guaranteed ABI-compatible with iovec on Unix.
        hdr.msg_iov = bufs.as_ptr().cast_mut().cast::<libc::iovec>();
        hdr.msg_iovlen = bufs.len() as _;
        if !raw.is_empty() {
            let payload = (raw.len() * mem::size_of::<RawFd>()) as libc::c_uint;
            hdr.msg_control = control.as_mut_ptr().cast();
            hdr.msg_controllen = libc::CMSG_SPACE(payload) as _;
            let cmsg = libc::CMSG_FIRSTHDR(&raw const hdr);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(payload) as _;
            ptr::copy_nonoverlapping(raw.as_ptr(), libc::CMSG_DATA(cmsg).cast::<RawFd>(), raw.len());
        }
        libc::sendmsg(sock.as_raw_fd(), &raw const hdr, SEND_FLAGS)
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    #[allow(clippy::cast_sign_loss)]
    Ok(n as usize)
}

/// Receives into `buf`, appending any `SCM_RIGHTS` descriptors to `fds`.
///
/// Returns the number of bytes read; zero means end of stream. Truncated
/// control data is an error, but the descriptors that did arrive are still
/// taken over (and closed on drop).
pub fn recv_with_fds(sock: BorrowedFd<'_>, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> io::Result<usize> {
    let mut control = control_buffer(MAX_FDS);
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };

    let (n, flags) = unsafe {
        let mut hdr: libc::msghdr = mem::zeroed();
        hdr.msg_iov = &raw mut iov;
        hdr.msg_iovlen = 1;
        hdr.msg_control = control.as_mut_ptr().cast();
        hdr.msg_controllen = (control.len() * mem::size_of::<u64>()) as _;

        let n = libc::recvmsg(sock.as_raw_fd(), &raw mut hdr, RECV_FLAGS);
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut cmsg = libc::CMSG_FIRSTHDR(&raw const hdr);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                let len = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                for i in 0..len / mem::size_of::<RawFd>() {
                    let fd = ptr::read_unaligned(data.add(i));
                    fds.push(OwnedFd::from_raw_fd(fd));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&raw const hdr, cmsg);
        }
        (n, hdr.msg_flags)
    };

    #[cfg(not(target_os = "linux"))]
    for fd in fds.iter() {
        set_cloexec(fd.as_raw_fd())?;
    }

    if flags & libc::MSG_CTRUNC != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "ancillary data truncated",
        ));
    }
    #[allow(clippy::cast_sign_loss)]
    Ok(n as usize)
}

#[cfg(not(target_os = "linux"))]
fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Shuts down both directions of a socket, waking any blocked reader.
pub fn shutdown(sock: BorrowedFd<'_>) -> io::Result<()> {
    let ret = unsafe { libc::shutdown(sock.as_raw_fd(), libc::SHUT_RDWR) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        // Already disconnected.
        if err.raw_os_error() == Some(libc::ENOTCONN) {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn passes_descriptors_with_data() {
        let (a, b) = UnixStream::pair().unwrap();
        let (mut keep, passed) = UnixStream::pair().unwrap();

        let n = send_with_fds(a.as_fd(), &[IoSlice::new(b"he"), IoSlice::new(b"llo")], &[passed.as_fd()]).unwrap();
        assert_eq!(n, 5);
        drop(passed);

        let mut buf = [0u8; 16];
        let mut fds = Vec::new();
        let n = recv_with_fds(b.as_fd(), &mut buf, &mut fds).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(fds.len(), 1);

        // The received descriptor is the other end of `keep`.
        let mut received = UnixStream::from(fds.pop().unwrap());
        received.write_all(b"ping").unwrap();
        let mut got = [0u8; 4];
        keep.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"ping");
    }

    #[test]
    fn plain_data_has_no_descriptors() {
        let (mut a, b) = UnixStream::pair().unwrap();
        a.write_all(b"x").unwrap();
        let mut buf = [0u8; 4];
        let mut fds = Vec::new();
        assert_eq!(recv_with_fds(b.as_fd(), &mut buf, &mut fds).unwrap(), 1);
        assert!(fds.is_empty());
    }

    #[test]
    fn shutdown_signals_end_of_stream() {
        let (a, mut b) = UnixStream::pair().unwrap();
        shutdown(a.as_fd()).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(b.read(&mut buf).unwrap(), 0);
    }
}
