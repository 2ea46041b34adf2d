//! Unix-socket transport: connect, framing and descriptor passing.
//!
//! Connecting and authenticating happen on a blocking socket. After that
//! the socket is non-blocking and driven by tokio: one [`Reader`], and one
//! writer task that takes whole frames from a queue so frames never
//! interleave. A frame the writer has started is always finished, even if
//! the sender stopped waiting for it.

use std::io::{self, IoSlice};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::sync::Arc;

use dbx_proto::{FIXED_HEADER_LEN, FrameLengths};
use tokio::io::Interest;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};

use crate::address::Address;
use crate::error::{Error, Result};
use crate::sys;

/// One raw frame and the descriptors that arrived with it.
pub(crate) type Frame = (Vec<u8>, Vec<OwnedFd>);

/// Connects to the first reachable address, in order.
pub(crate) fn connect(addresses: &[Address]) -> Result<StdUnixStream> {
    let mut last = None;
    for addr in addresses {
        match connect_one(addr) {
            Ok(stream) => {
                tracing::debug!(%addr, "connected");
                return Ok(stream);
            }
            Err(e) => {
                tracing::debug!(%addr, error = %e, "connect failed");
                last = Some(e);
            }
        }
    }
    Err(last.map_or_else(
        || Error::InvalidAddress {
            address: String::new(),
            reason: "empty address list".to_owned(),
        },
        Error::Io,
    ))
}

fn connect_one(addr: &Address) -> io::Result<StdUnixStream> {
    match addr {
        Address::Path(path) => StdUnixStream::connect(path),
        #[cfg(target_os = "linux")]
        Address::Abstract(name) => {
            use std::os::linux::net::SocketAddrExt;
            let sa = std::os::unix::net::SocketAddr::from_abstract_name(name)?;
            StdUnixStream::connect_addr(&sa)
        }
        #[cfg(not(target_os = "linux"))]
        Address::Abstract(_) => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "abstract sockets are Linux-only",
        )),
    }
}

/// One frame queued for the writer task.
struct WriteJob {
    header: Vec<u8>,
    body: Vec<u8>,
    fds: Vec<OwnedFd>,
    /// Receives the outcome once the last byte is written.
    done: oneshot::Sender<Result<()>>,
}

/// An authenticated socket.
#[derive(Debug)]
pub(crate) struct Transport {
    /// The socket, shared with the reader and the writer task.
    stream: Arc<UnixStream>,
    /// Frames waiting for the writer task.
    jobs: mpsc::UnboundedSender<WriteJob>,
    /// Whether descriptor passing was negotiated.
    unix_fd: bool,
}

impl Transport {
    /// Hands an authenticated blocking socket over to tokio and starts the
    /// writer task.
    pub(crate) fn new(stream: StdUnixStream, unix_fd: bool) -> Result<Self> {
        stream.set_nonblocking(true)?;
        let shared = Arc::new(UnixStream::from_std(stream)?);
        let (jobs, queue) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(Arc::clone(&shared), queue));
        Ok(Self {
            stream: shared,
            jobs,
            unix_fd,
        })
    }

    pub(crate) const fn unix_fd(&self) -> bool {
        self.unix_fd
    }

    /// Queues one frame, attaching `fds` to its first byte, and waits until
    /// it is written.
    ///
    /// Dropping the returned future does not cancel the write.
    pub(crate) async fn send(&self, header: Vec<u8>, body: Vec<u8>, fds: Vec<OwnedFd>) -> Result<()> {
        if !fds.is_empty() && !self.unix_fd {
            return Err(Error::InvalidArgument(
                "descriptor passing was not negotiated".to_owned(),
            ));
        }
        let (done, result) = oneshot::channel();
        self.jobs
            .send(WriteJob {
                header,
                body,
                fds,
                done,
            })
            .map_err(|_| Error::ConnectionClosed)?;
        result.await.unwrap_or(Err(Error::ConnectionClosed))
    }

    /// A reader over the same socket.
    pub(crate) fn reader(&self) -> Reader {
        Reader {
            stream: Arc::clone(&self.stream),
        }
    }

    /// Shuts the socket down in both directions; the reader sees end of stream.
    pub(crate) fn shutdown(&self) -> io::Result<()> {
        sys::shutdown(self.stream.as_fd())
    }
}

/// Writes queued frames in order until every [`Transport`] handle is gone.
///
/// A failed write leaves the stream out of step, so every later frame
/// fails with [`Error::ConnectionClosed`].
async fn write_loop(stream: Arc<UnixStream>, mut queue: mpsc::UnboundedReceiver<WriteJob>) {
    let mut broken = false;
    while let Some(job) = queue.recv().await {
        let result = if broken {
            Err(Error::ConnectionClosed)
        } else {
            match write_frame(&stream, &job.header, &job.body, &job.fds).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    tracing::warn!(error = %e, "frame write failed");
                    broken = true;
                    Err(e.into())
                }
            }
        };
        // The sender may have stopped waiting.
        let _ = job.done.send(result);
    }
}

/// Writes `header ++ body` completely.
async fn write_frame(stream: &UnixStream, header: &[u8], body: &[u8], fds: &[OwnedFd]) -> io::Result<()> {
    let borrowed: Vec<BorrowedFd<'_>> = fds.iter().map(AsFd::as_fd).collect();
    let mut pending_fds = borrowed.as_slice();
    let total = header.len() + body.len();
    let mut written = 0;

    while written < total {
        let bufs = remaining(header, body, written);
        stream.writable().await?;
        match stream.try_io(Interest::WRITABLE, || {
            sys::send_with_fds(stream.as_fd(), &bufs, pending_fds)
        }) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                written += n;
                pending_fds = &[];
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// The read half of a [`Transport`].
///
/// Holds the socket open but not the connection.
#[derive(Debug)]
pub(crate) struct Reader {
    stream: Arc<UnixStream>,
}

impl Reader {
    /// Reads the next frame. `Ok(None)` is a clean end of stream.
    ///
    /// An error here means the stream can no longer be delimited.
    pub(crate) async fn recv(&self) -> Result<Option<Frame>> {
        let mut fds = Vec::new();
        let mut fixed = [0u8; FIXED_HEADER_LEN];
        if !self.read_exact(&mut fixed, &mut fds).await? {
            return Ok(None);
        }
        let total = FrameLengths::parse(&fixed)?.total();
        let mut frame = vec![0u8; total];
        frame[..FIXED_HEADER_LEN].copy_from_slice(&fixed);
        if !self.read_exact(&mut frame[FIXED_HEADER_LEN..], &mut fds).await? {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        Ok(Some((frame, fds)))
    }

    /// Fills `buf`. Returns `false` on end of stream before the first byte.
    async fn read_exact(&self, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> Result<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            self.stream.readable().await?;
            match self.stream.try_io(Interest::READABLE, || {
                sys::recv_with_fds(self.stream.as_fd(), &mut buf[filled..], fds)
            }) {
                Ok(0) if filled == 0 => return Ok(false),
                Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }
}

/// The unwritten tail of `header ++ body` after `written` bytes.
fn remaining<'a>(header: &'a [u8], body: &'a [u8], written: usize) -> Vec<IoSlice<'a>> {
    if written < header.len() {
        vec![IoSlice::new(&header[written..]), IoSlice::new(body)]
    } else {
        vec![IoSlice::new(&body[written - header.len()..])]
    }
}
