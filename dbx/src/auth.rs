//! SASL `EXTERNAL` authentication.
//!
//! Runs on the blocking socket before any D-Bus message is exchanged.
//! Lines are read one byte at a time so that nothing past the final
//! `\r\n` is consumed.

use std::io::{Read, Write};

use uuid::Uuid;

use crate::error::{Error, Result};

/// Longest SASL line accepted, terminator included.
const MAX_LINE: usize = 512;

/// Failed attempts a server tolerates before giving up.
const MAX_REJECTIONS: usize = 8;

/// Result of a successful client handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Authenticated {
    /// Server GUID from the `OK` line.
    pub guid: String,
    /// Whether the server agreed to pass file descriptors.
    pub unix_fd: bool,
}

/// Authenticates as `uid` over `stream`.
pub fn client<S: Read + Write>(stream: &mut S, uid: u32, negotiate_unix_fd: bool) -> Result<Authenticated> {
    stream.write_all(&[0])?;
    send(stream, &format!("AUTH EXTERNAL {}", hex::encode(uid.to_string())))?;

    let line = read_line(stream)?;
    let guid = match line.strip_prefix("OK ") {
        Some(guid) if !guid.trim().is_empty() => guid.trim().to_owned(),
        _ => return Err(Error::Auth(format!("server answered {line:?}"))),
    };

    let mut unix_fd = false;
    if negotiate_unix_fd {
        send(stream, "NEGOTIATE_UNIX_FD")?;
        let line = read_line(stream)?;
        if line == "AGREE_UNIX_FD" {
            unix_fd = true;
        } else if line.starts_with("ERROR") {
            tracing::debug!(reply = %line, "server declined unix fd passing");
        } else {
            return Err(Error::Auth(format!("unexpected reply to NEGOTIATE_UNIX_FD: {line:?}")));
        }
    }

    send(stream, "BEGIN")?;
    Ok(Authenticated { guid, unix_fd })
}

/// Serves the handshake for a peer that must authenticate as `uid`.
///
/// Returns whether descriptor passing was agreed.
pub fn server<S: Read + Write>(stream: &mut S, uid: u32, guid: &str) -> Result<bool> {
    let mut nul = [0u8; 1];
    stream.read_exact(&mut nul)?;
    if nul[0] != 0 {
        return Err(Error::Auth("missing leading NUL byte".to_owned()));
    }

    let expected = uid.to_string();
    let mut authed = false;
    let mut awaiting_data = false;
    let mut unix_fd = false;
    let mut rejections = 0;

    loop {
        let line = read_line(stream)?;
        let (command, arg) = line.split_once(' ').unwrap_or((line.as_str(), ""));
        let identity = match (command, awaiting_data) {
            ("AUTH", false) if !authed => match arg.split_once(' ') {
                Some(("EXTERNAL", id)) => Some(id.to_owned()),
                None if arg == "EXTERNAL" => {
                    awaiting_data = true;
                    send(stream, "DATA")?;
                    continue;
                }
                _ => None,
            },
            ("DATA", true) => {
                awaiting_data = false;
                Some(arg.to_owned())
            }
            ("NEGOTIATE_UNIX_FD", _) if authed => {
                unix_fd = true;
                send(stream, "AGREE_UNIX_FD")?;
                continue;
            }
            ("BEGIN", _) if authed => return Ok(unix_fd),
            ("CANCEL" | "ERROR", _) if !authed => {
                awaiting_data = false;
                None
            }
            _ => {
                send(stream, "ERROR")?;
                continue;
            }
        };

        let claimed = identity.and_then(|h| hex::decode(h).ok()).and_then(|b| String::from_utf8(b).ok());
        if claimed.as_deref() == Some(expected.as_str()) {
            authed = true;
            send(stream, &format!("OK {guid}"))?;
        } else {
            rejections += 1;
            if rejections >= MAX_REJECTIONS {
                return Err(Error::Auth("too many failed attempts".to_owned()));
            }
            send(stream, "REJECTED EXTERNAL")?;
        }
    }
}

/// Writes one line followed by `\r\n`.
fn send<W: Write>(w: &mut W, line: &str) -> Result<()> {
    tracing::trace!(line, "sasl >");
    w.write_all(line.as_bytes())?;
    w.write_all(b"\r\n")?;
    w.flush()?;
    Ok(())
}

/// Reads one `\r\n`-terminated line, without the terminator.
fn read_line<R: Read>(r: &mut R) -> Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    while !line.ends_with(b"\r\n") {
        if line.len() >= MAX_LINE {
            return Err(Error::Auth("line too long".to_owned()));
        }
        if r.read(&mut byte)? == 0 {
            return Err(Error::Auth("connection closed during authentication".to_owned()));
        }
        line.push(byte[0]);
    }
    line.truncate(line.len() - 2);
    let line = String::from_utf8(line).map_err(|_| Error::Auth("line is not ASCII".to_owned()))?;
    tracing::trace!(line = %line, "sasl <");
    Ok(line)
}

/// Generates a 32-character hex server GUID.
pub fn generate_guid() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use std::io::{self, Cursor};

    use super::*;

    /// Scripted peer: reads come from `input`, writes collect in `output`.
    struct Script {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Script {
        fn new(input: &[u8]) -> Self {
            Self {
                input: Cursor::new(input.to_vec()),
                output: Vec::new(),
            }
        }

        fn written(&self) -> &str {
            std::str::from_utf8(&self.output).unwrap()
        }
    }

    impl Read for Script {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Script {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn client_transcript() {
        let guid = "0123456789abcdef0123456789abcdef";
        let mut s = Script::new(format!("OK {guid}\r\nAGREE_UNIX_FD\r\n\x6c\x01").as_bytes());
        let auth = client(&mut s, 1000, true).unwrap();
        assert_eq!(auth.guid, guid);
        assert!(auth.unix_fd);
        assert_eq!(
            s.written(),
            "\0AUTH EXTERNAL 31303030\r\nNEGOTIATE_UNIX_FD\r\nBEGIN\r\n"
        );
        // The bytes after the last line are left for the message stream.
        assert_eq!(s.input.position() as usize, s.input.get_ref().len() - 2);
    }

    #[test]
    fn client_without_fd_negotiation() {
        let mut s = Script::new(b"OK 00ff\r\n");
        let auth = client(&mut s, 0, false).unwrap();
        assert!(!auth.unix_fd);
        assert_eq!(s.written(), "\0AUTH EXTERNAL 30\r\nBEGIN\r\n");
    }

    #[test]
    fn client_tolerates_declined_fd_passing() {
        let mut s = Script::new(b"OK 00ff\r\nERROR not supported\r\n");
        assert!(!client(&mut s, 0, true).unwrap().unix_fd);
    }

    #[test]
    fn client_rejected() {
        let mut s = Script::new(b"REJECTED EXTERNAL DBUS_COOKIE_SHA1\r\n");
        assert!(matches!(client(&mut s, 1000, true), Err(Error::Auth(_))));
    }

    #[test]
    fn overlong_line_is_rejected() {
        let mut input = b"OK ".to_vec();
        input.extend(std::iter::repeat_n(b'a', MAX_LINE));
        let mut s = Script::new(&input);
        assert!(matches!(client(&mut s, 1, false), Err(Error::Auth(_))));
    }

    #[test]
    fn server_transcript() {
        let mut s = Script::new(b"\0AUTH EXTERNAL 31303030\r\nNEGOTIATE_UNIX_FD\r\nBEGIN\r\n");
        assert!(server(&mut s, 1000, "abcd").unwrap());
        assert_eq!(s.written(), "OK abcd\r\nAGREE_UNIX_FD\r\n");
    }

    #[test]
    fn server_rejects_wrong_uid_and_other_mechanisms() {
        let mut s = Script::new(
            b"\0AUTH DBUS_COOKIE_SHA1 abc\r\nAUTH EXTERNAL 30\r\nAUTH EXTERNAL\r\nDATA 37\r\nBEGIN\r\n",
        );
        // None of the attempts succeed, so BEGIN is an error and the peer
        // eventually hangs up.
        assert!(server(&mut s, 7000, "g").is_err());
        assert_eq!(
            s.written(),
            "REJECTED EXTERNAL\r\nREJECTED EXTERNAL\r\nDATA\r\nREJECTED EXTERNAL\r\nERROR\r\n"
        );
    }

    #[test]
    fn server_accepts_data_continuation() {
        let mut s = Script::new(b"\0AUTH EXTERNAL\r\nDATA 37\r\nBEGIN\r\n");
        assert!(!server(&mut s, 7, "g").unwrap());
        assert_eq!(s.written(), "DATA\r\nOK g\r\n");
    }

    #[test]
    fn client_and_server_agree_over_a_socket() {
        let (mut a, mut b) = std::os::unix::net::UnixStream::pair().unwrap();
        let guid = generate_guid();
        let expected = guid.clone();
        let srv = std::thread::spawn(move || server(&mut b, 42, &guid));
        let auth = client(&mut a, 42, true).unwrap();
        assert_eq!(auth.guid, expected);
        assert!(auth.unix_fd);
        assert!(srv.join().unwrap().unwrap());
    }

    #[test]
    fn guid_is_32_hex_chars() {
        let g = generate_guid();
        assert_eq!(g.len(), 32);
        assert!(g.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_ne!(g, generate_guid());
    }

    #[test]
    fn malformed_identity_hex_is_rejected() {
        let mut s = Script::new(b"\0AUTH EXTERNAL 3130303\r\nAUTH EXTERNAL 31zz\r\n");
        assert!(server(&mut s, 1000, "g").is_err());
        assert_eq!(s.written(), "REJECTED EXTERNAL\r\nREJECTED EXTERNAL\r\n");
    }
}
