//! Blocking frame codec over any `Read`/`Write` stream.
//!
//! Frames carry no file descriptors here; descriptor passing needs a Unix
//! socket and lives in the `dbx` transport.

use std::io::{self, Read, Write};

use crate::message::{FIXED_HEADER_LEN, FrameLengths, Message};

/// Total frame length announced by a fixed header.
pub fn frame_len(fixed: &[u8; FIXED_HEADER_LEN]) -> crate::Result<usize> {
    FrameLengths::parse(fixed).map(|l| l.total())
}

/// Writes `msg` as one complete frame to `w`.
pub fn encode<W: Write>(w: &mut W, msg: &Message) -> io::Result<()> {
    if msg.fd_count() > 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "message carries file descriptors",
        ));
    }
    let header = msg.encode_header().map_err(invalid)?;
    w.write_all(&header)?;
    w.write_all(msg.body())?;
    w.flush()
}

/// Reads one complete frame from `r` and parses it.
///
/// Returns `Ok(None)` on a clean end of stream between frames.
pub fn decode(r: &mut impl Read) -> io::Result<Option<Message>> {
    let mut fixed = [0u8; FIXED_HEADER_LEN];
    match r.read_exact(&mut fixed) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let total = frame_len(&fixed).map_err(invalid)?;
    let mut frame = vec![0u8; total];
    frame[..FIXED_HEADER_LEN].copy_from_slice(&fixed);
    r.read_exact(&mut frame[FIXED_HEADER_LEN..])?;
    Message::decode(frame, Vec::new()).map(Some).map_err(invalid)
}

fn invalid(e: crate::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Body, ObjectPath, Value};

    fn ping(serial: u32) -> Message {
        let mut msg = Message::method_call(ObjectPath::new("/org/example").unwrap(), "Ping")
            .with_interface("org.freedesktop.DBus.Peer")
            .with_destination(":1.4");
        msg.set_serial(serial);
        msg
    }

    #[test]
    fn roundtrip_stream_of_frames() {
        let mut buf = Vec::new();
        encode(&mut buf, &ping(1)).unwrap();
        let body = Body::from_values(&[Value::from("hello"), Value::Int64(-9)]).unwrap();
        encode(&mut buf, &ping(2).with_body(body)).unwrap();

        let mut cursor = io::Cursor::new(&buf);
        let first = decode(&mut cursor).unwrap().unwrap();
        assert_eq!(first.serial(), 1);
        assert_eq!(first.member(), Some("Ping"));
        let second = decode(&mut cursor).unwrap().unwrap();
        assert_eq!(second.serial(), 2);
        assert_eq!(
            second.decoder().get_values().unwrap(),
            [Value::from("hello"), Value::Int64(-9)]
        );
        assert!(decode(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn frame_len_matches_encoded_size() {
        let mut buf = Vec::new();
        encode(&mut buf, &ping(5)).unwrap();
        let fixed: [u8; FIXED_HEADER_LEN] = buf[..FIXED_HEADER_LEN].try_into().unwrap();
        assert_eq!(frame_len(&fixed).unwrap(), buf.len());
    }

    #[test]
    fn rejects_oversized_frame() {
        let mut fixed = [0u8; FIXED_HEADER_LEN];
        fixed[..4].copy_from_slice(&[b'l', 1, 0, 1]);
        fixed[4..8].copy_from_slice(&(200u32 * 1024 * 1024).to_le_bytes());
        let mut cursor = io::Cursor::new(&fixed[..]);
        let err = decode(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let mut buf = Vec::new();
        encode(&mut buf, &ping(3)).unwrap();
        buf.truncate(buf.len() - 2);
        let mut cursor = io::Cursor::new(&buf);
        assert_eq!(
            decode(&mut cursor).unwrap_err().kind(),
            io::ErrorKind::UnexpectedEof
        );
    }
}
