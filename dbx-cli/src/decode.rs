//! `dbx decode`: parse raw frames from a capture.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result};
use dbx::Message;
use dbx_proto::codec;

use crate::{OutputFormat, render};

/// Decodes every frame in `file` (or stdin) and prints it.
pub fn run(file: Option<&Path>, format: OutputFormat) -> Result<()> {
    let input: Box<dyn Read> = match file {
        Some(path) => Box::new(File::open(path).with_context(|| format!("opening {}", path.display()))?),
        None => Box::new(io::stdin().lock()),
    };
    let messages = decode_all(BufReader::new(input))?;
    if matches!(format, OutputFormat::Json) {
        let list = messages
            .iter()
            .map(|(msg, body)| render::message_json(msg, body))
            .collect::<Vec<_>>();
        println!("{}", serde_json::to_string_pretty(&list)?);
        return Ok(());
    }
    for (msg, body) in &messages {
        println!("{} signature={:?}", render::header(msg), msg.signature().as_str());
        for v in body {
            println!("  {}", render::value(v));
        }
    }
    Ok(())
}

/// Reads frames until a clean end of stream.
fn decode_all(mut reader: impl Read) -> Result<Vec<(Message, Vec<dbx::Value>)>> {
    let mut out = Vec::new();
    while let Some(msg) = codec::decode(&mut reader).with_context(|| format!("frame {}", out.len()))? {
        let body = msg
            .decoder()
            .get_values()
            .with_context(|| format!("body of frame {}", out.len()))?;
        out.push((msg, body));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use dbx::{Body, ObjectPath, Value};

    use super::*;

    fn frame(serial: u32, member: &str, body: Body) -> Vec<u8> {
        let mut msg = Message::method_call(ObjectPath::new("/org/example").unwrap(), member)
            .with_interface("org.example.Disk1")
            .with_destination("org.example")
            .with_body(body);
        msg.set_serial(serial);
        let mut buf = Vec::new();
        codec::encode(&mut buf, &msg).unwrap();
        buf
    }

    #[test]
    fn decodes_consecutive_frames() {
        let mut capture = frame(1, "Eject", Body::empty());
        capture.extend(frame(2, "Resize", Body::from_args(&(4096u64, "fast".to_owned())).unwrap()));

        let messages = decode_all(capture.as_slice()).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].0.member(), Some("Eject"));
        assert!(messages[0].1.is_empty());
        assert_eq!(messages[1].0.serial(), 2);
        assert_eq!(messages[1].1, [Value::UInt64(4096), Value::from("fast")]);
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let mut capture = frame(1, "Eject", Body::empty());
        capture.truncate(capture.len() - 1);
        assert!(decode_all(capture.as_slice()).is_err());
        assert!(decode_all(&[][..]).unwrap().is_empty());
    }
}
