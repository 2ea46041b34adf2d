//! Text rendering of values and message headers.

use std::fmt::Write;

use dbx::{Message, MessageType, Value};

/// Renders `value` in a compact, type-revealing text form.
///
/// Strings are quoted, variants are wrapped in `<…>`, arrays in `[…]`,
/// dicts in `{…}` and structs in `(…)`.
pub fn value(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Byte(n) => push(out, n),
        Value::Bool(b) => push(out, b),
        Value::Int16(n) => push(out, n),
        Value::UInt16(n) => push(out, n),
        Value::Int32(n) => push(out, n),
        Value::UInt32(n) => push(out, n),
        Value::Int64(n) => push(out, n),
        Value::UInt64(n) => push(out, n),
        Value::Double(n) => push(out, n),
        Value::Str(s) => push(out, format_args!("{s:?}")),
        Value::ObjectPath(p) => push(out, p),
        Value::Signature(g) => push(out, format_args!("@g {:?}", g.as_str())),
        Value::UnixFd(n) => push(out, format_args!("fd#{n}")),
        Value::Variant(inner) => {
            out.push('<');
            write_value(out, inner);
            out.push('>');
        }
        Value::Array(a) => {
            out.push('[');
            join(out, a.items().iter(), |out, item| write_value(out, item));
            out.push(']');
        }
        Value::Dict(d) => {
            out.push('{');
            join(out, d.entries().iter(), |out, (k, v)| {
                write_value(out, k);
                out.push_str(": ");
                write_value(out, v);
            });
            out.push('}');
        }
        Value::Struct(fields) => {
            out.push('(');
            join(out, fields.iter(), |out, f| write_value(out, f));
            if fields.len() == 1 {
                out.push(',');
            }
            out.push(')');
        }
    }
}

fn push(out: &mut String, v: impl std::fmt::Display) {
    // Writing into a String cannot fail.
    let _ = write!(out, "{v}");
}

fn join<I, T>(out: &mut String, items: I, mut f: impl FnMut(&mut String, T))
where
    I: Iterator<Item = T>,
{
    for (i, item) in items.enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        f(out, item);
    }
}

/// Lower-case name of a message type.
pub const fn kind(ty: MessageType) -> &'static str {
    match ty {
        MessageType::MethodCall => "method_call",
        MessageType::MethodReturn => "method_return",
        MessageType::Error => "error",
        MessageType::Signal => "signal",
        _ => "unknown",
    }
}

/// One-line summary of a message header.
pub fn header(msg: &Message) -> String {
    let mut out = format!("{} serial={}", kind(msg.message_type()), msg.serial());
    if let Some(reply) = msg.reply_serial() {
        push(&mut out, format_args!(" reply_serial={reply}"));
    }
    if let Some(sender) = msg.sender() {
        push(&mut out, format_args!(" sender={sender}"));
    }
    if let Some(dest) = msg.destination() {
        push(&mut out, format_args!(" destination={dest}"));
    }
    if let Some(path) = msg.path() {
        push(&mut out, format_args!(" path={path}"));
    }
    if let Some(iface) = msg.interface() {
        push(&mut out, format_args!(" interface={iface}"));
    }
    if let Some(member) = msg.member() {
        push(&mut out, format_args!(" member={member}"));
    }
    if let Some(name) = msg.error_name() {
        push(&mut out, format_args!(" error_name={name}"));
    }
    out
}

/// JSON object describing a message header and its decoded body.
pub fn message_json(msg: &Message, body: &[Value]) -> serde_json::Value {
    serde_json::json!({
        "type": kind(msg.message_type()),
        "serial": msg.serial(),
        "reply_serial": msg.reply_serial(),
        "sender": msg.sender(),
        "destination": msg.destination(),
        "path": msg.path(),
        "interface": msg.interface(),
        "member": msg.member(),
        "error_name": msg.error_name(),
        "signature": msg.signature(),
        "body": body,
    })
}
