//! D-Bus server addresses.
//!
//! An address string is a `;`-separated list of `transport:key=value,…`
//! entries with `%xx` escapes, e.g.
//! `unix:path=/run/user/1000/bus;unix:abstract=/tmp/dbus-XYZ,guid=…`.
//! Only the `unix` transport is supported; other entries are skipped.

use std::fmt;
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Fallback system bus socket.
pub const SYSTEM_BUS_DEFAULT: &str = "unix:path=/var/run/dbus/system_bus_socket";

/// One connectable Unix-socket address.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Address {
    /// A socket in the filesystem.
    Path(PathBuf),
    /// A Linux abstract-namespace socket (name without the leading NUL).
    Abstract(Vec<u8>),
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(p) => write!(f, "unix:path={}", p.display()),
            Self::Abstract(name) => write!(f, "unix:abstract={}", String::from_utf8_lossy(name)),
        }
    }
}

/// Parses an address list, keeping the supported entries in order.
///
/// Fails if the string is malformed or no entry is usable.
pub fn parse(addresses: &str) -> Result<Vec<Address>> {
    let invalid = |reason: &str| Error::InvalidAddress {
        address: addresses.to_owned(),
        reason: reason.to_owned(),
    };

    let mut out = Vec::new();
    for entry in addresses.split(';').filter(|e| !e.is_empty()) {
        let (transport, params) = entry
            .split_once(':')
            .ok_or_else(|| invalid("missing transport prefix"))?;

        let mut path = None;
        let mut abstract_name = None;
        for pair in params.split(',').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| invalid("expected key=value"))?;
            let value = unescape(value).ok_or_else(|| invalid("bad %-escape"))?;
            match key {
                "path" => path = Some(value),
                "abstract" => abstract_name = Some(value),
                _ => {}
            }
        }

        if transport != "unix" {
            tracing::debug!(transport, "skipping unsupported transport");
            continue;
        }
        match (path, abstract_name) {
            (Some(_), Some(_)) => return Err(invalid("both path and abstract given")),
            (Some(p), None) => {
                let p = String::from_utf8(p).map_err(|_| invalid("path is not UTF-8"))?;
                out.push(Address::Path(PathBuf::from(p)));
            }
            (None, Some(name)) => out.push(Address::Abstract(name)),
            (None, None) => tracing::debug!(entry, "skipping unix address without path"),
        }
    }

    if out.is_empty() {
        return Err(invalid("no usable unix address"));
    }
    Ok(out)
}

/// Decodes `%xx` escapes.
fn unescape(value: &str) -> Option<Vec<u8>> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = value.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Some(out)
}

/// Address of the session bus from the environment.
pub fn session_bus() -> Result<String> {
    session_bus_from(
        std::env::var("DBUS_SESSION_BUS_ADDRESS").ok(),
        std::env::var("XDG_RUNTIME_DIR").ok(),
    )
}

/// Address of the system bus from the environment.
pub fn system_bus() -> String {
    system_bus_from(std::env::var("DBUS_SYSTEM_BUS_ADDRESS").ok())
}

fn session_bus_from(explicit: Option<String>, runtime_dir: Option<String>) -> Result<String> {
    if let Some(addr) = explicit.filter(|a| !a.is_empty()) {
        return Ok(addr);
    }
    match runtime_dir.filter(|d| !d.is_empty()) {
        Some(dir) => Ok(format!("unix:path={}/bus", dir.trim_end_matches('/'))),
        None => Err(Error::InvalidAddress {
            address: String::new(),
            reason: "neither DBUS_SESSION_BUS_ADDRESS nor XDG_RUNTIME_DIR is set".to_owned(),
        }),
    }
}

fn system_bus_from(explicit: Option<String>) -> String {
    explicit
        .filter(|a| !a.is_empty())
        .unwrap_or_else(|| SYSTEM_BUS_DEFAULT.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_path_and_abstract_lists() {
        let addrs = parse("unix:path=/run/user/1000/bus;unix:abstract=/tmp/dbus-x,guid=abc").unwrap();
        assert_eq!(
            addrs,
            [
                Address::Path("/run/user/1000/bus".into()),
                Address::Abstract(b"/tmp/dbus-x".to_vec()),
            ]
        );
    }

    #[test]
    fn decodes_escapes() {
        let addrs = parse("unix:path=/tmp/a%20b%2cc").unwrap();
        assert_eq!(addrs, [Address::Path("/tmp/a b,c".into())]);
    }

    #[test]
    fn skips_other_transports() {
        let addrs = parse("tcp:host=localhost,port=1234;unix:path=/tmp/bus").unwrap();
        assert_eq!(addrs, [Address::Path("/tmp/bus".into())]);
    }

    #[test]
    fn rejects_unusable_addresses() {
        for bad in ["", "tcp:host=x", "nocolon", "unix:path", "unix:path=/a%zz", "unix:path=/a,abstract=b"] {
            assert!(
                matches!(parse(bad), Err(Error::InvalidAddress { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn session_default_prefers_env_address() {
        assert_eq!(
            session_bus_from(Some("unix:path=/x".into()), Some("/run/user/1".into())).unwrap(),
            "unix:path=/x"
        );
        assert_eq!(
            session_bus_from(None, Some("/run/user/1/".into())).unwrap(),
            "unix:path=/run/user/1/bus"
        );
        assert!(session_bus_from(None, None).is_err());
    }

    #[test]
    fn system_default() {
        assert_eq!(system_bus_from(None), SYSTEM_BUS_DEFAULT);
        assert_eq!(system_bus_from(Some(String::new())), SYSTEM_BUS_DEFAULT);
        assert_eq!(system_bus_from(Some("unix:path=/s".into())), "unix:path=/s");
    }
}
