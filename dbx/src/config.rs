//! Connection settings and JSON persistence.

use std::path::Path;
use std::{fs, io};

use serde::{Deserialize, Serialize};

/// Which well-known bus to connect to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum BusKind {
    /// The per-login-session bus.
    #[default]
    Session,
    /// The system-wide bus.
    System,
}

/// Serializable connection settings.
///
/// ```json
/// { "bus": "system", "negotiate_unix_fd": false }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct Config {
    /// Bus used when `address` is not set.
    pub bus: BusKind,
    /// Explicit D-Bus address, overriding `bus`.
    pub address: Option<String>,
    /// Ask the peer for file-descriptor passing during authentication.
    pub negotiate_unix_fd: bool,
    /// Send `Hello` after authenticating (required on a message bus).
    pub hello: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bus: BusKind::Session,
            address: None,
            negotiate_unix_fd: true,
            hello: true,
        }
    }
}

impl Config {
    /// Loads settings from a JSON file; missing keys take their defaults.
    pub fn load(path: &Path) -> io::Result<Self> {
        let data = fs::read_to_string(path)?;
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Writes settings to a JSON file.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let file = fs::File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(io::Error::other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_take_defaults() {
        let cfg: Config = serde_json::from_str(r#"{"bus":"system"}"#).unwrap();
        assert_eq!(cfg.bus, BusKind::System);
        assert!(cfg.address.is_none());
        assert!(cfg.negotiate_unix_fd);
        assert!(cfg.hello);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dbx.json");
        let cfg = Config {
            address: Some("unix:path=/tmp/bus".into()),
            hello: false,
            ..Config::default()
        };
        cfg.save(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), cfg);
    }

    #[test]
    fn rejects_unknown_bus() {
        let err = serde_json::from_str::<Config>(r#"{"bus":"starter"}"#).unwrap_err();
        assert!(err.is_data());
    }
}
