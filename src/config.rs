//! Configuration management
//!
//! Config is stored as `config.toml` under a directory resolved from the
//! `IOT49` environment variable (falling back to `~/.iot49`).
//!
//! Loading from disk is an external collaborator per the system design: this
//! module stays a thin `fs::read_to_string` + `toml::from_str`, with an
//! embedded default so the gateway still starts with sane values when no
//! config file is present.

use crate::constants::{
    DEFAULT_ADVERTISE_PORT, DEFAULT_CONNECTION_SERVER_PORT, DEFAULT_DEVICE_SCAN_INTERVAL_SECS,
};
use crate::error::{IotError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_TOML: &str = include_str!("../config/default.toml");

/// Gateway / client configuration
///
/// Mirrors the fields specified in the external interface (§6): `host_dir`,
/// `mcu_dir`, `advertise_port`, `connection_server_port`,
/// `device_scan_interval`, `password`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host file tree root used by `fput`/`fget`/`rsync` path resolution
    pub host_dir: PathBuf,
    /// Informational: where the synced tree lives on the device
    pub mcu_dir: String,
    /// UDP port for device advertisements
    pub advertise_port: u16,
    /// TCP port for the TLS connection server
    pub connection_server_port: u16,
    /// Interval between registry scans / advertisement ticks (seconds)
    pub device_scan_interval: f64,
    /// Shared password clients present during the auth handshake
    pub password: String,
    /// PEM-encoded certificate chain for the TLS connection server
    pub cert_pem: PathBuf,
    /// PEM-encoded private key matching `cert_pem`
    pub key_pem: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        toml::from_str(DEFAULT_CONFIG_TOML).expect("embedded default.toml must parse")
    }
}

impl Config {
    /// Resolve the config root: `$IOT49` if set, else `$HOME/.iot49`
    pub fn config_root() -> PathBuf {
        if let Some(dir) = std::env::var_os("IOT49") {
            return PathBuf::from(dir);
        }
        let home = std::env::var_os("HOME").unwrap_or_else(|| "/tmp".into());
        PathBuf::from(home).join(".iot49")
    }

    /// Path to `config.toml` under the resolved config root
    pub fn config_path() -> PathBuf {
        Self::config_root().join("config.toml")
    }

    /// Load config from `config.toml`, falling back to embedded defaults if absent
    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        Self::load_from(&path)
    }

    /// Load config from an explicit path, falling back to defaults if the file is absent
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|e| IotError::ConfigLoad {
            path: path.to_path_buf(),
            source: Box::new(e),
        })?;
        toml::from_str(&text).map_err(|e| IotError::ConfigLoad {
            path: path.to_path_buf(),
            source: Box::new(e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_embedded_toml() {
        let cfg = Config::default();
        assert_eq!(cfg.advertise_port, DEFAULT_ADVERTISE_PORT);
        assert_eq!(cfg.connection_server_port, DEFAULT_CONNECTION_SERVER_PORT);
        assert_eq!(cfg.device_scan_interval, DEFAULT_DEVICE_SCAN_INTERVAL_SECS);
    }

    #[test]
    fn load_from_missing_path_returns_default() {
        let cfg = Config::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(cfg.advertise_port, DEFAULT_ADVERTISE_PORT);
    }

    #[test]
    fn load_from_parses_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            host_dir = "/srv/iot"
            mcu_dir = "/"
            advertise_port = 9999
            connection_server_port = 9998
            device_scan_interval = 2.5
            password = "hunter2"
            cert_pem = "/srv/iot/cert.pem"
            key_pem = "/srv/iot/key.pem"
            "#,
        )
        .unwrap();
        let cfg = Config::load_from(&path).unwrap();
        assert_eq!(cfg.advertise_port, 9999);
        assert_eq!(cfg.password, "hunter2");
        assert_eq!(cfg.device_scan_interval, 2.5);
    }
}
