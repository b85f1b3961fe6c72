//! Server configuration: a TOML file overridable by environment
//! variables, matching the listen address / cipher / password / address
//! logging table from the wire-compatible `ss-config` layout, trimmed
//! down from `nyx_core::config` to the handful of fields this relay
//! actually needs (no hot-reload watcher, no multipath/push sections).

use std::fs;
use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// TCP and UDP listen address (default: `0.0.0.0:8388`).
    #[serde(default = "default_address")]
    pub address: SocketAddr,
    /// One of `aes-128-gcm`, `aes-256-gcm`, `chacha20-ietf-poly1305`
    /// (default: `chacha20-ietf-poly1305`).
    #[serde(rename = "method", default = "default_cipher_name")]
    pub cipher_name: String,
    /// Pre-shared secret. Defaults to the empty string, matching the
    /// documented upstream default; an empty password is accepted rather
    /// than rejected, since that is the config's own documented default.
    #[serde(default)]
    pub password: String,
    /// Log each relayed connection's resolved target address. Off by
    /// default since it is sensitive operational data.
    #[serde(default)]
    pub log_addresses: bool,
    /// NAT idle timeout, in seconds, for UDP associations (spec default: 60).
    #[serde(default = "default_nat_idle_secs")]
    pub nat_idle_secs: u64,
}

fn default_address() -> SocketAddr {
    "0.0.0.0:8388".parse().expect("valid default address")
}

fn default_cipher_name() -> String {
    "chacha20-ietf-poly1305".to_string()
}

fn default_nat_idle_secs() -> u64 {
    60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: default_address(),
            cipher_name: default_cipher_name(),
            password: String::new(),
            log_addresses: false,
            nat_idle_secs: default_nat_idle_secs(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::config(format!("reading {}: {e}", path.display())))?;
        let mut cfg: Config = toml::from_str(&raw)?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// `SS_ADDRESS`, `SS_METHOD`, `SS_PASSWORD`, `SS_LOG_ADDRESSES` override
    /// whatever the file contains, letting deployments keep secrets out of
    /// the TOML file entirely.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SS_ADDRESS") {
            if let Ok(addr) = v.parse() {
                self.address = addr;
            }
        }
        if let Ok(v) = std::env::var("SS_METHOD") {
            self.cipher_name = v;
        }
        if let Ok(v) = std::env::var("SS_PASSWORD") {
            self.password = v;
        }
        if let Ok(v) = std::env::var("SS_LOG_ADDRESSES") {
            self.log_addresses = matches!(v.as_str(), "1" | "true" | "yes");
        }
    }

    pub fn validate(&self) -> Result<()> {
        ss_core::CipherKind::from_name(&self.cipher_name)
            .map_err(|e| Error::config(format!("invalid method: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_toml() {
        let raw = r#"
            address = "127.0.0.1:8388"
            method = "chacha20-ietf-poly1305"
            password = "hunter2"
        "#;
        let mut cfg: Config = toml::from_str(raw).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.nat_idle_secs, 60);
        assert!(!cfg.log_addresses);
    }

    #[test]
    fn rejects_unknown_cipher() {
        let raw = r#"
            address = "127.0.0.1:8388"
            method = "rc4-md5"
            password = "hunter2"
        "#;
        let cfg: Config = toml::from_str(raw).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn empty_password_is_the_documented_default_and_is_accepted() {
        let raw = r#"
            address = "127.0.0.1:8388"
            method = "aes-128-gcm"
            password = ""
        "#;
        let cfg: Config = toml::from_str(raw).unwrap();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn default_matches_documented_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.address, "0.0.0.0:8388".parse().unwrap());
        assert_eq!(cfg.cipher_name, "chacha20-ietf-poly1305");
        assert_eq!(cfg.password, "");
        assert!(!cfg.log_addresses);
        assert_eq!(cfg.nat_idle_secs, 60);
        assert!(cfg.validate().is_ok());
    }
}
