//! Configuration file (`carrier.toml`).
//!
//! Every table and field is optional; missing values fall back to the
//! defaults below. Example:
//!
//! ```toml
//! bind = "0.0.0.0:3000"
//! snapshot = "/mnt/vm/servers.json"
//!
//! [allocator]
//! console_base = 3000
//! mac_prefix = "02:52:0a"
//!
//! [defaults]
//! nic = "e1000"
//! memory = 1024
//! disk = 10
//! boot = "cn"
//!
//! [backend]
//! kind = "qemu"
//! qemu_binary = "qemu-system-x86_64"
//! disk_dir = "/mnt/vm/disks"
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::vm::ResourceAllocator;
use crate::vm::allocator::VmDefaults;
use crate::vm::parse_octets;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CarrierConfig {
    /// Address the HTTP API listens on.
    pub bind: String,
    /// Snapshot file; defaults to `<data dir>/servers.json`.
    pub snapshot: Option<PathBuf>,
    pub allocator: AllocatorConfig,
    pub defaults: VmDefaults,
    pub backend: BackendConfig,
}

impl Default for CarrierConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3000".to_string(),
            snapshot: None,
            allocator: AllocatorConfig::default(),
            defaults: VmDefaults::default(),
            backend: BackendConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Console port of VM `n` is `console_base + n`.
    pub console_base: u16,
    /// First three octets of every allocated MAC address.
    pub mac_prefix: String,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            console_base: 3000,
            mac_prefix: "02:52:0a".to_string(),
        }
    }
}

impl AllocatorConfig {
    /// A fresh allocator with these settings.
    pub fn build(&self) -> Result<ResourceAllocator> {
        let prefix = parse_octets::<3>(&self.mac_prefix)
            .with_context(|| format!("allocator.mac_prefix '{}'", self.mac_prefix))?;
        Ok(ResourceAllocator::new(self.console_base, prefix))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Launch VMs as QEMU child processes.
    Qemu,
    /// Simulate VMs in memory (no processes, no disks).
    Mock,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub qemu_binary: PathBuf,
    /// Disk image directory; defaults to `<data dir>/disks`.
    pub disk_dir: Option<PathBuf>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Qemu,
            qemu_binary: PathBuf::from("qemu-system-x86_64"),
            disk_dir: None,
        }
    }
}

impl CarrierConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).context("parse carrier config")
    }

    /// Read `path`. A missing file yields the defaults; a malformed one is an
    /// error.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                info!(path = %path.display(), "loaded config");
                Self::from_toml_str(&text).with_context(|| path.display().to_string())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e).with_context(|| format!("read config {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_all_defaults() {
        let config = CarrierConfig::from_toml_str("").unwrap();
        assert_eq!(config, CarrierConfig::default());
        assert_eq!(config.defaults.nic, "e1000");
        assert_eq!(config.backend.kind, BackendKind::Qemu);
    }

    #[test]
    fn partial_tables_keep_remaining_defaults() {
        let config = CarrierConfig::from_toml_str(
            r#"
            bind = "127.0.0.1:8080"

            [allocator]
            console_base = 4000

            [defaults]
            memory = 512

            [backend]
            kind = "mock"
            "#,
        )
        .unwrap();

        assert_eq!(config.bind, "127.0.0.1:8080");
        assert_eq!(config.allocator.console_base, 4000);
        assert_eq!(config.allocator.mac_prefix, "02:52:0a");
        assert_eq!(config.defaults.memory, 512);
        assert_eq!(config.defaults.boot, "cn");
        assert_eq!(config.backend.kind, BackendKind::Mock);
    }

    #[test]
    fn allocator_uses_configured_prefix_and_base() {
        let config = AllocatorConfig {
            console_base: 5000,
            mac_prefix: "52:54:00".to_string(),
        };
        let record = config.build().unwrap().next().unwrap();
        assert_eq!(record.console, 5001);
        assert_eq!(record.mac.to_string(), "52:54:00:00:00:01");
    }

    #[test]
    fn bad_mac_prefix_is_rejected() {
        let config = AllocatorConfig {
            console_base: 3000,
            mac_prefix: "02:52".to_string(),
        };
        assert!(config.build().is_err());
    }

    #[test]
    fn missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = CarrierConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, CarrierConfig::default());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("carrier.toml");
        std::fs::write(&path, "bind = [").unwrap();
        assert!(CarrierConfig::load(&path).is_err());
    }
}
