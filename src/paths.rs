//! Directory layout for carrier.
//!
//! - Config: `$XDG_CONFIG_HOME/carrier/` or `~/.config/carrier/` (`carrier.toml`)
//! - Data:   `$XDG_DATA_HOME/carrier/` or `~/.local/share/carrier/`
//!   - `servers.json`  registry snapshot
//!   - `disks/`        one raw image per VM
//! - Logs:   `<data>/logs/`
//!
//! When `$HOME` is unset (system services), everything lives under
//! `/var/lib/carrier` and `/etc/carrier`.

use std::path::{Path, PathBuf};
use tracing::info;

const APP_NAME: &str = "carrier";

/// All resolved application directory paths.
#[derive(Debug, Clone)]
pub struct CarrierPaths {
    /// Human-editable config directory
    pub config: PathBuf,
    /// Machine-managed data root
    pub data: PathBuf,
    /// VM disk images
    pub disks: PathBuf,
    /// Application logs
    pub logs: PathBuf,
}

impl CarrierPaths {
    /// Resolve all paths. Does not create any directories; call `ensure()`.
    pub fn resolve() -> Self {
        match std::env::var("HOME").ok().map(PathBuf::from) {
            Some(home) => Self::under(resolve_config_dir(&home), resolve_data_dir(&home)),
            None => Self::under(
                PathBuf::from("/etc").join(APP_NAME),
                PathBuf::from("/var/lib").join(APP_NAME),
            ),
        }
    }

    fn under(config: PathBuf, data: PathBuf) -> Self {
        Self {
            config,
            disks: data.join("disks"),
            logs: data.join("logs"),
            data,
        }
    }

    /// Default location of the config file.
    pub fn config_file(&self) -> PathBuf {
        self.config.join("carrier.toml")
    }

    /// Default location of the registry snapshot.
    pub fn snapshot(&self) -> PathBuf {
        self.data.join("servers.json")
    }

    /// Create the data directories that don't already exist.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [&self.data, &self.disks, &self.logs] {
            std::fs::create_dir_all(dir)?;
            info!("ensured directory: {}", dir.display());
        }
        Ok(())
    }
}

fn resolve_config_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".config").join(APP_NAME)
    }
}

fn resolve_data_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".local").join("share").join(APP_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_hangs_off_data_dir() {
        let paths = CarrierPaths::under(PathBuf::from("/cfg"), PathBuf::from("/data"));
        assert_eq!(paths.disks, PathBuf::from("/data/disks"));
        assert_eq!(paths.logs, PathBuf::from("/data/logs"));
        assert_eq!(paths.snapshot(), PathBuf::from("/data/servers.json"));
        assert_eq!(paths.config_file(), PathBuf::from("/cfg/carrier.toml"));
    }

    #[test]
    fn ensure_creates_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = CarrierPaths::under(tmp.path().join("config"), tmp.path().join("data"));

        paths.ensure().expect("ensure should succeed");

        assert!(paths.data.is_dir());
        assert!(paths.disks.is_dir());
        assert!(paths.logs.is_dir());
    }
}
