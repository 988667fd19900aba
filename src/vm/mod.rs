//! VM model for carrier.
//!
//! Holds the persisted [`VmConfig`], the partial [`VmConfigPatch`] accepted by
//! create and update, the observed [`VmState`], and the backends that
//! implement the [`VirtualMachine`] capability set.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{RegistryError, RegistryResult};

pub mod allocator;
pub mod filesystem;
pub mod handle;
pub mod lifecycle;
pub mod mock;

// ---------------------------------------------------------------------------
// Shared types used across submodules
// ---------------------------------------------------------------------------

/// A 6-octet hardware address.
///
/// Rendered as lowercase colon-separated hex (`02:52:0a:00:00:01`); parsing
/// accepts either case so snapshots written by older tooling still load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// Combine a 3-octet vendor prefix with the low 24 bits of `index`.
    pub fn from_prefix(prefix: [u8; 3], index: u32) -> Self {
        let [_, a, b, c] = index.to_be_bytes();
        Self([prefix[0], prefix[1], prefix[2], a, b, c])
    }

    /// The leading three octets.
    pub fn prefix(&self) -> [u8; 3] {
        [self.0[0], self.0[1], self.0[2]]
    }

    /// The trailing three octets read as a big-endian integer.
    pub fn suffix(&self) -> u32 {
        u32::from_be_bytes([0, self.0[3], self.0[4], self.0[5]])
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

/// Parse failure for [`MacAddress`] and MAC prefixes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid MAC address '{0}'")]
pub struct MacParseError(pub String);

/// Parse `N` colon-separated hex octets.
pub(crate) fn parse_octets<const N: usize>(s: &str) -> Result<[u8; N], MacParseError> {
    let mut out = [0u8; N];
    let mut parts = s.split(':');
    for slot in out.iter_mut() {
        let part = parts.next().ok_or_else(|| MacParseError(s.to_string()))?;
        if part.is_empty() || part.len() > 2 {
            return Err(MacParseError(s.to_string()));
        }
        *slot = u8::from_str_radix(part, 16).map_err(|_| MacParseError(s.to_string()))?;
    }
    if parts.next().is_some() {
        return Err(MacParseError(s.to_string()));
    }
    Ok(out)
}

impl FromStr for MacAddress {
    type Err = MacParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_octets::<6>(s).map(Self)
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Longest accepted VM name.
pub const MAX_NAME_LEN: usize = 64;

/// Check that `name` is usable as a VM name.
///
/// Names become file names (`<name>.img`) and hypervisor arguments, so only
/// ASCII letters, digits, `.`, `_` and `-` are accepted, and `.`/`..` are
/// rejected.
pub fn validate_name(name: &str) -> RegistryResult<()> {
    let reason = if name.is_empty() {
        Some("name is empty")
    } else if name.len() > MAX_NAME_LEN {
        Some("name is longer than 64 characters")
    } else if name == "." || name == ".." {
        Some("name is a relative path component")
    } else if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
    {
        Some("only letters, digits, '.', '_' and '-' are allowed")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(RegistryError::InvalidName {
            name: name.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// Persisted configuration of one VM.
///
/// Only these fields are durable; runtime state is never written to the
/// snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfig {
    /// Unique registry key, immutable once created.
    pub name: String,

    /// TCP port on 127.0.0.1 serving the serial console.
    pub console: u16,

    /// VNC display index.
    pub vnc: u32,

    /// Hardware address of the VM's network interface.
    pub mac: MacAddress,

    /// NIC model handed to the hypervisor (e.g. `e1000`).
    pub nic: String,

    /// Memory in megabytes.
    pub memory: u64,

    /// Disk size in gigabytes.
    pub disk: u64,

    /// Boot order string handed to the hypervisor (e.g. `cn`).
    pub boot: String,
}

/// Caller-supplied fields for create and update.
///
/// Allocator-owned fields (`console`, `vnc`, `mac`) and `name` are not part of
/// the patch; a body carrying them, or any other unknown key, is rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VmConfigPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot: Option<String>,
}

impl VmConfigPatch {
    /// Overwrite every field present in the patch.
    pub fn apply(&self, config: &mut VmConfig) {
        if let Some(nic) = &self.nic {
            config.nic = nic.clone();
        }
        if let Some(memory) = self.memory {
            config.memory = memory;
        }
        if let Some(disk) = self.disk {
            config.disk = disk;
        }
        if let Some(boot) = &self.boot {
            config.boot = boot.clone();
        }
    }
}

impl From<&VmConfig> for VmConfigPatch {
    /// A patch that restores every mutable field of `config`.
    fn from(config: &VmConfig) -> Self {
        Self {
            nic: Some(config.nic.clone()),
            memory: Some(config.memory),
            disk: Some(config.disk),
            boot: Some(config.boot.clone()),
        }
    }
}

/// Observed lifecycle state of a VM, as reported by its backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmState {
    /// The hypervisor process is running.
    Running,
    /// A stop was requested and we are waiting for process exit.
    Stopping,
    /// No hypervisor process exists for this VM.
    Stopped,
    /// The backend reported a failure.
    Failed(String),
}

impl VmState {
    pub fn is_stopped(&self) -> bool {
        matches!(self, VmState::Stopped)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, VmState::Running)
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmState::Running => f.write_str("RUNNING"),
            VmState::Stopping => f.write_str("STOPPING"),
            VmState::Stopped => f.write_str("STOPPED"),
            VmState::Failed(_) => f.write_str("FAILED"),
        }
    }
}

impl Serialize for VmState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// `{state, config}` pair returned by most API operations.
#[derive(Debug, Clone, Serialize)]
pub struct VmStatus {
    pub state: VmState,
    pub config: VmConfig,
}

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use allocator::{AllocationRecord, ResourceAllocator};
pub use handle::{MachineFactory, VirtualMachine};

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> VmConfig {
        VmConfig {
            name: "web1".into(),
            console: 3001,
            vnc: 1,
            mac: "02:52:0a:00:00:01".parse().unwrap(),
            nic: "e1000".into(),
            memory: 1024,
            disk: 10,
            boot: "cn".into(),
        }
    }

    #[test]
    fn mac_parses_either_case_and_renders_lowercase() {
        let mac: MacAddress = "02:52:0A:00:00:0B".parse().unwrap();
        assert_eq!(mac.to_string(), "02:52:0a:00:00:0b");
        assert_eq!(mac.suffix(), 11);
        assert_eq!(mac.prefix(), [0x02, 0x52, 0x0a]);
    }

    #[test]
    fn mac_rejects_malformed_input() {
        assert!("02:52:0a:00:00".parse::<MacAddress>().is_err());
        assert!("02:52:0a:00:00:01:02".parse::<MacAddress>().is_err());
        assert!("02:52:0a:00:00:zz".parse::<MacAddress>().is_err());
        assert!("02:52:0a:00::01".parse::<MacAddress>().is_err());
    }

    #[test]
    fn mac_from_prefix_uses_big_endian_low_bytes() {
        let mac = MacAddress::from_prefix([0x02, 0x52, 0x0a], 0x01_02_03);
        assert_eq!(mac.to_string(), "02:52:0a:01:02:03");
    }

    #[test]
    fn patch_overrides_only_present_fields() {
        let mut config = sample_config();
        let patch: VmConfigPatch = serde_json::from_str(r#"{"memory": 2048, "boot": "d"}"#).unwrap();
        patch.apply(&mut config);
        assert_eq!(config.memory, 2048);
        assert_eq!(config.boot, "d");
        assert_eq!(config.disk, 10);
        assert_eq!(config.nic, "e1000");
    }

    #[test]
    fn patch_rejects_allocator_owned_keys() {
        for (body, key) in [
            (r#"{"memory": 512, "console": 22}"#, "console"),
            (r#"{"vnc": 1}"#, "vnc"),
            (r#"{"mac": "02:52:0a:00:00:01"}"#, "mac"),
            (r#"{"name": "evil"}"#, "name"),
        ] {
            let err = serde_json::from_str::<VmConfigPatch>(body).unwrap_err();
            assert!(err.to_string().contains(key), "{body}: {err}");
        }
    }

    #[test]
    fn valid_names_are_accepted() {
        for name in ["web1", "db-primary", "build_02", "v1.2", "a"] {
            validate_name(name).unwrap();
        }
        validate_name(&"x".repeat(MAX_NAME_LEN)).unwrap();
    }

    #[test]
    fn path_like_and_odd_names_are_rejected() {
        let long = "x".repeat(MAX_NAME_LEN + 1);
        let names = [
            "",
            ".",
            "..",
            "../escaped",
            "a/b",
            "disk,format=qcow2",
            "web 1",
            "ü",
            long.as_str(),
        ];
        for name in names {
            let err = validate_name(name).unwrap_err();
            assert!(matches!(err, RegistryError::InvalidName { .. }), "{name}");
        }
    }

    #[test]
    fn state_serializes_as_uppercase_word() {
        assert_eq!(serde_json::to_string(&VmState::Running).unwrap(), "\"RUNNING\"");
        assert_eq!(
            serde_json::to_string(&VmState::Failed("boom".into())).unwrap(),
            "\"FAILED\""
        );
    }

    #[test]
    fn config_serializes_mac_as_string() {
        let json = serde_json::to_value(sample_config()).unwrap();
        assert_eq!(json["mac"], "02:52:0a:00:00:01");
        let back: VmConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, sample_config());
    }
}
