//! Conflict-free resource allocation for new VMs.
//!
//! Every VM gets a console port, a VNC display and a MAC address derived from
//! a single counter `n`:
//!
//! ```text
//! console = console_base + n
//! vnc     = n
//! mac     = mac_prefix ++ be24(n)
//! ```
//!
//! The counter only moves forward. Values belonging to deleted VMs are
//! retired, never handed out again within a process, and after a restart the
//! counter is reseeded past everything found in the snapshot.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{RegistryError, RegistryResult};
use crate::vm::{MacAddress, VmConfig};

/// Largest index whose MAC suffix still fits in three octets.
const MAX_INDEX: u32 = 0x00FF_FFFF;

/// Values every new VM starts with before the caller's patch is applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmDefaults {
    pub nic: String,
    pub memory: u64,
    pub disk: u64,
    pub boot: String,
}

impl Default for VmDefaults {
    fn default() -> Self {
        Self {
            nic: "e1000".to_string(),
            memory: 1024,
            disk: 10,
            boot: "cn".to_string(),
        }
    }
}

/// One allocation: the identifying resources for a single new VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationRecord {
    pub index: u32,
    pub console: u16,
    pub vnc: u32,
    pub mac: MacAddress,
}

impl AllocationRecord {
    /// Build a complete config for `name` from this record and `defaults`.
    pub fn into_config(self, name: &str, defaults: &VmDefaults) -> VmConfig {
        VmConfig {
            name: name.to_string(),
            console: self.console,
            vnc: self.vnc,
            mac: self.mac,
            nic: defaults.nic.clone(),
            memory: defaults.memory,
            disk: defaults.disk,
            boot: defaults.boot.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResourceAllocator {
    console_base: u16,
    mac_prefix: [u8; 3],
    next_index: u32,
}

impl ResourceAllocator {
    /// A fresh allocator whose first record has index 1.
    pub fn new(console_base: u16, mac_prefix: [u8; 3]) -> Self {
        Self {
            console_base,
            mac_prefix,
            next_index: 1,
        }
    }

    /// Index the next call to [`next`](Self::next) will use.
    pub fn peek_index(&self) -> u32 {
        self.next_index
    }

    /// Hand out the next record and advance the counter by one.
    ///
    /// Fails with [`RegistryError::Exhausted`] once the console port would
    /// overflow a TCP port or the MAC suffix would overflow three octets.
    pub fn next(&mut self) -> RegistryResult<AllocationRecord> {
        let index = self.next_index;
        let console = u32::from(self.console_base)
            .checked_add(index)
            .and_then(|port| u16::try_from(port).ok())
            .filter(|_| index <= MAX_INDEX)
            .ok_or(RegistryError::Exhausted { index })?;

        self.next_index = index + 1;

        Ok(AllocationRecord {
            index,
            console,
            vnc: index,
            mac: MacAddress::from_prefix(self.mac_prefix, index),
        })
    }

    /// Advance the counter past every index already used by `configs`.
    ///
    /// An index counts as used if it shows up as the VNC display, as the
    /// console offset from `console_base`, or as the MAC suffix under our
    /// prefix. Never moves the counter backwards.
    pub fn resume_after<'a>(&mut self, configs: impl IntoIterator<Item = &'a VmConfig>) {
        let highest = configs
            .into_iter()
            .flat_map(|config| {
                let console_offset = config
                    .console
                    .checked_sub(self.console_base)
                    .map(u32::from);
                let mac_index = (config.mac.prefix() == self.mac_prefix).then(|| config.mac.suffix());
                [Some(config.vnc), console_offset, mac_index]
            })
            .flatten()
            .max();

        if let Some(highest) = highest {
            let resume = highest.saturating_add(1);
            if resume > self.next_index {
                debug!(from = self.next_index, to = resume, "reseeding allocator");
                self.next_index = resume;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
