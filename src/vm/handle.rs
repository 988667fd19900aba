//! The capability set a registry entry holds.
//!
//! The registry and the console tunnel only ever talk to a VM through
//! [`VirtualMachine`]; the hypervisor itself sits behind it. Handles use
//! interior mutability so they can be shared as `Arc<dyn VirtualMachine>`.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::RegistryResult;
use crate::vm::{VmConfig, VmConfigPatch, VmState};

#[async_trait]
pub trait VirtualMachine: Send + Sync {
    /// Name of the VM (never changes).
    fn name(&self) -> &str;

    /// Current observed lifecycle state.
    async fn state(&self) -> VmState;

    /// Copy of the current configuration.
    async fn config(&self) -> VmConfig;

    /// Boot the VM. Safe to call in any state.
    async fn start(&self) -> RegistryResult<()>;

    /// Power the VM off. Safe to call in any state.
    async fn stop(&self) -> RegistryResult<()>;

    /// Provision backing storage. Called exactly once, when the VM is created.
    async fn create_disk(&self) -> RegistryResult<()>;

    /// Merge `patch` into the live configuration.
    async fn update(&self, patch: &VmConfigPatch) -> RegistryResult<()>;

    /// Release backing storage and any held resources.
    async fn delete(&self) -> RegistryResult<()>;
}

/// Builds handles for the registry, both for fresh VMs and for configs
/// reloaded from the snapshot.
pub trait MachineFactory: Send + Sync {
    fn build(&self, config: VmConfig) -> Arc<dyn VirtualMachine>;
}
