//! In-memory VM backend.
//!
//! Simulates a hypervisor without launching processes: power state, disk
//! provisioning and deletion are recorded in a shared [`MockHypervisor`] so
//! tests (and `backend.kind = "mock"` dry runs) can observe every side effect
//! after the registry has taken ownership of the handles.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use crate::error::{RegistryError, RegistryResult};
use crate::vm::{MachineFactory, VirtualMachine, VmConfig, VmConfigPatch, VmState};

/// Shared simulated hypervisor state.
#[derive(Debug, Default)]
pub struct MockHypervisor {
    states: Mutex<HashMap<String, VmState>>,
    disks: Mutex<BTreeSet<String>>,
    disk_creations: AtomicU64,
    deletions: AtomicU64,
    fail_disk: AtomicBool,
    fail_delete: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockHypervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Observed state of `name`; unknown VMs are stopped.
    pub fn state_of(&self, name: &str) -> VmState {
        lock(&self.states)
            .get(name)
            .cloned()
            .unwrap_or(VmState::Stopped)
    }

    /// Force the reported state of `name`, e.g. to simulate a crash.
    pub fn set_state(&self, name: &str, state: VmState) {
        lock(&self.states).insert(name.to_string(), state);
    }

    /// Names of VMs whose disk currently exists.
    pub fn disks(&self) -> Vec<String> {
        lock(&self.disks).iter().cloned().collect()
    }

    pub fn disk_creations(&self) -> u64 {
        self.disk_creations.load(Ordering::SeqCst)
    }

    pub fn deletions(&self) -> u64 {
        self.deletions.load(Ordering::SeqCst)
    }

    /// Make every subsequent `create_disk` fail until cleared.
    pub fn fail_disk_creation(&self, fail: bool) {
        self.fail_disk.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `delete` fail, leaving disk and state in place.
    pub fn fail_deletion(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }
}

/// A VM handle backed by [`MockHypervisor`].
pub struct MockMachine {
    name: String,
    config: tokio::sync::RwLock<VmConfig>,
    hypervisor: Arc<MockHypervisor>,
}

impl MockMachine {
    pub fn new(config: VmConfig, hypervisor: Arc<MockHypervisor>) -> Self {
        Self {
            name: config.name.clone(),
            config: tokio::sync::RwLock::new(config),
            hypervisor,
        }
    }
}

#[async_trait]
impl VirtualMachine for MockMachine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn state(&self) -> VmState {
        self.hypervisor.state_of(&self.name)
    }

    async fn config(&self) -> VmConfig {
        self.config.read().await.clone()
    }

    async fn start(&self) -> RegistryResult<()> {
        debug!(vm = %self.name, "mock start");
        self.hypervisor.set_state(&self.name, VmState::Running);
        Ok(())
    }

    async fn stop(&self) -> RegistryResult<()> {
        debug!(vm = %self.name, "mock stop");
        self.hypervisor.set_state(&self.name, VmState::Stopped);
        Ok(())
    }

    async fn create_disk(&self) -> RegistryResult<()> {
        if self.hypervisor.fail_disk.load(Ordering::SeqCst) {
            return Err(RegistryError::backend(
                &self.name,
                "create_disk",
                "simulated disk failure",
            ));
        }
        self.hypervisor.disk_creations.fetch_add(1, Ordering::SeqCst);
        lock(&self.hypervisor.disks).insert(self.name.clone());
        Ok(())
    }

    async fn update(&self, patch: &VmConfigPatch) -> RegistryResult<()> {
        patch.apply(&mut *self.config.write().await);
        Ok(())
    }

    async fn delete(&self) -> RegistryResult<()> {
        if self.hypervisor.fail_delete.load(Ordering::SeqCst) {
            return Err(RegistryError::backend(
                &self.name,
                "delete",
                "simulated release failure",
            ));
        }
        self.hypervisor.deletions.fetch_add(1, Ordering::SeqCst);
        lock(&self.hypervisor.disks).remove(&self.name);
        lock(&self.hypervisor.states).remove(&self.name);
        Ok(())
    }
}

/// Builds [`MockMachine`]s that all share one [`MockHypervisor`].
#[derive(Debug, Clone)]
pub struct MockFactory {
    hypervisor: Arc<MockHypervisor>,
}

impl MockFactory {
    pub fn new(hypervisor: Arc<MockHypervisor>) -> Self {
        Self { hypervisor }
    }

    pub fn hypervisor(&self) -> &Arc<MockHypervisor> {
        &self.hypervisor
    }
}

impl MachineFactory for MockFactory {
    fn build(&self, config: VmConfig) -> Arc<dyn VirtualMachine> {
        Arc::new(MockMachine::new(config, Arc::clone(&self.hypervisor)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
