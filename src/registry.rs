//! The VM registry: name → handle, backed by a JSON snapshot.
//!
//! ## Concurrency
//!
//! One async mutex guards the map, the allocator and the snapshot write.
//! Every mutating operation holds it from its precondition check through the
//! persist, so two creates of the same name cannot both succeed and an update
//! can never race a delete into a torn snapshot. Read-only lookups take the
//! same lock briefly and release it before talking to the backend.
//!
//! ## Durability
//!
//! `save` runs after the in-memory mutation and before the operation returns.
//! A failed save is reported as [`RegistryError::Persistence`] and the
//! mutation is undone where the backend allows it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{RegistryError, RegistryResult};
use crate::vm::allocator::VmDefaults;
use crate::vm::{
    MachineFactory, ResourceAllocator, VirtualMachine, VmConfig, VmConfigPatch, VmStatus,
    validate_name,
};

/// A power transition requested through the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    Start,
    Stop,
}

impl std::str::FromStr for PowerAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(PowerAction::Start),
            "stop" => Ok(PowerAction::Stop),
            other => Err(format!("unknown power action '{other}' (expected start or stop)")),
        }
    }
}

struct Inner {
    machines: BTreeMap<String, Arc<dyn VirtualMachine>>,
    allocator: ResourceAllocator,
}

pub struct Registry {
    inner: Mutex<Inner>,
    factory: Arc<dyn MachineFactory>,
    defaults: VmDefaults,
    snapshot: PathBuf,
}

impl Registry {
    /// An empty registry that persists to `snapshot`.
    pub fn new(
        snapshot: impl Into<PathBuf>,
        allocator: ResourceAllocator,
        defaults: VmDefaults,
        factory: Arc<dyn MachineFactory>,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                machines: BTreeMap::new(),
                allocator,
            }),
            factory,
            defaults,
            snapshot: snapshot.into(),
        }
    }

    /// Build a registry from the snapshot at `snapshot`.
    ///
    /// A missing snapshot yields an empty registry. An unreadable one is
    /// logged as [`RegistryError::LoadCorruption`] and also yields an empty
    /// registry. The allocator is reseeded past every loaded VM.
    pub async fn load(
        snapshot: impl Into<PathBuf>,
        mut allocator: ResourceAllocator,
        defaults: VmDefaults,
        factory: Arc<dyn MachineFactory>,
    ) -> Self {
        let snapshot = snapshot.into();
        let mut configs = match read_snapshot(&snapshot).await {
            Ok(configs) => configs,
            Err(e) => {
                error!(error = %e, "starting with an empty registry");
                BTreeMap::new()
            }
        };
        configs.retain(|name, _| match validate_name(name) {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "skipping snapshot entry");
                false
            }
        });

        allocator.resume_after(configs.values());

        let machines: BTreeMap<_, _> = configs
            .into_iter()
            .map(|(name, mut config)| {
                // The map key is authoritative for the name.
                config.name.clone_from(&name);
                (name, factory.build(config))
            })
            .collect();

        info!(
            snapshot = %snapshot.display(),
            vms = machines.len(),
            next_index = allocator.peek_index(),
            "registry loaded"
        );

        Self {
            inner: Mutex::new(Inner {
                machines,
                allocator,
            }),
            factory,
            defaults,
            snapshot,
        }
    }

    /// Path of the snapshot file.
    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot
    }

    /// Names of all registered VMs, sorted.
    pub async fn list(&self) -> Vec<String> {
        self.inner.lock().await.machines.keys().cloned().collect()
    }

    /// The handle for `name`.
    pub async fn get(&self, name: &str) -> RegistryResult<Arc<dyn VirtualMachine>> {
        let inner = self.inner.lock().await;
        lookup(&inner, name).cloned()
    }

    /// `{state, config}` for `name`.
    pub async fn status(&self, name: &str) -> RegistryResult<VmStatus> {
        let vm = self.get(name).await?;
        Ok(status_of(vm.as_ref()).await)
    }

    /// Register a new VM, provision its disk and persist.
    #[instrument(skip(self, patch), level = "info")]
    pub async fn create(&self, name: &str, patch: &VmConfigPatch) -> RegistryResult<VmStatus> {
        validate_name(name)?;
        let mut inner = self.inner.lock().await;
        if inner.machines.contains_key(name) {
            return Err(RegistryError::Conflict {
                name: name.to_string(),
            });
        }

        let record = inner.allocator.next()?;
        let mut config = record.into_config(name, &self.defaults);
        patch.apply(&mut config);

        let vm = self.factory.build(config);
        vm.create_disk().await?;

        inner.machines.insert(name.to_string(), Arc::clone(&vm));
        if let Err(e) = self.save_locked(&inner).await {
            inner.machines.remove(name);
            if let Err(cleanup) = vm.delete().await {
                warn!(vm = name, error = %cleanup, "failed to release disk after aborted create");
            }
            return Err(e);
        }

        info!(vm = name, index = record.index, console = record.console, mac = %record.mac, "VM created");
        Ok(status_of(vm.as_ref()).await)
    }

    /// Merge `patch` into a stopped VM's config and persist.
    #[instrument(skip(self, patch), level = "info")]
    pub async fn update(&self, name: &str, patch: &VmConfigPatch) -> RegistryResult<VmStatus> {
        let inner = self.inner.lock().await;
        let vm = Arc::clone(lookup(&inner, name)?);
        require_stopped(vm.as_ref(), "modify").await?;

        let previous = vm.config().await;
        vm.update(patch).await?;

        if let Err(e) = self.save_locked(&inner).await {
            if let Err(restore) = vm.update(&VmConfigPatch::from(&previous)).await {
                warn!(vm = name, error = %restore, "failed to restore config after aborted update");
            }
            return Err(e);
        }

        info!(vm = name, "VM updated");
        Ok(status_of(vm.as_ref()).await)
    }

    /// Unregister a stopped VM, persist, then release its resources.
    ///
    /// The snapshot is written before the disk is released, so a failed save
    /// leaves the VM registered and intact. If the release fails, the entry
    /// is put back and the snapshot rewritten.
    #[instrument(skip(self), level = "info")]
    pub async fn delete(&self, name: &str) -> RegistryResult<()> {
        let mut inner = self.inner.lock().await;
        let vm = Arc::clone(lookup(&inner, name)?);
        require_stopped(vm.as_ref(), "delete").await?;

        inner.machines.remove(name);
        if let Err(e) = self.save_locked(&inner).await {
            inner.machines.insert(name.to_string(), vm);
            return Err(e);
        }

        if let Err(e) = vm.delete().await {
            inner.machines.insert(name.to_string(), vm);
            if let Err(restore) = self.save_locked(&inner).await {
                warn!(vm = name, error = %restore, "failed to restore snapshot after aborted delete");
            }
            return Err(e);
        }

        info!(vm = name, "VM deleted");
        Ok(())
    }

    /// Start or stop a VM. Power state is not persisted.
    #[instrument(skip(self), level = "info")]
    pub async fn set_power(&self, name: &str, action: PowerAction) -> RegistryResult<VmStatus> {
        let inner = self.inner.lock().await;
        let vm = Arc::clone(lookup(&inner, name)?);
        match action {
            PowerAction::Start => vm.start().await?,
            PowerAction::Stop => vm.stop().await?,
        }
        drop(inner);
        Ok(status_of(vm.as_ref()).await)
    }

    /// Write every VM's config to the snapshot.
    pub async fn save(&self) -> RegistryResult<()> {
        let inner = self.inner.lock().await;
        self.save_locked(&inner).await
    }

    async fn save_locked(&self, inner: &Inner) -> RegistryResult<()> {
        let mut configs = BTreeMap::new();
        for (name, vm) in &inner.machines {
            configs.insert(name.clone(), vm.config().await);
        }
        write_snapshot(&self.snapshot, &configs).await?;
        debug!(snapshot = %self.snapshot.display(), vms = configs.len(), "snapshot saved");
        Ok(())
    }
}

fn lookup<'a>(inner: &'a Inner, name: &str) -> RegistryResult<&'a Arc<dyn VirtualMachine>> {
    inner.machines.get(name).ok_or_else(|| RegistryError::NotFound {
        name: name.to_string(),
    })
}

async fn require_stopped(vm: &dyn VirtualMachine, operation: &'static str) -> RegistryResult<()> {
    let state = vm.state().await;
    if state.is_stopped() {
        Ok(())
    } else {
        Err(RegistryError::InvalidState {
            name: vm.name().to_string(),
            operation,
            state: state.to_string(),
        })
    }
}

async fn status_of(vm: &dyn VirtualMachine) -> VmStatus {
    VmStatus {
        state: vm.state().await,
        config: vm.config().await,
    }
}

// ---------------------------------------------------------------------------
// Snapshot I/O
// ---------------------------------------------------------------------------

/// Read the snapshot. A missing file is an empty registry, not an error.
async fn read_snapshot(path: &Path) -> RegistryResult<BTreeMap<String, VmConfig>> {
    let corrupt = |reason: String| RegistryError::LoadCorruption {
        path: path.to_path_buf(),
        reason,
    };

    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(snapshot = %path.display(), "no snapshot yet");
            return Ok(BTreeMap::new());
        }
        Err(e) => return Err(corrupt(e.to_string())),
    };

    serde_json::from_slice(&bytes).map_err(|e| corrupt(e.to_string()))
}

/// Write `configs` with sorted keys and two-space indentation, atomically.
async fn write_snapshot(path: &Path, configs: &BTreeMap<String, VmConfig>) -> RegistryResult<()> {
    let persistence = |reason: String| RegistryError::Persistence {
        path: path.to_path_buf(),
        reason,
    };

    // Round-trip through Value so struct fields are key-sorted too.
    let value = serde_json::to_value(configs).map_err(|e| persistence(e.to_string()))?;
    let mut body = serde_json::to_vec_pretty(&value).map_err(|e| persistence(e.to_string()))?;
    body.push(b'\n');

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| persistence(e.to_string()))?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, &body)
        .await
        .map_err(|e| persistence(e.to_string()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| persistence(e.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::mock::{MockFactory, MockHypervisor};

    const PREFIX: [u8; 3] = [0x02, 0x52, 0x0a];

    fn registry(dir: &Path, hv: &Arc<MockHypervisor>) -> Registry {
        Registry::new(
            dir.join("servers.json"),
            ResourceAllocator::new(3000, PREFIX),
            VmDefaults::default(),
            Arc::new(MockFactory::new(Arc::clone(hv))),
        )
    }

    #[test]
    fn power_action_parses_start_and_stop_only() {
        assert_eq!("start".parse::<PowerAction>(), Ok(PowerAction::Start));
        assert_eq!("stop".parse::<PowerAction>(), Ok(PowerAction::Stop));
        assert!("reboot".parse::<PowerAction>().is_err());
    }

    #[tokio::test]
    async fn snapshot_keys_are_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let hv = MockHypervisor::new();
        let reg = registry(dir.path(), &hv);

        reg.create("zeta", &VmConfigPatch::default()).await.unwrap();
        reg.create("alpha", &VmConfigPatch::default()).await.unwrap();

        let text = std::fs::read_to_string(reg.snapshot_path()).unwrap();
        assert!(text.find("\"alpha\"").unwrap() < text.find("\"zeta\"").unwrap());

        let fields = ["boot", "console", "disk", "mac", "memory", "name", "nic", "vnc"];
        let positions: Vec<usize> = fields
            .iter()
            .map(|f| text.find(&format!("\"{f}\"")).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{text}");
        assert!(text.contains("\n  \"alpha\": {\n    \"boot\""));
    }

    #[tokio::test]
    async fn load_accepts_uppercase_mac_from_older_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.json");
        std::fs::write(
            &path,
            r#"{"old": {"boot": "cn", "console": 3010, "disk": 10, "mac": "02:52:0A:00:00:0A",
                        "memory": 1024, "name": "old", "nic": "e1000", "vnc": 10}}"#,
        )
        .unwrap();

        let hv = MockHypervisor::new();
        let reg = Registry::load(
            &path,
            ResourceAllocator::new(3000, PREFIX),
            VmDefaults::default(),
            Arc::new(MockFactory::new(hv)),
        )
        .await;

        assert_eq!(reg.list().await, vec!["old".to_string()]);
        let created = reg.create("new", &VmConfigPatch::default()).await.unwrap();
        assert_eq!(created.config.vnc, 11);
        assert_eq!(created.config.mac.to_string(), "02:52:0a:00:00:0b");
    }

    #[tokio::test]
    async fn unwritable_snapshot_rolls_back_create() {
        let dir = tempfile::tempdir().unwrap();
        // The snapshot's parent is a regular file, so the write must fail.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();

        let hv = MockHypervisor::new();
        let reg = Registry::new(
            blocker.join("servers.json"),
            ResourceAllocator::new(3000, PREFIX),
            VmDefaults::default(),
            Arc::new(MockFactory::new(Arc::clone(&hv))),
        );

        let err = reg.create("web1", &VmConfigPatch::default()).await.unwrap_err();
        assert!(matches!(err, RegistryError::Persistence { .. }));
        assert!(reg.list().await.is_empty());
        assert!(hv.disks().is_empty());
        assert_eq!(hv.deletions(), 1);
    }
}
