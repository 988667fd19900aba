//! VM lifecycle management via QEMU child processes.
//!
//! ## Architecture
//!
//! ```text
//! QemuFactory::build(VmConfig)
//!     └─► QemuMachine { config, child: None }
//!             ├─► start()  →  tokio::process::Command  →  qemu-system-* child
//!             ├─► state()  →  RUNNING while the child is alive (try_wait)
//!             └─► stop()   →  kill + reap the child
//! ```
//!
//! The serial console is exposed by QEMU itself as a TCP server on
//! `127.0.0.1:<console>`; the console tunnel connects to it directly.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::error::{RegistryError, RegistryResult};
use crate::vm::filesystem::{create_disk_image, disk_image_path, remove_disk_image};
use crate::vm::{MachineFactory, VirtualMachine, VmConfig, VmConfigPatch, VmState};

/// Host-wide settings shared by every QEMU-backed VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QemuSettings {
    /// QEMU system emulator binary, looked up on `PATH` if not absolute.
    pub binary: PathBuf,

    /// Directory holding one `<name>.img` per VM.
    pub disk_dir: PathBuf,
}

/// Build the QEMU argument list for `config`, booting from `disk`.
pub fn qemu_args(config: &VmConfig, disk: &std::path::Path) -> Vec<String> {
    vec![
        "-name".to_string(),
        config.name.clone(),
        "-machine".to_string(),
        "accel=kvm:tcg".to_string(),
        "-m".to_string(),
        config.memory.to_string(),
        "-drive".to_string(),
        format!("file={},format=raw,if=virtio", disk.display()),
        "-boot".to_string(),
        format!("order={}", config.boot),
        "-netdev".to_string(),
        "user,id=net0".to_string(),
        "-device".to_string(),
        format!("{},netdev=net0,mac={}", config.nic, config.mac),
        "-vnc".to_string(),
        format!(":{}", config.vnc),
        "-serial".to_string(),
        format!("tcp:127.0.0.1:{},server,nowait", config.console),
        "-display".to_string(),
        "none".to_string(),
    ]
}

/// A VM whose hypervisor is a QEMU child of this process.
///
/// Dropping the handle kills the child; VMs do not outlive the control plane.
pub struct QemuMachine {
    name: String,
    config: RwLock<VmConfig>,
    settings: Arc<QemuSettings>,
    child: Mutex<Option<Child>>,
}

impl QemuMachine {
    pub fn new(config: VmConfig, settings: Arc<QemuSettings>) -> Self {
        Self {
            name: config.name.clone(),
            config: RwLock::new(config),
            settings,
            child: Mutex::new(None),
        }
    }

    fn disk_path(&self) -> PathBuf {
        disk_image_path(&self.settings.disk_dir, &self.name)
    }

    /// Reap the child if it has exited. Returns the observed state.
    fn poll_child(&self, slot: &mut Option<Child>) -> VmState {
        let Some(child) = slot.as_mut() else {
            return VmState::Stopped;
        };
        match child.try_wait() {
            Ok(None) => VmState::Running,
            Ok(Some(status)) => {
                info!(vm = %self.name, exit_status = ?status, "QEMU process exited");
                *slot = None;
                VmState::Stopped
            }
            Err(e) => {
                error!(vm = %self.name, error = %e, "try_wait error on QEMU process");
                VmState::Failed(e.to_string())
            }
        }
    }
}

#[async_trait]
impl VirtualMachine for QemuMachine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn state(&self) -> VmState {
        let mut slot = self.child.lock().await;
        self.poll_child(&mut slot)
    }

    async fn config(&self) -> VmConfig {
        self.config.read().await.clone()
    }

    async fn start(&self) -> RegistryResult<()> {
        let mut slot = self.child.lock().await;
        if self.poll_child(&mut slot).is_running() {
            info!(vm = %self.name, "start requested but VM already running");
            return Ok(());
        }

        let config = self.config.read().await.clone();
        let mut cmd = Command::new(&self.settings.binary);
        cmd.args(qemu_args(&config, &self.disk_path()));

        // Redirect child stdio so it does not pollute our terminal.
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::null());
        cmd.stderr(std::process::Stdio::null());
        cmd.kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| RegistryError::backend(&self.name, "start", e))?;

        info!(
            vm = %self.name,
            pid = ?child.id(),
            console = config.console,
            vnc = config.vnc,
            memory_mb = config.memory,
            "VM started"
        );
        *slot = Some(child);
        Ok(())
    }

    async fn stop(&self) -> RegistryResult<()> {
        let mut slot = self.child.lock().await;
        let Some(mut child) = slot.take() else {
            info!(vm = %self.name, "stop requested but VM not running");
            return Ok(());
        };

        if let Err(e) = child.kill().await {
            warn!(vm = %self.name, error = %e, "failed to kill QEMU process");
            *slot = Some(child);
            return Err(RegistryError::backend(&self.name, "stop", e));
        }
        info!(vm = %self.name, "VM stopped");
        Ok(())
    }

    async fn create_disk(&self) -> RegistryResult<()> {
        let size_gb = self.config.read().await.disk;
        create_disk_image(&self.disk_path(), size_gb)
            .await
            .map_err(|e| RegistryError::backend(&self.name, "create_disk", format!("{e:#}")))
    }

    async fn update(&self, patch: &VmConfigPatch) -> RegistryResult<()> {
        patch.apply(&mut *self.config.write().await);
        Ok(())
    }

    async fn delete(&self) -> RegistryResult<()> {
        remove_disk_image(&self.disk_path())
            .await
            .map_err(|e| RegistryError::backend(&self.name, "delete", format!("{e:#}")))
    }
}

/// Builds [`QemuMachine`]s sharing one set of [`QemuSettings`].
#[derive(Debug, Clone)]
pub struct QemuFactory {
    settings: Arc<QemuSettings>,
}

impl QemuFactory {
    pub fn new(settings: QemuSettings) -> Self {
        Self {
            settings: Arc::new(settings),
        }
    }
}

impl MachineFactory for QemuFactory {
    fn build(&self, config: VmConfig) -> Arc<dyn VirtualMachine> {
        Arc::new(QemuMachine::new(config, Arc::clone(&self.settings)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn config() -> VmConfig {
        VmConfig {
            name: "web1".into(),
            console: 3001,
            vnc: 1,
            mac: "02:52:0a:00:00:01".parse().unwrap(),
            nic: "virtio-net-pci".into(),
            memory: 2048,
            disk: 10,
            boot: "cn".into(),
        }
    }

    fn arg_after<'a>(args: &'a [String], flag: &str) -> Vec<&'a str> {
        args.windows(2)
            .filter(|w| w[0] == flag)
            .map(|w| w[1].as_str())
            .collect()
    }

    #[test]
    fn qemu_args_wire_console_vnc_and_nic() {
        let args = qemu_args(&config(), Path::new("/disks/web1.img"));

        assert_eq!(arg_after(&args, "-m"), vec!["2048"]);
        assert_eq!(arg_after(&args, "-vnc"), vec![":1"]);
        assert_eq!(
            arg_after(&args, "-serial"),
            vec!["tcp:127.0.0.1:3001,server,nowait"]
        );
        assert_eq!(
            arg_after(&args, "-device"),
            vec!["virtio-net-pci,netdev=net0,mac=02:52:0a:00:00:01"]
        );
        assert_eq!(
            arg_after(&args, "-drive"),
            vec!["file=/disks/web1.img,format=raw,if=virtio"]
        );
        assert_eq!(arg_after(&args, "-boot"), vec!["order=cn"]);
    }

    #[tokio::test]
    async fn fresh_machine_is_stopped_and_stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let factory = QemuFactory::new(QemuSettings {
            binary: PathBuf::from("qemu-system-x86_64"),
            disk_dir: dir.path().to_path_buf(),
        });
        let vm = factory.build(config());

        assert_eq!(vm.state().await, VmState::Stopped);
        vm.stop().await.unwrap();
        assert_eq!(vm.state().await, VmState::Stopped);
    }

    #[tokio::test]
    async fn start_with_missing_binary_is_a_backend_error() {
        let dir = tempfile::tempdir().unwrap();
        let factory = QemuFactory::new(QemuSettings {
            binary: dir.path().join("no-such-qemu"),
            disk_dir: dir.path().to_path_buf(),
        });
        let vm = factory.build(config());

        let err = vm.start().await.unwrap_err();
        assert!(matches!(err, RegistryError::Backend { operation: "start", .. }));
        assert_eq!(vm.state().await, VmState::Stopped);
    }

    #[tokio::test]
    async fn disk_follows_create_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let factory = QemuFactory::new(QemuSettings {
            binary: PathBuf::from("qemu-system-x86_64"),
            disk_dir: dir.path().to_path_buf(),
        });
        let mut cfg = config();
        cfg.disk = 1;
        let vm = factory.build(cfg);

        vm.create_disk().await.unwrap();
        assert!(dir.path().join("web1.img").exists());

        vm.delete().await.unwrap();
        assert!(!dir.path().join("web1.img").exists());
    }
}
