//! carrier: VM control plane server.
//!
//! Loads the registry snapshot, then serves the control API until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use carrier::api;
use carrier::config::{BackendKind, CarrierConfig};
use carrier::logging;
use carrier::paths::CarrierPaths;
use carrier::registry::Registry;
use carrier::vm::MachineFactory;
use carrier::vm::lifecycle::{QemuFactory, QemuSettings};
use carrier::vm::mock::{MockFactory, MockHypervisor};

/// VM control plane
#[derive(Parser, Debug)]
#[command(name = "carrier", version, about = "VM registry and console tunnel")]
struct Args {
    /// Config file (default: ~/.config/carrier/carrier.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides `bind` from the config file
    #[arg(short, long)]
    bind: Option<String>,

    /// Snapshot file, overrides `snapshot` from the config file
    #[arg(short, long)]
    snapshot: Option<PathBuf>,

    /// VM backend, overrides `backend.kind` from the config file
    #[arg(long, value_enum)]
    backend: Option<BackendKind>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let paths = CarrierPaths::resolve();
    let _log_guard = logging::init(&paths.logs);

    let config_path = args.config.unwrap_or_else(|| paths.config_file());
    let mut config = CarrierConfig::load(&config_path)?;
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(snapshot) = args.snapshot {
        config.snapshot = Some(snapshot);
    }
    if let Some(kind) = args.backend {
        config.backend.kind = kind;
    }

    paths.ensure().context("create data directories")?;

    let factory: Arc<dyn MachineFactory> = match config.backend.kind {
        BackendKind::Qemu => Arc::new(QemuFactory::new(QemuSettings {
            binary: config.backend.qemu_binary.clone(),
            disk_dir: config
                .backend
                .disk_dir
                .clone()
                .unwrap_or_else(|| paths.disks.clone()),
        })),
        BackendKind::Mock => Arc::new(MockFactory::new(MockHypervisor::new())),
    };

    let snapshot = config.snapshot.clone().unwrap_or_else(|| paths.snapshot());
    let registry = Arc::new(
        Registry::load(
            snapshot,
            config.allocator.build()?,
            config.defaults.clone(),
            factory,
        )
        .await,
    );

    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("bind {}", config.bind))?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %config.bind,
        backend = ?config.backend.kind,
        "carrier listening"
    );

    axum::serve(listener, api::router(registry))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve control API")?;

    info!("carrier stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
