//! Disk image management for QEMU-backed VMs.
//!
//! ## Layout
//!
//! Every VM owns one sparse raw image named after it:
//!
//! ```text
//! <disk_dir>/<name>.img      (size = config.disk GiB, sparse)
//! ```
//!
//! The file only consumes real blocks when the guest writes to them.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

const GIB: u64 = 1024 * 1024 * 1024;

/// Path of the disk image for VM `name` under `disk_dir`.
pub fn disk_image_path(disk_dir: &Path, name: &str) -> PathBuf {
    disk_dir.join(format!("{name}.img"))
}

/// Create a blank sparse raw disk image at `path` with size `size_gb` GiB.
///
/// Refuses to overwrite an existing file so a stale image from a VM that was
/// never cleaned up is not silently reused or truncated.
pub async fn create_disk_image(path: &Path, size_gb: u64) -> Result<()> {
    let Some(len) = size_gb.checked_mul(GIB) else {
        bail!("disk size {size_gb} GiB is too large");
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create disk directory {}", parent.display()))?;
    }

    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
        .with_context(|| format!("create disk image {}", path.display()))?;

    file.set_len(len)
        .await
        .with_context(|| format!("size disk image {} to {size_gb} GiB", path.display()))?;

    info!(path = %path.display(), size_gb, "disk image created");
    Ok(())
}

/// Remove the disk image at `path`. A missing file is not an error.
pub async fn remove_disk_image(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            info!(path = %path.display(), "disk image removed");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "disk image already absent");
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("remove disk image {}", path.display())),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_image_path_appends_img_suffix() {
        let path = disk_image_path(Path::new("/var/lib/carrier/disks"), "web1");
        assert_eq!(path, PathBuf::from("/var/lib/carrier/disks/web1.img"));
    }

    #[tokio::test]
    async fn create_makes_sparse_file_of_requested_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = disk_image_path(&dir.path().join("nested"), "web1");

        create_disk_image(&path, 2).await.unwrap();

        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.len(), 2 * GIB);
    }

    #[tokio::test]
    async fn create_refuses_to_clobber() {
        let dir = tempfile::tempdir().unwrap();
        let path = disk_image_path(dir.path(), "web1");
        std::fs::write(&path, b"precious").unwrap();

        assert!(create_disk_image(&path, 1).await.is_err());
        assert_eq!(std::fs::read(&path).unwrap(), b"precious");
    }

    #[tokio::test]
    async fn remove_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = disk_image_path(dir.path(), "gone");

        remove_disk_image(&path).await.unwrap();

        std::fs::write(&path, b"x").unwrap();
        remove_disk_image(&path).await.unwrap();
        assert!(!path.exists());
    }
}
