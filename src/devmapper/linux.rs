//! Full thin-device manager for Linux hosts.
//!
//! Drives the kernel through the `dmsetup`, `mkfs.ext4`, `mount` and
//! `umount` tools. Requires root and a pre-existing thin pool; both are
//! verified at construction.

use super::{device_name, device_path, snapshot_name, snapshot_path, DeviceInfo, ThinManager};
use crate::constants::{DEVICE_SECTORS, MAPPER_DIR, SECTOR_SIZE};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Thin-device manager backed by `dmsetup` against a named pool.
pub struct LinuxThinManager {
    pool_name: String,
    devices: Mutex<HashMap<i64, DeviceInfo>>,
}

impl LinuxThinManager {
    /// Verifies privileges and pool presence, then returns the manager.
    pub async fn new(pool_name: &str) -> Result<Self> {
        if !is_root().await {
            return Err(Error::PermissionDenied {
                reason: "thin-device management requires root".to_string(),
            });
        }

        let status = Command::new("dmsetup")
            .args(["info", pool_name])
            .output()
            .await
            .map_err(|e| Error::Kernel {
                op: "dmsetup info".to_string(),
                reason: e.to_string(),
            })?;
        if !status.status.success() {
            return Err(Error::PoolMissing {
                pool: pool_name.to_string(),
            });
        }

        info!(pool = pool_name, "thin-device manager ready");
        Ok(Self {
            pool_name: pool_name.to_string(),
            devices: Mutex::new(HashMap::new()),
        })
    }

    fn pool_path(&self) -> PathBuf {
        Path::new(MAPPER_DIR).join(&self.pool_name)
    }

    /// Sends a thin-pool management message, e.g. `create_thin 7`.
    async fn pool_message(&self, message: &str) -> Result<()> {
        let pool = self.pool_path();
        run_tool(
            "dmsetup message",
            Command::new("dmsetup").args([
                "message",
                pool.to_string_lossy().as_ref(),
                "0",
                message,
            ]),
        )
        .await
    }

    /// Activates pool id `id` as a named mapper node.
    async fn activate(&self, name: &str, id: i64) -> Result<()> {
        let table = format!(
            "0 {} thin {} {}",
            DEVICE_SECTORS,
            self.pool_path().display(),
            id
        );
        run_tool(
            "dmsetup create",
            Command::new("dmsetup").args(["create", name, "--table", &table]),
        )
        .await
    }
}

#[async_trait]
impl ThinManager for LinuxThinManager {
    async fn create_device(&self, device_id: i64) -> Result<DeviceInfo> {
        debug!(device_id, pool = %self.pool_name, "creating thin device");

        // The pool rejects create for an existing id but accepts delete of an
        // absent one, so delete first and ignore the outcome.
        let _ = self.pool_message(&format!("delete {}", device_id)).await;

        self.pool_message(&format!("create_thin {}", device_id))
            .await?;
        self.activate(&device_name(device_id), device_id).await?;

        let path = device_path(device_id);
        run_tool(
            "mkfs.ext4",
            Command::new("mkfs.ext4").args(["-F", path.to_string_lossy().as_ref()]),
        )
        .await?;

        let info = DeviceInfo {
            path: path.clone(),
            device_id,
            size: DEVICE_SECTORS * SECTOR_SIZE,
        };
        self.devices.lock().unwrap().insert(device_id, info.clone());

        info!(device_id, path = %path.display(), "thin device created");
        Ok(info)
    }

    async fn create_snapshot(&self, base_device_id: i64, snapshot_id: i64) -> Result<DeviceInfo> {
        if base_device_id == snapshot_id {
            return Err(Error::Engine(format!(
                "snapshot id {} equals base device id",
                snapshot_id
            )));
        }

        debug!(base_device_id, snapshot_id, "creating snapshot");

        let _ = self.pool_message(&format!("delete {}", snapshot_id)).await;

        self.pool_message(&format!("create_snap {} {}", snapshot_id, base_device_id))
            .await?;
        self.activate(&snapshot_name(snapshot_id), snapshot_id)
            .await?;

        let path = snapshot_path(snapshot_id);
        let info = DeviceInfo {
            path: path.clone(),
            device_id: snapshot_id,
            size: DEVICE_SECTORS * SECTOR_SIZE,
        };
        self.devices
            .lock()
            .unwrap()
            .insert(snapshot_id, info.clone());

        info!(snapshot_id, path = %path.display(), "snapshot created");
        Ok(info)
    }

    async fn mount_device(&self, device_path: &Path, mount_point: &Path) -> Result<()> {
        debug!(device = %device_path.display(), mount_point = %mount_point.display(), "mounting");
        let output = Command::new("mount")
            .arg(device_path)
            .arg(mount_point)
            .output()
            .await
            .map_err(|e| Error::MountFailed {
                mount_point: mount_point.to_path_buf(),
                reason: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(Error::MountFailed {
                mount_point: mount_point.to_path_buf(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    async fn unmount_device(&self, mount_point: &Path) -> Result<()> {
        debug!(mount_point = %mount_point.display(), "unmounting");
        let output = Command::new("umount")
            .arg(mount_point)
            .output()
            .await
            .map_err(|e| Error::UnmountFailed {
                mount_point: mount_point.to_path_buf(),
                reason: e.to_string(),
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("not mounted") || stderr.contains("no mount point") {
                return Ok(());
            }
            return Err(Error::UnmountFailed {
                mount_point: mount_point.to_path_buf(),
                reason: stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    async fn delete_device(&self, device_id: i64) -> Result<()> {
        debug!(device_id, "deleting thin device");

        // Deactivate whichever node name the id was activated under.
        for name in [device_name(device_id), snapshot_name(device_id)] {
            let result = run_tool(
                "dmsetup remove",
                Command::new("dmsetup").args(["remove", &name]),
            )
            .await;
            match result {
                Ok(()) | Err(Error::DeviceMissing { .. }) => {}
                Err(e) => warn!(device_id, name = %name, error = %e, "node deactivation failed"),
            }
        }

        // Dropping an absent id from the pool is accepted.
        let _ = self.pool_message(&format!("delete {}", device_id)).await;

        self.devices.lock().unwrap().remove(&device_id);
        Ok(())
    }

    async fn list_devices(&self) -> Vec<DeviceInfo> {
        self.devices.lock().unwrap().values().cloned().collect()
    }

    fn is_operational(&self) -> bool {
        true
    }

    async fn close(&self) -> Result<()> {
        self.devices.lock().unwrap().clear();
        Ok(())
    }
}

/// Runs a kernel tool to completion, classifying failures by stderr.
async fn run_tool(op: &str, command: &mut Command) -> Result<()> {
    let output = command.output().await.map_err(|e| Error::Kernel {
        op: op.to_string(),
        reason: e.to_string(),
    })?;
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let lowered = stderr.to_lowercase();

    if lowered.contains("permission denied") || lowered.contains("operation not permitted") {
        return Err(Error::PermissionDenied { reason: stderr });
    }
    if lowered.contains("out of data space")
        || lowered.contains("out of metadata space")
        || lowered.contains("no space left")
    {
        return Err(Error::PoolExhausted { reason: stderr });
    }
    if lowered.contains("no such device") || lowered.contains("device doesn't exist") {
        return Err(Error::DeviceMissing { device: stderr });
    }

    Err(Error::Kernel {
        op: op.to_string(),
        reason: stderr,
    })
}

async fn is_root() -> bool {
    match Command::new("id").arg("-u").output().await {
        Ok(output) => String::from_utf8_lossy(&output.stdout).trim() == "0",
        Err(_) => false,
    }
}
