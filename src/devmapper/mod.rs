//! Thin-device management over a pre-existing kernel thin pool.
//!
//! The [`ThinManager`] trait fronts the pool with a small capability surface:
//! create/format a thin device, produce a copy-on-write snapshot, mount,
//! unmount, delete. Two variants implement it: a full manager on Linux
//! systems with a configured pool, and a degraded stub everywhere else whose
//! mutating operations fail with `PlatformUnsupported`. Consumers treat that
//! error as "skip", not "fail".
//!
//! Idempotency discipline: the kernel rejects repeated `create` operations
//! for an id but silently accepts `delete` of an absent id, so both device
//! and snapshot creation delete the id first and ignore the outcome. This is
//! safe under the pipeline's single-run-per-key guarantee.

use crate::constants::{DEVICE_NAME_PREFIX, MAPPER_DIR, SNAPSHOT_NAME_PREFIX};
use crate::error::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[cfg(target_os = "linux")]
mod linux;
mod stub;

#[cfg(target_os = "linux")]
pub use linux::LinuxThinManager;
pub use stub::StubThinManager;

/// Metadata for an activated device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Mapper node path.
    pub path: PathBuf,
    /// Pool id the node is bound to.
    pub device_id: i64,
    /// Device size in bytes.
    pub size: u64,
}

/// Capability surface over the kernel thin pool.
#[async_trait]
pub trait ThinManager: Send + Sync {
    /// Idempotently ensures a thin device exists for `device_id`, activates
    /// it as a named mapper node and formats it with a filesystem.
    async fn create_device(&self, device_id: i64) -> Result<DeviceInfo>;

    /// Idempotently produces a copy-on-write snapshot of `base_device_id`
    /// under `snapshot_id` and activates it. The two ids must differ.
    async fn create_snapshot(&self, base_device_id: i64, snapshot_id: i64) -> Result<DeviceInfo>;

    /// Mounts `device_path` at `mount_point`.
    async fn mount_device(&self, device_path: &Path, mount_point: &Path) -> Result<()>;

    /// Unmounts `mount_point`. Idempotent against "not mounted".
    async fn unmount_device(&self, mount_point: &Path) -> Result<()>;

    /// Deactivates the named node and drops the id from the pool. Idempotent.
    async fn delete_device(&self, device_id: i64) -> Result<()>;

    /// Returns the in-process handles this manager created.
    async fn list_devices(&self) -> Vec<DeviceInfo>;

    /// True for the full variant, false for the degraded stub. The pipeline
    /// uses this to distinguish "skip activation" from "activation failed".
    fn is_operational(&self) -> bool;

    /// Releases in-process resources; kernel state is left alone.
    async fn close(&self) -> Result<()>;
}

/// Mapper node name for a base device id.
pub fn device_name(device_id: i64) -> String {
    format!("{}{}", DEVICE_NAME_PREFIX, device_id)
}

/// Mapper node name for a snapshot id.
pub fn snapshot_name(snapshot_id: i64) -> String {
    format!("{}{}", SNAPSHOT_NAME_PREFIX, snapshot_id)
}

/// Mapper node path for a base device id.
pub fn device_path(device_id: i64) -> PathBuf {
    Path::new(MAPPER_DIR).join(device_name(device_id))
}

/// Mapper node path for a snapshot id.
pub fn snapshot_path(snapshot_id: i64) -> PathBuf {
    Path::new(MAPPER_DIR).join(snapshot_name(snapshot_id))
}

/// Builds the thin manager for this host: the full variant on Linux when
/// `dm_enabled` is set, the degraded stub otherwise.
pub async fn new_manager(pool_name: &str, dm_enabled: bool) -> Result<Arc<dyn ThinManager>> {
    #[cfg(target_os = "linux")]
    {
        if dm_enabled {
            let manager = LinuxThinManager::new(pool_name).await?;
            return Ok(Arc::new(manager));
        }
    }

    let _ = (pool_name, dm_enabled);
    Ok(Arc::new(StubThinManager::new()))
}
