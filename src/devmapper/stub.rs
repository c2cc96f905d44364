//! Degraded thin-device manager for hosts without thin-pool support.

use super::{DeviceInfo, ThinManager};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::Path;

/// No-op manager. Every mutating operation fails with
/// [`Error::PlatformUnsupported`]; consumers degrade instead of failing.
pub struct StubThinManager;

impl StubThinManager {
    pub fn new() -> Self {
        StubThinManager
    }

    fn unsupported<T>() -> Result<T> {
        Err(Error::PlatformUnsupported {
            os: std::env::consts::OS,
        })
    }
}

impl Default for StubThinManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ThinManager for StubThinManager {
    async fn create_device(&self, _device_id: i64) -> Result<DeviceInfo> {
        Self::unsupported()
    }

    async fn create_snapshot(&self, _base_device_id: i64, _snapshot_id: i64) -> Result<DeviceInfo> {
        Self::unsupported()
    }

    async fn mount_device(&self, _device_path: &Path, _mount_point: &Path) -> Result<()> {
        Self::unsupported()
    }

    async fn unmount_device(&self, _mount_point: &Path) -> Result<()> {
        Self::unsupported()
    }

    async fn delete_device(&self, _device_id: i64) -> Result<()> {
        Self::unsupported()
    }

    async fn list_devices(&self) -> Vec<DeviceInfo> {
        Vec::new()
    }

    fn is_operational(&self) -> bool {
        false
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
