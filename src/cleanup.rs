//! Resource reclamation.
//!
//! Releases everything an activation left behind: the snapshot and base
//! device in the pool, the transient mount point, the scratch extraction
//! tree and the downloaded archive. The image row itself transitions to the
//! terminal `cleaned` status with its device fields cleared, so no row with
//! `status = ready` survives a cleanup.
//!
//! Kernel teardown failures are logged and skipped rather than propagated;
//! a dead device in the pool should not wedge the rest of the cleanup.

use crate::constants::{DOWNLOADS_DIR, EXTRACTED_DIR, MOUNTS_DIR};
use crate::devmapper::ThinManager;
use crate::error::Result;
use crate::pipeline::key_basename;
use crate::registry::{ImageRecord, ImageRegistry, ImageStatus};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Releases all resources for one image and marks its row `cleaned`.
pub async fn cleanup_image(
    registry: &ImageRegistry,
    manager: &Arc<dyn ThinManager>,
    work_dir: &Path,
    image: &ImageRecord,
) -> Result<()> {
    info!(key = %image.key, image_id = image.id, "cleaning up image");

    if manager.is_operational() {
        if let Some(snapshot_id) = image.snapshot_id.filter(|id| *id != 0) {
            if let Err(e) = manager.delete_device(snapshot_id).await {
                warn!(snapshot_id, error = %e, "snapshot removal failed");
            }
        }
        if let Some(base_id) = image.base_device_id.filter(|id| *id != 0) {
            if let Err(e) = manager.delete_device(base_id).await {
                warn!(base_id, error = %e, "base device removal failed");
            }
        }
    }

    if let Some(base_id) = image.base_device_id.filter(|id| *id != 0) {
        let mount_point = work_dir.join(MOUNTS_DIR).join(base_id.to_string());
        if mount_point.exists() {
            if let Err(e) = manager.unmount_device(&mount_point).await {
                warn!(mount_point = %mount_point.display(), error = %e, "unmount failed");
            }
            if let Err(e) = std::fs::remove_dir_all(&mount_point) {
                warn!(mount_point = %mount_point.display(), error = %e, "mount dir removal failed");
            }
        }
    }

    let basename = key_basename(&image.key);
    let extracted = work_dir.join(EXTRACTED_DIR).join(&basename);
    if extracted.exists() {
        std::fs::remove_dir_all(&extracted)?;
    }
    let download = work_dir.join(DOWNLOADS_DIR).join(&basename);
    if download.exists() {
        std::fs::remove_file(&download)?;
    }

    let mut updated = image.clone();
    updated.status = ImageStatus::Cleaned;
    updated.device_path = None;
    updated.base_device_id = None;
    updated.snapshot_id = None;
    updated.error_message = None;
    registry.update(&updated)?;

    info!(key = %image.key, "cleanup complete");
    Ok(())
}

/// Cleans every image in the registry. Per-image failures are logged and do
/// not stop the sweep; the number of successfully cleaned images is returned.
pub async fn cleanup_all(
    registry: &ImageRegistry,
    manager: &Arc<dyn ThinManager>,
    work_dir: &Path,
) -> Result<usize> {
    let images = registry.list()?;
    info!(count = images.len(), "cleaning up all images");

    let mut cleaned = 0;
    for image in &images {
        match cleanup_image(registry, manager, work_dir, image).await {
            Ok(()) => cleaned += 1,
            Err(e) => warn!(key = %image.key, error = %e, "cleanup failed"),
        }
    }
    Ok(cleaned)
}

/// Removes work-directory entries that no registry row accounts for.
/// Returns the number of orphans removed.
pub async fn cleanup_orphaned(
    registry: &ImageRegistry,
    work_dir: &Path,
) -> Result<usize> {
    let known: HashSet<String> = registry
        .list()?
        .iter()
        .map(|image| key_basename(&image.key))
        .collect();

    let mut removed = 0;

    let extracted_dir = work_dir.join(EXTRACTED_DIR);
    if let Ok(entries) = std::fs::read_dir(&extracted_dir) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if known.contains(&name) {
                continue;
            }
            match std::fs::remove_dir_all(entry.path()) {
                Ok(()) => {
                    info!(name = %name, "removed orphaned extraction tree");
                    removed += 1;
                }
                Err(e) => warn!(name = %name, error = %e, "orphan removal failed"),
            }
        }
    }

    let downloads_dir = work_dir.join(DOWNLOADS_DIR);
    if let Ok(entries) = std::fs::read_dir(&downloads_dir) {
        for entry in entries.flatten() {
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if known.contains(&name) {
                continue;
            }
            match std::fs::remove_file(entry.path()) {
                Ok(()) => {
                    info!(name = %name, "removed orphaned download");
                    removed += 1;
                }
                Err(e) => warn!(name = %name, error = %e, "orphan removal failed"),
            }
        }
    }

    info!(removed, "orphan sweep complete");
    Ok(removed)
}
