//! The activation pipeline.
//!
//! Composes the registry, object store, validator and thin-device manager
//! into the five durable transitions that take an image from an opaque
//! object key to a mountable copy-on-write snapshot:
//!
//! ```text
//! check_db → download → validate → create_device → complete
//!                                                      │
//!                                  (abort at any step) ▼
//!                                                   failed
//! ```
//!
//! ## Cross-cutting rules
//!
//! - Every handler consults the attempt counter first and aborts once the
//!   configured retry budget is exceeded.
//! - Every handler updates the registry before returning. The in-memory
//!   response is a cache for same-run continuity only; anything a later
//!   transition needs after a crash must be read back from the registry.
//! - Permanent errors set `status = failed` plus `error_message` on the
//!   image row, then abort so the failure is visible to operators. Transient
//!   errors go back through the ordinary channel and the engine retries.
//! - Handlers short-circuit when the image row is already `ready`, so a
//!   replayed activation walks the chain as no-ops without fetching or
//!   mutating anything.

use crate::constants::{DOWNLOADS_DIR, EXTRACTED_DIR, MOUNTS_DIR};
use crate::devmapper::ThinManager;
use crate::engine::{handler, Chain, Handler, TransitionCtx, TransitionError, TransitionResult};
use crate::error::Error;
use crate::extract::extract_archive;
use crate::registry::{ImageRecord, ImageRegistry, ImageStatus};
use crate::security::Validator;
use crate::store::ObjectStore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

/// State names, in chain order.
pub const STATE_CHECK_DB: &str = "check_db";
pub const STATE_DOWNLOAD: &str = "download";
pub const STATE_VALIDATE: &str = "validate";
pub const STATE_CREATE_DEVICE: &str = "create_device";
pub const STATE_COMPLETE: &str = "complete";
pub const STATE_FAILED: &str = "failed";

/// Input of one activation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationRequest {
    /// Opaque object-store key; doubles as the run's resource identifier.
    pub key: String,
    /// Bucket the key lives in (informational; the store is pre-bound).
    pub bucket: String,
}

/// Response accumulated across transitions.
///
/// Same-run cache only. The registry remains the authority for every field
/// that must survive an engine restart.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActivationResponse {
    pub image_id: i64,
    pub content_digest: String,
    pub download_path: Option<PathBuf>,
    pub download_size: u64,
    pub extracted_path: Option<PathBuf>,
    pub device_path: Option<String>,
    pub snapshot_id: Option<i64>,
    pub status: String,
    pub error_message: Option<String>,
}

impl ActivationResponse {
    fn is_ready(&self) -> bool {
        self.status == ImageStatus::Ready.as_str()
    }

    fn mark_ready(&mut self) {
        self.status = ImageStatus::Ready.as_str().to_string();
    }
}

/// Holds the pipeline's collaborators and implements the five transitions.
pub struct ActivationMachine {
    registry: Arc<ImageRegistry>,
    store: Arc<dyn ObjectStore>,
    validator: Arc<Validator>,
    manager: Arc<dyn ThinManager>,
    work_dir: PathBuf,
    max_retries: u32,
}

impl ActivationMachine {
    pub fn new(
        registry: Arc<ImageRegistry>,
        store: Arc<dyn ObjectStore>,
        validator: Arc<Validator>,
        manager: Arc<dyn ThinManager>,
        work_dir: PathBuf,
        max_retries: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            store,
            validator,
            manager,
            work_dir,
            max_retries,
        })
    }

    /// Builds the activation chain for registration with the engine.
    pub fn chain(self: &Arc<Self>) -> Chain<ActivationRequest, ActivationResponse> {
        Chain::named("image-activate")
            .start(STATE_CHECK_DB, step(self, ActivationMachine::check_db))
            .to(STATE_DOWNLOAD, step(self, ActivationMachine::download))
            .to(STATE_VALIDATE, step(self, ActivationMachine::validate))
            .to(
                STATE_CREATE_DEVICE,
                step(self, ActivationMachine::create_device),
            )
            .to(STATE_COMPLETE, step(self, ActivationMachine::complete))
            .end(STATE_FAILED)
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// `check_db`: idempotency gate. Looks the key up, inserts a pending row
    /// when absent, short-circuits the rest of the chain when already ready.
    async fn check_db(
        self: Arc<Self>,
        ctx: TransitionCtx,
        req: ActivationRequest,
        mut resp: ActivationResponse,
    ) -> TransitionResult<ActivationResponse> {
        info!(key = %req.key, state = STATE_CHECK_DB, "transition");
        self.budget(&ctx, &req.key)?;

        let existing = self
            .registry
            .get_by_key(&req.key)
            .map_err(TransitionError::Abort)?;

        match existing {
            Some(image) => {
                resp.image_id = image.id;
                resp.content_digest = image.content_digest.clone();
                resp.status = image.status.as_str().to_string();
                if image.status == ImageStatus::Ready {
                    info!(key = %req.key, image_id = image.id, "image already ready");
                    resp.device_path = image.device_path;
                    resp.snapshot_id = image.snapshot_id;
                } else {
                    info!(
                        key = %req.key,
                        image_id = image.id,
                        status = %image.status,
                        "image found, resuming"
                    );
                }
            }
            None => {
                let mut record = ImageRecord::pending(&req.key);
                match self.registry.create(&mut record) {
                    Ok(()) => {
                        resp.image_id = record.id;
                        info!(key = %req.key, image_id = record.id, "image record created");
                    }
                    // Raced with a concurrent activation between get and
                    // create; the row is there now, adopt it.
                    Err(Error::DuplicateKey { .. }) => {
                        let image = self
                            .registry
                            .get_by_key(&req.key)
                            .map_err(TransitionError::Abort)?
                            .ok_or_else(|| {
                                TransitionError::Abort(Error::Database(
                                    "row vanished after duplicate key".to_string(),
                                ))
                            })?;
                        resp.image_id = image.id;
                        resp.status = image.status.as_str().to_string();
                    }
                    Err(e) => return Err(TransitionError::Abort(e)),
                }
            }
        }

        Ok(resp)
    }

    /// `download`: acquires the archive bytes and commits their digest.
    async fn download(
        self: Arc<Self>,
        ctx: TransitionCtx,
        req: ActivationRequest,
        mut resp: ActivationResponse,
    ) -> TransitionResult<ActivationResponse> {
        info!(key = %req.key, state = STATE_DOWNLOAD, "transition");
        self.budget(&ctx, &req.key)?;
        if resp.is_ready() {
            return Ok(resp);
        }

        self.registry
            .update_status(resp.image_id, ImageStatus::Downloading, None)
            .map_err(|e| self.dispose(resp.image_id, e))?;

        let download_dir = self.work_dir.join(DOWNLOADS_DIR);
        fs::create_dir_all(&download_dir).map_err(|e| TransitionError::Retry(e.into()))?;

        let dest = download_dir.join(key_basename(&req.key));
        let result = self
            .store
            .download(&req.key, &dest)
            .await
            .map_err(|e| self.dispose(resp.image_id, e))?;

        let mut image = self
            .registry
            .get_by_key(&req.key)
            .map_err(|e| self.dispose(resp.image_id, e))?
            .ok_or_else(|| {
                TransitionError::Abort(Error::NotFound { id: resp.image_id })
            })?;
        image.content_digest = result.digest.clone();
        self.registry
            .update(&image)
            .map_err(|e| self.dispose(resp.image_id, e))?;

        info!(
            key = %req.key,
            size = result.size,
            digest = %&result.digest[..16.min(result.digest.len())],
            "download complete"
        );

        resp.content_digest = result.digest;
        resp.download_path = Some(result.local_path);
        resp.download_size = result.size;
        Ok(resp)
    }

    /// `validate`: security-gated extraction into a clean scratch directory.
    async fn validate(
        self: Arc<Self>,
        ctx: TransitionCtx,
        req: ActivationRequest,
        mut resp: ActivationResponse,
    ) -> TransitionResult<ActivationResponse> {
        info!(key = %req.key, state = STATE_VALIDATE, "transition");
        self.budget(&ctx, &req.key)?;
        if resp.is_ready() {
            return Ok(resp);
        }

        // Cheap upper bound before any extraction work.
        self.validator
            .validate_file_size(resp.download_size)
            .map_err(|e| self.dispose(resp.image_id, e))?;

        let download_path = resp.download_path.clone().ok_or_else(|| {
            TransitionError::Abort(Error::Engine(
                "download path missing from response".to_string(),
            ))
        })?;

        let extract_dir = self
            .work_dir
            .join(EXTRACTED_DIR)
            .join(key_basename(&req.key));
        if extract_dir.exists() {
            fs::remove_dir_all(&extract_dir).map_err(|e| TransitionError::Retry(e.into()))?;
        }
        fs::create_dir_all(&extract_dir).map_err(|e| TransitionError::Retry(e.into()))?;

        extract_archive(&download_path, &extract_dir, &self.validator)
            .map_err(|e| self.dispose(resp.image_id, e))?;

        info!(key = %req.key, extract_dir = %extract_dir.display(), "extraction complete");
        resp.extracted_path = Some(extract_dir);
        Ok(resp)
    }

    /// `create_device`: materializes the extracted tree onto a formatted
    /// thin device. Skipped without failing on degraded platforms.
    async fn create_device(
        self: Arc<Self>,
        ctx: TransitionCtx,
        req: ActivationRequest,
        mut resp: ActivationResponse,
    ) -> TransitionResult<ActivationResponse> {
        info!(key = %req.key, state = STATE_CREATE_DEVICE, "transition");
        self.budget(&ctx, &req.key)?;
        if resp.is_ready() {
            return Ok(resp);
        }

        if !self.manager.is_operational() {
            warn!(key = %req.key, "thin devices unavailable, skipping materialization");
            return Ok(resp);
        }

        let base_id = self
            .registry
            .allocate_next_device_id()
            .map_err(|e| self.dispose(resp.image_id, e))?;

        let device = match self.manager.create_device(base_id).await {
            Ok(device) => device,
            Err(Error::PlatformUnsupported { os }) => {
                warn!(key = %req.key, os, "device creation unsupported, skipping");
                return Ok(resp);
            }
            Err(e) => {
                self.release_device(base_id, None).await;
                return Err(self.dispose(resp.image_id, e));
            }
        };

        let mount_point = self.work_dir.join(MOUNTS_DIR).join(base_id.to_string());
        if let Err(e) = fs::create_dir_all(&mount_point) {
            self.release_device(base_id, None).await;
            return Err(TransitionError::Retry(e.into()));
        }

        if let Err(e) = self.manager.mount_device(&device.path, &mount_point).await {
            self.release_device(base_id, None).await;
            return Err(self.dispose(resp.image_id, e));
        }

        let extracted = match resp.extracted_path.clone() {
            Some(extracted) => extracted,
            None => {
                self.release_device(base_id, Some(&mount_point)).await;
                return Err(TransitionError::Abort(Error::Engine(
                    "extracted path missing from response".to_string(),
                )));
            }
        };

        info!(
            key = %req.key,
            source = %extracted.display(),
            dest = %mount_point.display(),
            "copying tree to device"
        );
        if let Err(e) = copy_tree(&extracted, &mount_point) {
            let copy_err = Error::CopyFailed {
                reason: e.to_string(),
            };
            self.fail_image(resp.image_id, &copy_err);
            self.release_device(base_id, Some(&mount_point)).await;
            return Err(TransitionError::Abort(copy_err));
        }

        if let Err(e) = self.manager.unmount_device(&mount_point).await {
            self.release_device(base_id, None).await;
            return Err(self.dispose(resp.image_id, e));
        }

        let device_path = device.path.to_string_lossy().into_owned();
        let mut image = self
            .registry
            .get_by_key(&req.key)
            .map_err(|e| self.dispose(resp.image_id, e))?
            .ok_or_else(|| {
                TransitionError::Abort(Error::NotFound { id: resp.image_id })
            })?;
        image.base_device_id = Some(base_id);
        image.device_path = Some(device_path.clone());
        self.registry
            .update(&image)
            .map_err(|e| self.dispose(resp.image_id, e))?;

        info!(key = %req.key, base_id, device_path = %device_path, "device materialized");

        resp.device_path = Some(device_path);
        // Downstream observability and cleanup read the contents here now.
        resp.extracted_path = Some(mount_point);
        Ok(resp)
    }

    /// `complete`: mandatory snapshot activation (degrades on the stub).
    async fn complete(
        self: Arc<Self>,
        ctx: TransitionCtx,
        req: ActivationRequest,
        mut resp: ActivationResponse,
    ) -> TransitionResult<ActivationResponse> {
        info!(key = %req.key, state = STATE_COMPLETE, "transition");
        self.budget(&ctx, &req.key)?;

        // The registry is the authoritative source for device identifiers.
        let image = self
            .registry
            .get_by_key(&req.key)
            .map_err(|e| self.dispose(resp.image_id, e))?
            .ok_or_else(|| {
                TransitionError::Abort(Error::NotFound { id: resp.image_id })
            })?;

        if image.status == ImageStatus::Ready {
            resp.image_id = image.id;
            resp.content_digest = image.content_digest;
            resp.device_path = image.device_path;
            resp.snapshot_id = image.snapshot_id;
            resp.mark_ready();
            return Ok(resp);
        }

        let device_path = image.device_path.clone().filter(|p| !p.is_empty());
        let device_path = match device_path {
            Some(device_path) => device_path,
            None => {
                if self.manager.is_operational() {
                    // Full platform with no base device recorded: marking
                    // this ready would break the readiness invariant.
                    let e = Error::SnapshotRequired {
                        reason: "no base device recorded".to_string(),
                    };
                    self.fail_image(image.id, &e);
                    return Err(TransitionError::Abort(e));
                }
                info!(key = %req.key, "degraded platform, completing without snapshot");
                self.registry
                    .update_status(image.id, ImageStatus::Ready, None)
                    .map_err(|e| self.dispose(image.id, e))?;
                resp.mark_ready();
                return Ok(resp);
            }
        };

        let base_id = match image.base_device_id.filter(|id| *id != 0) {
            Some(base_id) => base_id,
            None => {
                let e = Error::SnapshotRequired {
                    reason: "no base device id recorded".to_string(),
                };
                self.fail_image(image.id, &e);
                return Err(TransitionError::Abort(e));
            }
        };

        // Reuse a previously allocated snapshot id so a retried completion
        // converges on the same identifiers.
        let snapshot_id = match image.snapshot_id.filter(|id| *id != 0) {
            Some(snapshot_id) => {
                info!(key = %req.key, snapshot_id, "reusing existing snapshot id");
                snapshot_id
            }
            None => {
                let snapshot_id = self.registry.allocate_next_device_id().map_err(|e| {
                    self.fail_image(image.id, &e);
                    TransitionError::Abort(e)
                })?;
                info!(key = %req.key, snapshot_id, "allocated snapshot id");
                snapshot_id
            }
        };

        match self.manager.create_snapshot(base_id, snapshot_id).await {
            Ok(snapshot) => {
                let mut updated = image;
                updated.snapshot_id = Some(snapshot_id);
                updated.status = ImageStatus::Ready;
                updated.error_message = None;
                self.registry
                    .update(&updated)
                    .map_err(|e| self.dispose(updated.id, e))?;

                info!(
                    key = %req.key,
                    snapshot_id,
                    snapshot_path = %snapshot.path.display(),
                    "snapshot activated"
                );
                resp.snapshot_id = Some(snapshot_id);
                resp.device_path = Some(device_path);
                resp.mark_ready();
                Ok(resp)
            }
            Err(Error::PlatformUnsupported { os }) => {
                // The create_device gate should have caught this; degrade.
                warn!(key = %req.key, os, "snapshot unsupported, degrading");
                self.registry
                    .update_status(image.id, ImageStatus::Ready, None)
                    .map_err(|e| self.dispose(image.id, e))?;
                resp.device_path = Some(device_path);
                resp.mark_ready();
                Ok(resp)
            }
            Err(e) => {
                let e = Error::SnapshotRequired {
                    reason: e.to_string(),
                };
                self.fail_image(image.id, &e);
                Err(TransitionError::Abort(e))
            }
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Aborts once the per-transition retry budget is exceeded.
    fn budget(&self, ctx: &TransitionCtx, key: &str) -> Result<(), TransitionError> {
        if ctx.attempt() >= u64::from(self.max_retries) {
            error!(key, max_retries = self.max_retries, "retry budget exhausted");
            return Err(TransitionError::Abort(Error::MaxRetries {
                limit: self.max_retries,
            }));
        }
        Ok(())
    }

    /// Records the failure on the image row so operators can see it.
    fn fail_image(&self, image_id: i64, e: &Error) {
        if image_id == 0 {
            return;
        }
        if let Err(db) =
            self.registry
                .update_status(image_id, ImageStatus::Failed, Some(&e.to_string()))
        {
            error!(image_id, error = %db, "cannot record failure on image row");
        }
    }

    /// Routes an error: permanent failures mark the row failed and abort,
    /// transient ones go back to the engine for retry.
    fn dispose(&self, image_id: i64, e: Error) -> TransitionError {
        if e.is_permanent() {
            self.fail_image(image_id, &e);
            TransitionError::Abort(e)
        } else {
            TransitionError::Retry(e)
        }
    }

    /// Best-effort teardown after a failed materialization: unmount (when a
    /// mount point is known), then drop the device id. Failures here are
    /// logged, never allowed to mask the original error.
    async fn release_device(&self, device_id: i64, mount_point: Option<&Path>) {
        if let Some(mount_point) = mount_point {
            if let Err(e) = self.manager.unmount_device(mount_point).await {
                warn!(device_id, error = %e, "teardown unmount failed");
            }
        }
        if let Err(e) = self.manager.delete_device(device_id).await {
            warn!(device_id, error = %e, "teardown device deletion failed");
        }
    }
}

/// Boxes an `ActivationMachine` method into an engine handler.
fn step<F, Fut>(
    machine: &Arc<ActivationMachine>,
    f: F,
) -> Handler<ActivationRequest, ActivationResponse>
where
    F: Fn(Arc<ActivationMachine>, TransitionCtx, ActivationRequest, ActivationResponse) -> Fut
        + Send
        + Sync
        + 'static,
    Fut: Future<Output = TransitionResult<ActivationResponse>> + Send + 'static,
{
    let machine = machine.clone();
    handler(move |ctx, req, resp| f(machine.clone(), ctx, req, resp))
}

/// Final path component of an object key.
pub(crate) fn key_basename(key: &str) -> String {
    key.rsplit('/')
        .find(|part| !part.is_empty())
        .unwrap_or(key)
        .to_string()
}

/// Copies a tree preserving directories, regular files (with mode bits) and
/// symlinks (recreated textually, never followed).
pub(crate) fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let from = entry.path();
        let to = dst.join(entry.file_name());

        if file_type.is_dir() {
            fs::create_dir_all(&to)?;
            #[cfg(unix)]
            {
                let mode = fs::metadata(&from)?.permissions();
                fs::set_permissions(&to, mode)?;
            }
            copy_tree(&from, &to)?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(&from)?;
            #[cfg(unix)]
            match std::os::unix::fs::symlink(&target, &to) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e),
            }
            #[cfg(not(unix))]
            let _ = target;
        } else {
            fs::copy(&from, &to)?;
        }
    }
    Ok(())
}
