//! # snapforge
//!
//! **Container-Image Activation Subsystem**
//!
//! Given an opaque tarball key in an object store, this crate materializes
//! the archive into a thin-provisioned block device and produces a writable
//! copy-on-write snapshot that a downstream runtime can mount to boot a
//! container. The pipeline is idempotent across restarts and crashes, and
//! treats every archive as potentially malicious.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     Activation Pipeline                          │
//! │   check_db → download → validate → create_device → complete      │
//! │       │          │          │            │             │         │
//! ├───────┼──────────┼──────────┼────────────┼─────────────┼─────────┤
//! │       ▼          ▼          ▼            ▼             ▼         │
//! │  ┌─────────┐ ┌────────┐ ┌──────────┐ ┌──────────┐ ┌──────────┐  │
//! │  │ Image   │ │ Object │ │Validator │ │   Thin   │ │   Thin   │  │
//! │  │Registry │ │ Store  │ │Extractor │ │  Device  │ │ Snapshot │  │
//! │  │(SQLite) │ │  (S3)  │ │  (tar)   │ │ Manager  │ │ Manager  │  │
//! │  └─────────┘ └────────┘ └──────────┘ └──────────┘ └──────────┘  │
//! ├──────────────────────────────────────────────────────────────────┤
//! │        Durable State-Machine Engine (per-key serialized,         │
//! │          crash-resumable, bounded retry with backoff)            │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Security Properties
//!
//! - **Path traversal protection**: every archive entry name is validated
//!   textually before any filesystem path is formed; absolute names and
//!   names that climb above the extraction root abort the extraction.
//! - **Symlink escape detection**: relative symlink targets are resolved
//!   against the link's directory with a depth counter, so legitimate
//!   cross-directory links survive while true escapes are rejected.
//! - **Size limits**: a per-entry ceiling and a cumulative ceiling bound
//!   disk use; both abort extraction the moment they are crossed.
//! - **Compression-bomb detection**: the extracted/compressed ratio is
//!   checked against a configurable maximum.
//!
//! # Recovery Model
//!
//! The engine persists state and the accumulated response between
//! transitions, but the registry is the single source of truth for anything
//! a later transition needs: device path, base device id, snapshot id. A
//! crash at any point resumes from the persisted state and re-reads the
//! registry, so a half-finished activation converges on the same final row.
//!
//! # Platform Degradation
//!
//! Thin-device support needs a Linux host with a configured thin pool. On
//! every other host (or with `dm_enabled = false`) the device manager is a
//! stub whose operations report `PlatformUnsupported`; the pipeline then
//! completes activation without a device, leaving the device fields empty.
//! On an operational host the snapshot step is mandatory: failure to
//! produce one fails the activation.
//!
//! # Example
//!
//! ```rust,ignore
//! use snapforge::{
//!     ActivationMachine, ActivationRequest, ActivationResponse, Config,
//!     Engine, EngineOptions, ImageRegistry, S3Store, Validator,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> snapforge::Result<()> {
//!     let cfg = Config::load()?;
//!     cfg.validate()?;
//!
//!     let registry = Arc::new(ImageRegistry::open(&cfg.registry_path)?);
//!     let store = Arc::new(
//!         S3Store::new(None, &cfg.object_store.bucket, &cfg.object_store.region).await,
//!     );
//!     let validator = Arc::new(Validator::new(
//!         cfg.max_file_size,
//!         cfg.max_total_size,
//!         cfg.max_compression_ratio,
//!     ));
//!     let manager = snapforge::new_manager(&cfg.pool_name, cfg.dm_enabled).await?;
//!
//!     let machine = ActivationMachine::new(
//!         registry, store, validator, manager, cfg.work_dir.clone(), cfg.max_retries,
//!     );
//!     let engine = Engine::new(&cfg.engine_db_path, machine.chain(), EngineOptions::default())?;
//!
//!     let key = "images/golang/2.tar";
//!     let request = ActivationRequest {
//!         key: key.to_string(),
//!         bucket: cfg.object_store.bucket.clone(),
//!     };
//!     let version = engine.start(key, request, ActivationResponse::default())?;
//!     let outcome = engine.wait(&version).await?;
//!     println!("activation finished: {:?}", outcome.status);
//!     Ok(())
//! }
//! ```

// =============================================================================
// Modules
// =============================================================================

mod cleanup;
mod config;
mod constants;
mod devmapper;
mod engine;
mod error;
mod extract;
mod pipeline;
mod registry;
mod security;
mod store;

// =============================================================================
// Public API
// =============================================================================

pub use cleanup::{cleanup_all, cleanup_image, cleanup_orphaned};
pub use config::{Config, ObjectStoreConfig};
pub use constants::{
    DEFAULT_MAX_COMPRESSION_RATIO, DEFAULT_MAX_FILE_SIZE, DEFAULT_MAX_RETRIES,
    DEFAULT_MAX_TOTAL_SIZE, DEVICE_NAME_PREFIX, DEVICE_SECTORS, MAPPER_DIR, SECTOR_SIZE,
    SNAPSHOT_NAME_PREFIX,
};
pub use devmapper::{
    device_name, device_path, new_manager, snapshot_name, snapshot_path, DeviceInfo,
    StubThinManager, ThinManager,
};
#[cfg(target_os = "linux")]
pub use devmapper::LinuxThinManager;
pub use engine::{
    handler, Chain, ChainBuilder, Engine, EngineOptions, Handler, RunOutcome, RunRecord,
    RunStatus, TransitionCtx, TransitionError, TransitionResult,
};
pub use error::{Error, Result};
pub use extract::extract_archive;
pub use pipeline::{
    ActivationMachine, ActivationRequest, ActivationResponse, STATE_CHECK_DB, STATE_COMPLETE,
    STATE_CREATE_DEVICE, STATE_DOWNLOAD, STATE_FAILED, STATE_VALIDATE,
};
pub use registry::{ImageRecord, ImageRegistry, ImageStatus};
pub use security::Validator;
pub use store::{DownloadResult, ObjectStore, S3Store};
