//! Error types for the activation subsystem.

use std::path::PathBuf;

/// Result type alias for activation operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur across the activation pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Security Validation Errors
    // =========================================================================
    /// Archive entry name is absolute.
    #[error("security: absolute path not allowed: {path}")]
    AbsolutePath { path: String },

    /// Archive entry name escapes the extraction root.
    #[error("security: path traversal detected: {path}")]
    PathTraversal { path: String },

    /// Symlink target resolves above the extraction root.
    #[error("security: symlink escapes extraction root: {link} -> {target}")]
    SymlinkEscape { link: String, target: String },

    /// A single entry exceeds the per-file ceiling.
    #[error("security: file size {size} exceeds max {limit}")]
    FileTooLarge { size: u64, limit: u64 },

    /// Cumulative extracted size exceeds the total ceiling.
    #[error("security: total extracted size {total} exceeds max {limit}")]
    TotalTooLarge { total: u64, limit: u64 },

    /// Decompression bomb detected.
    #[error("security: {reason}")]
    CompressionBomb { reason: String },

    // =========================================================================
    // Archive Errors
    // =========================================================================
    /// Archive is unreadable or contains a forbidden entry type.
    #[error("archive corrupt: {reason}")]
    ArchiveCorrupt { reason: String },

    // =========================================================================
    // Object Store Errors
    // =========================================================================
    /// Requested key does not exist in the object store.
    #[error("object not found: {key}")]
    ObjectMissing { key: String },

    /// Object-store transport failure (retryable).
    #[error("object store error: {reason}")]
    StoreIo { reason: String },

    // =========================================================================
    // Registry Errors
    // =========================================================================
    /// Registry query or statement failed.
    #[error("database error: {0}")]
    Database(String),

    /// An image with this key already exists.
    #[error("image already exists: {key}")]
    DuplicateKey { key: String },

    /// No image row matches the given id.
    #[error("image not found: id={id}")]
    NotFound { id: i64 },

    // =========================================================================
    // Thin-Device Manager Errors
    // =========================================================================
    /// Device management is not available on this platform.
    #[error("thin devices not supported on {os}")]
    PlatformUnsupported { os: &'static str },

    /// The configured thin pool does not exist.
    #[error("thin pool not found: {pool}")]
    PoolMissing { pool: String },

    /// The thin pool is out of data or metadata space.
    #[error("thin pool exhausted: {reason}")]
    PoolExhausted { reason: String },

    /// Insufficient privileges for a kernel operation.
    #[error("permission denied: {reason}")]
    PermissionDenied { reason: String },

    /// A device expected in the pool was not found.
    #[error("device missing: {device}")]
    DeviceMissing { device: String },

    /// Kernel tool failure not covered by a more specific kind.
    #[error("kernel operation '{op}' failed: {reason}")]
    Kernel { op: String, reason: String },

    // =========================================================================
    // Pipeline Errors
    // =========================================================================
    /// Copying the extracted tree onto the device failed.
    #[error("copy to device failed: {reason}")]
    CopyFailed { reason: String },

    /// Mounting the device failed.
    #[error("mount failed at {mount_point}: {reason}")]
    MountFailed { mount_point: PathBuf, reason: String },

    /// Unmounting the device failed.
    #[error("unmount failed at {mount_point}: {reason}")]
    UnmountFailed { mount_point: PathBuf, reason: String },

    /// Snapshot production failed on a platform where it is mandatory.
    #[error("snapshot required: {reason}")]
    SnapshotRequired { reason: String },

    /// A transition exhausted its retry budget.
    #[error("max retries ({limit}) exceeded")]
    MaxRetries { limit: u32 },

    // =========================================================================
    // Engine Errors
    // =========================================================================
    /// Run-record or response (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Engine bookkeeping failure (unknown run, unresumable record).
    #[error("engine error: {0}")]
    Engine(String),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid or unreadable configuration.
    #[error("config error: {0}")]
    Config(String),

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true when retrying cannot change the outcome.
    ///
    /// Permanent errors are wrapped in an engine abort by the pipeline;
    /// everything else goes back through the ordinary error channel so the
    /// engine retries. `PlatformUnsupported` is classified permanent but the
    /// pipeline special-cases it (skip at `create_device`, degrade at
    /// `complete`) before consulting this.
    pub fn is_permanent(&self) -> bool {
        match self {
            Error::AbsolutePath { .. }
            | Error::PathTraversal { .. }
            | Error::SymlinkEscape { .. }
            | Error::FileTooLarge { .. }
            | Error::TotalTooLarge { .. }
            | Error::CompressionBomb { .. }
            | Error::ArchiveCorrupt { .. }
            | Error::ObjectMissing { .. }
            | Error::Database(_)
            | Error::DuplicateKey { .. }
            | Error::NotFound { .. }
            | Error::PlatformUnsupported { .. }
            | Error::PoolMissing { .. }
            | Error::PoolExhausted { .. }
            | Error::PermissionDenied { .. }
            | Error::CopyFailed { .. }
            | Error::SnapshotRequired { .. }
            | Error::MaxRetries { .. }
            | Error::Serialization(_)
            | Error::Engine(_)
            | Error::Config(_) => true,

            Error::StoreIo { .. }
            | Error::DeviceMissing { .. }
            | Error::Kernel { .. }
            | Error::MountFailed { .. }
            | Error::UnmountFailed { .. }
            | Error::Io(_) => false,
        }
    }
}
