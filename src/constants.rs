//! Constants for the activation subsystem.
//!
//! All limits, device geometry, and naming conventions are defined here to
//! ensure consistency and prevent magic numbers throughout the codebase.

use std::time::Duration;

// =============================================================================
// Security Limits (defaults, overridable via config)
// =============================================================================

/// Default maximum size of a single archive entry (2 GiB).
/// Prevents disk exhaustion from a single oversized file.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// Default maximum cumulative extracted size (20 GiB).
pub const DEFAULT_MAX_TOTAL_SIZE: u64 = 20 * 1024 * 1024 * 1024;

/// Default maximum ratio of extracted bytes to archive bytes.
/// Archives above this ratio are treated as decompression bombs.
pub const DEFAULT_MAX_COMPRESSION_RATIO: f64 = 100.0;

// =============================================================================
// Device Geometry
// =============================================================================

/// Sector size in bytes.
pub const SECTOR_SIZE: u64 = 512;

/// Thin device size in sectors (1 GiB).
pub const DEVICE_SECTORS: u64 = 2_097_152;

/// Directory where the kernel exposes activated mapper nodes.
pub const MAPPER_DIR: &str = "/dev/mapper";

/// Name prefix for activated base devices: `flyio-<id>`.
pub const DEVICE_NAME_PREFIX: &str = "flyio-";

/// Name prefix for activated snapshots: `flyio-snapshot-<id>`.
pub const SNAPSHOT_NAME_PREFIX: &str = "flyio-snapshot-";

// =============================================================================
// Work Directory Layout
// =============================================================================

/// Subdirectory for raw fetched archives.
pub const DOWNLOADS_DIR: &str = "downloads";

/// Subdirectory for scratch extraction trees.
pub const EXTRACTED_DIR: &str = "extracted";

/// Subdirectory for transient mount points, partitioned by device id.
pub const MOUNTS_DIR: &str = "mounts";

// =============================================================================
// Engine
// =============================================================================

/// Default per-transition retry budget before the pipeline aborts.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Engine-level attempt backstop per state. The pipeline's own retry budget
/// fires first; this bound only guards against a misconfigured chain.
pub const ENGINE_MAX_ATTEMPTS: u64 = 32;

/// Base delay for the engine's exponential retry backoff.
pub const ENGINE_RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

/// Cap on a single backoff sleep.
pub const ENGINE_RETRY_MAX_DELAY: Duration = Duration::from_secs(30);
