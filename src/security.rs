//! Security validation for archive extraction.
//!
//! A [`Validator`] is shared by the extractor for the duration of one
//! extraction. It enforces four independent gates:
//!
//! - **Path traversal**: entry names must be relative and must not climb
//!   above the extraction root.
//! - **Symlink escape**: relative symlink targets are resolved against the
//!   link's directory and rejected when the resolution climbs above the
//!   root. Absolute targets are accepted as container-relative (OS images
//!   legitimately ship links like `/bin/sh -> /usr/bin/dash`).
//! - **Size limits**: a per-entry ceiling and a cumulative ceiling across
//!   the whole extraction.
//! - **Compression bombs**: the ratio of extracted bytes to archive bytes,
//!   checked once after the last entry.
//!
//! All checks are purely textual or arithmetic; the validator never touches
//! the filesystem, so a malicious archive cannot influence validation
//! through staged on-disk state.

use crate::error::{Error, Result};
use std::sync::Mutex;
use tracing::{debug, error};

/// Escapes control characters and non-printables so attacker-supplied entry
/// names cannot inject terminal control sequences into error messages or logs.
pub(crate) fn printable(path: &str) -> String {
    path.escape_default().to_string()
}

/// Splits a path into lexically-cleaned components.
///
/// Resolves `.` and `name/..` pairs without consulting the filesystem.
/// Leading `..` components (climbs above the starting point) are preserved.
pub(crate) fn clean_components(path: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if matches!(out.last(), Some(last) if last != "..") {
                    out.pop();
                } else {
                    out.push("..".to_string());
                }
            }
            name => out.push(name.to_string()),
        }
    }
    out
}

/// Stateful security validator for one extraction.
///
/// Thread-compatible: the cumulative size accumulator sits behind a mutex so
/// the validator can be shared across extraction workers.
pub struct Validator {
    max_file_size: u64,
    max_total_size: u64,
    max_compression_ratio: f64,
    total: Mutex<u64>,
}

impl Validator {
    /// Creates a validator with the given limits.
    pub fn new(max_file_size: u64, max_total_size: u64, max_compression_ratio: f64) -> Self {
        debug!(
            max_file_size,
            max_total_size, max_compression_ratio, "security validator initialized"
        );
        Self {
            max_file_size,
            max_total_size,
            max_compression_ratio,
            total: Mutex::new(0),
        }
    }

    /// Validates an archive entry name against path traversal.
    ///
    /// Rejects absolute names and names whose cleaned form begins with `..`.
    pub fn validate_path(&self, name: &str) -> Result<()> {
        if name.starts_with('/') {
            error!(path = name, "absolute path in archive");
            return Err(Error::AbsolutePath {
                path: printable(name),
            });
        }

        let clean = clean_components(name);
        if matches!(clean.first(), Some(first) if first == "..") {
            error!(path = name, "path traversal in archive");
            return Err(Error::PathTraversal {
                path: printable(name),
            });
        }

        Ok(())
    }

    /// Validates a symlink target in the context of the link's location.
    ///
    /// `link` is the entry name of the symlink inside the archive (e.g.
    /// `etc/fonts/conf.d/10-hinting.conf`); `target` is its textual target
    /// (e.g. `../conf.avail/10-hinting.conf`).
    ///
    /// Absolute targets are accepted; they are interpreted relative to the
    /// eventual container root. Relative targets are resolved against the
    /// link's directory, and the resolution is walked with a depth counter:
    /// each named component descends one level, each `..` climbs one. The
    /// moment the counter goes negative the target has escaped the
    /// extraction root.
    pub fn validate_symlink(&self, link: &str, target: &str) -> Result<()> {
        if target.starts_with('/') {
            debug!(link, target, kind = "absolute", "symlink validated");
            return Ok(());
        }

        let link_dir = match link.rsplit_once('/') {
            Some((dir, _)) => dir,
            None => "",
        };
        let resolved = clean_components(&format!("{}/{}", link_dir, target));

        let mut depth: i64 = 0;
        for part in &resolved {
            if part == ".." {
                depth -= 1;
            } else {
                depth += 1;
            }
            if depth < 0 {
                error!(link, target, "symlink escapes extraction root");
                return Err(Error::SymlinkEscape {
                    link: printable(link),
                    target: printable(target),
                });
            }
        }

        debug!(link, target, kind = "relative", "symlink validated");
        Ok(())
    }

    /// Checks a single entry size against the per-file ceiling.
    pub fn validate_file_size(&self, size: u64) -> Result<()> {
        if size > self.max_file_size {
            error!(size, limit = self.max_file_size, "file size exceeded");
            return Err(Error::FileTooLarge {
                size,
                limit: self.max_file_size,
            });
        }
        Ok(())
    }

    /// Adds to the cumulative extracted size and checks the total ceiling.
    pub fn add_extracted_size(&self, size: u64) -> Result<()> {
        let mut total = self.total.lock().unwrap();
        *total = total.saturating_add(size);
        if *total > self.max_total_size {
            error!(
                total = *total,
                limit = self.max_total_size,
                "total extracted size exceeded"
            );
            return Err(Error::TotalTooLarge {
                total: *total,
                limit: self.max_total_size,
            });
        }
        Ok(())
    }

    /// Checks the extracted/compressed ratio after extraction finishes.
    pub fn validate_compression_ratio(&self, compressed: u64, uncompressed: u64) -> Result<()> {
        if compressed == 0 {
            error!("zero compressed size");
            return Err(Error::CompressionBomb {
                reason: "compressed size cannot be zero".to_string(),
            });
        }

        let ratio = uncompressed as f64 / compressed as f64;
        if ratio > self.max_compression_ratio {
            error!(
                ratio,
                limit = self.max_compression_ratio,
                compressed,
                uncompressed,
                "compression bomb detected"
            );
            return Err(Error::CompressionBomb {
                reason: format!(
                    "compression ratio {:.2} exceeds max {:.2} (compressed: {}, uncompressed: {})",
                    ratio, self.max_compression_ratio, compressed, uncompressed
                ),
            });
        }

        debug!(ratio, compressed, uncompressed, "compression ratio validated");
        Ok(())
    }

    /// Clears the cumulative size accumulator for a fresh extraction.
    pub fn reset(&self) {
        *self.total.lock().unwrap() = 0;
    }

    /// Returns the cumulative extracted size so far.
    pub fn current_total(&self) -> u64 {
        *self.total.lock().unwrap()
    }
}
