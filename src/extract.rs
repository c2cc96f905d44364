//! Security-gated tar extraction.
//!
//! Streams an archive entry-by-entry into a destination directory, consulting
//! the [`Validator`] on every gate decision. Extraction aborts on the first
//! rejected entry, so an attack terminates I/O early instead of exhausting
//! the destination.
//!
//! ## Entry policy
//!
//! | Entry type | Handling |
//! |---|---|
//! | directory | created, mode bits preserved |
//! | regular file | size-gated, written open-write-close, truncates existing |
//! | symlink | target validated, written textually (never resolved) |
//! | hard link | target path validated, linked within the destination |
//! | char/block device | rejected |
//! | anything else | skipped |
//!
//! The destination directory must exist. On failure the destination is left
//! as-is (minus any partial file, which is deleted before returning); the
//! caller owns scratch-tree cleanup.

use crate::error::{Error, Result};
use crate::security::{clean_components, printable, Validator};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tar::{Archive, EntryType};
use tracing::{debug, info};

/// Extracts `archive_path` into `dest_dir` under the validator's rules.
///
/// Gzip-compressed archives are detected by magic bytes and decompressed
/// transparently. After the last entry the archive's on-disk size is compared
/// against the cumulative extracted size to catch decompression bombs.
pub fn extract_archive(archive_path: &Path, dest_dir: &Path, validator: &Validator) -> Result<()> {
    validator.reset();

    let mut file = File::open(archive_path)?;
    let mut magic = [0u8; 2];
    let magic_len = file.read(&mut magic)?;
    file.seek(SeekFrom::Start(0))?;

    let reader: Box<dyn Read> = if magic_len == 2 && magic == [0x1f, 0x8b] {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };

    let mut archive = Archive::new(reader);
    let entries = archive.entries().map_err(|e| Error::ArchiveCorrupt {
        reason: e.to_string(),
    })?;

    for entry in entries {
        let mut entry = entry.map_err(|e| Error::ArchiveCorrupt {
            reason: e.to_string(),
        })?;

        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        validator.validate_path(&name)?;

        // Join destination and name only after validation, via the cleaned
        // relative components.
        let rel: PathBuf = clean_components(&name).iter().collect();
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dest_dir.join(&rel);
        let mode = entry.header().mode().unwrap_or(0o644);

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&target)?;
                set_mode(&target, mode);
            }

            EntryType::Regular | EntryType::Continuous => {
                let size = entry.header().size().map_err(|e| Error::ArchiveCorrupt {
                    reason: e.to_string(),
                })?;
                validator.validate_file_size(size)?;
                validator.add_extracted_size(size)?;

                create_parent_dirs(&target)?;
                write_entry_file(&mut entry, &target, mode)?;
            }

            EntryType::Symlink => {
                let link_target = entry
                    .link_name_bytes()
                    .map(|b| String::from_utf8_lossy(&b).into_owned())
                    .ok_or_else(|| Error::ArchiveCorrupt {
                        reason: format!("symlink without target: {}", printable(&name)),
                    })?;
                validator.validate_symlink(&name, &link_target)?;

                create_parent_dirs(&target)?;
                write_symlink(&link_target, &target)?;
            }

            EntryType::Link => {
                let link_target = entry
                    .link_name_bytes()
                    .map(|b| String::from_utf8_lossy(&b).into_owned())
                    .ok_or_else(|| Error::ArchiveCorrupt {
                        reason: format!("hard link without target: {}", printable(&name)),
                    })?;
                validator.validate_path(&link_target)?;

                let source: PathBuf = clean_components(&link_target).iter().collect();
                create_parent_dirs(&target)?;
                fs::hard_link(dest_dir.join(source), &target).map_err(|e| {
                    Error::ArchiveCorrupt {
                        reason: format!("hard link {} -> {}: {}", printable(&name), printable(&link_target), e),
                    }
                })?;
            }

            EntryType::Char | EntryType::Block => {
                return Err(Error::ArchiveCorrupt {
                    reason: format!("device entry not allowed: {}", printable(&name)),
                });
            }

            other => {
                debug!(path = %name, kind = ?other, "skipping archive entry");
            }
        }
    }

    let archive_size = fs::metadata(archive_path)?.len();
    validator.validate_compression_ratio(archive_size, validator.current_total())?;

    info!(
        archive = %archive_path.display(),
        dest = %dest_dir.display(),
        extracted_bytes = validator.current_total(),
        "extraction complete"
    );
    Ok(())
}

/// Writes one regular-file entry. The partial file is removed on failure so
/// the destination never holds truncated content.
fn write_entry_file(entry: &mut impl Read, target: &Path, mode: u32) -> Result<()> {
    let mut out = File::create(target)?;
    if let Err(e) = io::copy(entry, &mut out) {
        drop(out);
        let _ = fs::remove_file(target);
        return Err(Error::Io(e));
    }
    drop(out);
    set_mode(target, mode);
    Ok(())
}

/// Creates missing parent directories with mode `0o755`.
fn create_parent_dirs(target: &Path) -> Result<()> {
    let parent = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => return Ok(()),
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(parent)?;
    }
    #[cfg(not(unix))]
    {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777));
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) {}

#[cfg(unix)]
fn write_symlink(link_target: &str, target: &Path) -> Result<()> {
    match std::os::unix::fs::symlink(link_target, target) {
        Ok(()) => Ok(()),
        // An identical link from an earlier layer or retry is tolerated.
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(Error::Io(e)),
    }
}

#[cfg(not(unix))]
fn write_symlink(link_target: &str, target: &Path) -> Result<()> {
    tracing::warn!(
        path = %target.display(),
        link_target,
        "symlinks not supported on this platform, skipping"
    );
    Ok(())
}
