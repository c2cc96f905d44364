//! Tests for the security-gated archive extractor.
//!
//! Fixture archives are authored in-process with `tar::Builder`. Malicious
//! entry names that the builder itself refuses to write (absolute paths,
//! `..` components) are produced by patching the name field and checksum of
//! the finished archive bytes.

use flate2::write::GzEncoder;
use flate2::Compression;
use snapforge::{extract_archive, Error, Validator};
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::TempDir;

// =============================================================================
// Fixture Helpers
// =============================================================================

fn generous_validator() -> Validator {
    Validator::new(64 * 1024 * 1024, 256 * 1024 * 1024, 1000.0)
}

fn append_file(builder: &mut tar::Builder<Vec<u8>>, name: &str, data: &[u8], mode: u32) {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(mode);
    builder.append_data(&mut header, name, data).unwrap();
}

fn append_dir(builder: &mut tar::Builder<Vec<u8>>, name: &str) {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Directory);
    header.set_size(0);
    header.set_mode(0o755);
    builder.append_data(&mut header, name, std::io::empty()).unwrap();
}

fn append_symlink(builder: &mut tar::Builder<Vec<u8>>, name: &str, target: &str) {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Symlink);
    header.set_size(0);
    builder.append_link(&mut header, name, target).unwrap();
}

fn append_hard_link(builder: &mut tar::Builder<Vec<u8>>, name: &str, target: &str) {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Link);
    header.set_size(0);
    builder.append_link(&mut header, name, target).unwrap();
}

fn finish(builder: tar::Builder<Vec<u8>>) -> Vec<u8> {
    builder.into_inner().unwrap()
}

/// Rewrites the name of the tar entry currently called `old` to `new`,
/// fixing up the header checksum. `tar::Builder` refuses to write hostile
/// names, so hostile fixtures are patched in after the fact.
fn rename_entry(archive: &mut [u8], old: &str, new: &str) {
    assert!(new.len() <= 100, "patched name must fit the header field");
    for block in (0..archive.len()).step_by(512) {
        let name = &archive[block..block + 100];
        let matches = name.starts_with(old.as_bytes()) && name[old.len()] == 0;
        if !matches {
            continue;
        }

        for byte in &mut archive[block..block + 100] {
            *byte = 0;
        }
        archive[block..block + new.len()].copy_from_slice(new.as_bytes());

        // Recompute the checksum with the checksum field read as spaces.
        let mut sum: u64 = 0;
        for (i, byte) in archive[block..block + 512].iter().enumerate() {
            sum += if (148..156).contains(&i) {
                b' ' as u64
            } else {
                *byte as u64
            };
        }
        let checksum = format!("{:06o}\0 ", sum);
        archive[block + 148..block + 156].copy_from_slice(checksum.as_bytes());
        return;
    }
    panic!("entry {:?} not found in fixture archive", old);
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn write_archive(dir: &Path, bytes: &[u8]) -> std::path::PathBuf {
    let path = dir.join("image.tar");
    fs::write(&path, bytes).unwrap();
    path
}

fn entry_count(dir: &Path) -> usize {
    fs::read_dir(dir).unwrap().count()
}

// =============================================================================
// Happy-Path Extraction Tests
// =============================================================================

#[test]
fn test_extract_simple_archive() {
    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("rootfs");
    fs::create_dir(&dest).unwrap();

    let mut builder = tar::Builder::new(Vec::new());
    append_dir(&mut builder, "etc/");
    append_file(&mut builder, "etc/hostname", b"container\n", 0o644);
    append_file(&mut builder, "usr/bin/tool", b"#!/bin/sh\n", 0o755);
    append_symlink(&mut builder, "bin/sh", "/usr/bin/dash");
    let archive = write_archive(temp.path(), &finish(builder));

    extract_archive(&archive, &dest, &generous_validator()).unwrap();

    assert_eq!(
        fs::read(dest.join("etc/hostname")).unwrap(),
        b"container\n"
    );
    assert_eq!(fs::read(dest.join("usr/bin/tool")).unwrap(), b"#!/bin/sh\n");
    let link = fs::read_link(dest.join("bin/sh")).unwrap();
    assert_eq!(link, Path::new("/usr/bin/dash"));
}

#[cfg(unix)]
#[test]
fn test_extract_preserves_file_mode() {
    use std::os::unix::fs::PermissionsExt;

    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("rootfs");
    fs::create_dir(&dest).unwrap();

    let mut builder = tar::Builder::new(Vec::new());
    append_file(&mut builder, "bin/run", b"echo hi\n", 0o755);
    let archive = write_archive(temp.path(), &finish(builder));

    extract_archive(&archive, &dest, &generous_validator()).unwrap();

    let mode = fs::metadata(dest.join("bin/run")).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o755);
}

#[test]
fn test_extract_gzip_archive() {
    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("rootfs");
    fs::create_dir(&dest).unwrap();

    let mut builder = tar::Builder::new(Vec::new());
    append_file(&mut builder, "readme.txt", b"compressed content", 0o644);
    let bytes = gzip(&finish(builder));
    let archive = temp.path().join("image.tar.gz");
    fs::write(&archive, &bytes).unwrap();

    let validator = Validator::new(1024 * 1024, 4 * 1024 * 1024, 1000.0);
    extract_archive(&archive, &dest, &validator).unwrap();

    assert_eq!(
        fs::read(dest.join("readme.txt")).unwrap(),
        b"compressed content"
    );
}

#[test]
fn test_extract_hard_link() {
    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("rootfs");
    fs::create_dir(&dest).unwrap();

    let mut builder = tar::Builder::new(Vec::new());
    append_file(&mut builder, "data/original.txt", b"shared bytes", 0o644);
    append_hard_link(&mut builder, "data/alias.txt", "data/original.txt");
    let archive = write_archive(temp.path(), &finish(builder));

    extract_archive(&archive, &dest, &generous_validator()).unwrap();

    assert_eq!(fs::read(dest.join("data/alias.txt")).unwrap(), b"shared bytes");
}

#[test]
fn test_extract_truncates_existing_file() {
    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("rootfs");
    fs::create_dir(&dest).unwrap();
    fs::write(dest.join("config"), b"old contents that are longer").unwrap();

    let mut builder = tar::Builder::new(Vec::new());
    append_file(&mut builder, "config", b"new", 0o644);
    let archive = write_archive(temp.path(), &finish(builder));

    extract_archive(&archive, &dest, &generous_validator()).unwrap();

    assert_eq!(fs::read(dest.join("config")).unwrap(), b"new");
}

#[test]
fn test_extract_empty_archive() {
    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("rootfs");
    fs::create_dir(&dest).unwrap();

    let builder = tar::Builder::new(Vec::new());
    let archive = write_archive(temp.path(), &finish(builder));

    extract_archive(&archive, &dest, &generous_validator()).unwrap();
    assert_eq!(entry_count(&dest), 0);
}

// =============================================================================
// Hostile Archive Tests
// =============================================================================

#[test]
fn test_extract_rejects_path_traversal_entry() {
    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("rootfs");
    fs::create_dir(&dest).unwrap();

    let mut builder = tar::Builder::new(Vec::new());
    append_file(&mut builder, "placeholder", b"malicious", 0o644);
    let mut bytes = finish(builder);
    rename_entry(&mut bytes, "placeholder", "../../etc/shadow");
    let archive = write_archive(temp.path(), &bytes);

    let err = extract_archive(&archive, &dest, &generous_validator()).unwrap_err();
    assert!(matches!(err, Error::PathTraversal { .. }));
    // Nothing may be written before the gate fires.
    assert_eq!(entry_count(&dest), 0);
}

#[test]
fn test_extract_rejects_absolute_entry() {
    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("rootfs");
    fs::create_dir(&dest).unwrap();

    let mut builder = tar::Builder::new(Vec::new());
    append_file(&mut builder, "placeholder", b"malicious", 0o644);
    let mut bytes = finish(builder);
    rename_entry(&mut bytes, "placeholder", "/etc/cron.d/backdoor");
    let archive = write_archive(temp.path(), &bytes);

    let err = extract_archive(&archive, &dest, &generous_validator()).unwrap_err();
    assert!(matches!(err, Error::AbsolutePath { .. }));
    assert_eq!(entry_count(&dest), 0);
}

#[test]
fn test_extract_rejects_escaping_symlink() {
    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("rootfs");
    fs::create_dir(&dest).unwrap();

    let mut builder = tar::Builder::new(Vec::new());
    append_symlink(&mut builder, "innocent", "../../etc/passwd");
    let archive = write_archive(temp.path(), &finish(builder));

    let err = extract_archive(&archive, &dest, &generous_validator()).unwrap_err();
    assert!(matches!(err, Error::SymlinkEscape { .. }));
    assert_eq!(entry_count(&dest), 0);
}

#[test]
fn test_extract_allows_cross_directory_symlink() {
    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("rootfs");
    fs::create_dir(&dest).unwrap();

    let mut builder = tar::Builder::new(Vec::new());
    append_dir(&mut builder, "etc/fonts/conf.avail/");
    append_file(
        &mut builder,
        "etc/fonts/conf.avail/10-hinting.conf",
        b"<fontconfig/>",
        0o644,
    );
    append_symlink(
        &mut builder,
        "etc/fonts/conf.d/10-hinting.conf",
        "../conf.avail/10-hinting.conf",
    );
    let archive = write_archive(temp.path(), &finish(builder));

    extract_archive(&archive, &dest, &generous_validator()).unwrap();

    let link = fs::read_link(dest.join("etc/fonts/conf.d/10-hinting.conf")).unwrap();
    assert_eq!(link, Path::new("../conf.avail/10-hinting.conf"));
}

#[test]
fn test_extract_rejects_oversized_file() {
    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("rootfs");
    fs::create_dir(&dest).unwrap();

    let mut builder = tar::Builder::new(Vec::new());
    append_file(&mut builder, "big.bin", &[0u8; 4096], 0o644);
    let archive = write_archive(temp.path(), &finish(builder));

    let validator = Validator::new(1024, 1024 * 1024, 1000.0);
    let err = extract_archive(&archive, &dest, &validator).unwrap_err();
    assert!(matches!(err, Error::FileTooLarge { .. }));
}

#[test]
fn test_extract_rejects_cumulative_size() {
    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("rootfs");
    fs::create_dir(&dest).unwrap();

    let mut builder = tar::Builder::new(Vec::new());
    append_file(&mut builder, "a.bin", &[1u8; 1000], 0o644);
    append_file(&mut builder, "b.bin", &[2u8; 1000], 0o644);
    let archive = write_archive(temp.path(), &finish(builder));

    let validator = Validator::new(1024, 1500, 1000.0);
    let err = extract_archive(&archive, &dest, &validator).unwrap_err();
    assert!(matches!(err, Error::TotalTooLarge { .. }));
}

#[test]
fn test_extract_detects_compression_bomb() {
    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("rootfs");
    fs::create_dir(&dest).unwrap();

    // 1 MiB of zeros gzips to a couple of KiB; the extracted/compressed
    // ratio blows well past 10.
    let mut builder = tar::Builder::new(Vec::new());
    append_file(&mut builder, "zeros.bin", &vec![0u8; 1024 * 1024], 0o644);
    let bytes = gzip(&finish(builder));
    let archive = temp.path().join("bomb.tar.gz");
    fs::write(&archive, &bytes).unwrap();

    let validator = Validator::new(64 * 1024 * 1024, 256 * 1024 * 1024, 10.0);
    let err = extract_archive(&archive, &dest, &validator).unwrap_err();
    assert!(matches!(err, Error::CompressionBomb { .. }));
    assert!(err.to_string().contains("compression ratio"));
}

#[test]
fn test_extract_rejects_device_entry() {
    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("rootfs");
    fs::create_dir(&dest).unwrap();

    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Char);
    header.set_size(0);
    header.set_device_major(1).unwrap();
    header.set_device_minor(3).unwrap();
    builder
        .append_data(&mut header, "dev/null", std::io::empty())
        .unwrap();
    let archive = write_archive(temp.path(), &finish(builder));

    let err = extract_archive(&archive, &dest, &generous_validator()).unwrap_err();
    assert!(matches!(err, Error::ArchiveCorrupt { .. }));
}

#[test]
fn test_extract_skips_fifo_entry() {
    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("rootfs");
    fs::create_dir(&dest).unwrap();

    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Fifo);
    header.set_size(0);
    builder
        .append_data(&mut header, "run/queue", std::io::empty())
        .unwrap();
    append_file(&mut builder, "kept.txt", b"kept", 0o644);
    let archive = write_archive(temp.path(), &finish(builder));

    extract_archive(&archive, &dest, &generous_validator()).unwrap();

    assert!(!dest.join("run/queue").exists());
    assert_eq!(fs::read(dest.join("kept.txt")).unwrap(), b"kept");
}
