//! Tests for the security validator.
//!
//! Covers path traversal, symlink depth accounting, size ceilings, and
//! compression-ratio enforcement.

use snapforge::{Error, Validator};

fn validator() -> Validator {
    Validator::new(1024 * 1024, 10 * 1024 * 1024, 100.0)
}

// =============================================================================
// Path Validation Tests
// =============================================================================

#[test]
fn test_validate_path_accepts_normal_paths() {
    let v = validator();
    assert!(v.validate_path("usr/bin/env").is_ok());
    assert!(v.validate_path("etc/passwd").is_ok());
    assert!(v.validate_path("./relative/file").is_ok());
    assert!(v.validate_path("deep/a/b/c/d/e/f").is_ok());
}

#[test]
fn test_validate_path_rejects_absolute_path() {
    let v = validator();
    let err = v.validate_path("/etc/passwd").unwrap_err();
    assert!(matches!(err, Error::AbsolutePath { .. }));
    assert!(err.to_string().starts_with("security: absolute path"));
}

#[test]
fn test_validate_path_rejects_leading_dotdot() {
    let v = validator();
    let err = v.validate_path("../../etc/shadow").unwrap_err();
    assert!(matches!(err, Error::PathTraversal { .. }));
    assert!(err.to_string().starts_with("security: path traversal"));
}

#[test]
fn test_validate_path_rejects_traversal_after_cleaning() {
    let v = validator();
    // Cleans to "../etc/shadow".
    let err = v.validate_path("a/../../etc/shadow").unwrap_err();
    assert!(matches!(err, Error::PathTraversal { .. }));
}

#[test]
fn test_validate_path_accepts_interior_dotdot_that_stays_inside() {
    let v = validator();
    // Cleans to "lib/libc.so", never leaves the root.
    assert!(v.validate_path("usr/../lib/libc.so").is_ok());
}

// =============================================================================
// Symlink Validation Tests
// =============================================================================

#[test]
fn test_validate_symlink_accepts_absolute_target() {
    let v = validator();
    // OS images ship /bin/sh -> /usr/bin/dash; absolute targets are
    // container-relative and always accepted.
    assert!(v.validate_symlink("bin/sh", "/usr/bin/dash").is_ok());
}

#[test]
fn test_validate_symlink_accepts_cross_directory_target() {
    let v = validator();
    // etc/fonts/conf.d/x -> ../conf.avail/x resolves inside the tree.
    assert!(v
        .validate_symlink("etc/fonts/conf.d/10-hinting.conf", "../conf.avail/10-hinting.conf")
        .is_ok());
}

#[test]
fn test_validate_symlink_rejects_escape_near_root() {
    let v = validator();
    let err = v.validate_symlink("foo", "../../etc/passwd").unwrap_err();
    assert!(matches!(err, Error::SymlinkEscape { .. }));
}

#[test]
fn test_validate_symlink_rejects_deep_escape() {
    let v = validator();
    let err = v
        .validate_symlink("a/b/link", "../../../../outside")
        .unwrap_err();
    assert!(matches!(err, Error::SymlinkEscape { .. }));
}

#[test]
fn test_validate_symlink_accepts_climb_that_stays_inside() {
    let v = validator();
    // a/b/c/link -> ../../x resolves to a/x, inside the tree.
    assert!(v.validate_symlink("a/b/c/link", "../../x").is_ok());
}

// =============================================================================
// Size Limit Tests
// =============================================================================

#[test]
fn test_validate_file_size_boundary() {
    let v = validator();
    assert!(v.validate_file_size(1024 * 1024).is_ok());
    let err = v.validate_file_size(1024 * 1024 + 1).unwrap_err();
    assert!(matches!(err, Error::FileTooLarge { .. }));
}

#[test]
fn test_add_extracted_size_accumulates() {
    let v = validator();
    for _ in 0..10 {
        v.add_extracted_size(1024 * 1024).unwrap();
    }
    assert_eq!(v.current_total(), 10 * 1024 * 1024);

    let err = v.add_extracted_size(1).unwrap_err();
    assert!(matches!(err, Error::TotalTooLarge { .. }));
}

#[test]
fn test_reset_clears_accumulator() {
    let v = validator();
    v.add_extracted_size(5 * 1024 * 1024).unwrap();
    v.reset();
    assert_eq!(v.current_total(), 0);
    assert!(v.add_extracted_size(10 * 1024 * 1024).is_ok());
}

// =============================================================================
// Compression Ratio Tests
// =============================================================================

#[test]
fn test_compression_ratio_within_limit() {
    let v = validator();
    assert!(v.validate_compression_ratio(1024, 50 * 1024).is_ok());
}

#[test]
fn test_compression_ratio_exceeded() {
    let v = validator();
    let err = v.validate_compression_ratio(1024, 1024 * 1024).unwrap_err();
    assert!(matches!(err, Error::CompressionBomb { .. }));
    assert!(err.to_string().contains("compression ratio"));
}

#[test]
fn test_compression_ratio_zero_compressed_size() {
    let v = validator();
    let err = v.validate_compression_ratio(0, 1024).unwrap_err();
    assert!(matches!(err, Error::CompressionBomb { .. }));
}

#[test]
fn test_compression_ratio_at_exact_limit_passes() {
    let v = validator();
    // Exactly 100.0 is allowed; only strictly greater ratios are bombs.
    assert!(v.validate_compression_ratio(1024, 100 * 1024).is_ok());
}
