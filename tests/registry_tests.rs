//! Tests for the persistent image registry.
//!
//! Validates CRUD semantics, key uniqueness, status transitions, and the
//! no-duplicates/no-gaps property of the device-id allocator.

use snapforge::{Error, ImageRecord, ImageRegistry, ImageStatus};
use std::collections::HashSet;
use std::sync::Arc;
use tempfile::TempDir;

fn open_registry() -> (TempDir, ImageRegistry) {
    let temp = TempDir::new().unwrap();
    let registry = ImageRegistry::open(&temp.path().join("images.db")).unwrap();
    (temp, registry)
}

// =============================================================================
// CRUD Tests
// =============================================================================

#[test]
fn test_create_assigns_id() {
    let (_temp, registry) = open_registry();

    let mut record = ImageRecord::pending("images/alpine/1.tar");
    registry.create(&mut record).unwrap();
    assert!(record.id > 0);

    let mut second = ImageRecord::pending("images/alpine/2.tar");
    registry.create(&mut second).unwrap();
    assert!(second.id > record.id);
}

#[test]
fn test_create_rejects_duplicate_key() {
    let (_temp, registry) = open_registry();

    let mut record = ImageRecord::pending("images/alpine/1.tar");
    registry.create(&mut record).unwrap();

    let mut duplicate = ImageRecord::pending("images/alpine/1.tar");
    let err = registry.create(&mut duplicate).unwrap_err();
    assert!(matches!(err, Error::DuplicateKey { .. }));
}

#[test]
fn test_get_by_key_roundtrip() {
    let (_temp, registry) = open_registry();

    let mut record = ImageRecord::pending("images/golang/2.tar");
    registry.create(&mut record).unwrap();

    let fetched = registry.get_by_key("images/golang/2.tar").unwrap().unwrap();
    assert_eq!(fetched.id, record.id);
    assert_eq!(fetched.key, "images/golang/2.tar");
    assert_eq!(fetched.status, ImageStatus::Pending);
    assert_eq!(fetched.content_digest, "");
    assert!(fetched.device_path.is_none());
    assert!(fetched.snapshot_id.is_none());
    assert!(!fetched.created_at.is_empty());
}

#[test]
fn test_get_by_key_absent_is_none() {
    let (_temp, registry) = open_registry();
    assert!(registry.get_by_key("no/such/key").unwrap().is_none());
}

#[test]
fn test_update_overwrites_mutable_columns() {
    let (_temp, registry) = open_registry();

    let mut record = ImageRecord::pending("images/golang/2.tar");
    registry.create(&mut record).unwrap();

    record.content_digest = "abcdef0123456789".to_string();
    record.status = ImageStatus::Ready;
    record.device_path = Some("/dev/mapper/flyio-1".to_string());
    record.base_device_id = Some(1);
    record.snapshot_id = Some(2);
    registry.update(&record).unwrap();

    let fetched = registry.get_by_key("images/golang/2.tar").unwrap().unwrap();
    assert_eq!(fetched.status, ImageStatus::Ready);
    assert_eq!(fetched.content_digest, "abcdef0123456789");
    assert_eq!(fetched.device_path.as_deref(), Some("/dev/mapper/flyio-1"));
    assert_eq!(fetched.base_device_id, Some(1));
    assert_eq!(fetched.snapshot_id, Some(2));
}

#[test]
fn test_update_missing_row_fails() {
    let (_temp, registry) = open_registry();

    let mut record = ImageRecord::pending("ghost");
    record.id = 4242;
    let err = registry.update(&record).unwrap_err();
    assert!(matches!(err, Error::NotFound { id: 4242 }));
}

#[test]
fn test_update_status_sets_error_message() {
    let (_temp, registry) = open_registry();

    let mut record = ImageRecord::pending("images/bad.tar");
    registry.create(&mut record).unwrap();

    registry
        .update_status(
            record.id,
            ImageStatus::Failed,
            Some("security: path traversal detected: ../../etc/shadow"),
        )
        .unwrap();

    let fetched = registry.get_by_key("images/bad.tar").unwrap().unwrap();
    assert_eq!(fetched.status, ImageStatus::Failed);
    assert!(fetched
        .error_message
        .unwrap()
        .starts_with("security: path traversal"));
}

#[test]
fn test_list_returns_all_rows() {
    let (_temp, registry) = open_registry();

    for i in 0..5 {
        let mut record = ImageRecord::pending(&format!("images/{}.tar", i));
        registry.create(&mut record).unwrap();
    }

    let images = registry.list().unwrap();
    assert_eq!(images.len(), 5);
}

#[test]
fn test_delete_removes_row() {
    let (_temp, registry) = open_registry();

    let mut record = ImageRecord::pending("images/doomed.tar");
    registry.create(&mut record).unwrap();
    registry.delete(record.id).unwrap();

    assert!(registry.get_by_key("images/doomed.tar").unwrap().is_none());
}

#[test]
fn test_cleaned_is_a_valid_status() {
    let (_temp, registry) = open_registry();

    let mut record = ImageRecord::pending("images/done.tar");
    registry.create(&mut record).unwrap();
    registry
        .update_status(record.id, ImageStatus::Cleaned, None)
        .unwrap();

    let fetched = registry.get_by_key("images/done.tar").unwrap().unwrap();
    assert_eq!(fetched.status, ImageStatus::Cleaned);
}

// =============================================================================
// Device-ID Allocator Tests
// =============================================================================

#[test]
fn test_allocator_starts_at_one_and_is_sequential() {
    let (_temp, registry) = open_registry();

    assert_eq!(registry.allocate_next_device_id().unwrap(), 1);
    assert_eq!(registry.allocate_next_device_id().unwrap(), 2);
    assert_eq!(registry.allocate_next_device_id().unwrap(), 3);
}

#[test]
fn test_allocator_survives_reopen() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("images.db");

    {
        let registry = ImageRegistry::open(&path).unwrap();
        assert_eq!(registry.allocate_next_device_id().unwrap(), 1);
        assert_eq!(registry.allocate_next_device_id().unwrap(), 2);
    }

    let registry = ImageRegistry::open(&path).unwrap();
    assert_eq!(registry.allocate_next_device_id().unwrap(), 3);
}

#[test]
fn test_allocator_no_duplicates_no_gaps_under_concurrency() {
    let (_temp, registry) = open_registry();
    let registry = Arc::new(registry);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let registry = registry.clone();
        handles.push(std::thread::spawn(move || {
            let mut ids = Vec::new();
            for _ in 0..25 {
                ids.push(registry.allocate_next_device_id().unwrap());
            }
            ids
        }));
    }

    let mut all: Vec<i64> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    all.sort_unstable();

    let unique: HashSet<i64> = all.iter().copied().collect();
    assert_eq!(unique.len(), all.len(), "allocator returned a duplicate id");
    assert_eq!(*all.first().unwrap(), 1);
    assert_eq!(*all.last().unwrap(), all.len() as i64, "allocator left a gap");
}
