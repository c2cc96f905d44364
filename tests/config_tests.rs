//! Tests for configuration defaults and validation.

use snapforge::Config;

#[test]
fn test_defaults_are_usable() {
    let cfg = Config::default();
    assert!(cfg.validate().is_ok());
    assert_eq!(cfg.max_compression_ratio, 100.0);
    assert_eq!(cfg.max_retries, 5);
    assert!(!cfg.dm_enabled);
    assert_eq!(cfg.pool_name, "pool");
    assert!(cfg.object_store.endpoint.is_none());
}

#[test]
fn test_partial_json_keeps_other_defaults() {
    let cfg: Config = serde_json::from_str(
        r#"{
            "work_dir": "/var/lib/snapforge",
            "dm_enabled": true,
            "object_store": {"bucket": "prod-images"}
        }"#,
    )
    .unwrap();

    assert_eq!(cfg.work_dir.to_str(), Some("/var/lib/snapforge"));
    assert!(cfg.dm_enabled);
    assert_eq!(cfg.object_store.bucket, "prod-images");
    // Untouched fields fall back to defaults.
    assert_eq!(cfg.object_store.region, "us-east-1");
    assert_eq!(cfg.max_retries, 5);
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_validate_rejects_zero_limits() {
    let mut cfg = Config::default();
    cfg.max_file_size = 0;
    assert!(cfg.validate().is_err());

    let mut cfg = Config::default();
    cfg.max_total_size = 0;
    assert!(cfg.validate().is_err());

    let mut cfg = Config::default();
    cfg.max_compression_ratio = 0.0;
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_rejects_empty_paths() {
    let mut cfg = Config::default();
    cfg.registry_path = std::path::PathBuf::new();
    assert!(cfg.validate().is_err());

    let mut cfg = Config::default();
    cfg.object_store.bucket = String::new();
    assert!(cfg.validate().is_err());

    let mut cfg = Config::default();
    cfg.pool_name = String::new();
    assert!(cfg.validate().is_err());
}
