//! Application configuration.
//!
//! Configuration is read once at startup from an optional JSON file and
//! `SNAPFORGE_*` environment variables, then treated as immutable for the
//! lifetime of the run. Every field has a sensible default so the binary
//! works with no configuration at all.
//!
//! Precedence (lowest to highest): built-in defaults, config file,
//! environment variables.

use crate::constants::{
    DEFAULT_MAX_COMPRESSION_RATIO, DEFAULT_MAX_FILE_SIZE, DEFAULT_MAX_RETRIES,
    DEFAULT_MAX_TOTAL_SIZE,
};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Object-store connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    /// Optional custom endpoint (e.g. a local MinIO). `None` means AWS S3.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Bucket holding the image archives.
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// Bucket region.
    #[serde(default = "default_region")]
    pub region: String,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            bucket: default_bucket(),
            region: default_region(),
        }
    }
}

/// Top-level configuration for the activation subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path of the image registry database.
    #[serde(default = "default_registry_path")]
    pub registry_path: PathBuf,

    /// Directory for durable state-machine run records.
    #[serde(default = "default_engine_db_path")]
    pub engine_db_path: PathBuf,

    /// Object-store settings.
    #[serde(default)]
    pub object_store: ObjectStoreConfig,

    /// Root of the work-directory layout (downloads/, extracted/, mounts/).
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Per-entry byte ceiling during extraction.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// Cumulative extracted-byte ceiling.
    #[serde(default = "default_max_total_size")]
    pub max_total_size: u64,

    /// Maximum extracted/compressed ratio before an archive is rejected.
    #[serde(default = "default_max_compression_ratio")]
    pub max_compression_ratio: f64,

    /// Name of the pre-existing kernel thin pool.
    #[serde(default = "default_pool_name")]
    pub pool_name: String,

    /// Whether to use the full thin-device manager. When false the degraded
    /// stub is used and activation completes without device materialization.
    #[serde(default)]
    pub dm_enabled: bool,

    /// Per-transition retry budget.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        // serde_json round-trip of an empty object applies every field default.
        serde_json::from_str("{}").expect("defaults are infallible")
    }
}

fn state_root() -> PathBuf {
    if let Some(home) = dirs::home_dir() {
        home.join(".snapforge")
    } else {
        PathBuf::from(".snapforge")
    }
}

fn default_registry_path() -> PathBuf {
    state_root().join("images.db")
}

fn default_engine_db_path() -> PathBuf {
    state_root().join("engine")
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/tmp/snapforge")
}

fn default_bucket() -> String {
    "snapforge-images".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_max_file_size() -> u64 {
    DEFAULT_MAX_FILE_SIZE
}

fn default_max_total_size() -> u64 {
    DEFAULT_MAX_TOTAL_SIZE
}

fn default_max_compression_ratio() -> f64 {
    DEFAULT_MAX_COMPRESSION_RATIO
}

fn default_pool_name() -> String {
    "pool".to_string()
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl Config {
    /// Loads configuration from `SNAPFORGE_CONFIG` (or `./snapforge.json` if
    /// present), then applies environment overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var_os("SNAPFORGE_CONFIG")
            .map(PathBuf::from)
            .or_else(|| {
                let local = PathBuf::from("snapforge.json");
                local.exists().then_some(local)
            });

        let mut cfg: Config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(&path).map_err(|e| {
                    Error::Config(format!("cannot read {}: {}", path.display(), e))
                })?;
                serde_json::from_str(&raw).map_err(|e| {
                    Error::Config(format!("cannot parse {}: {}", path.display(), e))
                })?
            }
            None => Config::default(),
        };

        cfg.apply_env();
        Ok(cfg)
    }

    /// Applies `SNAPFORGE_*` environment variable overrides.
    fn apply_env(&mut self) {
        if let Some(v) = env_str("SNAPFORGE_REGISTRY_PATH") {
            self.registry_path = PathBuf::from(v);
        }
        if let Some(v) = env_str("SNAPFORGE_ENGINE_DB_PATH") {
            self.engine_db_path = PathBuf::from(v);
        }
        if let Some(v) = env_str("SNAPFORGE_ENDPOINT") {
            self.object_store.endpoint = Some(v);
        }
        if let Some(v) = env_str("SNAPFORGE_BUCKET") {
            self.object_store.bucket = v;
        }
        if let Some(v) = env_str("SNAPFORGE_REGION") {
            self.object_store.region = v;
        }
        if let Some(v) = env_str("SNAPFORGE_WORK_DIR") {
            self.work_dir = PathBuf::from(v);
        }
        if let Some(v) = env_parse("SNAPFORGE_MAX_FILE_SIZE") {
            self.max_file_size = v;
        }
        if let Some(v) = env_parse("SNAPFORGE_MAX_TOTAL_SIZE") {
            self.max_total_size = v;
        }
        if let Some(v) = env_parse("SNAPFORGE_MAX_COMPRESSION_RATIO") {
            self.max_compression_ratio = v;
        }
        if let Some(v) = env_str("SNAPFORGE_POOL_NAME") {
            self.pool_name = v;
        }
        if let Some(v) = env_parse("SNAPFORGE_DM_ENABLED") {
            self.dm_enabled = v;
        }
        if let Some(v) = env_parse("SNAPFORGE_MAX_RETRIES") {
            self.max_retries = v;
        }
    }

    /// Checks the configuration for values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.registry_path.as_os_str().is_empty() {
            return Err(Error::Config("registry_path cannot be empty".into()));
        }
        if self.engine_db_path.as_os_str().is_empty() {
            return Err(Error::Config("engine_db_path cannot be empty".into()));
        }
        if self.object_store.bucket.is_empty() {
            return Err(Error::Config("object_store.bucket cannot be empty".into()));
        }
        if self.work_dir.as_os_str().is_empty() {
            return Err(Error::Config("work_dir cannot be empty".into()));
        }
        if self.max_file_size == 0 {
            return Err(Error::Config("max_file_size must be positive".into()));
        }
        if self.max_total_size == 0 {
            return Err(Error::Config("max_total_size must be positive".into()));
        }
        if self.max_compression_ratio <= 0.0 {
            return Err(Error::Config(
                "max_compression_ratio must be positive".into(),
            ));
        }
        if self.pool_name.is_empty() {
            return Err(Error::Config("pool_name cannot be empty".into()));
        }
        Ok(())
    }
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_str(key).and_then(|v| v.parse().ok())
}
