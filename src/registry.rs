//! Persistent image registry.
//!
//! Durable, single-host record store over SQLite. Owns two tables: `images`
//! (one row per object key, lifecycle status, device identifiers) and
//! `device_sequence` (a single row backing the monotonic device-id
//! allocator shared by base devices and snapshots).
//!
//! Concurrency model: one connection behind a mutex, serialized writes. The
//! sequence bump runs inside a transaction so concurrent allocations can
//! never observe the same value.

use crate::error::{Error, Result};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS images (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL UNIQUE,
    content_digest TEXT NOT NULL,
    status TEXT NOT NULL CHECK(status IN ('pending', 'downloading', 'ready', 'failed', 'cleaned')),
    device_path TEXT,
    base_device_id INTEGER,
    snapshot_id INTEGER,
    error_message TEXT,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_images_key ON images(key);
CREATE INDEX IF NOT EXISTS idx_images_status ON images(status);
CREATE INDEX IF NOT EXISTS idx_images_created_at ON images(created_at);

CREATE TABLE IF NOT EXISTS device_sequence (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    next_device_id INTEGER NOT NULL DEFAULT 1
);

INSERT OR IGNORE INTO device_sequence (id, next_device_id) VALUES (1, 1);
";

/// Lifecycle status of an image record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageStatus {
    /// Row created, nothing fetched yet.
    Pending,
    /// Archive fetch in progress.
    Downloading,
    /// Activation finished; the image is mountable (or the platform is
    /// degraded and activation was skipped).
    Ready,
    /// A transition aborted; `error_message` names the cause.
    Failed,
    /// Terminal: resources released by the cleanup operation.
    Cleaned,
}

impl ImageStatus {
    /// Returns the TEXT column representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageStatus::Pending => "pending",
            ImageStatus::Downloading => "downloading",
            ImageStatus::Ready => "ready",
            ImageStatus::Failed => "failed",
            ImageStatus::Cleaned => "cleaned",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ImageStatus::Pending),
            "downloading" => Ok(ImageStatus::Downloading),
            "ready" => Ok(ImageStatus::Ready),
            "failed" => Ok(ImageStatus::Failed),
            "cleaned" => Ok(ImageStatus::Cleaned),
            other => Err(Error::Database(format!("unknown image status: {}", other))),
        }
    }
}

impl std::fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One image row.
#[derive(Debug, Clone)]
pub struct ImageRecord {
    /// Assigned by the store on insertion.
    pub id: i64,
    /// Opaque object-store key, unique across the registry.
    pub key: String,
    /// Hex digest of the fetched bytes; empty until `download` commits it.
    pub content_digest: String,
    /// Lifecycle status.
    pub status: ImageStatus,
    /// Mapper path of the activated base device.
    pub device_path: Option<String>,
    /// Pool id of the base device.
    pub base_device_id: Option<i64>,
    /// Pool id of the copy-on-write snapshot.
    pub snapshot_id: Option<i64>,
    /// Human-readable failure cause, set whenever status is `failed`.
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl ImageRecord {
    /// A fresh pending record for `key`, ready for [`ImageRegistry::create`].
    pub fn pending(key: &str) -> Self {
        Self {
            id: 0,
            key: key.to_string(),
            content_digest: String::new(),
            status: ImageStatus::Pending,
            device_path: None,
            base_device_id: None,
            snapshot_id: None,
            error_message: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }
}

/// Durable image registry over SQLite.
pub struct ImageRegistry {
    conn: Mutex<Connection>,
}

impl ImageRegistry {
    /// Opens (creating if needed) the registry at `path` and applies the
    /// schema. Parent directories are created.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)
            .map_err(|e| Error::Database(format!("cannot open {}: {}", path.display(), e)))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| Error::Database(format!("cannot apply schema: {}", e)))?;

        info!(path = %path.display(), "image registry ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// An in-memory registry, for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("cannot open in-memory db: {}", e)))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| Error::Database(format!("cannot apply schema: {}", e)))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Inserts a new row and assigns `record.id`.
    ///
    /// Returns [`Error::DuplicateKey`] when the key is already registered.
    pub fn create(&self, record: &mut ImageRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let result = conn.execute(
            "INSERT INTO images (key, content_digest, status, device_path, base_device_id, snapshot_id, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                record.key,
                record.content_digest,
                record.status.as_str(),
                record.device_path,
                record.base_device_id,
                record.snapshot_id,
                record.error_message,
            ],
        );

        match result {
            Ok(_) => {
                record.id = conn.last_insert_rowid();
                debug!(key = %record.key, image_id = record.id, "image record created");
                Ok(())
            }
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(Error::DuplicateKey {
                    key: record.key.clone(),
                })
            }
            Err(e) => Err(Error::Database(format!("insert failed: {}", e))),
        }
    }

    /// Looks up an image by key. Absence is `Ok(None)`, never an error.
    pub fn get_by_key(&self, key: &str) -> Result<Option<ImageRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, key, content_digest, status, device_path, base_device_id,
                    snapshot_id, error_message, created_at, updated_at
             FROM images WHERE key = ?1",
            [key],
            row_to_record,
        )
        .optional()
        .map_err(|e| Error::Database(format!("query failed: {}", e)))?
        .map(finish_record)
        .transpose()
    }

    /// Overwrites the mutable columns of an existing row and bumps
    /// `updated_at`. Fails with [`Error::NotFound`] when no row matches.
    pub fn update(&self, record: &ImageRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "UPDATE images
                 SET content_digest = ?1, status = ?2, device_path = ?3,
                     base_device_id = ?4, snapshot_id = ?5, error_message = ?6,
                     updated_at = CURRENT_TIMESTAMP
                 WHERE id = ?7",
                rusqlite::params![
                    record.content_digest,
                    record.status.as_str(),
                    record.device_path,
                    record.base_device_id,
                    record.snapshot_id,
                    record.error_message,
                    record.id,
                ],
            )
            .map_err(|e| Error::Database(format!("update failed: {}", e)))?;

        if changed == 0 {
            return Err(Error::NotFound { id: record.id });
        }
        debug!(image_id = record.id, status = %record.status, "image record updated");
        Ok(())
    }

    /// Partial update of status and error message.
    pub fn update_status(
        &self,
        id: i64,
        status: ImageStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "UPDATE images SET status = ?1, error_message = ?2, updated_at = CURRENT_TIMESTAMP
                 WHERE id = ?3",
                rusqlite::params![status.as_str(), error_message, id],
            )
            .map_err(|e| Error::Database(format!("status update failed: {}", e)))?;

        if changed == 0 {
            return Err(Error::NotFound { id });
        }
        debug!(image_id = id, status = %status, "status updated");
        Ok(())
    }

    /// Lists all images, newest first.
    pub fn list(&self) -> Result<Vec<ImageRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, key, content_digest, status, device_path, base_device_id,
                        snapshot_id, error_message, created_at, updated_at
                 FROM images ORDER BY created_at DESC, id DESC",
            )
            .map_err(|e| Error::Database(format!("list failed: {}", e)))?;

        let rows = stmt
            .query_map([], row_to_record)
            .map_err(|e| Error::Database(format!("list failed: {}", e)))?;

        let mut records = Vec::new();
        for row in rows {
            let raw = row.map_err(|e| Error::Database(format!("row scan failed: {}", e)))?;
            records.push(finish_record(raw)?);
        }
        Ok(records)
    }

    /// Removes a row by id.
    pub fn delete(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM images WHERE id = ?1", [id])
            .map_err(|e| Error::Database(format!("delete failed: {}", e)))?;
        Ok(())
    }

    /// Atomically bumps the shared device-id sequence and returns the
    /// pre-increment value.
    ///
    /// This is the only source of device-manager ids, for base devices and
    /// snapshots alike, which rules out collisions inside the pool. The read
    /// and the write commit in one transaction; a crash before commit does
    /// not burn the id.
    pub fn allocate_next_device_id(&self) -> Result<i64> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(format!("cannot begin transaction: {}", e)))?;

        let next: i64 = tx
            .query_row(
                "SELECT next_device_id FROM device_sequence WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .map_err(|e| Error::Database(format!("cannot read device sequence: {}", e)))?;

        tx.execute(
            "UPDATE device_sequence SET next_device_id = ?1 WHERE id = 1",
            [next + 1],
        )
        .map_err(|e| Error::Database(format!("cannot bump device sequence: {}", e)))?;

        tx.commit()
            .map_err(|e| Error::Database(format!("cannot commit device sequence: {}", e)))?;

        debug!(device_id = next, "device id allocated");
        Ok(next)
    }
}

/// Row shape before status parsing; keeps the rusqlite closure infallible
/// on the rusqlite error channel.
struct RawRecord {
    record: ImageRecord,
    status: String,
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        record: ImageRecord {
            id: row.get(0)?,
            key: row.get(1)?,
            content_digest: row.get(2)?,
            status: ImageStatus::Pending,
            device_path: row.get(4)?,
            base_device_id: row.get(5)?,
            snapshot_id: row.get(6)?,
            error_message: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        },
        status: row.get(3)?,
    })
}

fn finish_record(raw: RawRecord) -> Result<ImageRecord> {
    let mut record = raw.record;
    record.status = ImageStatus::parse(&raw.status)?;
    Ok(record)
}
