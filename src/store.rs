//! Object-store collaborator.
//!
//! The pipeline consumes object storage through the [`ObjectStore`] trait:
//! `download` streams an archive to a local path while computing its SHA-256,
//! `list` enumerates keys under a prefix, `exists` probes a single key.
//! [`S3Store`] is the production implementation; tests substitute a local
//! fixture store.
//!
//! Credentials are anonymous for the reference workload; the pipeline is
//! indifferent to authentication.

use crate::error::{Error, Result};
use async_trait::async_trait;
use aws_sdk_s3::Client;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Metadata for a completed download.
#[derive(Debug, Clone)]
pub struct DownloadResult {
    /// Where the bytes landed.
    pub local_path: PathBuf,
    /// Hex SHA-256 of the downloaded bytes.
    pub digest: String,
    /// Byte count.
    pub size: u64,
}

/// Capability surface the activation pipeline needs from object storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Streams the object at `key` into `dest`, returning its digest and size.
    async fn download(&self, key: &str, dest: &Path) -> Result<DownloadResult>;

    /// Lists keys under `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Returns whether `key` exists.
    async fn exists(&self, key: &str) -> Result<bool>;
}

/// S3 implementation of [`ObjectStore`] with anonymous credentials.
pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    /// Builds a client for `bucket` in `region`, optionally against a custom
    /// `endpoint` (e.g. a local MinIO).
    pub async fn new(endpoint: Option<&str>, bucket: &str, region: &str) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region.to_string()))
            .no_credentials();
        if let Some(endpoint) = endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if endpoint.is_some() {
            // Path-style addressing for S3-compatible local endpoints.
            builder = builder.force_path_style(true);
        }
        let client = Client::from_conf(builder.build());

        info!(bucket, region, "object store client ready");
        Self {
            client,
            bucket: bucket.to_string(),
        }
    }

    /// Returns the configured bucket name.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn download(&self, key: &str, dest: &Path) -> Result<DownloadResult> {
        debug!(bucket = %self.bucket, key, dest = %dest.display(), "download started");

        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                let missing = err
                    .as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false);
                if missing {
                    Error::ObjectMissing {
                        key: key.to_string(),
                    }
                } else {
                    Error::StoreIo {
                        reason: err.to_string(),
                    }
                }
            })?;

        let mut body = output.body;
        let mut file = tokio::fs::File::create(dest).await?;
        let mut hasher = Sha256::new();
        let mut size: u64 = 0;

        while let Some(chunk) = body.try_next().await.map_err(|e| Error::StoreIo {
            reason: e.to_string(),
        })? {
            hasher.update(&chunk);
            size += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        let digest = hex::encode(hasher.finalize());
        info!(key, size, digest = %&digest[..16.min(digest.len())], "download complete");

        Ok(DownloadResult {
            local_path: dest.to_path_buf(),
            digest,
            size,
        })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| Error::StoreIo {
                reason: e.to_string(),
            })?;
            for object in page.contents() {
                if let Some(key) = object.key() {
                    keys.push(key.to_string());
                }
            }
        }

        debug!(prefix, count = keys.len(), "list complete");
        Ok(keys)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                let not_found = err
                    .as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false);
                if not_found {
                    Ok(false)
                } else {
                    Err(Error::StoreIo {
                        reason: err.to_string(),
                    })
                }
            }
        }
    }
}
