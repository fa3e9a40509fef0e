// restoretool/src/storage/mod.rs
//! Object storage restore: mirror `storage/<bucket>/...` into buckets.
pub(crate) mod logic;
pub(crate) mod s3;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::errors::Result;

pub use logic::{plan_storage, restore_storage};

/// One entry of a single-level listing. Entries without a size are
/// directories (common prefixes) to descend into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub name: String,
    pub size: Option<u64>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool>;

    /// Creates a private bucket.
    async fn create_bucket(&self, bucket: &str) -> Result<()>;

    /// Lists one level under `prefix` (empty for the bucket root).
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectEntry>>;

    /// Stores `body` at `key`. Without `upsert` an existing object is kept
    /// and the call fails.
    async fn upload(&self, bucket: &str, key: &str, body: Vec<u8>, upsert: bool) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct StorageOptions {
    pub incremental: bool,
    pub overwrite_files: bool,
    pub concurrency: usize,
    pub max_attempts: usize,
    /// Attempt `n` waits `n * retry_base_delay` before the next one.
    pub retry_base_delay: Duration,
}

impl StorageOptions {
    /// Upsert unless the run is incremental and told not to overwrite.
    pub fn upsert(&self) -> bool {
        self.overwrite_files || !self.incremental
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedUpload {
    pub path: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketReport {
    pub bucket_name: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub uploaded: usize,
    pub skipped_existing: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_files: Vec<FailedUpload>,
}

impl BucketReport {
    pub fn failed(bucket_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            bucket_name: bucket_name.into(),
            success: false,
            error: Some(error.into()),
            uploaded: 0,
            skipped_existing: 0,
            failed_files: Vec::new(),
        }
    }
}

/// Dry-run view of one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketPreview {
    pub bucket: String,
    pub bucket_exists: bool,
    pub local_files: usize,
    pub existing_remote: usize,
    pub to_upload: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
