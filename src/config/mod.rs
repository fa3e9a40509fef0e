// restoretool/src/config/mod.rs
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::errors::RestoreError;
use crate::storage::StorageOptions;

pub const DEFAULT_BATCH_SIZE: usize = 500;
pub const DEFAULT_UPLOAD_CONCURRENCY: usize = 30;
pub const DEFAULT_UPLOAD_MAX_ATTEMPTS: usize = 3;
pub const DEFAULT_SCHEMA: &str = "public";

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonS3StorageConfig {
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
    pub force_path_style: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonRestoreOptions {
    pub restore_mode: Option<String>,
    pub incremental_storage: Option<bool>,
    pub overwrite_files: Option<bool>,
    pub batch_size: Option<usize>,
    pub upload_concurrency: Option<usize>,
    pub upload_max_attempts: Option<usize>,
    pub reset_sequences: Option<bool>,
    pub verify_row_counts: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub target_database_url: Option<String>,
    pub backup_path: Option<PathBuf>,
    pub database_schema: Option<String>,
    pub restore_options: Option<JsonRestoreOptions>,
    pub s3_storage: Option<JsonS3StorageConfig>,
}

// Application's internal configuration structs
#[derive(Debug, Clone)]
pub struct SpacesConfig {
    /// Absent for AWS proper; set for S3-compatible services.
    pub endpoint_url: Option<String>,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub force_path_style: bool,
}

/// Whether existing target data is cleared before loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RestoreMode {
    #[default]
    Append,
    Overwrite,
}

impl FromStr for RestoreMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "append" => Ok(RestoreMode::Append),
            "overwrite" => Ok(RestoreMode::Overwrite),
            other => Err(anyhow::anyhow!(
                "restore_mode must be 'append' or 'overwrite', got '{}'",
                other
            )),
        }
    }
}

impl fmt::Display for RestoreMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestoreMode::Append => write!(f, "append"),
            RestoreMode::Overwrite => write!(f, "overwrite"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestoreConfig {
    /// `None` leaves the database phase unconfigured.
    pub target_db_url: Option<String>,
    pub backup_path: PathBuf,
    pub schema: String,
    pub restore_mode: RestoreMode,
    pub incremental_storage: bool,
    pub overwrite_files: bool,
    pub batch_size: usize,
    pub upload_concurrency: usize,
    pub upload_max_attempts: usize,
    pub reset_sequences: bool,
    pub verify_row_counts: bool,
}

impl RestoreConfig {
    pub fn storage_options(&self) -> StorageOptions {
        StorageOptions {
            incremental: self.incremental_storage,
            overwrite_files: self.overwrite_files,
            concurrency: self.upload_concurrency,
            max_attempts: self.upload_max_attempts,
            retry_base_delay: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub operation: Option<OperationConfig>,
    pub spaces_config: Option<SpacesConfig>,
    pub raw_json_config: RawJsonConfig,
}

#[derive(Debug, Clone)]
pub enum OperationConfig {
    Restore(RestoreConfig),
    Preview(RestoreConfig),
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let mut raw_json_config: RawJsonConfig = serde_json::from_str(&config_content)
            .with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?;
        apply_env_overrides(&mut raw_json_config, |key| std::env::var(key).ok());
        Ok(Self::from_raw(raw_json_config))
    }

    pub fn from_raw(raw_json_config: RawJsonConfig) -> Self {
        let spaces_config = raw_json_config.s3_storage.as_ref().and_then(spaces_config_from_raw);
        AppConfig {
            operation: None, // filled by main once the operation is known
            spaces_config,
            raw_json_config,
        }
    }
}

fn spaces_config_from_raw(s3_raw: &JsonS3StorageConfig) -> Option<SpacesConfig> {
    let non_empty = |v: &Option<String>| v.as_ref().filter(|s| !s.trim().is_empty()).cloned();
    if let (Some(region), Some(access_key_id), Some(secret_access_key)) = (
        non_empty(&s3_raw.region),
        non_empty(&s3_raw.access_key_id),
        non_empty(&s3_raw.secret_access_key),
    ) {
        Some(SpacesConfig {
            endpoint_url: non_empty(&s3_raw.endpoint_url),
            region,
            access_key_id,
            secret_access_key,
            force_path_style: s3_raw.force_path_style.unwrap_or(false),
        })
    } else {
        if s3_raw.region.is_some()
            || s3_raw.access_key_id.is_some()
            || s3_raw.secret_access_key.is_some()
            || s3_raw.endpoint_url.is_some()
        {
            // Only warn when some S3 fields were provided
            tracing::warn!(
                "s3_storage is present in config.json but region, access_key_id or secret_access_key is missing or empty. Storage restore will be skipped."
            );
        }
        None
    }
}

/// `TARGET_DATABASE_URL` and `BACKUP_PATH` take precedence over the file.
pub fn apply_env_overrides<F>(raw: &mut RawJsonConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = lookup("TARGET_DATABASE_URL").filter(|v| !v.trim().is_empty()) {
        raw.target_database_url = Some(url);
    }
    if let Some(path) = lookup("BACKUP_PATH").filter(|v| !v.trim().is_empty()) {
        raw.backup_path = Some(PathBuf::from(path));
    }
}

pub fn load_restore_config_from_json(raw_config: &RawJsonConfig) -> Result<RestoreConfig> {
    let backup_path = raw_config
        .backup_path
        .as_ref()
        .context("backup_path must be set in config.json (or BACKUP_PATH) for restore")?
        .clone();

    if backup_path.to_string_lossy().trim().is_empty() {
        return Err(anyhow::anyhow!("backup_path cannot be empty in config.json."));
    }

    let target_db_url = raw_config
        .target_database_url
        .clone()
        .filter(|url| !url.trim().is_empty());
    if let Some(url) = &target_db_url {
        validate_database_url(url).context("target_database_url is not usable")?;
    }

    let schema = raw_config
        .database_schema
        .clone()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_SCHEMA.to_string());

    let opts = raw_config.restore_options.clone().unwrap_or_default();
    let restore_mode = match &opts.restore_mode {
        Some(mode) => mode.parse::<RestoreMode>()?,
        None => RestoreMode::Append,
    };

    let batch_size = at_least_one("batch_size", opts.batch_size, DEFAULT_BATCH_SIZE)?;
    let upload_concurrency =
        at_least_one("upload_concurrency", opts.upload_concurrency, DEFAULT_UPLOAD_CONCURRENCY)?;
    let upload_max_attempts =
        at_least_one("upload_max_attempts", opts.upload_max_attempts, DEFAULT_UPLOAD_MAX_ATTEMPTS)?;

    // An overwrite restore replaces stored objects as well as rows.
    let overwrite_files =
        restore_mode == RestoreMode::Overwrite || opts.overwrite_files.unwrap_or(false);

    Ok(RestoreConfig {
        target_db_url,
        backup_path,
        schema,
        restore_mode,
        incremental_storage: opts.incremental_storage.unwrap_or(false),
        overwrite_files,
        batch_size,
        upload_concurrency,
        upload_max_attempts,
        reset_sequences: opts.reset_sequences.unwrap_or(true),
        verify_row_counts: opts.verify_row_counts.unwrap_or(true),
    })
}

/// Only Postgres URLs are accepted; the scheme decides the driver.
fn validate_database_url(raw: &str) -> crate::errors::Result<()> {
    let url = url::Url::parse(raw)?;
    match url.scheme() {
        "postgres" | "postgresql" => Ok(()),
        other => Err(RestoreError::Config(format!(
            "unsupported database scheme '{}', expected postgres://",
            other
        ))),
    }
}

fn at_least_one(name: &str, value: Option<usize>, default: usize) -> Result<usize> {
    match value {
        Some(0) => Err(anyhow::anyhow!("{} must be at least 1 in config.json", name)),
        Some(v) => Ok(v),
        None => Ok(default),
    }
}
