// restoretool/src/restore/logic.rs
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use super::db_restore::{replay_script, truncate_all_tables};
use super::ndjson::{NdjsonOptions, restore_ndjson};
use super::package::{BackupPackage, DatabaseSource, SCHEMA_FILE, TableEntry};
use super::session::{Connector, PgConnector};
use super::summary::RestoreSummary;
use super::verification::verify_row_counts;
use crate::config::{AppConfig, RestoreConfig, RestoreMode};
use crate::errors::Result;
use crate::sql::prepare_script;
use crate::storage::s3::S3Store;
use crate::storage::{BucketPreview, BucketReport, ObjectStore, plan_storage, restore_storage};
use crate::utils::redact_url;
use crate::utils::sequence_reset::{SequenceResetOutcome, reset_sequences_with_timeout};

const SEQUENCE_RESET_TIMEOUT: Duration = Duration::from_secs(60);

/// Where a phase ended up. Each phase is reported on its own; one failing
/// never undoes the other.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum PhaseReport<T> {
    NotConfigured,
    NothingToRestore,
    Completed { result: T },
    Failed { error: String },
}

#[cfg(test)]
impl<T> PhaseReport<T> {
    pub fn completed(&self) -> Option<&T> {
        match self {
            PhaseReport::Completed { result } => Some(result),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    Ndjson,
    Sql,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseOutcome {
    pub source: DatabaseKind,
    pub summary: RestoreSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequences: Option<SequenceResetOutcome>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    pub backup_path: String,
    pub restore_mode: RestoreMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub database: PhaseReport<DatabaseOutcome>,
    pub storage: PhaseReport<Vec<BucketReport>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "source", rename_all = "camelCase")]
pub enum DatabasePreview {
    Ndjson {
        #[serde(skip_serializing_if = "Option::is_none")]
        version: Option<serde_json::Value>,
        tables: Vec<TableEntry>,
        /// `None` when the schema script is missing or unreadable.
        schema_statements: Option<usize>,
    },
    Sql {
        file: String,
        statements: usize,
        unterminated_tail: bool,
        leaked_conversation: bool,
    },
    Absent,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewReport {
    pub backup_path: String,
    pub database: DatabasePreview,
    pub storage: PhaseReport<Vec<BucketPreview>>,
}

async fn connect_targets(
    app_config: &AppConfig,
    restore_config: &RestoreConfig,
) -> (Option<PgConnector>, Option<Arc<dyn ObjectStore>>) {
    let connector = match &restore_config.target_db_url {
        Some(url) => {
            info!("Restore target: {}", redact_url(url));
            Some(PgConnector::new(url.clone()))
        }
        None => {
            warn!("⚠️  target_database_url is not set; database phase will be skipped");
            None
        }
    };
    let store: Option<Arc<dyn ObjectStore>> = match &app_config.spaces_config {
        Some(spaces_config) => Some(Arc::new(S3Store::from_config(spaces_config).await)),
        None => None,
    };
    (connector, store)
}

/// Opens the configured backup and restores it into the configured targets.
pub async fn perform_restore_orchestration(
    app_config: &AppConfig,
    restore_config: &RestoreConfig,
) -> anyhow::Result<RestoreReport> {
    let package = BackupPackage::open(&restore_config.backup_path).with_context(|| {
        format!(
            "Failed to open backup at {}",
            restore_config.backup_path.display()
        )
    })?;
    let (connector, store) = connect_targets(app_config, restore_config).await;
    Ok(restore_package(&package, connector.as_ref(), store, restore_config).await)
}

/// Runs the database and storage phases side by side.
pub async fn restore_package<C: Connector>(
    package: &BackupPackage,
    connector: Option<&C>,
    store: Option<Arc<dyn ObjectStore>>,
    config: &RestoreConfig,
) -> RestoreReport {
    let started_at = Utc::now();
    info!(mode = %config.restore_mode, "🔄 Restoring backup {}", package.root.display());

    let (database, storage) = tokio::join!(
        database_phase(package, connector, config),
        storage_phase(package, store, config),
    );

    let report = RestoreReport {
        backup_path: package.root.display().to_string(),
        restore_mode: config.restore_mode,
        started_at,
        finished_at: Utc::now(),
        database,
        storage,
    };
    info!(
        elapsed_ms = (report.finished_at - report.started_at).num_milliseconds(),
        "✅ Restore finished"
    );
    report
}

async fn database_phase<C: Connector>(
    package: &BackupPackage,
    connector: Option<&C>,
    config: &RestoreConfig,
) -> PhaseReport<DatabaseOutcome> {
    let Some(connector) = connector else {
        return PhaseReport::NotConfigured;
    };

    let source = package.database_source();
    let (kind, result) = match source {
        DatabaseSource::Absent => {
            info!("ℹ️  Backup holds no database snapshot");
            return PhaseReport::NothingToRestore;
        }
        DatabaseSource::Ndjson(manifest) => {
            let options = NdjsonOptions {
                mode: config.restore_mode,
                schema: config.schema.clone(),
                batch_size: config.batch_size,
            };
            (
                DatabaseKind::Ndjson,
                restore_ndjson(connector, package, manifest, &options).await,
            )
        }
        DatabaseSource::SqlDump(path) => (DatabaseKind::Sql, restore_sql_dump(connector, path, config).await),
    };

    let mut summary = match result {
        Ok(summary) => summary,
        Err(e) => {
            error!("❌ Database phase failed: {}", e);
            return PhaseReport::Failed { error: e.to_string() };
        }
    };

    let verify_tables = match source {
        DatabaseSource::Ndjson(manifest) if config.verify_row_counts => Some(manifest.tables.as_slice()),
        _ => None,
    };
    let sequences = if summary.rolled_back {
        None
    } else {
        post_restore_checks(connector, config, verify_tables, SEQUENCE_RESET_TIMEOUT, &mut summary).await
    };

    info!(
        total = summary.total,
        success = summary.success,
        skipped = summary.skipped,
        failed = summary.failed,
        rolled_back = summary.rolled_back,
        "Database phase finished"
    );
    PhaseReport::Completed {
        result: DatabaseOutcome {
            source: kind,
            summary,
            sequences,
        },
    }
}

/// Sequence reset and row-count verification on a connection of their own.
/// A reset that timed out leaves its session mid-query, so verification
/// reconnects instead of queueing behind it.
async fn post_restore_checks<C: Connector>(
    connector: &C,
    config: &RestoreConfig,
    verify_tables: Option<&[TableEntry]>,
    reset_limit: Duration,
    summary: &mut RestoreSummary,
) -> Option<SequenceResetOutcome> {
    if !config.reset_sequences && verify_tables.is_none() {
        return None;
    }
    let mut session = match connector.connect().await {
        Ok(session) => session,
        Err(e) => {
            summary.warn(format!("post-restore checks skipped: {}", e));
            return None;
        }
    };

    let mut sequences = None;
    if config.reset_sequences {
        let outcome = reset_sequences_with_timeout(&mut session, &config.schema, reset_limit).await;
        summary
            .warnings
            .extend(outcome.errors.iter().map(|e| format!("sequence reset: {}", e)));
        if outcome.timed_out && verify_tables.is_some() {
            match connector.connect().await {
                Ok(fresh) => session = fresh,
                Err(e) => {
                    summary.warn(format!("row count verification skipped: {}", e));
                    return Some(outcome);
                }
            }
        }
        sequences = Some(outcome);
    }
    if let Some(tables) = verify_tables {
        let mismatches = verify_row_counts(&mut session, &config.schema, tables, config.restore_mode).await;
        summary.warnings.extend(mismatches);
    }
    sequences
}

async fn restore_sql_dump<C: Connector>(
    connector: &C,
    path: &Path,
    config: &RestoreConfig,
) -> Result<RestoreSummary> {
    let bytes = tokio::fs::read(path).await?;
    let script = String::from_utf8_lossy(&bytes);
    info!("🔄 Replaying SQL dump {}", path.display());

    let mut truncate_warning = None;
    if config.restore_mode == RestoreMode::Overwrite {
        match truncate_all_tables(connector, &config.schema).await {
            Ok(count) => info!("✓ Truncated {} tables before overwrite", count),
            Err(e) => {
                truncate_warning = Some(format!(
                    "Truncate before overwrite failed, continuing in append fashion: {}",
                    e
                ))
            }
        }
    }

    let mut summary = replay_script(connector, &script, &config.schema).await?;
    if let Some(message) = truncate_warning {
        summary.warn(message);
    }
    Ok(summary)
}

async fn storage_phase(
    package: &BackupPackage,
    store: Option<Arc<dyn ObjectStore>>,
    config: &RestoreConfig,
) -> PhaseReport<Vec<BucketReport>> {
    let Some(storage_dir) = &package.storage_dir else {
        return PhaseReport::NothingToRestore;
    };
    let Some(store) = store else {
        warn!("⚠️  Backup has a storage snapshot but s3_storage is not configured");
        return PhaseReport::NotConfigured;
    };

    match restore_storage(store, storage_dir, &config.storage_options()).await {
        Ok(buckets) => {
            let failed = buckets.iter().filter(|b| !b.success).count();
            info!(buckets = buckets.len(), failed, "Storage phase finished");
            PhaseReport::Completed { result: buckets }
        }
        Err(e) => {
            error!("❌ Storage phase failed: {}", e);
            PhaseReport::Failed { error: e.to_string() }
        }
    }
}

/// Reports what a restore would do without touching either target.
pub async fn perform_preview_orchestration(
    app_config: &AppConfig,
    restore_config: &RestoreConfig,
) -> anyhow::Result<PreviewReport> {
    let package = BackupPackage::open(&restore_config.backup_path).with_context(|| {
        format!(
            "Failed to open backup at {}",
            restore_config.backup_path.display()
        )
    })?;
    let store: Option<Arc<dyn ObjectStore>> = match &app_config.spaces_config {
        Some(spaces_config) => Some(Arc::new(S3Store::from_config(spaces_config).await)),
        None => None,
    };
    preview_package(&package, store, restore_config)
        .await
        .context("Failed to build restore preview")
}

pub async fn preview_package(
    package: &BackupPackage,
    store: Option<Arc<dyn ObjectStore>>,
    config: &RestoreConfig,
) -> Result<PreviewReport> {
    let database = match package.database_source() {
        DatabaseSource::Ndjson(manifest) => {
            let schema_statements = match tokio::fs::read(package.schema_script_path()).await {
                Ok(bytes) => Some(prepare_script(&String::from_utf8_lossy(&bytes)).0.len()),
                Err(e) => {
                    warn!("⚠️  {} unreadable: {}", SCHEMA_FILE, e);
                    None
                }
            };
            DatabasePreview::Ndjson {
                version: manifest.version.clone(),
                tables: manifest.tables.clone(),
                schema_statements,
            }
        }
        DatabaseSource::SqlDump(path) => {
            let bytes = tokio::fs::read(path).await?;
            let (statements, normalized) = prepare_script(&String::from_utf8_lossy(&bytes));
            DatabasePreview::Sql {
                file: path.display().to_string(),
                statements: statements.len(),
                unterminated_tail: statements.last().is_some_and(|s| !s.terminated),
                leaked_conversation: normalized.leaked_conversation,
            }
        }
        DatabaseSource::Absent => DatabasePreview::Absent,
    };

    let storage = match (&package.storage_dir, store) {
        (None, _) => PhaseReport::NothingToRestore,
        (Some(_), None) => PhaseReport::NotConfigured,
        (Some(dir), Some(store)) => match plan_storage(store, dir, &config.storage_options()).await {
            Ok(previews) => PhaseReport::Completed { result: previews },
            Err(e) => PhaseReport::Failed { error: e.to_string() },
        },
    };

    Ok(PreviewReport {
        backup_path: package.root.display().to_string(),
        database,
        storage,
    })
}
