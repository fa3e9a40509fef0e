// restoretool/src/restore/ndjson.rs
use std::collections::BTreeSet;
use std::path::Path;

use serde_json::{Map, Value};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use super::column_types::{ColumnTypeCache, ColumnTypeMap};
use super::db_restore::{replay_script, truncate_tables};
use super::encode::encode_value;
use super::package::{BackupPackage, Manifest, TableEntry};
use super::session::{Connector, SqlSession, begin_relaxed, commit, rollback_quietly};
use super::summary::{RestoreSummary, TableReport};
use crate::config::RestoreMode;
use crate::errors::{DbFailure, RestoreError, Result};
use crate::utils::{quote_ident, quote_qualified};

type Row = Map<String, Value>;

#[derive(Debug, Clone)]
pub struct NdjsonOptions {
    pub mode: RestoreMode,
    pub schema: String,
    pub batch_size: usize,
}

/// Restores a manifest-described package: schema replay, optional
/// truncation, then each table in manifest order.
///
/// The summary counts tables, not statements. Only a failure to reach the
/// database for the schema step is returned as an error; everything after
/// that is recorded per table.
pub async fn restore_ndjson<C: Connector>(
    connector: &C,
    package: &BackupPackage,
    manifest: &Manifest,
    options: &NdjsonOptions,
) -> Result<RestoreSummary> {
    let mut summary = RestoreSummary::with_total(manifest.tables.len());

    let schema_path = package.schema_script_path();
    let schema_script = match tokio::fs::read_to_string(&schema_path).await {
        Ok(text) => text,
        Err(e) => {
            let reason = format!("schema script {} unreadable: {}", schema_path.display(), e);
            fail_all_tables(&mut summary, manifest, &reason);
            return Ok(summary);
        }
    };

    info!(tables = manifest.tables.len(), "🔄 Replaying schema script");
    let schema_summary = replay_script(connector, &schema_script, &options.schema).await?;
    if schema_summary.rolled_back {
        let reason = match schema_summary.first_errors.first() {
            Some(first) => RestoreError::Statement {
                index: first.index,
                message: first.message.clone(),
            }
            .to_string(),
            None => "schema replay rolled back".to_string(),
        };
        fail_all_tables(&mut summary, manifest, &format!("schema replay failed: {}", reason));
        summary.rolled_back = true;
        return Ok(summary);
    }
    if schema_summary.skipped > 0 {
        debug!(skipped = schema_summary.skipped, "Schema objects already present");
    }

    if options.mode == RestoreMode::Overwrite {
        let names: Vec<String> = manifest.tables.iter().map(|t| t.name.clone()).collect();
        if let Err(e) = truncate_tables(connector, &options.schema, &names).await {
            // Loading on top of existing rows is still better than loading nothing.
            summary.warn(format!("Truncate before overwrite failed, continuing in append fashion: {}", e));
        }
    }

    let mut cache = ColumnTypeCache::new(options.schema.clone());
    for (index, entry) in manifest.tables.iter().enumerate() {
        let report = match restore_table(connector, package, entry, &mut cache, options).await {
            Ok(report) => report,
            Err(e) => {
                warn!(table = %entry.name, error = %e, "Table restore failed");
                TableReport::failed(entry.name.clone(), e.to_string())
            }
        };
        if let Some(error) = &report.error {
            summary.record_error(index, format!("{}: {}", entry.name, error));
        }
        info!(
            table = %report.table,
            status = ?report.status,
            inserted = report.rows_inserted,
            skipped = report.rows_skipped,
            failed = report.rows_failed,
            malformed = report.lines_malformed,
            "Table processed"
        );
        summary.add_table(report);
    }

    debug_assert!(summary.is_balanced());
    Ok(summary)
}

fn fail_all_tables(summary: &mut RestoreSummary, manifest: &Manifest, reason: &str) {
    warn!("{}", reason);
    for (index, entry) in manifest.tables.iter().enumerate() {
        summary.record_error(index, format!("{}: {}", entry.name, reason));
        summary.add_table(TableReport::failed(entry.name.clone(), reason));
    }
}

/// Where one table's load currently stands.
struct TableLoad<C: Connector> {
    schema: String,
    qualified: String,
    session: Option<C::Session>,
    types: Option<ColumnTypeMap>,
    dropped_columns: BTreeSet<String>,
    report: TableReport,
}

async fn restore_table<C: Connector>(
    connector: &C,
    package: &BackupPackage,
    entry: &TableEntry,
    cache: &mut ColumnTypeCache,
    options: &NdjsonOptions,
) -> Result<TableReport> {
    let path = package.table_data_path(entry)?;
    let mut lines = open_lines(&path).await?;

    let mut load = TableLoad::<C> {
        schema: options.schema.clone(),
        qualified: quote_qualified(&options.schema, &entry.name),
        session: None,
        types: None,
        dropped_columns: BTreeSet::new(),
        report: TableReport::new(entry.name.clone()),
    };
    let mut batch: Vec<Row> = Vec::with_capacity(options.batch_size);
    let mut line_no = 0usize;

    while let Some(line) = lines.next_segment().await? {
        line_no += 1;
        let trimmed = line.trim_ascii();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_slice::<Value>(trimmed) {
            Ok(Value::Object(row)) => batch.push(row),
            Ok(_) => {
                warn!(table = %entry.name, line = line_no, "Skipping line that is not a JSON object");
                load.report.lines_malformed += 1;
            }
            Err(e) => {
                warn!(table = %entry.name, line = line_no, error = %e, "Skipping malformed line");
                load.report.lines_malformed += 1;
            }
        }
        if batch.len() >= options.batch_size {
            flush_batch(connector, &mut load, &entry.name, cache, &batch).await?;
            batch.clear();
        }
    }
    if !batch.is_empty() {
        flush_batch(connector, &mut load, &entry.name, cache, &batch).await?;
    }

    if !load.dropped_columns.is_empty() {
        warn!(
            table = %entry.name,
            columns = ?load.dropped_columns,
            "Dropped keys that are not columns of the target table"
        );
    }
    load.report.settle();
    Ok(load.report)
}

/// Raw lines, so a line with broken UTF-8 is one malformed record rather
/// than a read error for the whole file.
async fn open_lines(path: &Path) -> Result<tokio::io::Split<BufReader<File>>> {
    let file = File::open(path).await.map_err(|e| {
        RestoreError::Io(std::io::Error::new(
            e.kind(),
            format!("{}: {}", path.display(), e),
        ))
    })?;
    Ok(BufReader::new(file).split(b'\n'))
}

async fn flush_batch<C: Connector>(
    connector: &C,
    load: &mut TableLoad<C>,
    table: &str,
    cache: &mut ColumnTypeCache,
    rows: &[Row],
) -> Result<()> {
    if load.session.is_none() {
        load.session = Some(connector.connect().await?);
    }
    let Some(session) = load.session.as_mut() else {
        return Ok(());
    };
    if load.types.is_none() {
        load.types = Some(cache.resolve(session, table).await.clone());
    }
    let types = load.types.clone().unwrap_or_default();

    let columns = insert_columns(rows, &types, &mut load.dropped_columns);
    if columns.is_empty() {
        warn!(table = %table, rows = rows.len(), "Rows carry no known columns");
        load.report.rows_failed += rows.len() as u64;
        return Ok(());
    }

    let sql = build_insert(&load.qualified, &columns, rows, &types);
    match insert_in_transaction(session, &sql, &load.schema).await {
        Ok(()) => {
            load.report.rows_inserted += rows.len() as u64;
            return Ok(());
        }
        Err(e) => {
            debug!(table = %table, error = %e, "Batch insert failed, retrying row by row");
        }
    }

    for row in rows {
        let sql = build_insert(&load.qualified, &columns, std::slice::from_ref(row), &types);
        match insert_in_transaction(session, &sql, &load.schema).await {
            Ok(()) => load.report.rows_inserted += 1,
            Err(e) if e.is_already_applied() => load.report.rows_skipped += 1,
            Err(e) => {
                warn!(table = %table, error = %e, "Row insert failed");
                load.report.rows_failed += 1;
            }
        }
    }
    Ok(())
}

/// One insert in its own transaction under the restore session settings.
async fn insert_in_transaction<S: SqlSession + ?Sized>(
    session: &mut S,
    sql: &str,
    schema: &str,
) -> std::result::Result<(), DbFailure> {
    begin_relaxed(session, schema).await?;
    if let Err(e) = session.execute(sql).await {
        rollback_quietly(session).await;
        return Err(e);
    }
    if let Err(e) = commit(session).await {
        rollback_quietly(session).await;
        return Err(e);
    }
    Ok(())
}

/// Union of the batch's keys in sorted order. When the table's columns are
/// known, keys that are not columns are dropped and remembered in `dropped`.
fn insert_columns(rows: &[Row], types: &ColumnTypeMap, dropped: &mut BTreeSet<String>) -> Vec<String> {
    let keys: BTreeSet<&String> = rows.iter().flat_map(|row| row.keys()).collect();
    keys.into_iter()
        .filter(|key| {
            if types.is_empty() || types.contains(key) {
                true
            } else {
                dropped.insert((*key).clone());
                false
            }
        })
        .cloned()
        .collect()
}

fn build_insert(qualified: &str, columns: &[String], rows: &[Row], types: &ColumnTypeMap) -> String {
    let column_list = columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
    let tuples = rows
        .iter()
        .map(|row| {
            let values = columns
                .iter()
                .map(|column| match row.get(column) {
                    Some(value) => encode_value(value, types.get(column)),
                    None => "NULL".to_string(),
                })
                .collect::<Vec<_>>()
                .join(", ");
            format!("({})", values)
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("INSERT INTO {} ({}) VALUES {}", qualified, column_list, tuples)
}
