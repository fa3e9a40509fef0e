// restoretool/src/restore/verification.rs
use tracing::{info, warn};

use super::package::TableEntry;
use super::session::SqlSession;
use crate::config::RestoreMode;
use crate::utils::quote_qualified;

/// Compares live row counts against the manifest after an NDJSON restore.
///
/// Returns one warning per mismatch. In append mode a table may legitimately
/// hold more rows than the snapshot, so only shortfalls are reported; in
/// overwrite mode any difference is.
pub async fn verify_row_counts<S: SqlSession + ?Sized>(
    session: &mut S,
    schema: &str,
    tables: &[TableEntry],
    mode: RestoreMode,
) -> Vec<String> {
    info!("Verifying restored row counts for {} tables", tables.len());
    let mut warnings = Vec::new();

    for entry in tables {
        let sql = format!(
            "SELECT count(*)::text FROM {}",
            quote_qualified(schema, &entry.name)
        );
        let actual = match session.query_text(&sql, &[]).await {
            Ok(rows) => rows
                .first()
                .and_then(|row| row.first().cloned().flatten())
                .and_then(|text| text.parse::<u64>().ok()),
            Err(e) => {
                warnings.push(format!("{}: could not count rows: {}", entry.name, e));
                continue;
            }
        };
        let Some(actual) = actual else {
            warnings.push(format!("{}: row count unreadable", entry.name));
            continue;
        };

        let mismatch = match mode {
            RestoreMode::Append => actual < entry.rows,
            RestoreMode::Overwrite => actual != entry.rows,
        };
        if mismatch {
            warnings.push(format!(
                "{}: {} rows in target, manifest lists {}",
                entry.name, actual, entry.rows
            ));
        }
    }

    if warnings.is_empty() {
        info!("✓ Row counts match the manifest");
    } else {
        for w in &warnings {
            warn!("{}", w);
        }
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::restore::testing::FakeDatabase;

    fn entry(name: &str, rows: u64) -> TableEntry {
        TableEntry {
            name: name.to_string(),
            data_file: format!("data/{}.ndjson", name),
            rows,
            columns: 1,
        }
    }

    #[tokio::test]
    async fn test_append_tolerates_surplus() {
        let db = FakeDatabase::new();
        db.with_row_count("users", 12);
        db.with_row_count("orders", 3);
        let mut session = db.session();

        let warnings = verify_row_counts(
            &mut session,
            "public",
            &[entry("users", 10), entry("orders", 5)],
            RestoreMode::Append,
        )
        .await;
        assert_eq!(warnings, vec!["orders: 3 rows in target, manifest lists 5".to_string()]);
    }

    #[tokio::test]
    async fn test_overwrite_requires_exact_counts() {
        let db = FakeDatabase::new();
        db.with_row_count("users", 12);
        let mut session = db.session();

        let warnings =
            verify_row_counts(&mut session, "public", &[entry("users", 10)], RestoreMode::Overwrite).await;
        assert_eq!(warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_query_failure_is_a_warning() {
        let db = FakeDatabase::new();
        db.fail_on("count(*)", Some("42P01"), "relation does not exist");
        let mut session = db.session();

        let warnings =
            verify_row_counts(&mut session, "public", &[entry("ghost", 1)], RestoreMode::Append).await;
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].starts_with("ghost: could not count rows"));
    }
}
