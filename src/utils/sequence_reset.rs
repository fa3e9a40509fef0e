// restoretool/src/utils/sequence_reset.rs
use std::time::Duration;

use serde::Serialize;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::restore::session::SqlSession;
use crate::utils::{quote_ident, quote_literal};

/// Sequences owned by columns of one schema, with their table and column.
/// `quote_ident` is applied server-side so the names can be spliced back in.
const OWNED_SEQUENCES_QUERY: &str = r#"
    SELECT
        quote_ident(nsp.nspname) || '.' || quote_ident(seq.relname),
        tab.relname::text,
        attr.attname::text
    FROM
        pg_class seq
    JOIN
        pg_depend dep ON dep.objid = seq.oid AND dep.deptype IN ('a', 'i')
    JOIN
        pg_class tab ON dep.refobjid = tab.oid
    JOIN
        pg_attribute attr ON dep.refobjid = attr.attrelid AND dep.refobjsubid = attr.attnum
    JOIN
        pg_namespace nsp ON seq.relnamespace = nsp.oid
    WHERE
        seq.relkind = 'S'
        AND tab.relkind IN ('r', 'p')
        AND nsp.nspname = $1
    ORDER BY
        2, 3
"#;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceResetOutcome {
    pub reset: usize,
    pub errors: Vec<String>,
    /// The reset was cut off mid-flight; its session may still be busy.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub timed_out: bool,
}

/// Moves every column-owned sequence in `schema` past the column's current
/// maximum, so inserts after a restore do not collide with restored ids.
/// Per-sequence failures are collected, never raised.
pub async fn reset_all_sequences<S: SqlSession + ?Sized>(
    session: &mut S,
    schema: &str,
) -> SequenceResetOutcome {
    info!("🔄 Resetting sequences in schema {}", schema);
    let mut outcome = SequenceResetOutcome::default();

    let sequences = match session.query_text(OWNED_SEQUENCES_QUERY, &[schema]).await {
        Ok(rows) => rows,
        Err(e) => {
            outcome.errors.push(format!("could not list sequences: {}", e));
            return outcome;
        }
    };
    if sequences.is_empty() {
        info!("ℹ️  No owned sequences found in schema {}", schema);
        return outcome;
    }

    for row in sequences {
        let mut cells = row.into_iter();
        let (Some(Some(sequence)), Some(Some(table)), Some(Some(column))) =
            (cells.next(), cells.next(), cells.next())
        else {
            continue;
        };

        let sql = format!(
            "SELECT setval({}, COALESCE((SELECT MAX({}) FROM {}.{}), 0) + 1, false)",
            quote_literal(&sequence),
            quote_ident(&column),
            quote_ident(schema),
            quote_ident(&table)
        );
        match session.execute(&sql).await {
            Ok(_) => {
                info!("✓ Reset sequence {} (table: {}, column: {})", sequence, table, column);
                outcome.reset += 1;
            }
            Err(e) => {
                warn!("⚠️  Failed to reset sequence {}: {}", sequence, e);
                outcome.errors.push(format!("{}: {}", sequence, e));
            }
        }
    }

    info!(
        "✅ Sequence reset completed: {} successful, {} errors",
        outcome.reset,
        outcome.errors.len()
    );
    outcome
}

/// [`reset_all_sequences`] bounded by `limit`.
pub async fn reset_sequences_with_timeout<S: SqlSession + ?Sized>(
    session: &mut S,
    schema: &str,
    limit: Duration,
) -> SequenceResetOutcome {
    match timeout(limit, reset_all_sequences(session, schema)).await {
        Ok(outcome) => outcome,
        Err(_) => SequenceResetOutcome {
            reset: 0,
            errors: vec![format!(
                "sequence reset timed out after {} seconds",
                limit.as_secs()
            )],
            timed_out: true,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::restore::testing::FakeDatabase;

    #[tokio::test]
    async fn test_resets_each_owned_sequence() {
        let db = FakeDatabase::new();
        db.with_sequence("public.users_id_seq", "users", "id");
        db.with_sequence("public.\"Orders_id_seq\"", "Orders", "id");
        db.fail_on("\"Orders\"", Some("42501"), "permission denied");
        let mut session = db.session();

        let outcome = reset_all_sequences(&mut session, "public").await;

        assert_eq!(outcome.reset, 1);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(
            db.executed_matching("setval")[0],
            "SELECT setval('public.users_id_seq', COALESCE((SELECT MAX(\"id\") FROM \"public\".\"users\"), 0) + 1, false)"
        );
    }

    #[tokio::test]
    async fn test_no_sequences_is_quiet() {
        let db = FakeDatabase::new();
        let mut session = db.session();
        let outcome = reset_sequences_with_timeout(&mut session, "public", Duration::from_secs(5)).await;
        assert_eq!(outcome, SequenceResetOutcome::default());
        assert!(db.executed().is_empty());
    }

    #[tokio::test]
    async fn test_stalled_reset_is_cut_off() {
        let db = FakeDatabase::new();
        db.with_sequence("public.users_id_seq", "users", "id");
        db.stall_on("pg_depend");
        let mut session = db.session();

        let outcome = reset_sequences_with_timeout(&mut session, "public", Duration::from_millis(20)).await;

        assert!(outcome.timed_out);
        assert_eq!(outcome.reset, 0);
        assert_eq!(outcome.errors, vec!["sequence reset timed out after 0 seconds".to_string()]);
        assert!(db.executed_matching("setval").is_empty());
    }
}
