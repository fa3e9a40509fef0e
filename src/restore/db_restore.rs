// restoretool/src/restore/db_restore.rs
use tracing::{debug, info, warn};

use super::session::{
    Connector, SqlSession, begin_relaxed, commit, execute_in_savepoint, rollback_quietly,
};
use super::summary::RestoreSummary;
use crate::errors::{DbFailure, RestoreError, Result};
use crate::sql::{SqlStatement, prepare_script, repair_statement};
use crate::utils::{quote_qualified, truncate_for_log};

const LOG_STATEMENT_CHARS: usize = 120;

/// Normalizes a whole dump and replays it on a fresh connection.
///
/// # Arguments
/// * `connector` - Source of the target connection; the session is released on return.
/// * `script` - Raw dump text.
/// * `schema` - Schema placed on the search path for the replay transaction.
pub async fn replay_script<C: Connector>(
    connector: &C,
    script: &str,
    schema: &str,
) -> Result<RestoreSummary> {
    let (statements, normalized) = prepare_script(script);
    info!(
        statements = statements.len(),
        leaked_conversation = normalized.leaked_conversation,
        "Prepared dump for replay"
    );
    let mut session = connector.connect().await?;
    replay_statements(&mut session, &statements, schema).await
}

/// Executes statements in order inside one transaction.
///
/// A failure that means "already applied" is counted as skipped. Any other
/// failure gets one repair pass and one retry; if that still fails the whole
/// transaction is rolled back and every statement from the failing one on is
/// counted as failed.
pub async fn replay_statements<S: SqlSession + ?Sized>(
    session: &mut S,
    statements: &[SqlStatement],
    schema: &str,
) -> Result<RestoreSummary> {
    let mut summary = RestoreSummary::with_total(statements.len());
    if statements.is_empty() {
        return Ok(summary);
    }

    begin_relaxed(session, schema).await?;

    for (position, statement) in statements.iter().enumerate() {
        if statement.is_comment_only() {
            summary.skipped += 1;
            continue;
        }

        match run_statement(session, statement).await {
            StepOutcome::Applied => summary.success += 1,
            StepOutcome::AlreadyApplied(failure) => {
                debug!(
                    index = statement.index,
                    error = %failure,
                    "Statement already applied, skipping"
                );
                summary.skipped += 1;
            }
            StepOutcome::Failed(failure) => {
                let remaining = statements.len() - position;
                warn!(
                    index = statement.index,
                    statement = %truncate_for_log(&statement.text, LOG_STATEMENT_CHARS),
                    error = %failure,
                    "Statement failed after repair; rolling back the replay"
                );
                summary.record_error(statement.index, failure.message.clone());
                summary.failed += remaining;
                summary.rolled_back = true;
                rollback_quietly(session).await;
                return Ok(summary);
            }
        }
    }

    if let Err(failure) = commit(session).await {
        warn!(error = %failure, "COMMIT failed; replay rolled back");
        rollback_quietly(session).await;
        summary.record_error(statements.len(), format!("commit failed: {}", failure));
        summary.rolled_back = true;
        // Nothing reached the target.
        summary.failed += summary.success;
        summary.success = 0;
        return Ok(summary);
    }

    info!(
        success = summary.success,
        skipped = summary.skipped,
        "✓ Replay committed"
    );
    debug_assert!(summary.is_balanced());
    Ok(summary)
}

enum StepOutcome {
    Applied,
    AlreadyApplied(DbFailure),
    Failed(DbFailure),
}

async fn run_statement<S: SqlSession + ?Sized>(session: &mut S, statement: &SqlStatement) -> StepOutcome {
    let failure = match execute_in_savepoint(session, &statement.text).await {
        Ok(_) => return StepOutcome::Applied,
        Err(failure) if failure.is_already_applied() => return StepOutcome::AlreadyApplied(failure),
        Err(failure) => failure,
    };

    let repaired = repair_statement(&statement.text);
    if repaired == statement.text {
        return StepOutcome::Failed(failure);
    }
    debug!(index = statement.index, "Retrying statement after repair");
    match execute_in_savepoint(session, &repaired).await {
        Ok(_) => StepOutcome::Applied,
        Err(retry_failure) if retry_failure.is_already_applied() => {
            StepOutcome::AlreadyApplied(retry_failure)
        }
        Err(retry_failure) => StepOutcome::Failed(retry_failure),
    }
}

/// Lists the base tables of `schema`.
pub async fn list_base_tables<S: SqlSession + ?Sized>(
    session: &mut S,
    schema: &str,
) -> std::result::Result<Vec<String>, DbFailure> {
    let rows = session
        .query_text(
            "SELECT table_name::text FROM information_schema.tables \
             WHERE table_schema = $1 AND table_type = 'BASE TABLE' ORDER BY table_name",
            &[schema],
        )
        .await?;
    Ok(rows
        .into_iter()
        .filter_map(|row| row.into_iter().next().flatten())
        .collect())
}

/// Empties `tables` in one transaction, resetting identities and cascading
/// to dependents. An empty list is a no-op.
pub async fn truncate_tables<C: Connector>(
    connector: &C,
    schema: &str,
    tables: &[String],
) -> Result<usize> {
    if tables.is_empty() {
        return Ok(0);
    }
    let mut session = connector.connect().await?;
    truncate_in_transaction(&mut session, schema, tables).await?;
    Ok(tables.len())
}

/// Overwrite mode for SQL dumps: empties every base table of `schema`.
pub async fn truncate_all_tables<C: Connector>(connector: &C, schema: &str) -> Result<usize> {
    let mut session = connector.connect().await?;
    let tables = list_base_tables(&mut session, schema).await?;
    if tables.is_empty() {
        info!(schema = %schema, "No tables to truncate");
        return Ok(0);
    }
    truncate_in_transaction(&mut session, schema, &tables).await?;
    Ok(tables.len())
}

async fn truncate_in_transaction<S: SqlSession + ?Sized>(
    session: &mut S,
    schema: &str,
    tables: &[String],
) -> Result<()> {
    let targets = tables
        .iter()
        .map(|t| quote_qualified(schema, t))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!("TRUNCATE TABLE {} RESTART IDENTITY CASCADE", targets);

    begin_relaxed(session, schema).await?;
    if let Err(failure) = session.execute(&sql).await {
        rollback_quietly(session).await;
        return Err(RestoreError::Database(failure));
    }
    commit(session).await?;
    info!(tables = tables.len(), "✓ Truncated target tables");
    Ok(())
}
