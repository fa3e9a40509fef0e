// restoretool/src/restore/session.rs
//! The connection seam between the restore logic and Postgres.
//!
//! Replay and NDJSON loading only ever talk to a [`SqlSession`], so tests can
//! run them against an in-memory fake. A session is released when it is
//! dropped; nothing holds a connection beyond the operation that acquired it.

use async_trait::async_trait;
use sqlx::{Connection, Executor, PgConnection, Row};

use crate::errors::{DbFailure, RestoreError, Result};
use crate::utils::{quote_ident, redact_url};

/// Every column read back as text.
pub type TextRow = Vec<Option<String>>;

#[async_trait]
pub trait SqlSession: Send {
    /// Runs one statement (or a statement list) without parameters.
    async fn execute(&mut self, sql: &str) -> std::result::Result<u64, DbFailure>;

    /// Runs a parameterized query whose result columns are all text.
    async fn query_text(
        &mut self,
        sql: &str,
        params: &[&str],
    ) -> std::result::Result<Vec<TextRow>, DbFailure>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    type Session: SqlSession;

    async fn connect(&self) -> Result<Self::Session>;
}

/// Opens one Postgres connection per call.
#[derive(Debug, Clone)]
pub struct PgConnector {
    url: String,
}

impl PgConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Session = PgSession;

    async fn connect(&self) -> Result<PgSession> {
        let conn = PgConnection::connect(&self.url).await.map_err(|e| {
            RestoreError::Connection(format!("{}: {}", redact_url(&self.url), e))
        })?;
        Ok(PgSession { conn })
    }
}

pub struct PgSession {
    conn: PgConnection,
}

#[async_trait]
impl SqlSession for PgSession {
    async fn execute(&mut self, sql: &str) -> std::result::Result<u64, DbFailure> {
        // Plain &str goes over the simple query protocol, so multi-statement
        // text and session commands behave as they would in psql.
        let done = self.conn.execute(sql).await?;
        Ok(done.rows_affected())
    }

    async fn query_text(
        &mut self,
        sql: &str,
        params: &[&str],
    ) -> std::result::Result<Vec<TextRow>, DbFailure> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = query.bind(*param);
        }
        let rows = query.fetch_all(&mut self.conn).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut values = Vec::with_capacity(row.len());
            for idx in 0..row.len() {
                values.push(row.try_get::<Option<String>, _>(idx)?);
            }
            out.push(values);
        }
        Ok(out)
    }
}

const SAVEPOINT: &str = "restore_step";

/// Opens a transaction with the settings every restore write runs under:
/// row security off, deferred constraints and the target schema on the
/// search path. Settings the role may not change are logged and ignored.
pub async fn begin_relaxed<S: SqlSession + ?Sized>(
    session: &mut S,
    schema: &str,
) -> std::result::Result<(), DbFailure> {
    session.execute("BEGIN").await?;
    let settings = [
        "SET LOCAL row_security = off".to_string(),
        "SET CONSTRAINTS ALL DEFERRED".to_string(),
        format!("SET LOCAL search_path = {}", quote_ident(schema)),
        "SET LOCAL standard_conforming_strings = on".to_string(),
    ];
    for setting in &settings {
        if let Err(e) = execute_in_savepoint(session, setting).await {
            tracing::debug!(setting = %setting, error = %e, "Session setting not applied");
        }
    }
    Ok(())
}

/// Runs `sql` inside a savepoint so a failure leaves the enclosing
/// transaction usable.
pub async fn execute_in_savepoint<S: SqlSession + ?Sized>(
    session: &mut S,
    sql: &str,
) -> std::result::Result<u64, DbFailure> {
    session.execute(&format!("SAVEPOINT {}", SAVEPOINT)).await?;
    match session.execute(sql).await {
        Ok(affected) => {
            session.execute(&format!("RELEASE SAVEPOINT {}", SAVEPOINT)).await?;
            Ok(affected)
        }
        Err(failure) => {
            if let Err(e) = session
                .execute(&format!("ROLLBACK TO SAVEPOINT {}", SAVEPOINT))
                .await
            {
                tracing::warn!(error = %e, "Could not roll back to savepoint");
            }
            Err(failure)
        }
    }
}

pub async fn commit<S: SqlSession + ?Sized>(session: &mut S) -> std::result::Result<(), DbFailure> {
    session.execute("COMMIT").await.map(|_| ())
}

/// Best-effort rollback; a connection that is already broken has nothing to undo.
pub async fn rollback_quietly<S: SqlSession + ?Sized>(session: &mut S) {
    if let Err(e) = session.execute("ROLLBACK").await {
        tracing::debug!(error = %e, "ROLLBACK failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::restore::testing::FakeDatabase;

    #[tokio::test]
    async fn test_savepoint_wraps_success_and_failure() -> anyhow::Result<()> {
        let db = FakeDatabase::new();
        db.fail_on("BAD", Some("22P02"), "invalid input");
        let mut session = db.session();

        execute_in_savepoint(&mut session, "GOOD").await?;
        let failure = execute_in_savepoint(&mut session, "BAD").await;
        assert!(failure.is_err());

        assert_eq!(
            db.executed(),
            vec![
                "SAVEPOINT restore_step",
                "GOOD",
                "RELEASE SAVEPOINT restore_step",
                "SAVEPOINT restore_step",
                "BAD",
                "ROLLBACK TO SAVEPOINT restore_step",
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_begin_relaxed_tolerates_rejected_settings() -> anyhow::Result<()> {
        let db = FakeDatabase::new();
        db.fail_on("row_security", Some("42501"), "permission denied");
        let mut session = db.session();

        begin_relaxed(&mut session, "app").await?;
        let executed = db.executed();
        assert_eq!(executed[0], "BEGIN");
        assert!(executed.contains(&"SET LOCAL search_path = \"app\"".to_string()));
        assert!(executed.contains(&"SET CONSTRAINTS ALL DEFERRED".to_string()));
        Ok(())
    }
}
