// restoretool/src/restore/testing.rs
//! In-memory stand-in for Postgres behind the session seam.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::session::{Connector, SqlSession, TextRow};
use crate::errors::{DbFailure, RestoreError, Result};
use crate::utils::quote_ident;

struct FailRule {
    needle: String,
    code: Option<String>,
    message: String,
    remaining: Option<usize>,
}

/// Shared state behind every fake session: a log of what was sent, failure
/// rules keyed by substring, and canned catalog answers.
#[derive(Default)]
pub struct FakeDatabase {
    executed: Mutex<Vec<String>>,
    queries: Mutex<Vec<String>>,
    rules: Mutex<Vec<FailRule>>,
    stalls: Mutex<Vec<String>>,
    columns: Mutex<HashMap<String, Vec<TextRow>>>,
    tables: Mutex<Vec<String>>,
    sequences: Mutex<Vec<TextRow>>,
    row_counts: Mutex<HashMap<String, i64>>,
    refuse_connections: AtomicBool,
    connections: AtomicUsize,
}

impl FakeDatabase {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn session(self: &Arc<Self>) -> FakeSession {
        FakeSession { db: Arc::clone(self) }
    }

    pub fn connector(self: &Arc<Self>) -> FakeConnector {
        FakeConnector { db: Arc::clone(self) }
    }

    /// Every statement containing `needle` fails.
    pub fn fail_on(&self, needle: &str, code: Option<&str>, message: &str) {
        self.push_rule(needle, code, message, None);
    }

    /// The next `times` statements containing `needle` fail.
    pub fn fail_times(&self, needle: &str, code: Option<&str>, message: &str, times: usize) {
        self.push_rule(needle, code, message, Some(times));
    }

    /// Queries containing `needle` never answer.
    pub fn stall_on(&self, needle: &str) {
        if let Ok(mut stalls) = self.stalls.lock() {
            stalls.push(needle.to_string());
        }
    }

    fn stalls(&self, sql: &str) -> bool {
        self.stalls
            .lock()
            .map(|stalls| stalls.iter().any(|needle| sql.contains(needle.as_str())))
            .unwrap_or(false)
    }

    fn push_rule(&self, needle: &str, code: Option<&str>, message: &str, remaining: Option<usize>) {
        if let Ok(mut rules) = self.rules.lock() {
            rules.push(FailRule {
                needle: needle.to_string(),
                code: code.map(str::to_string),
                message: message.to_string(),
                remaining,
            });
        }
    }

    /// Declares a table with `(column_name, data_type, udt_name)` columns.
    pub fn with_table(&self, table: &str, columns: &[(&str, &str, &str)]) {
        let rows = columns
            .iter()
            .map(|(name, data_type, udt)| {
                vec![
                    Some(name.to_string()),
                    Some(data_type.to_string()),
                    Some(udt.to_string()),
                ]
            })
            .collect();
        if let Ok(mut map) = self.columns.lock() {
            map.insert(table.to_string(), rows);
        }
        if let Ok(mut tables) = self.tables.lock() {
            tables.push(table.to_string());
        }
    }

    pub fn with_sequence(&self, sequence: &str, table: &str, column: &str) {
        if let Ok(mut sequences) = self.sequences.lock() {
            sequences.push(vec![
                Some(sequence.to_string()),
                Some(table.to_string()),
                Some(column.to_string()),
            ]);
        }
    }

    pub fn with_row_count(&self, table: &str, count: i64) {
        if let Ok(mut counts) = self.row_counts.lock() {
            counts.insert(table.to_string(), count);
        }
    }

    pub fn refuse_connections(&self) {
        self.refuse_connections.store(true, Ordering::SeqCst);
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().map(|log| log.clone()).unwrap_or_default()
    }

    pub fn executed_matching(&self, needle: &str) -> Vec<String> {
        self.executed()
            .into_iter()
            .filter(|sql| sql.contains(needle))
            .collect()
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().map(|log| log.clone()).unwrap_or_default()
    }

    fn check_rules(&self, sql: &str) -> std::result::Result<(), DbFailure> {
        let mut rules = match self.rules.lock() {
            Ok(rules) => rules,
            Err(_) => return Ok(()),
        };
        for rule in rules.iter_mut() {
            if !sql.contains(&rule.needle) {
                continue;
            }
            match rule.remaining {
                Some(0) => continue,
                Some(n) => rule.remaining = Some(n - 1),
                None => {}
            }
            return Err(DbFailure::new(rule.code.as_deref(), rule.message.clone()));
        }
        Ok(())
    }

    fn answer(&self, sql: &str, params: &[&str]) -> Vec<TextRow> {
        if sql.contains("information_schema.columns") {
            let table = params.get(1).copied().unwrap_or_default();
            return self
                .columns
                .lock()
                .ok()
                .and_then(|map| map.get(table).cloned())
                .unwrap_or_default();
        }
        if sql.contains("information_schema.tables") {
            return self
                .tables
                .lock()
                .map(|tables| tables.iter().map(|t| vec![Some(t.clone())]).collect())
                .unwrap_or_default();
        }
        if sql.contains("pg_depend") {
            return self.sequences.lock().map(|s| s.clone()).unwrap_or_default();
        }
        if sql.contains("count(*)") {
            if let Ok(counts) = self.row_counts.lock() {
                for (table, count) in counts.iter() {
                    if sql.contains(&quote_ident(table)) {
                        return vec![vec![Some(count.to_string())]];
                    }
                }
            }
            return vec![vec![Some("0".to_string())]];
        }
        Vec::new()
    }
}

pub struct FakeSession {
    db: Arc<FakeDatabase>,
}

#[async_trait]
impl SqlSession for FakeSession {
    async fn execute(&mut self, sql: &str) -> std::result::Result<u64, DbFailure> {
        if let Ok(mut log) = self.db.executed.lock() {
            log.push(sql.to_string());
        }
        self.db.check_rules(sql)?;
        Ok(1)
    }

    async fn query_text(
        &mut self,
        sql: &str,
        params: &[&str],
    ) -> std::result::Result<Vec<TextRow>, DbFailure> {
        if let Ok(mut log) = self.db.queries.lock() {
            log.push(sql.to_string());
        }
        if self.db.stalls(sql) {
            std::future::pending::<()>().await;
        }
        self.db.check_rules(sql)?;
        Ok(self.db.answer(sql, params))
    }
}

pub struct FakeConnector {
    db: Arc<FakeDatabase>,
}

#[async_trait]
impl Connector for FakeConnector {
    type Session = FakeSession;

    async fn connect(&self) -> Result<FakeSession> {
        if self.db.refuse_connections.load(Ordering::SeqCst) {
            return Err(RestoreError::Connection("connection refused".to_string()));
        }
        self.db.connections.fetch_add(1, Ordering::SeqCst);
        Ok(self.db.session())
    }
}
