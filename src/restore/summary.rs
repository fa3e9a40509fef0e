// restoretool/src/restore/summary.rs
use serde::Serialize;

/// Only the first few errors are kept; the counters carry the rest.
pub const MAX_REPORTED_ERRORS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexedError {
    pub index: usize,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TableStatus {
    Success,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableReport {
    pub table: String,
    pub status: TableStatus,
    pub rows_inserted: u64,
    pub rows_skipped: u64,
    pub rows_failed: u64,
    pub lines_malformed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TableReport {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            status: TableStatus::Skipped,
            rows_inserted: 0,
            rows_skipped: 0,
            rows_failed: 0,
            lines_malformed: 0,
            error: None,
        }
    }

    pub fn failed(table: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            status: TableStatus::Failed,
            error: Some(error.into()),
            ..Self::new(table)
        }
    }

    /// Status from the row counters: nothing valid or everything already
    /// present is `skipped`; nothing inserted but genuine failures is `failed`.
    pub fn settle(&mut self) {
        self.status = if self.rows_inserted > 0 {
            TableStatus::Success
        } else if self.rows_failed > 0 {
            TableStatus::Failed
        } else {
            TableStatus::Skipped
        };
    }
}

/// Outcome of one database phase. `total == success + skipped + failed`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSummary {
    pub total: usize,
    pub success: usize,
    pub skipped: usize,
    pub failed: usize,
    pub first_errors: Vec<IndexedError>,
    pub rolled_back: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tables: Vec<TableReport>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl RestoreSummary {
    pub fn with_total(total: usize) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    pub fn record_error(&mut self, index: usize, message: impl Into<String>) {
        if self.first_errors.len() < MAX_REPORTED_ERRORS {
            self.first_errors.push(IndexedError {
                index,
                message: message.into(),
            });
        }
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("{}", message);
        self.warnings.push(message);
    }

    /// Folds one table report into the counters.
    pub fn add_table(&mut self, report: TableReport) {
        match report.status {
            TableStatus::Success => self.success += 1,
            TableStatus::Skipped => self.skipped += 1,
            TableStatus::Failed => self.failed += 1,
        }
        self.tables.push(report);
    }

    pub fn is_balanced(&self) -> bool {
        self.total == self.success + self.skipped + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_list_is_capped() {
        let mut summary = RestoreSummary::with_total(20);
        for i in 0..20 {
            summary.record_error(i, format!("error {i}"));
        }
        summary.failed = 20;
        assert_eq!(summary.first_errors.len(), MAX_REPORTED_ERRORS);
        assert_eq!(summary.first_errors[9].index, 9);
        assert!(summary.is_balanced());
    }

    #[test]
    fn test_table_status_rules() {
        let mut report = TableReport::new("t");
        report.settle();
        assert_eq!(report.status, TableStatus::Skipped);

        report.rows_skipped = 3;
        report.settle();
        assert_eq!(report.status, TableStatus::Skipped);

        report.rows_failed = 1;
        report.settle();
        assert_eq!(report.status, TableStatus::Failed);

        report.rows_inserted = 1;
        report.settle();
        assert_eq!(report.status, TableStatus::Success);
    }

    #[test]
    fn test_serializes_camel_case() -> anyhow::Result<()> {
        let mut summary = RestoreSummary::with_total(1);
        summary.add_table(TableReport::failed("users", "boom"));
        let json = serde_json::to_value(&summary)?;
        assert_eq!(json["firstErrors"], serde_json::json!([]));
        assert_eq!(json["rolledBack"], serde_json::json!(false));
        assert_eq!(json["tables"][0]["status"], "failed");
        assert_eq!(json["tables"][0]["rowsInserted"], 0);
        Ok(())
    }
}
