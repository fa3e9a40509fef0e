// restoretool/src/errors.rs
use thiserror::Error;

/// SQLSTATE codes meaning "this object or row is already in the state the
/// dump wants": duplicate objects, missing objects on DROP/ALTER paths, and
/// unique violations.
const ALREADY_APPLIED_CODES: &[&str] = &[
    "42P07", "42710", "42P06", "42701", "42723", "42P04", // duplicate objects
    "42P01", "42703", "42704", "42883", "3F000", // missing objects
    "23505", // unique_violation
];

const ALREADY_APPLIED_MESSAGES: &[&str] = &["already exists", "does not exist", "duplicate key"];

/// How a statement or row failure is counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Harmless on a restore that ran before: counted as skipped.
    AlreadyApplied,
    Genuine,
}

/// A failure reported by the database for one statement.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct DbFailure {
    /// SQLSTATE, when the server sent one.
    pub code: Option<String>,
    pub message: String,
}

impl DbFailure {
    pub fn new(code: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            code: code.map(str::to_string),
            message: message.into(),
        }
    }

    pub fn class(&self) -> FailureClass {
        if let Some(code) = &self.code {
            if ALREADY_APPLIED_CODES.contains(&code.as_str()) {
                return FailureClass::AlreadyApplied;
            }
        }
        let lowered = self.message.to_lowercase();
        if ALREADY_APPLIED_MESSAGES.iter().any(|m| lowered.contains(m)) {
            FailureClass::AlreadyApplied
        } else {
            FailureClass::Genuine
        }
    }

    pub fn is_already_applied(&self) -> bool {
        self.class() == FailureClass::AlreadyApplied
    }
}

impl From<sqlx::Error> for DbFailure {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) => DbFailure::new(db_err.code().as_deref(), db_err.message()),
            other => DbFailure::new(None, other.to_string()),
        }
    }
}

#[derive(Error, Debug)]
pub enum RestoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid backup package: {0}")]
    Package(String),

    #[error("Cannot acquire target connection: {0}")]
    Connection(String),

    #[error("Database error: {0}")]
    Database(#[from] DbFailure),

    #[error("Statement {index} failed: {message}")]
    Statement { index: usize, message: String },

    #[error("Object store transport error: {0}")]
    Transport(String),

    #[error("Storage operation failed: {0}")]
    Storage(String),

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, RestoreError>;
