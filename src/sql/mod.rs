// restoretool/src/sql/mod.rs
//! Dump text handling: context scanning, normalization passes and splitting.
pub(crate) mod normalize;
pub(crate) mod sanitize;
pub(crate) mod scanner;
pub(crate) mod split;

pub use normalize::{NormalizedScript, normalize_script, repair_statement};
pub use split::{SqlStatement, split_statements};

/// Normalizes a whole dump and cuts it into executable statements.
pub fn prepare_script(sql: &str) -> (Vec<SqlStatement>, NormalizedScript) {
    let normalized = normalize_script(sql);
    let statements = split_statements(&normalized.text);
    (statements, normalized)
}
