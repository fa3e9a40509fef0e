// restoretool/src/restore/mod.rs
pub(crate) mod column_types;
pub(crate) mod db_restore;
pub(crate) mod encode;
mod logic;
pub(crate) mod ndjson;
pub(crate) mod package;
pub(crate) mod session;
pub(crate) mod summary;
pub(crate) mod verification;

#[cfg(test)]
pub(crate) mod testing;

use anyhow::Result;

use crate::config::{AppConfig, OperationConfig};
pub use logic::{PreviewReport, RestoreReport};

/// Public entry point for the restore process.
pub async fn run_restore_flow(app_config: &AppConfig) -> Result<RestoreReport> {
    let restore_config = match &app_config.operation {
        Some(OperationConfig::Restore(cfg)) => cfg,
        _ => anyhow::bail!("Restore operation selected but no restore configuration found."),
    };
    logic::perform_restore_orchestration(app_config, restore_config).await
}

/// Dry run: reports what `run_restore_flow` would do.
pub async fn run_preview_flow(app_config: &AppConfig) -> Result<PreviewReport> {
    let restore_config = match &app_config.operation {
        Some(OperationConfig::Preview(cfg)) => cfg,
        _ => anyhow::bail!("Preview operation selected but no restore configuration found."),
    };
    logic::perform_preview_orchestration(app_config, restore_config).await
}
