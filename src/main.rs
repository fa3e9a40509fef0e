//! Backup Restore Tool
//!
//! Replays a backup package (SQL dump or NDJSON snapshot plus storage tree)
//! into a target database and object store.

// restoretool/src/main.rs
mod config;
mod errors;
mod restore;
mod sql;
mod storage;
mod utils;

use anyhow::{Context, Result};
use config::{AppConfig, OperationConfig, load_restore_config_from_json};
use serde::Serialize;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "config.json";

/// Main entry point for the restore tool
#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    match run_app().await {
        Ok(_) => {
            println!("✅ Operation completed successfully.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<()> {
    let config_path = env::var("RESTORE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
    let mut app_config = AppConfig::load_from_json(&config_path).with_context(|| {
        format!(
            "Failed to load application configuration from {}",
            config_path.display()
        )
    })?;

    let choice = match env::args().nth(1) {
        Some(arg) => arg.trim().to_string(),
        None => prompt_choice()?,
    };

    match choice.as_str() {
        "1" | "restore" => {
            println!("🔄 Starting Restore Process...");
            let restore_config = load_restore_config_from_json(&app_config.raw_json_config)
                .context("Failed to load restore configuration from JSON")?;
            app_config.operation = Some(OperationConfig::Restore(restore_config));
            let report = restore::run_restore_flow(&app_config)
                .await
                .context("Restore process failed")?;
            print_report(&report)?;
        }
        "2" | "preview" => {
            println!("🔍 Starting Restore Preview...");
            let restore_config = load_restore_config_from_json(&app_config.raw_json_config)
                .context("Failed to load restore configuration from JSON")?;
            app_config.operation = Some(OperationConfig::Preview(restore_config));
            let report = restore::run_preview_flow(&app_config)
                .await
                .context("Restore preview failed")?;
            print_report(&report)?;
        }
        _ => {
            println!("❌ Invalid choice. Please enter '1' (restore) or '2' (preview).");
            anyhow::bail!("Invalid operation choice");
        }
    }
    Ok(())
}

fn print_report<T: Serialize>(report: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(report).context("Failed to serialize report")?;
    println!("{}", json);
    Ok(())
}

/// Prompts user to select restore or preview
///
/// Returns the user's choice as String
fn prompt_choice() -> Result<String> {
    use std::io::{Write, stdin, stdout};

    println!("Select an operation:");
    println!("1. Restore Backup (or type 'restore')");
    println!("2. Preview Restore (or type 'preview')");
    print!("Enter your choice: ");
    stdout().flush().context("Failed to flush stdout")?;

    let mut input = String::new();
    stdin().read_line(&mut input).context("Failed to read user input")?;
    Ok(input.trim().to_string())
}
