//! Centralized home-based storage paths for all console persistence.
//!
//! This module provides helpers for unified storage under `~/.uxprobe/`:
//! - `session.json` - Persisted session snapshot
//! - `logs/` - Structured event logs
//! - `console.lock` - Single-instance lock file
//! - `config.yaml` - Optional endpoint configuration

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

/// The name of the console storage directory.
const UXPROBE_DIR: &str = ".uxprobe";

/// Returns the home-based console directory: `~/.uxprobe/`
///
/// Creates the directory if it doesn't exist.
///
/// # Errors
///
/// Returns an error if:
/// - Home directory cannot be determined
/// - Directory creation fails
pub fn uxprobe_home_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory for session storage")?;
    let console_dir = home.join(UXPROBE_DIR);
    fs::create_dir_all(&console_dir).with_context(|| {
        format!(
            "Failed to create console directory: {}",
            console_dir.display()
        )
    })?;
    Ok(console_dir)
}

/// Returns the persisted session blob path: `~/.uxprobe/session.json`
pub fn session_blob_path() -> Result<PathBuf> {
    Ok(uxprobe_home_dir()?.join("session.json"))
}

/// Returns the logs directory: `~/.uxprobe/logs/`
///
/// Creates the directory if it doesn't exist.
pub fn logs_dir() -> Result<PathBuf> {
    let dir = uxprobe_home_dir()?.join("logs");
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create logs directory: {}", dir.display()))?;
    Ok(dir)
}

/// Returns the single-instance lock file path: `~/.uxprobe/console.lock`
pub fn lock_file_path() -> Result<PathBuf> {
    Ok(uxprobe_home_dir()?.join("console.lock"))
}

/// Returns the config file path: `~/.uxprobe/config.yaml`
pub fn config_file_path() -> Result<PathBuf> {
    Ok(uxprobe_home_dir()?.join("config.yaml"))
}
