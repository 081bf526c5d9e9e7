use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Endpoints and knobs for one console process.
///
/// Loaded from `~/.uxprobe/config.yaml` when present; every field has a
/// default so a missing file means a default config, not an error.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConsoleConfig {
    /// Control channel socket endpoint (process-lifetime connection).
    #[serde(default = "default_control_url")]
    pub control_url: String,
    /// Base endpoint for per-run live stream sockets; the run's test id is
    /// appended as the final path segment.
    #[serde(default = "default_live_url_base")]
    pub live_url_base: String,
    /// REST base for run creation and the recovery status probe.
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            control_url: default_control_url(),
            live_url_base: default_live_url_base(),
            api_base: default_api_base(),
        }
    }
}

fn default_control_url() -> String {
    "ws://127.0.0.1:8787/ws/events".to_string()
}

fn default_live_url_base() -> String {
    "ws://127.0.0.1:8787/ws/live".to_string()
}

fn default_api_base() -> String {
    "http://127.0.0.1:8787/api".to_string()
}

impl ConsoleConfig {
    /// Loads the config file, falling back to defaults when it is absent.
    ///
    /// # Errors
    ///
    /// Returns an error only for a file that exists but cannot be read or
    /// parsed; a missing file is not an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Live stream endpoint for a specific run.
    pub fn live_url(&self, test_id: &str) -> String {
        format!("{}/{}", self.live_url_base.trim_end_matches('/'), test_id)
    }
}

/// Parameters of one run, mirrored into the backend's run-creation call and
/// persisted so a reloaded console can show what it is resuming.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RunConfig {
    /// Target page URL the agent drives.
    pub target: String,
    /// Persona the agent role-plays while testing.
    #[serde(default = "default_persona")]
    pub persona: String,
    /// Emulated device profile.
    #[serde(default = "default_device")]
    pub device: String,
    /// Emulated network profile.
    #[serde(default = "default_network")]
    pub network: String,
    /// Step budget before the backend ends the run on its own.
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
}

fn default_persona() -> String {
    "first-time visitor".to_string()
}

fn default_device() -> String {
    "desktop".to_string()
}

fn default_network() -> String {
    "broadband".to_string()
}

fn default_max_steps() -> u32 {
    12
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = ConsoleConfig::load(&dir.path().join("config.yaml")).expect("load");
        assert_eq!(config.control_url, default_control_url());
        assert_eq!(config.api_base, default_api_base());
    }

    #[test]
    fn partial_config_file_fills_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "api_base: https://probe.example.com/api\n").expect("write");

        let config = ConsoleConfig::load(&path).expect("load");
        assert_eq!(config.api_base, "https://probe.example.com/api");
        assert_eq!(config.control_url, default_control_url());
    }

    #[test]
    fn malformed_config_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "control_url: [not, a, string\n").expect("write");
        assert!(ConsoleConfig::load(&path).is_err());
    }

    #[test]
    fn live_url_appends_test_id() {
        let config = ConsoleConfig {
            live_url_base: "ws://host/ws/live/".to_string(),
            ..ConsoleConfig::default()
        };
        assert_eq!(config.live_url("t-42"), "ws://host/ws/live/t-42");
    }

    #[test]
    fn run_config_defaults_apply() {
        let run: RunConfig = serde_yaml::from_str("target: https://example.com\n").expect("parse");
        assert_eq!(run.persona, "first-time visitor");
        assert_eq!(run.max_steps, 12);
    }
}
