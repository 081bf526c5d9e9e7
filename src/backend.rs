//! REST calls to the agent backend: run creation and the recovery probe.
//!
//! Both calls are request/response only. The run-creation response means
//! "accepted", never "started" - the authoritative start signal is always the
//! `run-started` envelope on the control channel.

use crate::config::RunConfig;
use crate::session::RunResults;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of a run-status probe during recovery.
#[derive(Debug, Clone, PartialEq)]
pub enum RunProbe {
    /// The run is still active; the console can reattach.
    Running,
    /// The run completed while the console was detached.
    Completed(RunResults),
    /// The backend does not know the run (e.g. it restarted).
    NotFound,
}

/// The two backend calls the controller depends on.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Requests a new run. `Ok` means accepted, `Err` means rejected or
    /// unreachable; neither implies the run has started.
    async fn create_run(&self, config: &RunConfig) -> Result<()>;

    /// Asks the backend what became of a previously persisted run.
    async fn probe_run(&self, test_id: &str) -> Result<RunProbe>;
}

/// HTTP implementation against the backend's REST surface.
pub struct HttpBackend {
    api_base: String,
}

impl HttpBackend {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
        }
    }

    fn agent() -> ureq::Agent {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(HTTP_TIMEOUT))
            .build();
        config.into()
    }
}

#[derive(Debug, Deserialize)]
struct ProbeResponse {
    status: String,
    #[serde(default)]
    passed: Option<u32>,
    #[serde(default)]
    failed: Option<u32>,
    #[serde(default)]
    reason: Option<String>,
}

#[async_trait]
impl BackendClient for HttpBackend {
    async fn create_run(&self, config: &RunConfig) -> Result<()> {
        let url = format!("{}/runs", self.api_base.trim_end_matches('/'));
        let body = serde_json::to_string(config).context("Failed to serialize run config")?;

        tokio::task::spawn_blocking(move || {
            let agent = Self::agent();
            agent
                .post(&url)
                .header("Content-Type", "application/json")
                .send(body.as_str())
                .context("Run creation request rejected")?;
            Ok(())
        })
        .await
        .context("Run creation task failed")?
    }

    async fn probe_run(&self, test_id: &str) -> Result<RunProbe> {
        let url = format!(
            "{}/runs/{}",
            self.api_base.trim_end_matches('/'),
            test_id
        );

        tokio::task::spawn_blocking(move || {
            let agent = Self::agent();
            let response = agent.get(&url).call();

            let mut response = match response {
                Ok(response) => response,
                Err(ureq::Error::StatusCode(404)) => return Ok(RunProbe::NotFound),
                Err(e) => return Err(e).context("Run status probe failed"),
            };

            let body = response
                .body_mut()
                .read_to_string()
                .context("Failed to read probe response body")?;

            let probe: ProbeResponse =
                serde_json::from_str(&body).context("Failed to parse probe response")?;

            match probe.status.as_str() {
                "running" => Ok(RunProbe::Running),
                "completed" => Ok(RunProbe::Completed(RunResults {
                    passed: probe.passed.unwrap_or(0),
                    failed: probe.failed.unwrap_or(0),
                    reason: probe.reason,
                })),
                other => anyhow::bail!("Unexpected probe status: {}", other),
            }
        })
        .await
        .context("Run status probe task failed")?
    }
}
