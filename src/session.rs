use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::RunConfig;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Scanning,
    Analyzing,
    Complete,
}

impl Phase {
    /// A run is in flight (a `test_id` must be present).
    pub fn is_active(&self) -> bool {
        matches!(self, Phase::Scanning | Phase::Analyzing)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Phase::Idle => "idle",
            Phase::Scanning => "scanning",
            Phase::Analyzing => "analyzing",
            Phase::Complete => "complete",
        };
        write!(f, "{}", label)
    }
}

/// Issue severity tiers, highest first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    P0,
    P1,
    P2,
    P3,
}

impl Severity {
    /// The two top tiers surface a toast; lower tiers stay in the log.
    pub fn is_alerting(&self) -> bool {
        matches!(self, Severity::P0 | Severity::P1)
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Severity::P0 => "P0",
            Severity::P1 => "P1",
            Severity::P2 => "P2",
            Severity::P3 => "P3",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Issue {
    pub description: String,
    pub severity: Severity,
}

/// Partial diagnostic record for the current step.
///
/// The backend reports each step in two asynchronous waves: a fast one the
/// moment a frame is captured (scores, issues, screenshot) and a slower one
/// once model reasoning completes (diagnosis narrative, console logs, alert
/// flag). The fast wave establishes the step's record, replacing the
/// previous step's; `merge` folds the slow wave onto it, converging to the
/// field-wise union: a present field overwrites, an absent field never
/// clobbers what the other wave already supplied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Diagnostic {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issues: Option<Vec<Issue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnosis: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console_logs: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert: Option<bool>,
}

impl Diagnostic {
    /// Field-wise union with another wave. Present fields in `other` win.
    pub fn merge(&mut self, other: &Diagnostic) {
        if other.score.is_some() {
            self.score = other.score;
        }
        if other.issues.is_some() {
            self.issues = other.issues.clone();
        }
        if other.severity.is_some() {
            self.severity = other.severity;
        }
        if other.team.is_some() {
            self.team = other.team.clone();
        }
        if other.evidence.is_some() {
            self.evidence = other.evidence.clone();
        }
        if other.diagnosis.is_some() {
            self.diagnosis = other.diagnosis.clone();
        }
        if other.console_logs.is_some() {
            self.console_logs = other.console_logs.clone();
        }
        if other.alert.is_some() {
            self.alert = other.alert;
        }
    }

}

/// Final run summary, set only on completion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunResults {
    pub passed: u32,
    pub failed: u32,
    #[serde(default)]
    pub reason: Option<String>,
}

impl RunResults {
    /// Narration line for the completion announcement.
    pub fn summary_line(&self) -> String {
        match &self.reason {
            Some(reason) => reason.clone(),
            None => format!(
                "Run complete. {} checks passed, {} failed.",
                self.passed, self.failed
            ),
        }
    }
}

/// A single timestamped log line. Entries are never mutated after being
/// appended; consumers rely on stable identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    /// RFC3339 timestamp
    pub at: String,
    pub line: String,
}

impl LogEntry {
    pub fn now(line: impl Into<String>) -> Self {
        Self {
            at: Utc::now().to_rfc3339(),
            line: line.into(),
        }
    }
}

/// The session aggregate. Owned exclusively by the `SessionController`;
/// everything else reads snapshots.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub phase: Phase,
    /// Present exactly while a run is in flight. Cleared early on completion
    /// so recovery probes cannot reattach to a finished run.
    pub test_id: Option<String>,
    pub step_index: u32,
    pub log: Vec<LogEntry>,
    pub latest_diagnostic: Option<Diagnostic>,
    /// Durable screenshot from the most recent step.
    pub last_screenshot: Option<String>,
    /// Ephemeral live frame; never persisted.
    pub last_live_frame: Option<String>,
    pub results: Option<RunResults>,
    /// User preference, independent of phase.
    pub live_mode_enabled: bool,
    /// Post-completion cooldown before consumers permit a new run.
    pub countdown_seconds: u32,
    /// Configuration of the current (or last) run.
    pub run_config: Option<RunConfig>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_log(&mut self, line: impl Into<String>) {
        self.log.push(LogEntry::now(line));
    }

    /// Clears every run-scoped field. Preference flags survive.
    pub fn clear_run_fields(&mut self) {
        self.phase = Phase::Idle;
        self.test_id = None;
        self.step_index = 0;
        self.log.clear();
        self.latest_diagnostic = None;
        self.last_screenshot = None;
        self.last_live_frame = None;
        self.results = None;
        self.countdown_seconds = 0;
        self.run_config = None;
    }
}
