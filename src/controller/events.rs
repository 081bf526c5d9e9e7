//! Events emitted by the session controller after applying an input.
//!
//! These are for the structured log and the side-effect dispatcher only -
//! consumers get state via the watch channel's `SessionSnapshot`.

use crate::session::{Phase, RunResults, Severity};
use serde::Serialize;

/// Events emitted by the session controller after applying an input.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum SessionEvent {
    /// Phase changed from one phase to another
    PhaseChanged { from: Phase, to: Phase },
    /// The backend confirmed a run started
    RunStarted { test_id: String },
    /// An agent step was recorded
    StepRecorded { step_index: u32 },
    /// The full diagnostic wave was merged
    DiagnosticUpdated {
        severity: Option<Severity>,
        diagnosis: Option<String>,
    },
    /// The run completed with a final summary
    RunCompleted { results: RunResults },
    /// The run failed
    RunFailed { message: String },
    /// A live stream instance was opened
    LiveStreamOpened { test_id: String, generation: u64 },
    /// A live stream instance was closed
    LiveStreamClosed { generation: u64, reason: String },
    /// The live mode preference flipped
    LiveModeToggled { enabled: bool },
    /// All run-scoped state was cleared
    SessionReset,
    /// A persisted session was restored on load
    SessionRecovered { outcome: String },
}
