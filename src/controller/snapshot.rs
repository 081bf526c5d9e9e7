//! Read-only snapshot of session state for consumers.
//!
//! Rendering components NEVER mutate this; they receive new snapshots via
//! the controller's watch channel.

use crate::config::RunConfig;
use crate::live_stream::LiveStreamStatus;
use crate::session::{Diagnostic, LogEntry, Phase, RunResults, SessionState};

/// Read-only snapshot of session state for display.
/// Consumers receive a fresh snapshot after every controller mutation.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub phase: Phase,
    pub test_id: Option<String>,
    pub step_index: u32,
    /// Append-only; entry identity is stable across snapshots.
    pub log: Vec<LogEntry>,
    pub latest_diagnostic: Option<Diagnostic>,
    pub last_screenshot: Option<String>,
    pub last_live_frame: Option<String>,
    pub results: Option<RunResults>,
    pub live_mode_enabled: bool,
    pub countdown_seconds: u32,
    pub run_config: Option<RunConfig>,
    /// Current live stream channel state.
    pub live_stream: LiveStreamStatus,
}

impl SessionSnapshot {
    pub fn capture(state: &SessionState, live_stream: LiveStreamStatus) -> Self {
        Self {
            phase: state.phase,
            test_id: state.test_id.clone(),
            step_index: state.step_index,
            log: state.log.clone(),
            latest_diagnostic: state.latest_diagnostic.clone(),
            last_screenshot: state.last_screenshot.clone(),
            last_live_frame: state.last_live_frame.clone(),
            results: state.results.clone(),
            live_mode_enabled: state.live_mode_enabled,
            countdown_seconds: state.countdown_seconds,
            run_config: state.run_config.clone(),
            live_stream,
        }
    }
}
