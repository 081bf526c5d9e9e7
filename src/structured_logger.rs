//! Structured JSONL logger for debugging and event reconstruction.
//!
//! Machine-parseable logging with:
//! - Monotonic sequence numbers for ordering
//! - ISO 8601 timestamps with microsecond precision
//! - Console session and run IDs for correlation
//! - Structured event data in JSON format

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Structured JSONL logger for debugging and event reconstruction.
pub struct StructuredLogger {
    session_id: String,
    run_id: AtomicU64,
    seq: AtomicU64,
    log_file: Mutex<File>,
    log_path: PathBuf,
}

/// A single log entry in JSONL format.
#[derive(Serialize, serde::Deserialize)]
pub struct LogEntry {
    /// Monotonic sequence number (unique across the console session)
    pub seq: u64,
    /// ISO 8601 timestamp with microseconds
    pub ts: String,
    /// Console session ID
    pub session_id: String,
    /// Run ID (increments on every new test run within the session)
    pub run_id: u64,
    /// Component that emitted the log
    pub component: String,
    /// Structured event data
    pub event: Value,
}

impl StructuredLogger {
    /// Creates a new structured logger for the given console session.
    ///
    /// Logs are written to `<logs_dir>/events.jsonl`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The logs directory cannot be created
    /// - The log file cannot be opened
    pub fn new(session_id: &str, logs_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(logs_dir)?;
        let log_path = logs_dir.join("events.jsonl");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        Ok(Self {
            session_id: session_id.to_string(),
            run_id: AtomicU64::new(1),
            seq: AtomicU64::new(0),
            log_file: Mutex::new(file),
            log_path,
        })
    }

    /// Increments the run ID (called when a new test run starts).
    pub fn increment_run_id(&self) {
        self.run_id.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns the next sequence number.
    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Logs a structured event.
    ///
    /// The event is serialized to JSON and written as a single line.
    /// This method is thread-safe.
    pub fn log(&self, component: &str, event: impl Serialize) {
        let entry = LogEntry {
            seq: self.next_seq(),
            ts: Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string(),
            session_id: self.session_id.clone(),
            run_id: self.run_id.load(Ordering::SeqCst),
            component: component.to_string(),
            event: serde_json::to_value(event).unwrap_or(Value::Null),
        };

        if let Ok(mut file) = self.log_file.lock() {
            if let Ok(line) = serde_json::to_string(&entry) {
                let _ = writeln!(file, "{}", line);
                let _ = file.flush();
            }
        }
    }

    /// Logs an inbound control channel envelope.
    pub fn log_envelope(&self, envelope: impl Serialize) {
        self.log(
            "ControlChannel",
            serde_json::json!({
                "type": "EnvelopeReceived",
                "envelope": serde_json::to_value(envelope).unwrap_or(Value::Null)
            }),
        );
    }

    /// Logs a session event emitted by the controller.
    pub fn log_session_event(&self, event: impl Serialize) {
        self.log(
            "Controller",
            serde_json::json!({
                "type": "SessionEvent",
                "event": serde_json::to_value(event).unwrap_or(Value::Null)
            }),
        );
    }

    /// Logs a channel lifecycle change (open/close/error).
    pub fn log_channel_lifecycle(&self, channel: &str, change: &str, detail: &str) {
        self.log(
            channel,
            serde_json::json!({
                "type": "Lifecycle",
                "change": change,
                "detail": detail
            }),
        );
    }

    /// Logs a live frame arrival. The payload itself is elided; frames are
    /// large and last-wins, so only the generation matters for replay.
    pub fn log_frame(&self, generation: u64) {
        self.log(
            "LiveStream",
            serde_json::json!({
                "type": "FrameReceived",
                "generation": generation
            }),
        );
    }

    /// Logs a dispatched side effect.
    pub fn log_effect(&self, kind: &str, detail: &str) {
        self.log(
            "Effects",
            serde_json::json!({
                "type": "EffectDispatched",
                "kind": kind,
                "detail": detail
            }),
        );
    }

    /// Logs a user-initiated controller operation.
    pub fn log_user_action(&self, action: &str) {
        self.log(
            "Controller",
            serde_json::json!({
                "type": "UserAction",
                "action": action
            }),
        );
    }

    /// Logs a persistence store operation.
    pub fn log_store(&self, operation: &str, detail: &str) {
        self.log(
            "Store",
            serde_json::json!({
                "type": "StoreOperation",
                "operation": operation,
                "detail": detail
            }),
        );
    }

    /// Returns the path to the log file.
    pub fn path(&self) -> &PathBuf {
        &self.log_path
    }

    /// Returns the console session ID.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

#[cfg(test)]
#[path = "tests/structured_logger_tests.rs"]
mod tests;
