//! Durable session snapshots for reload/recovery.
//!
//! The controller persists the resumable subset of session state after every
//! mutation so a fresh console process can reattach to a run that survived a
//! reload. Ephemeral fields (the live frame) are never written.
//!
//! ## Design Decisions
//!
//! - **Single blob**: one console owns one session; the snapshot lives at
//!   `~/.uxprobe/session.json` rather than a per-run file.
//! - **Tolerant load**: a missing, corrupt, or newer-versioned blob reads as
//!   "no snapshot". Recovery must never fail because of a bad blob.
//! - **Atomic writes**: temp file then rename, so a crash mid-save leaves the
//!   previous snapshot intact.

use crate::config::RunConfig;
use crate::session::{Diagnostic, LogEntry, Phase, RunResults, SessionState};
use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Current snapshot format version.
/// Increment this when making breaking changes to the snapshot format.
pub const SNAPSHOT_VERSION: u32 = 1;

/// The persistable subset of session state.
///
/// Excludes `last_live_frame`: frames are large, last-wins, and meaningless
/// across a reload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedSession {
    /// Snapshot format version for migration compatibility
    pub version: u32,
    /// Timestamp when this snapshot was created (RFC3339 format)
    pub saved_at: String,
    pub phase: Phase,
    pub test_id: Option<String>,
    pub step_index: u32,
    pub log: Vec<LogEntry>,
    pub latest_diagnostic: Option<Diagnostic>,
    pub results: Option<RunResults>,
    pub last_screenshot: Option<String>,
    pub live_mode_enabled: bool,
    pub run_config: Option<RunConfig>,
}

impl PersistedSession {
    /// Captures the resumable fields of the given state.
    pub fn capture(state: &SessionState) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: chrono::Utc::now().to_rfc3339(),
            phase: state.phase,
            test_id: state.test_id.clone(),
            step_index: state.step_index,
            log: state.log.clone(),
            latest_diagnostic: state.latest_diagnostic.clone(),
            results: state.results.clone(),
            last_screenshot: state.last_screenshot.clone(),
            live_mode_enabled: state.live_mode_enabled,
            run_config: state.run_config.clone(),
        }
    }

    /// Rebuilds session state from the snapshot. The live frame starts empty.
    pub fn restore(&self) -> SessionState {
        SessionState {
            phase: self.phase,
            test_id: self.test_id.clone(),
            step_index: self.step_index,
            log: self.log.clone(),
            latest_diagnostic: self.latest_diagnostic.clone(),
            last_screenshot: self.last_screenshot.clone(),
            last_live_frame: None,
            results: self.results.clone(),
            live_mode_enabled: self.live_mode_enabled,
            countdown_seconds: 0,
            run_config: self.run_config.clone(),
        }
    }
}

/// Disk-backed store for the session blob.
#[derive(Debug, Clone)]
pub struct SessionStore {
    blob_path: PathBuf,
}

impl SessionStore {
    pub fn new(blob_path: PathBuf) -> Self {
        Self { blob_path }
    }

    /// Store at the standard home location (`~/.uxprobe/session.json`).
    pub fn at_default_location() -> Result<Self> {
        Ok(Self::new(crate::console_paths::session_blob_path()?))
    }

    /// Saves a snapshot atomically: write to a temp file, then rename.
    pub fn save(&self, snapshot: &PersistedSession) -> Result<()> {
        let temp_path = self.blob_path.with_extension("json.tmp");

        let content = serde_json::to_string_pretty(snapshot)
            .context("Failed to serialize session snapshot")?;

        fs::write(&temp_path, &content).with_context(|| {
            format!("Failed to write temp snapshot file: {}", temp_path.display())
        })?;

        fs::rename(&temp_path, &self.blob_path).with_context(|| {
            format!("Failed to rename temp file to: {}", self.blob_path.display())
        })?;

        Ok(())
    }

    /// Loads the last snapshot, or `None` when there is nothing usable.
    ///
    /// Corrupt or unparseable blobs are deliberately treated as absent, as is
    /// a blob written by a newer version of the console.
    pub fn load(&self) -> Option<PersistedSession> {
        if !self.blob_path.exists() {
            return None;
        }

        let content = match fs::read_to_string(&self.blob_path) {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!("Unreadable session snapshot, ignoring: {}", e);
                return None;
            }
        };

        let snapshot: PersistedSession = match serde_json::from_str(&content) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!("Corrupt session snapshot, ignoring: {}", e);
                return None;
            }
        };

        if snapshot.version > SNAPSHOT_VERSION {
            tracing::warn!(
                "Session snapshot version {} is newer than supported version {}, ignoring",
                snapshot.version,
                SNAPSHOT_VERSION
            );
            return None;
        }

        Some(snapshot)
    }

    /// Deletes the persisted snapshot. Missing blob is not an error.
    pub fn clear(&self) -> Result<()> {
        if self.blob_path.exists() {
            fs::remove_file(&self.blob_path).with_context(|| {
                format!("Failed to delete snapshot: {}", self.blob_path.display())
            })?;
        }
        Ok(())
    }

    pub fn blob_path(&self) -> &Path {
        &self.blob_path
    }
}

/// Exclusive lock guaranteeing at most one console process owns the persisted
/// session. Held for the life of the process; released on drop.
#[derive(Debug)]
pub struct InstanceLock {
    _file: fs::File,
}

impl InstanceLock {
    /// Acquires the lock, failing immediately if another console holds it.
    pub fn acquire(lock_path: &Path) -> Result<Self> {
        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(lock_path)
            .with_context(|| format!("Failed to open lock file: {}", lock_path.display()))?;
        file.try_lock_exclusive()
            .context("Another uxprobe console is already running")?;
        Ok(Self { _file: file })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Severity;

    fn sample_state() -> SessionState {
        let mut state = SessionState::new();
        state.phase = Phase::Analyzing;
        state.test_id = Some("t-77".to_string());
        state.step_index = 3;
        state.append_log("step 3 recorded");
        state.latest_diagnostic = Some(Diagnostic {
            severity: Some(Severity::P1),
            diagnosis: Some("nav traps focus".to_string()),
            ..Diagnostic::default()
        });
        state.last_screenshot = Some("c2NyZWVu".to_string());
        state.last_live_frame = Some("ZnJhbWU=".to_string());
        state.live_mode_enabled = true;
        state.run_config = Some(RunConfig {
            target: "https://example.com".to_string(),
            persona: "first-time visitor".to_string(),
            device: "desktop".to_string(),
            network: "broadband".to_string(),
            max_steps: 12,
        });
        state
    }

    fn store_in(dir: &tempfile::TempDir) -> SessionStore {
        SessionStore::new(dir.path().join("session.json"))
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        let state = sample_state();

        store.save(&PersistedSession::capture(&state)).expect("save");
        let loaded = store.load().expect("snapshot should exist");

        assert_eq!(loaded.version, SNAPSHOT_VERSION);
        assert_eq!(loaded.phase, Phase::Analyzing);
        assert_eq!(loaded.test_id.as_deref(), Some("t-77"));
        assert_eq!(loaded.step_index, 3);
        assert_eq!(loaded.log.len(), 1);
        assert!(loaded.live_mode_enabled);

        let restored = loaded.restore();
        assert_eq!(restored.phase, Phase::Analyzing);
        assert_eq!(restored.last_screenshot.as_deref(), Some("c2NyZWVu"));
        // Live frames never survive a reload
        assert!(restored.last_live_frame.is_none());
        assert_eq!(restored.countdown_seconds, 0);
    }

    #[test]
    fn load_missing_blob_is_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(store_in(&dir).load().is_none());
    }

    #[test]
    fn load_corrupt_blob_is_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        fs::write(store.blob_path(), "{ not json").expect("write");
        assert!(store.load().is_none());
    }

    #[test]
    fn load_newer_version_is_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);

        let mut snapshot = PersistedSession::capture(&sample_state());
        snapshot.version = SNAPSHOT_VERSION + 1;
        let content = serde_json::to_string(&snapshot).expect("serialize");
        fs::write(store.blob_path(), content).expect("write");

        assert!(store.load().is_none());
    }

    #[test]
    fn clear_removes_blob() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);

        store
            .save(&PersistedSession::capture(&sample_state()))
            .expect("save");
        assert!(store.load().is_some());

        store.clear().expect("clear");
        assert!(store.load().is_none());

        // Clearing again is fine
        store.clear().expect("clear twice");
    }

    #[test]
    fn instance_lock_is_exclusive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock_path = dir.path().join("console.lock");

        let first = InstanceLock::acquire(&lock_path).expect("first lock");
        assert!(InstanceLock::acquire(&lock_path).is_err());

        drop(first);
        InstanceLock::acquire(&lock_path).expect("lock after release");
    }
}
