//! Session controller: the single authority over session state.
//!
//! Every input - control channel envelopes, live frames, user actions,
//! scheduled ticks - arrives as an ordinary message and is applied here, in
//! arrival order. The controller validates preconditions, mutates state,
//! emits events, persists the resumable subset, and broadcasts a read-only
//! snapshot to consumers via a watch channel. Side effects are derived from
//! the emitted events and dispatched fire-and-forget, never awaited.

pub mod envelopes;
mod events;
mod snapshot;

pub use events::SessionEvent;
pub use snapshot::SessionSnapshot;

use crate::backend::{BackendClient, RunProbe};
use crate::config::{ConsoleConfig, RunConfig};
use crate::effects::{Effect, EffectsHandle};
use crate::live_stream::{LiveStreamEvent, LiveStreamSlot};
use crate::session::{RunResults, Phase, SessionState};
use crate::session_store::{PersistedSession, SessionStore};
use crate::structured_logger::StructuredLogger;
use anyhow::{bail, Result};
use envelopes::Envelope;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// How long the final live frame stays visible after completion before the
/// stream is torn down.
const LIVE_STREAM_LINGER: Duration = Duration::from_secs(4);

/// Post-completion cooldown before consumers permit a new run.
const COOLDOWN_SECONDS: u32 = 15;

/// Everything the controller can be fed. The mailbox serializes arbitrary
/// interleavings of both channels, user actions, and timers into one ordered
/// stream of mutations.
#[derive(Debug)]
pub enum ControllerMsg {
    Envelope(Envelope),
    ControlStatus(ControlStatus),
    Live(LiveStreamEvent),
    /// One second of post-completion cooldown elapsed.
    CountdownTick { run_seq: u64 },
    /// The completion grace period for a live stream generation elapsed.
    LingerElapsed { generation: u64 },
}

/// Control channel connectivity changes.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlStatus {
    Connected,
    Closed { normal: bool, detail: String },
}

/// The session controller. Owns the state, the live stream slot, and the
/// schedule for deferred teardown; everything else holds a snapshot receiver.
pub struct SessionController {
    state: SessionState,
    config: ConsoleConfig,
    store: SessionStore,
    backend: Arc<dyn BackendClient>,
    effects: EffectsHandle,
    logger: Arc<StructuredLogger>,
    /// Sender into the controller's own mailbox, used to schedule deferred
    /// messages (grace teardown, countdown ticks).
    self_tx: mpsc::UnboundedSender<ControllerMsg>,
    live: LiveStreamSlot,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    /// Bumped on every run start and reset; stale countdown ticks carry an
    /// old value and are ignored.
    run_seq: u64,
}

impl SessionController {
    /// Creates the controller with a fresh idle session.
    ///
    /// Returns the controller and a watch receiver for state snapshots;
    /// call `recover_on_load` once before feeding the mailbox.
    pub fn new(
        config: ConsoleConfig,
        store: SessionStore,
        backend: Arc<dyn BackendClient>,
        effects: EffectsHandle,
        logger: Arc<StructuredLogger>,
        self_tx: mpsc::UnboundedSender<ControllerMsg>,
    ) -> (Self, watch::Receiver<SessionSnapshot>) {
        let state = SessionState::new();
        let live = LiveStreamSlot::default();
        let (snapshot_tx, snapshot_rx) =
            watch::channel(SessionSnapshot::capture(&state, live.status()));

        let controller = Self {
            state,
            config,
            store,
            backend,
            effects,
            logger,
            self_tx,
            live,
            snapshot_tx,
            run_seq: 0,
        };

        (controller, snapshot_rx)
    }

    /// Applies one mailbox message. Invalid inputs are logged and dropped;
    /// nothing that arrives here can crash the controller.
    pub fn handle(&mut self, msg: ControllerMsg) {
        match msg {
            ControllerMsg::Envelope(envelope) => match self.apply_envelope(envelope) {
                Ok(events) => self.finish(events, true),
                Err(e) => {
                    tracing::debug!("dropping envelope: {}", e);
                    self.logger.log(
                        "Controller",
                        serde_json::json!({
                            "type": "EnvelopeDropped",
                            "reason": e.to_string()
                        }),
                    );
                }
            },
            ControllerMsg::ControlStatus(status) => self.apply_control_status(status),
            ControllerMsg::Live(event) => self.apply_live_event(event),
            ControllerMsg::CountdownTick { run_seq } => self.apply_countdown_tick(run_seq),
            ControllerMsg::LingerElapsed { generation } => self.apply_linger_elapsed(generation),
        }
    }

    /// The sole mutator driven by control channel input.
    pub fn apply_envelope(&mut self, envelope: Envelope) -> Result<Vec<SessionEvent>> {
        use SessionEvent::*;

        match envelope {
            Envelope::RunStarted { test_id } => {
                if self.state.phase != Phase::Idle {
                    bail!("run-started while {}", self.state.phase);
                }
                let from = self.state.phase;
                self.run_seq += 1;
                self.logger.increment_run_id();
                self.state.phase = Phase::Scanning;
                self.state.test_id = Some(test_id.clone());
                self.state.step_index = 0;
                self.state.results = None;
                self.state.latest_diagnostic = None;
                self.state.countdown_seconds = 0;
                self.state.append_log(format!("Run {} started", test_id));

                let mut events = vec![
                    PhaseChanged {
                        from,
                        to: self.state.phase,
                    },
                    RunStarted {
                        test_id: test_id.clone(),
                    },
                ];
                if self.state.live_mode_enabled {
                    events.push(self.open_live_stream(&test_id));
                }
                Ok(events)
            }

            Envelope::StepUpdate {
                message,
                diagnostic,
                screenshot,
            } => {
                if !self.state.phase.is_active() {
                    bail!("step-update while {}", self.state.phase);
                }
                let mut events = Vec::new();
                if self.state.phase == Phase::Scanning {
                    events.push(PhaseChanged {
                        from: Phase::Scanning,
                        to: Phase::Analyzing,
                    });
                }
                self.state.phase = Phase::Analyzing;
                self.state.step_index += 1;
                self.state.append_log(message);
                if let Some(wave) = diagnostic {
                    // A step starts a fresh diagnostic record; the slow wave
                    // for the same step merges onto it via diagnostic-update
                    self.state.latest_diagnostic = Some(wave);
                }
                if let Some(shot) = screenshot {
                    self.state.last_screenshot = Some(shot);
                }
                events.push(StepRecorded {
                    step_index: self.state.step_index,
                });
                Ok(events)
            }

            Envelope::DiagnosticUpdate { diagnostic } => {
                if self.state.phase != Phase::Analyzing {
                    bail!("diagnostic-update while {}", self.state.phase);
                }
                self.state
                    .latest_diagnostic
                    .get_or_insert_with(Default::default)
                    .merge(&diagnostic);
                Ok(vec![DiagnosticUpdated {
                    severity: diagnostic.severity,
                    diagnosis: diagnostic.diagnosis,
                }])
            }

            Envelope::RunComplete {
                passed,
                failed,
                reason,
            } => {
                // Re-delivery of the completion envelope is a no-op
                if self.state.phase == Phase::Complete {
                    return Ok(vec![]);
                }
                if self.state.phase != Phase::Analyzing {
                    bail!("run-complete while {}", self.state.phase);
                }
                let from = self.state.phase;
                let results = RunResults {
                    passed,
                    failed,
                    reason,
                };
                self.state.phase = Phase::Complete;
                // Cleared before the stream teardown so recovery probes
                // cannot reattach to a finished run
                self.state.test_id = None;
                self.state.results = Some(results.clone());
                self.state.countdown_seconds = COOLDOWN_SECONDS;
                self.state.append_log(format!(
                    "Run complete: {} passed, {} failed",
                    results.passed, results.failed
                ));
                self.schedule_countdown();
                self.schedule_linger();

                Ok(vec![
                    PhaseChanged {
                        from,
                        to: self.state.phase,
                    },
                    RunCompleted { results },
                ])
            }

            Envelope::RunError { message } => {
                if !self.state.phase.is_active() {
                    bail!("run-error while {}", self.state.phase);
                }
                let from = self.state.phase;
                self.state.append_log(format!("Run error: {}", message));
                self.state.phase = Phase::Idle;
                self.state.test_id = None;
                self.state.last_live_frame = None;

                let mut events = vec![RunFailed { message }];
                // No grace period on failure
                if self.live.close("run error", &self.logger) {
                    events.push(LiveStreamClosed {
                        generation: self.live.current_generation(),
                        reason: "run error".to_string(),
                    });
                }
                events.push(PhaseChanged {
                    from,
                    to: self.state.phase,
                });
                Ok(events)
            }
        }
    }

    /// Issues the run-creation request. The `Scanning` transition only
    /// happens when the `run-started` envelope arrives; an accepted request
    /// changes nothing but the log.
    pub async fn start(&mut self, run: RunConfig) -> Result<()> {
        if self.state.phase != Phase::Idle {
            bail!("Cannot start a run while {}", self.state.phase);
        }
        self.logger.log_user_action("start");
        self.state
            .append_log(format!("Requesting run against {}", run.target));
        self.state.run_config = Some(run.clone());
        self.finish(vec![], true);

        match self.backend.create_run(&run).await {
            Ok(()) => {
                self.state
                    .append_log("Run request accepted; waiting for confirmation");
            }
            Err(e) => {
                self.state.append_log(format!("Run request failed: {:#}", e));
            }
        }
        self.finish(vec![], true);
        Ok(())
    }

    /// Tears down the run and all run-scoped state. Callable in any phase.
    /// The control channel is process-lifetime and stays up.
    pub fn reset(&mut self) {
        self.logger.log_user_action("reset");
        self.run_seq += 1;

        let mut events = Vec::new();
        if self.live.close("reset", &self.logger) {
            events.push(SessionEvent::LiveStreamClosed {
                generation: self.live.current_generation(),
                reason: "reset".to_string(),
            });
        }

        self.state.clear_run_fields();
        if let Err(e) = self.store.clear() {
            tracing::warn!("failed to delete persisted session: {:#}", e);
        }
        self.logger.log_store("clear", "reset");

        events.push(SessionEvent::SessionReset);
        self.finish(events, true);
    }

    /// Flips the live mode preference. Turning it on mid-run opens a fresh
    /// stream (superseding any current one); turning it off closes the
    /// stream and drops the frame, but keeps the screenshot so the view has
    /// something to show.
    pub fn toggle_live_mode(&mut self) {
        self.logger.log_user_action("toggle_live_mode");
        self.state.live_mode_enabled = !self.state.live_mode_enabled;

        let mut events = vec![SessionEvent::LiveModeToggled {
            enabled: self.state.live_mode_enabled,
        }];

        if self.state.live_mode_enabled {
            if self.state.phase.is_active() {
                if let Some(test_id) = self.state.test_id.clone() {
                    events.push(self.open_live_stream(&test_id));
                }
            }
        } else {
            if self.live.close("live mode off", &self.logger) {
                events.push(SessionEvent::LiveStreamClosed {
                    generation: self.live.current_generation(),
                    reason: "live mode off".to_string(),
                });
            }
            self.state.last_live_frame = None;
        }

        self.finish(events, true);
    }

    /// Restores persisted state and reconciles it with the backend. Called
    /// once at startup, before the mailbox is drained.
    pub async fn recover_on_load(&mut self) {
        let Some(snapshot) = self.store.load() else {
            self.broadcast();
            return;
        };
        self.logger.log_store("load", "snapshot restored");
        self.state = snapshot.restore();

        if !self.state.phase.is_active() {
            self.finish(
                vec![SessionEvent::SessionRecovered {
                    outcome: self.state.phase.to_string(),
                }],
                false,
            );
            return;
        }

        let Some(test_id) = self.state.test_id.clone() else {
            // Active phase without a run id is an inconsistent blob
            self.recover_as_stale();
            return;
        };

        match self.backend.probe_run(&test_id).await {
            Ok(RunProbe::Running) => {
                self.state
                    .append_log(format!("Reattached to run {}", test_id));
                let mut events = vec![SessionEvent::SessionRecovered {
                    outcome: "running".to_string(),
                }];
                if self.state.live_mode_enabled {
                    events.push(self.open_live_stream(&test_id));
                }
                self.finish(events, true);
            }
            Ok(RunProbe::Completed(results)) => {
                let from = self.state.phase;
                self.state.phase = Phase::Complete;
                self.state.test_id = None;
                self.state.results = Some(results.clone());
                self.state.countdown_seconds = COOLDOWN_SECONDS;
                self.state.append_log(format!(
                    "Run finished while detached: {} passed, {} failed",
                    results.passed, results.failed
                ));
                self.schedule_countdown();
                self.finish(
                    vec![
                        SessionEvent::SessionRecovered {
                            outcome: "completed".to_string(),
                        },
                        SessionEvent::PhaseChanged {
                            from,
                            to: Phase::Complete,
                        },
                        SessionEvent::RunCompleted { results },
                    ],
                    true,
                );
            }
            Ok(RunProbe::NotFound) => {
                // Nothing to resume; not an error from the user's view
                self.recover_as_stale();
            }
            Err(e) => {
                // Backend unreachable: keep the restored state rather than
                // destroy a run that may still be alive
                self.state
                    .append_log(format!("Could not verify run status: {:#}", e));
                self.finish(
                    vec![SessionEvent::SessionRecovered {
                        outcome: "probe-failed".to_string(),
                    }],
                    true,
                );
            }
        }
    }

    fn recover_as_stale(&mut self) {
        self.run_seq += 1;
        self.state.clear_run_fields();
        if let Err(e) = self.store.clear() {
            tracing::warn!("failed to delete persisted session: {:#}", e);
        }
        self.logger.log_store("clear", "stale run discarded");
        self.finish(
            vec![
                SessionEvent::SessionRecovered {
                    outcome: "stale".to_string(),
                },
                SessionEvent::SessionReset,
            ],
            true,
        );
    }

    fn apply_control_status(&mut self, status: ControlStatus) {
        match status {
            ControlStatus::Connected => {
                self.state.append_log("Control channel connected");
                self.finish(vec![], true);
            }
            ControlStatus::Closed { normal, detail } => {
                if !normal {
                    self.state.append_log(format!(
                        "Control channel closed unexpectedly ({}); relaunch to reconnect",
                        detail
                    ));
                } else {
                    self.state.append_log("Control channel closed");
                }
                self.finish(vec![], true);
            }
        }
    }

    fn apply_live_event(&mut self, event: LiveStreamEvent) {
        match event {
            LiveStreamEvent::Frame {
                generation,
                payload,
            } => {
                // Frames from a superseded instance are dropped: the guard
                // is the generation, not the socket reference
                if !self.live.is_current(generation) {
                    return;
                }
                self.logger.log_frame(generation);
                self.live.note_streaming(generation);
                self.state.last_live_frame = Some(payload);
                // Ephemeral field only; not worth a disk write per frame
                self.broadcast();
            }
            LiveStreamEvent::Closed { generation, .. } => {
                self.live.handle_closed(generation);
                self.broadcast();
            }
        }
    }

    fn apply_countdown_tick(&mut self, run_seq: u64) {
        if run_seq != self.run_seq {
            return;
        }
        if self.state.phase == Phase::Complete && self.state.countdown_seconds > 0 {
            self.state.countdown_seconds -= 1;
            self.broadcast();
        }
    }

    fn apply_linger_elapsed(&mut self, generation: u64) {
        if !self.live.is_current(generation) {
            return;
        }
        if self.live.close("completion grace elapsed", &self.logger) {
            self.state.last_live_frame = None;
            self.finish(
                vec![SessionEvent::LiveStreamClosed {
                    generation,
                    reason: "completion grace elapsed".to_string(),
                }],
                false,
            );
        }
    }

    fn open_live_stream(&mut self, test_id: &str) -> SessionEvent {
        let url = self.config.live_url(test_id);
        let generation = self
            .live
            .open(url, self.self_tx.clone(), Arc::clone(&self.logger));
        SessionEvent::LiveStreamOpened {
            test_id: test_id.to_string(),
            generation,
        }
    }

    fn schedule_linger(&self) {
        let generation = self.live.current_generation();
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(LIVE_STREAM_LINGER).await;
            let _ = tx.send(ControllerMsg::LingerElapsed { generation });
        });
    }

    fn schedule_countdown(&self) {
        let run_seq = self.run_seq;
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            for _ in 0..COOLDOWN_SECONDS {
                tokio::time::sleep(Duration::from_secs(1)).await;
                if tx.send(ControllerMsg::CountdownTick { run_seq }).is_err() {
                    return;
                }
            }
        });
    }

    /// Logs events, derives and dispatches side effects, persists the
    /// resumable subset, and broadcasts a fresh snapshot.
    fn finish(&mut self, events: Vec<SessionEvent>, persist: bool) {
        for event in &events {
            self.logger.log_session_event(event);
        }
        for effect in effects_for(&events) {
            self.effects.dispatch(effect);
        }
        if persist {
            if let Err(e) = self.store.save(&PersistedSession::capture(&self.state)) {
                tracing::warn!("failed to persist session: {:#}", e);
            }
        }
        self.broadcast();
    }

    fn broadcast(&self) {
        let _ = self
            .snapshot_tx
            .send(SessionSnapshot::capture(&self.state, self.live.status()));
    }

    /// Closes the live stream gracefully on console shutdown. The backend
    /// also times abandoned streams out, so this is a courtesy, not a
    /// requirement.
    pub fn shutdown(&mut self) {
        if self.live.close("console shutdown", &self.logger) {
            self.finish(
                vec![SessionEvent::LiveStreamClosed {
                    generation: self.live.current_generation(),
                    reason: "console shutdown".to_string(),
                }],
                false,
            );
        }
    }

    /// Read access for the console loop; consumers use the watch channel.
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    #[cfg(test)]
    pub(crate) fn live_slot(&self) -> &LiveStreamSlot {
        &self.live
    }
}

/// Derives the fire-and-forget effects a batch of events calls for. Kept
/// separate from the transition logic so the state machine stays pure.
fn effects_for(events: &[SessionEvent]) -> Vec<Effect> {
    let mut effects = Vec::new();
    for event in events {
        match event {
            SessionEvent::DiagnosticUpdated {
                severity,
                diagnosis,
            } => {
                if let Some(text) = diagnosis {
                    effects.push(Effect::Narration { text: text.clone() });
                }
                if let Some(severity) = severity {
                    if severity.is_alerting() {
                        effects.push(Effect::Toast {
                            title: format!("{} issue detected", severity),
                            body: diagnosis
                                .clone()
                                .unwrap_or_else(|| "See the latest diagnostic".to_string()),
                            severity: *severity,
                        });
                    }
                }
            }
            SessionEvent::RunCompleted { results } => {
                effects.push(Effect::Narration {
                    text: results.summary_line(),
                });
            }
            _ => {}
        }
    }
    effects
}
