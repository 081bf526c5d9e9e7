//! Inbound control channel envelopes.
//!
//! Every message on the control channel is a JSON object with a `type`
//! discriminant. Unknown types and malformed payloads are treated as
//! transport noise: they decode to `None` and are dropped without surfacing
//! an error, so the protocol can evolve without breaking older consoles.

use crate::session::Diagnostic;
use serde::{Deserialize, Serialize};

/// A discriminated control channel message describing run lifecycle and
/// diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Envelope {
    /// The backend confirmed a run started. This, not the run-creation HTTP
    /// response, is the authoritative start-of-run signal.
    RunStarted { test_id: String },
    /// One agent action was taken. Carries the fast diagnostic wave when the
    /// backend has partial scores ready at frame-capture time.
    StepUpdate {
        message: String,
        #[serde(default)]
        diagnostic: Option<Diagnostic>,
        #[serde(default)]
        screenshot: Option<String>,
    },
    /// The slow diagnostic wave, emitted once model reasoning completes.
    DiagnosticUpdate { diagnostic: Diagnostic },
    /// The run finished; payload is the final summary.
    RunComplete {
        passed: u32,
        failed: u32,
        #[serde(default)]
        reason: Option<String>,
    },
    /// The run failed; payload is a human-readable message.
    RunError { message: String },
}

impl Envelope {
    /// Decodes a text frame. `None` means noise, not an error.
    pub fn decode(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Severity;

    #[test]
    fn decode_run_started() {
        let envelope = Envelope::decode(r#"{"type":"run-started","test_id":"t-9"}"#);
        assert_eq!(
            envelope,
            Some(Envelope::RunStarted {
                test_id: "t-9".to_string()
            })
        );
    }

    #[test]
    fn decode_step_update_without_optional_fields() {
        let envelope = Envelope::decode(r#"{"type":"step-update","message":"clicked signup"}"#);
        match envelope {
            Some(Envelope::StepUpdate {
                message,
                diagnostic,
                screenshot,
            }) => {
                assert_eq!(message, "clicked signup");
                assert!(diagnostic.is_none());
                assert!(screenshot.is_none());
            }
            other => panic!("unexpected decode result: {:?}", other),
        }
    }

    #[test]
    fn decode_step_update_with_partial_diagnostic() {
        let envelope = Envelope::decode(
            r#"{"type":"step-update","message":"scrolled","diagnostic":{"score":6.5,"severity":"P2"}}"#,
        );
        match envelope {
            Some(Envelope::StepUpdate { diagnostic, .. }) => {
                let diagnostic = diagnostic.expect("diagnostic present");
                assert_eq!(diagnostic.score, Some(6.5));
                assert_eq!(diagnostic.severity, Some(Severity::P2));
                assert!(diagnostic.diagnosis.is_none());
            }
            other => panic!("unexpected decode result: {:?}", other),
        }
    }

    #[test]
    fn decode_run_complete_without_reason() {
        let envelope = Envelope::decode(r#"{"type":"run-complete","passed":4,"failed":1}"#);
        assert_eq!(
            envelope,
            Some(Envelope::RunComplete {
                passed: 4,
                failed: 1,
                reason: None
            })
        );
    }

    #[test]
    fn unknown_type_is_noise() {
        assert!(Envelope::decode(r#"{"type":"heartbeat","at":12}"#).is_none());
    }

    #[test]
    fn garbage_is_noise() {
        assert!(Envelope::decode("not even json").is_none());
        assert!(Envelope::decode(r#"{"type":"run-started"}"#).is_none());
    }
}
