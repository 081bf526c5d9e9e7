//! Best-effort live frame channel, one instance per run.
//!
//! Frames are a convenience layered over the durable screenshot fallback, so
//! every failure here is suppressed: a refused connection, a mid-stream
//! error, or a dropped frame never surfaces to the user.
//!
//! Teardown safety relies on generations, not socket references. Each opened
//! instance gets the next generation number and stamps it on everything it
//! sends back; the controller ignores anything stamped with a stale
//! generation. A socket still connecting when it is superseded can therefore
//! never resurrect stale state, no matter when its callbacks land.

use crate::controller::ControllerMsg;
use crate::structured_logger::StructuredLogger;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// Channel state, per instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LiveStreamStatus {
    #[default]
    Disconnected,
    Connecting,
    Streaming,
}

/// Messages a stream task sends back to the controller, stamped with the
/// generation of the instance that produced them.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveStreamEvent {
    Frame { generation: u64, payload: String },
    Closed { generation: u64, reason: String },
}

/// Wire shape of one inbound live message: a frame payload or an error
/// string the backend chose to report.
#[derive(Debug, Deserialize)]
struct LiveMessage {
    #[serde(default)]
    frame: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

struct ActiveStream {
    generation: u64,
    status: LiveStreamStatus,
    stop_tx: Option<oneshot::Sender<()>>,
}

/// The controller's one slot for a live stream instance.
///
/// At most one instance is current at any moment; opening a new one
/// invalidates the previous instance synchronously, before the new socket
/// exists.
#[derive(Default)]
pub struct LiveStreamSlot {
    generation: u64,
    active: Option<ActiveStream>,
}

impl LiveStreamSlot {
    /// Opens a new stream instance for `test_id`, superseding any current
    /// one, and returns the new generation.
    pub fn open(
        &mut self,
        url: String,
        tx: mpsc::UnboundedSender<ControllerMsg>,
        logger: Arc<StructuredLogger>,
    ) -> u64 {
        self.close("superseded", &logger);

        self.generation += 1;
        let generation = self.generation;
        let (stop_tx, stop_rx) = oneshot::channel();

        logger.log_channel_lifecycle("LiveStream", "opening", &url);
        tokio::spawn(run_stream(url, generation, tx, stop_rx, Arc::clone(&logger)));

        self.active = Some(ActiveStream {
            generation,
            status: LiveStreamStatus::Connecting,
            stop_tx: Some(stop_tx),
        });
        generation
    }

    /// Invalidates the current instance, if any. The socket is told to stop
    /// and close gracefully; its generation is already stale by the time it
    /// reacts, so nothing it does afterwards can be observed.
    pub fn close(&mut self, reason: &str, logger: &StructuredLogger) -> bool {
        match self.active.take() {
            Some(mut stream) => {
                if let Some(stop_tx) = stream.stop_tx.take() {
                    let _ = stop_tx.send(());
                }
                logger.log_channel_lifecycle("LiveStream", "closed", reason);
                true
            }
            None => false,
        }
    }

    /// Marks the instance as streaming once its first frame arrives.
    pub fn note_streaming(&mut self, generation: u64) {
        if let Some(stream) = self.active.as_mut() {
            if stream.generation == generation {
                stream.status = LiveStreamStatus::Streaming;
            }
        }
    }

    /// Handles a task-reported close. Only the current generation clears the
    /// slot; a superseded instance announcing its death is old news.
    pub fn handle_closed(&mut self, generation: u64) {
        if self
            .active
            .as_ref()
            .map(|stream| stream.generation == generation)
            .unwrap_or(false)
        {
            self.active = None;
        }
    }

    /// True when `generation` is the currently live instance.
    pub fn is_current(&self, generation: u64) -> bool {
        self.active
            .as_ref()
            .map(|stream| stream.generation == generation)
            .unwrap_or(false)
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Generation of the current instance, or of the last one when idle.
    pub fn current_generation(&self) -> u64 {
        self.generation
    }

    pub fn status(&self) -> LiveStreamStatus {
        self.active
            .as_ref()
            .map(|stream| stream.status)
            .unwrap_or(LiveStreamStatus::Disconnected)
    }
}

/// One stream instance: connect, forward frames, stop on request.
///
/// The courtesy "stop" text lets the backend release rendering resources
/// promptly; the backend also times sessions out, so failing to send it
/// (abrupt shutdown) is tolerated.
async fn run_stream(
    url: String,
    generation: u64,
    tx: mpsc::UnboundedSender<ControllerMsg>,
    mut stop_rx: oneshot::Receiver<()>,
    logger: Arc<StructuredLogger>,
) {
    let closed = |reason: &str| {
        ControllerMsg::Live(LiveStreamEvent::Closed {
            generation,
            reason: reason.to_string(),
        })
    };

    let mut ws = tokio::select! {
        connect = connect_async(url) => match connect {
            Ok((ws, _)) => ws,
            Err(e) => {
                tracing::debug!("live stream connect failed: {}", e);
                logger.log_channel_lifecycle("LiveStream", "connect_failed", &e.to_string());
                let _ = tx.send(closed("connect failed"));
                return;
            }
        },
        _ = &mut stop_rx => {
            // Torn down before the socket existed
            let _ = tx.send(closed("stopped while connecting"));
            return;
        }
    };

    loop {
        tokio::select! {
            message = ws.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<LiveMessage>(&text) {
                        Ok(LiveMessage { frame: Some(payload), .. }) => {
                            let _ = tx.send(ControllerMsg::Live(LiveStreamEvent::Frame {
                                generation,
                                payload,
                            }));
                        }
                        Ok(LiveMessage { error: Some(e), .. }) => {
                            tracing::debug!("live stream reported error: {}", e);
                        }
                        _ => {}
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    let _ = tx.send(closed("server closed"));
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!("live stream socket error: {}", e);
                    let _ = tx.send(closed("socket error"));
                    return;
                }
            },
            _ = &mut stop_rx => {
                let _ = ws.send(Message::Text("stop".into())).await;
                let _ = ws.close(None).await;
                let _ = tx.send(closed("stopped"));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_logger() -> (Arc<StructuredLogger>, TempDir) {
        let temp_dir = TempDir::new().expect("tempdir");
        let logger = Arc::new(
            StructuredLogger::new("live-test", temp_dir.path()).expect("logger"),
        );
        (logger, temp_dir)
    }

    #[tokio::test]
    async fn open_supersedes_previous_generation() {
        let (logger, _temp) = test_logger();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut slot = LiveStreamSlot::default();

        let first = slot.open(
            "ws://127.0.0.1:1/ws/live/a".to_string(),
            tx.clone(),
            Arc::clone(&logger),
        );
        let second = slot.open(
            "ws://127.0.0.1:1/ws/live/a".to_string(),
            tx,
            Arc::clone(&logger),
        );

        assert!(second > first);
        assert!(slot.is_current(second));
        assert!(!slot.is_current(first));
        assert!(slot.is_active());
    }

    #[tokio::test]
    async fn stale_close_does_not_clear_current_instance() {
        let (logger, _temp) = test_logger();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut slot = LiveStreamSlot::default();

        let first = slot.open(
            "ws://127.0.0.1:1/ws/live/a".to_string(),
            tx.clone(),
            Arc::clone(&logger),
        );
        let second = slot.open(
            "ws://127.0.0.1:1/ws/live/a".to_string(),
            tx,
            Arc::clone(&logger),
        );

        // The superseded instance reports its death late
        slot.handle_closed(first);
        assert!(slot.is_active());
        assert!(slot.is_current(second));

        slot.handle_closed(second);
        assert!(!slot.is_active());
        assert_eq!(slot.status(), LiveStreamStatus::Disconnected);
    }

    #[tokio::test]
    async fn streaming_status_ignores_stale_generation() {
        let (logger, _temp) = test_logger();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut slot = LiveStreamSlot::default();

        let first = slot.open(
            "ws://127.0.0.1:1/ws/live/a".to_string(),
            tx.clone(),
            Arc::clone(&logger),
        );
        let second = slot.open(
            "ws://127.0.0.1:1/ws/live/a".to_string(),
            tx,
            Arc::clone(&logger),
        );

        slot.note_streaming(first);
        assert_eq!(slot.status(), LiveStreamStatus::Connecting);

        slot.note_streaming(second);
        assert_eq!(slot.status(), LiveStreamStatus::Streaming);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (logger, _temp) = test_logger();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut slot = LiveStreamSlot::default();

        assert!(!slot.close("nothing open", &logger));

        slot.open(
            "ws://127.0.0.1:1/ws/live/a".to_string(),
            tx,
            Arc::clone(&logger),
        );
        assert!(slot.close("user toggle", &logger));
        assert!(!slot.close("user toggle again", &logger));
        assert!(!slot.is_active());
    }

    #[test]
    fn live_message_decodes_frame_and_error_shapes() {
        let frame: LiveMessage =
            serde_json::from_str(r#"{"frame":"aW1hZ2U="}"#).expect("parse");
        assert_eq!(frame.frame.as_deref(), Some("aW1hZ2U="));
        assert!(frame.error.is_none());

        let error: LiveMessage =
            serde_json::from_str(r#"{"error":"render worker busy"}"#).expect("parse");
        assert!(error.frame.is_none());
        assert_eq!(error.error.as_deref(), Some("render worker busy"));
    }
}
