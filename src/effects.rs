//! Fire-and-forget side effects: narration and toast notifications.
//!
//! The controller never invokes an output library directly and never awaits
//! an effect. It pushes plain-data requests onto an unbounded channel; a
//! dispatcher task forwards them to pluggable sinks. A slow or broken sink
//! can therefore never stall a state transition.

use crate::structured_logger::StructuredLogger;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::session::Severity;

/// A side effect request, as plain data.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub enum Effect {
    /// Speak a line of narration.
    Narration { text: String },
    /// Surface a toast alert.
    Toast {
        title: String,
        body: String,
        severity: Severity,
    },
}

/// Voice output sink.
pub trait NarrationSink: Send + Sync {
    fn speak(&self, text: &str);
}

/// Toast notification sink.
pub trait ToastSink: Send + Sync {
    fn notify(&self, title: &str, body: &str);
}

/// Default narration sink: writes the line to stdout with a speaker prefix.
pub struct ConsoleNarration;

impl NarrationSink for ConsoleNarration {
    fn speak(&self, text: &str) {
        println!("[voice] {}", text);
    }
}

/// Default toast sink: writes the alert to stderr.
pub struct ConsoleToast;

impl ToastSink for ConsoleToast {
    fn notify(&self, title: &str, body: &str) {
        eprintln!("[alert] {}: {}", title, body);
    }
}

/// Desktop toast sink backed by the OS notification center.
#[cfg(feature = "desktop-toast")]
pub struct DesktopToast;

#[cfg(feature = "desktop-toast")]
impl ToastSink for DesktopToast {
    fn notify(&self, title: &str, body: &str) {
        let result = notify_rust::Notification::new()
            .summary(title)
            .body(body)
            .show();
        if let Err(e) = result {
            tracing::warn!("Desktop notification failed: {}", e);
        }
    }
}

/// Cloneable handle for enqueueing effects without blocking.
#[derive(Clone)]
pub struct EffectsHandle {
    tx: mpsc::UnboundedSender<Effect>,
}

impl EffectsHandle {
    /// Enqueues an effect. Never blocks; if the dispatcher is gone the
    /// effect is silently dropped (effects are a convenience, not state).
    pub fn dispatch(&self, effect: Effect) {
        let _ = self.tx.send(effect);
    }

    /// Handle wired to a bare receiver, bypassing the dispatcher task so
    /// tests can assert on the exact effect sequence.
    #[cfg(test)]
    pub(crate) fn for_tests() -> (Self, mpsc::UnboundedReceiver<Effect>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

/// Spawns the dispatcher task and returns its handle.
///
/// The task drains the queue in order and invokes each sink inside
/// `spawn_blocking` so a sink that does synchronous I/O cannot stall the
/// event loop.
pub fn spawn_dispatcher(
    narration: Arc<dyn NarrationSink>,
    toast: Arc<dyn ToastSink>,
    logger: Arc<StructuredLogger>,
) -> (EffectsHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Effect>();

    let task = tokio::spawn(async move {
        while let Some(effect) = rx.recv().await {
            match effect {
                Effect::Narration { text } => {
                    logger.log_effect("narration", &text);
                    let sink = Arc::clone(&narration);
                    let _ = tokio::task::spawn_blocking(move || sink.speak(&text)).await;
                }
                Effect::Toast {
                    title,
                    body,
                    severity,
                } => {
                    logger.log_effect("toast", &format!("[{}] {}", severity, title));
                    let sink = Arc::clone(&toast);
                    let _ = tokio::task::spawn_blocking(move || sink.notify(&title, &body)).await;
                }
            }
        }
    });

    (EffectsHandle { tx }, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingNarration(Mutex<Vec<String>>, std::sync::mpsc::Sender<()>);

    impl NarrationSink for RecordingNarration {
        fn speak(&self, text: &str) {
            self.0.lock().expect("lock").push(text.to_string());
            let _ = self.1.send(());
        }
    }

    struct RecordingToast(Mutex<Vec<(String, String)>>, std::sync::mpsc::Sender<()>);

    impl ToastSink for RecordingToast {
        fn notify(&self, title: &str, body: &str) {
            self.0
                .lock()
                .expect("lock")
                .push((title.to_string(), body.to_string()));
            let _ = self.1.send(());
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dispatcher_forwards_to_sinks_in_order() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let logger = Arc::new(
            StructuredLogger::new("effects-test", temp_dir.path()).expect("logger"),
        );

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let narration = Arc::new(RecordingNarration(Mutex::new(Vec::new()), done_tx.clone()));
        let toast = Arc::new(RecordingToast(Mutex::new(Vec::new()), done_tx));

        let (handle, task) = spawn_dispatcher(
            Arc::clone(&narration) as Arc<dyn NarrationSink>,
            Arc::clone(&toast) as Arc<dyn ToastSink>,
            logger,
        );

        handle.dispatch(Effect::Narration {
            text: "first".to_string(),
        });
        handle.dispatch(Effect::Toast {
            title: "P0 issue".to_string(),
            body: "checkout broken".to_string(),
            severity: Severity::P0,
        });
        handle.dispatch(Effect::Narration {
            text: "second".to_string(),
        });

        for _ in 0..3 {
            done_rx
                .recv_timeout(std::time::Duration::from_secs(5))
                .expect("sink invoked");
        }

        assert_eq!(
            *narration.0.lock().expect("lock"),
            vec!["first".to_string(), "second".to_string()]
        );
        assert_eq!(
            *toast.0.lock().expect("lock"),
            vec![("P0 issue".to_string(), "checkout broken".to_string())]
        );

        task.abort();
    }

    #[tokio::test]
    async fn dispatch_after_dispatcher_gone_is_silent() {
        let temp_dir = tempfile::tempdir().expect("tempdir");
        let logger = Arc::new(
            StructuredLogger::new("effects-test", temp_dir.path()).expect("logger"),
        );

        let (handle, task) = spawn_dispatcher(
            Arc::new(ConsoleNarration),
            Arc::new(ConsoleToast),
            logger,
        );
        task.abort();
        let _ = task.await;

        // Must not panic or block
        handle.dispatch(Effect::Narration {
            text: "into the void".to_string(),
        });
    }
}
