//! Process-lifetime control channel to the backend's event stream.
//!
//! Exactly one logical connection per console process, independent of any
//! particular run. Text frames are decoded into envelopes and forwarded to
//! the controller; anything that fails to decode is protocol noise and is
//! dropped without comment. An unexpected close is logged once and the
//! channel stays down - reattaching means relaunching the console.

use crate::controller::{ControlStatus, ControllerMsg};
use crate::controller::envelopes::Envelope;
use crate::structured_logger::StructuredLogger;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;

/// Connects and spawns the read loop. The task ends when the socket closes;
/// it is never restarted within a console process.
pub fn spawn(
    url: String,
    tx: mpsc::UnboundedSender<ControllerMsg>,
    logger: Arc<StructuredLogger>,
) -> JoinHandle<()> {
    tokio::spawn(run_channel(url, tx, logger))
}

async fn run_channel(
    url: String,
    tx: mpsc::UnboundedSender<ControllerMsg>,
    logger: Arc<StructuredLogger>,
) {
    let mut ws = match connect_async(url.clone()).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            tracing::warn!("control channel connect failed: {}", e);
            logger.log_channel_lifecycle("ControlChannel", "connect_failed", &e.to_string());
            let _ = tx.send(ControllerMsg::ControlStatus(ControlStatus::Closed {
                normal: false,
                detail: format!("connect failed: {}", e),
            }));
            return;
        }
    };

    logger.log_channel_lifecycle("ControlChannel", "opened", &url);
    let _ = tx.send(ControllerMsg::ControlStatus(ControlStatus::Connected));

    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                match Envelope::decode(&text) {
                    Some(envelope) => {
                        logger.log_envelope(&envelope);
                        if tx.send(ControllerMsg::Envelope(envelope)).is_err() {
                            // Controller is gone; nothing left to feed
                            return;
                        }
                    }
                    // Noise: unknown type or malformed payload
                    None => tracing::debug!("dropping undecodable control frame"),
                }
            }
            Some(Ok(Message::Close(frame))) => {
                let normal = frame
                    .as_ref()
                    .map(|f| f.code == CloseCode::Normal)
                    .unwrap_or(false);
                let detail = frame
                    .map(|f| format!("code {}: {}", u16::from(f.code), f.reason))
                    .unwrap_or_else(|| "no close frame".to_string());
                if !normal {
                    tracing::warn!("control channel closed unexpectedly: {}", detail);
                }
                logger.log_channel_lifecycle("ControlChannel", "closed", &detail);
                let _ = tx.send(ControllerMsg::ControlStatus(ControlStatus::Closed {
                    normal,
                    detail,
                }));
                return;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::warn!("control channel error: {}", e);
                logger.log_channel_lifecycle("ControlChannel", "error", &e.to_string());
                let _ = tx.send(ControllerMsg::ControlStatus(ControlStatus::Closed {
                    normal: false,
                    detail: e.to_string(),
                }));
                return;
            }
            None => {
                tracing::warn!("control channel ended without close frame");
                logger.log_channel_lifecycle("ControlChannel", "closed", "stream ended");
                let _ = tx.send(ControllerMsg::ControlStatus(ControlStatus::Closed {
                    normal: false,
                    detail: "stream ended".to_string(),
                }));
                return;
            }
        }
    }
}
