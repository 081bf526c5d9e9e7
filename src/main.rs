mod backend;
mod config;
mod console_paths;
mod control_channel;
mod controller;
mod effects;
mod live_stream;
mod session;
mod session_store;
mod structured_logger;

use anyhow::{Context, Result};
use backend::HttpBackend;
use base64::Engine as _;
use clap::Parser;
use config::{ConsoleConfig, RunConfig};
use controller::{ControllerMsg, SessionController, SessionSnapshot};
use effects::{ConsoleNarration, ConsoleToast};
use live_stream::LiveStreamStatus;
use session::Phase;
use session_store::{InstanceLock, SessionStore};
use std::path::PathBuf;
use std::sync::Arc;
use structured_logger::StructuredLogger;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "uxprobe")]
#[command(about = "Headless console for the autonomous UX-testing agent")]
#[command(version)]
struct Cli {
    /// Target page URL; when given, a new run is requested
    target: Option<String>,

    /// Persona the agent role-plays while testing
    #[arg(long, default_value = "first-time visitor")]
    persona: String,

    /// Emulated device profile
    #[arg(long, default_value = "desktop")]
    device: String,

    /// Emulated network profile
    #[arg(long, default_value = "broadband")]
    network: String,

    /// Step budget for the run
    #[arg(long, default_value = "12")]
    max_steps: u32,

    /// Enable live frame streaming for this session
    #[arg(long)]
    live: bool,

    /// Discard any persisted session before doing anything else
    #[arg(long)]
    reset: bool,

    /// Stay attached after the run finishes instead of exiting
    #[arg(long)]
    attach: bool,

    /// Print the recovered session and exit
    #[arg(long)]
    status: bool,

    /// Write the final screenshot payload (decoded) to this path on exit
    #[arg(long)]
    screenshot_out: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // One console owns the persisted session at a time
    let _lock = InstanceLock::acquire(&console_paths::lock_file_path()?)?;

    let config = ConsoleConfig::load(&console_paths::config_file_path()?)?;
    let session_id = uuid::Uuid::new_v4().to_string();
    let logger = Arc::new(StructuredLogger::new(
        &session_id,
        &console_paths::logs_dir()?,
    )?);
    eprintln!(
        "session {} (events: {})",
        logger.session_id(),
        logger.path().display()
    );
    let store = SessionStore::at_default_location()?;

    let (effects, _effects_task) = effects::spawn_dispatcher(
        Arc::new(ConsoleNarration),
        toast_sink(),
        Arc::clone(&logger),
    );

    let (self_tx, mut mailbox) = mpsc::unbounded_channel::<ControllerMsg>();
    let backend = Arc::new(HttpBackend::new(config.api_base.clone()));
    let (mut controller, snapshot_rx) = SessionController::new(
        config.clone(),
        store,
        backend,
        effects,
        Arc::clone(&logger),
        self_tx.clone(),
    );

    controller.recover_on_load().await;

    if cli.status {
        print_status(&snapshot_rx.borrow());
        return Ok(());
    }

    if cli.reset {
        controller.reset();
    }

    if cli.live && !snapshot_rx.borrow().live_mode_enabled {
        controller.toggle_live_mode();
    }

    let _control_task = control_channel::spawn(
        config.control_url.clone(),
        self_tx.clone(),
        Arc::clone(&logger),
    );

    // Print whatever the session already holds, then follow new lines
    let mut printed = 0usize;
    printed = print_new_log_lines(&snapshot_rx.borrow(), printed);

    if let Some(target) = cli.target.clone() {
        if snapshot_rx.borrow().phase == Phase::Idle {
            controller
                .start(RunConfig {
                    target,
                    persona: cli.persona.clone(),
                    device: cli.device.clone(),
                    network: cli.network.clone(),
                    max_steps: cli.max_steps,
                })
                .await?;
        } else {
            eprintln!(
                "A session is already {}; attaching to it instead",
                snapshot_rx.borrow().phase
            );
        }
        printed = print_new_log_lines(&snapshot_rx.borrow(), printed);
    }

    let mut saw_active_run = snapshot_rx.borrow().phase.is_active();

    loop {
        tokio::select! {
            msg = mailbox.recv() => {
                let Some(msg) = msg else { break };
                controller.handle(msg);

                let snapshot = snapshot_rx.borrow().clone();
                printed = print_new_log_lines(&snapshot, printed);

                if snapshot.phase.is_active() {
                    saw_active_run = true;
                }
                let finished = snapshot.phase == Phase::Complete
                    || (saw_active_run && snapshot.phase == Phase::Idle);
                if finished && !cli.attach {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                controller.shutdown();
                break;
            }
        }
    }

    let snapshot = snapshot_rx.borrow().clone();
    if let Some(path) = cli.screenshot_out {
        export_screenshot(&snapshot, &path)?;
    }
    print_status(&snapshot);
    Ok(())
}

fn toast_sink() -> Arc<dyn effects::ToastSink> {
    #[cfg(feature = "desktop-toast")]
    {
        Arc::new(effects::DesktopToast)
    }
    #[cfg(not(feature = "desktop-toast"))]
    {
        Arc::new(ConsoleToast)
    }
}

/// Prints log entries appended since the last call; returns the new count.
fn print_new_log_lines(snapshot: &SessionSnapshot, printed: usize) -> usize {
    for entry in snapshot.log.iter().skip(printed) {
        println!("[{}] {}", entry.at, entry.line);
    }
    snapshot.log.len()
}

fn print_status(snapshot: &SessionSnapshot) {
    println!("phase: {}", snapshot.phase);
    if let Some(test_id) = &snapshot.test_id {
        println!("run: {}", test_id);
    }
    if let Some(run) = &snapshot.run_config {
        println!(
            "target: {} ({} / {} / {})",
            run.target, run.persona, run.device, run.network
        );
    }
    println!("steps: {}", snapshot.step_index);
    let live = match snapshot.live_stream {
        LiveStreamStatus::Streaming => "streaming",
        LiveStreamStatus::Connecting => "connecting",
        LiveStreamStatus::Disconnected if snapshot.live_mode_enabled => "enabled, not connected",
        LiveStreamStatus::Disconnected => "off",
    };
    println!("live: {}", live);
    if snapshot.last_live_frame.is_some() {
        println!("live frame: cached");
    }
    if let Some(diagnostic) = &snapshot.latest_diagnostic {
        if let Some(severity) = diagnostic.severity {
            println!("severity: {}", severity);
        }
        if let Some(diagnosis) = &diagnostic.diagnosis {
            println!("diagnosis: {}", diagnosis);
        }
    }
    if let Some(results) = &snapshot.results {
        println!(
            "results: {} passed, {} failed",
            results.passed, results.failed
        );
        if let Some(reason) = &results.reason {
            println!("reason: {}", reason);
        }
    }
    if snapshot.countdown_seconds > 0 {
        println!("cooldown: {}s", snapshot.countdown_seconds);
    }
}

fn export_screenshot(snapshot: &SessionSnapshot, path: &std::path::Path) -> Result<()> {
    let Some(payload) = &snapshot.last_screenshot else {
        eprintln!("No screenshot captured; nothing to export");
        return Ok(());
    };
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload)
        .context("Screenshot payload is not valid base64")?;
    std::fs::write(path, bytes)
        .with_context(|| format!("Failed to write screenshot to {}", path.display()))?;
    println!("Screenshot written to {}", path.display());
    Ok(())
}
