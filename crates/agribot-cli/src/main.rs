//! `agribot` – operator console for the weed-treatment robot.
//!
//! This binary wires the stack together and hands control to the operator.
//! It:
//!
//! 1. Loads `~/.agribot/config.toml`, writing a default one on first run.
//! 2. Opens the actuator link (`sim`, `tcp://…` or a device path) and starts
//!    the coordinator: mission state machine, obstacle arbiter and liveness
//!    monitor.
//! 3. Attaches the detection feed: the recording at `detections_path`, or
//!    the colour-blob detector over `[detection] frames_dir`.
//! 4. Drops the user into an **interactive REPL** (`/start`, `/stop`,
//!    `/status`, …).
//! 5. Intercepts **Ctrl-C** to send a stop-all and unwind the mission.

mod config;
mod repl;

use colored::Colorize;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

use agribot_hal::sim::SimUnit;
use agribot_middleware::{EventBus, ProtocolClient, ProtocolConfig, StreamLink, Topic};
use agribot_runtime::{Coordinator, CoordinatorConfig, init_tracing};
use agribot_types::{AgriError, EventPayload};

fn main() {
    // Installed before the runtime exists; the guard flushes spans on exit.
    let _tracing = init_tracing("agribot");

    print_banner();

    let cfg = load_or_create_config();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {}", "Failed to start the async runtime".red(), e);
            std::process::exit(1);
        }
    };

    print!(
        "  Connecting to actuator unit at {} … ",
        cfg.link.endpoint.bold()
    );
    std::io::stdout().flush().ok();
    let coordinator = match runtime.block_on(boot(&cfg)) {
        Ok(c) => {
            println!("{}", "OK".green());
            Arc::new(c)
        }
        Err(e) => {
            println!("{}", "FAILED".red());
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    };
    runtime.spawn(print_alerts(coordinator.bus().clone()));

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_ctrlc = shutdown.clone();
    let coordinator_ctrlc = coordinator.clone();
    let runtime_handle = runtime.handle().clone();

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – stopping the robot …".yellow().bold());
        match runtime_handle.block_on(coordinator_ctrlc.emergency_stop("operator Ctrl-C")) {
            Ok(()) => println!("{}", "  ✓ Stop-all acknowledged.".green()),
            Err(e) => println!("  {}: {}", "Stop-all failed".red(), e),
        }
        println!("{}", "  Press Enter to exit.".dimmed());
        shutdown_ctrlc.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler; Ctrl-C will not stop the robot");
    }

    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    // ── Interactive REPL ──────────────────────────────────────────────────
    repl::run(shutdown, &runtime, &coordinator);
    info!("operator console closed");
}

// ─────────────────────────────────────────────────────────────────────────────
// Boot
// ─────────────────────────────────────────────────────────────────────────────

/// Open the link and start the coordinator.
async fn boot(cfg: &config::Config) -> Result<Coordinator, AgriError> {
    let protocol = ProtocolConfig::from_profile(&cfg.calibration, cfg.link.command_timeout());
    let client = if cfg.link.is_sim() {
        let (stream, _probe) = SimUnit::new()
            .with_wheel_speed(cfg.calibration.wheel_speed_cm_s)
            .spawn();
        ProtocolClient::spawn(StreamLink::new(stream, config::SIM_ENDPOINT), protocol).0
    } else {
        let link = agribot_middleware::connect(&cfg.link.endpoint).await?;
        ProtocolClient::spawn(link, protocol).0
    };

    let coordinator_config =
        CoordinatorConfig::from_profile(&cfg.calibration, cfg.link.command_timeout());
    let mut coordinator = Coordinator::spawn(
        cfg.calibration.clone(),
        client,
        EventBus::default(),
        coordinator_config,
    )?;

    if let Some(source) = cfg.detection_source()? {
        info!(source = source.id(), kind = ?cfg.detection.source, "detection feed attached");
        coordinator.attach_source(source);
    }
    Ok(coordinator)
}

/// Echo operator-relevant alerts above the prompt.
async fn print_alerts(bus: EventBus) {
    let mut alerts = bus.subscribe_to(Topic::SystemAlerts);
    while let Some(event) = alerts.next().await {
        let line = match event.payload {
            EventPayload::EmergencyStop { reason } => format!("stopped: {reason}").yellow(),
            EventPayload::MissionFault { command, message } => {
                format!("fault on {command}: {message}").red()
            }
            EventPayload::FullyBlocked { .. } => "fully blocked, mission halted".red(),
            EventPayload::LinkHealth { alive: false } => "actuator link silent".red().bold(),
            EventPayload::ObstacleAvoided { action, .. } => format!("obstacle: {action}").cyan(),
            _ => continue,
        };
        println!("\n  {} {}", "▲".bold(), line);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

fn load_or_create_config() -> config::Config {
    match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => {
            let mut cfg = config::Config::default();
            match config::save(&cfg) {
                Ok(()) => println!(
                    "  {} Default config written to {}",
                    "✓".green().bold(),
                    config::config_path().display().to_string().bold()
                ),
                Err(e) => println!("{}: {}", "Error saving config".red(), e),
            }
            config::apply_env_overrides(&mut cfg);
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   ___              _ ___       __ "#.bold().green());
    println!("{}", r#"  / _ | ___ _____  (_) _ )___  / /_"#.bold().green());
    println!("{}", r#" / __ |/ _ `/ __/ / / _  / _ \/ __/"#.bold().green());
    println!("{}", r#"/_/ |_|\_, /_/   /_/____/\___/\__/ "#.bold().green());
    println!("{}", r#"      /___/                        "#.bold().green());
    println!();
    println!(
        "  {} {}",
        "AgriBot".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Targeted weed treatment controller");
    println!();
}
