//! REPL – the operator shell.
//!
//! Supported slash-commands:
//!   /start        – leave Idle and start searching
//!   /stop         – stop-all and return to Idle
//!   /reset        – stop, forget every track and zero the counters
//!   /status       – mission state, counters and link statistics
//!   /ping         – round-trip a PING to the actuator unit
//!   /help         – show this list
//!   /quit | /exit – stop the robot and exit the CLI

use colored::Colorize;
use std::io::{self, BufRead, Write};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use agribot_runtime::Coordinator;
use agribot_types::{MissionState, MissionStatus};
use tokio::runtime::Runtime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellCommand {
    Start,
    Stop,
    Reset,
    Status,
    Ping,
    Help,
    Quit,
}

impl FromStr for ShellCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "/start" => Ok(Self::Start),
            "/stop" => Ok(Self::Stop),
            "/reset" => Ok(Self::Reset),
            "/status" => Ok(Self::Status),
            "/ping" => Ok(Self::Ping),
            "/help" | "/?" => Ok(Self::Help),
            "/quit" | "/exit" => Ok(Self::Quit),
            other => Err(other.to_string()),
        }
    }
}

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled each iteration; when set the REPL exits cleanly.
pub fn run(shutdown: Arc<AtomicBool>, runtime: &Runtime, coordinator: &Coordinator) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        print!("{} ", "agribot>".bold().green());
        stdout.flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        }

        let input = line.trim();
        if input.is_empty() || shutdown.load(Ordering::SeqCst) {
            continue;
        }

        match input.parse::<ShellCommand>() {
            Ok(ShellCommand::Start) => cmd_start(runtime, coordinator),
            Ok(ShellCommand::Stop) => {
                coordinator.handle().stop("operator");
                println!("{}", "Stop requested.".yellow());
            }
            Ok(ShellCommand::Reset) => cmd_reset(runtime, coordinator),
            Ok(ShellCommand::Status) => print_status(&coordinator.handle().status(), coordinator),
            Ok(ShellCommand::Ping) => cmd_ping(runtime, coordinator),
            Ok(ShellCommand::Help) => cmd_help(),
            Ok(ShellCommand::Quit) => {
                if let Err(e) = runtime.block_on(coordinator.emergency_stop("operator quit")) {
                    println!("{}: {}", "Stop-all failed".red(), e);
                }
                println!("{}", "Goodbye.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Err(other) => {
                println!(
                    "{} '{}'. Type {} for available commands.",
                    "Unknown command:".red(),
                    other.yellow(),
                    "/help".bold()
                );
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_help() {
    println!();
    println!("{}", "AgriBot Commands".bold().underline());
    println!("  {}   – start searching for targets", "/start".bold().cyan());
    println!("  {}    – stop-all and return to Idle", "/stop".bold().cyan());
    println!("  {}   – stop and clear tracks and counters", "/reset".bold().cyan());
    println!("  {}  – mission state and counters", "/status".bold().cyan());
    println!("  {}    – check the actuator link", "/ping".bold().cyan());
    println!("  {}  – stop the robot and exit", "/quit  /exit".bold().cyan());
    println!();
}

fn cmd_start(runtime: &Runtime, coordinator: &Coordinator) {
    let handle = coordinator.handle();
    if handle.status().state != MissionState::Idle {
        println!("{}", "Mission already running.".yellow());
        return;
    }
    match runtime.block_on(handle.start()) {
        Ok(()) => println!("{} Mission started.", "✓".green().bold()),
        Err(e) => println!("{}: {}", "Start failed".red(), e),
    }
}

fn cmd_reset(runtime: &Runtime, coordinator: &Coordinator) {
    match runtime.block_on(coordinator.handle().reset()) {
        Ok(()) => println!("{} Counters and tracks cleared.", "✓".green().bold()),
        Err(e) => println!("{}: {}", "Reset failed".red(), e),
    }
}

fn cmd_ping(runtime: &Runtime, coordinator: &Coordinator) {
    print!("  PING … ");
    io::stdout().flush().ok();
    let started = Instant::now();
    match runtime.block_on(coordinator.dispatcher().client().ping()) {
        Ok(()) => println!(
            "{} in {} ms",
            "PONG".green(),
            started.elapsed().as_millis()
        ),
        Err(e) => println!("{}: {}", "no answer".red(), e),
    }
}

fn print_status(status: &MissionStatus, coordinator: &Coordinator) {
    let state = status.state.to_string();
    let state = if status.state == MissionState::Idle {
        state.dimmed()
    } else {
        state.green().bold()
    };
    println!("{}", "Mission Status".bold().underline());
    println!("  State          : {}", state);
    if let Some(id) = status.current_target {
        println!("  Target         : #{}", id);
    }
    println!("  Treated        : {}", status.treated.to_string().bold());
    println!("  Avoided        : {}", status.avoided);
    println!("  Skipped        : {}", status.skipped);
    println!("  Obstacle events: {}", status.obstacle_events);
    println!("  Distance       : {:.1} cm", status.distance_cm);
    if let Some(err) = &status.last_error {
        println!("  Last error     : {}", err.red());
    }

    let link = coordinator.dispatcher().client().stats();
    println!(
        "  Link           : {} sent, {} acknowledged, {} refused, {} timeouts, {} malformed",
        link.sent, link.acknowledged, link.refused, link.timeouts, link.malformed
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_command() {
        let cases = [
            ("/start", ShellCommand::Start),
            ("/stop", ShellCommand::Stop),
            ("/reset", ShellCommand::Reset),
            ("/status", ShellCommand::Status),
            ("/ping", ShellCommand::Ping),
            ("/help", ShellCommand::Help),
            ("/quit", ShellCommand::Quit),
            ("/exit", ShellCommand::Quit),
        ];
        for (input, expected) in cases {
            assert_eq!(input.parse::<ShellCommand>(), Ok(expected), "{input}");
        }
    }

    #[test]
    fn parsing_ignores_case_and_padding() {
        assert_eq!("  /STOP \n".parse::<ShellCommand>(), Ok(ShellCommand::Stop));
    }

    #[test]
    fn unknown_command_is_echoed_back() {
        assert_eq!(
            "/spray".parse::<ShellCommand>(),
            Err("/spray".to_string())
        );
    }
}
