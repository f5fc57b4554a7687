//! `vigil` – Vigil Command Line Interface
//!
//! Three ways to run:
//!
//! | Invocation | What runs |
//! |---|---|
//! | `vigil` | heartbeat + watchdog in-process, plus the interactive shell |
//! | `vigil watch` | the watchdog only, supervising whichever process writes the heartbeat |
//! | `vigil beat` | the heartbeat only; this process is the one being supervised |
//!
//! Running `vigil beat` and `vigil watch` against the same data directory in
//! two terminals gives a real two-process setup: stop the `beat` process
//! with SIGSTOP and watch the escalation happen.
//!
//! On first start a short wizard writes `~/.vigil/config.toml`.  Ctrl-C stops
//! both background threads before exiting.

mod config;
mod repl;

use colored::Colorize;
use std::io::{self, IsTerminal, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, warn};

use vigil_middleware::HandlerError;
use vigil_runtime::{Supervisor, init_tracing};
use vigil_types::{Event, EventKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Interactive,
    Watch,
    Beat,
    Help,
}

fn parse_mode(args: &[String]) -> Result<Mode, String> {
    match args.first().map(String::as_str) {
        None => Ok(Mode::Interactive),
        Some("watch") => Ok(Mode::Watch),
        Some("beat") => Ok(Mode::Beat),
        Some("help" | "-h" | "--help") => Ok(Mode::Help),
        Some(other) => Err(format!("unknown mode '{other}'")),
    }
}

fn main() {
    let _tracing = init_tracing("vigil");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mode = match parse_mode(&args) {
        Ok(Mode::Help) => {
            print_usage();
            return;
        }
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("{} {}", "Error:".red(), e);
            print_usage();
            std::process::exit(2);
        }
    };

    if mode == Mode::Interactive {
        print_banner();
    }

    // ── Configuration ─────────────────────────────────────────────────────
    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) if mode == Mode::Interactive && io::stdin().is_terminal() => {
            run_first_run_wizard()
        }
        Ok(None) => {
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
        Err(e) => {
            warn!(error = %e, "config unreadable; using defaults");
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };

    let supervisor_config = match cfg.to_supervisor_config() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}: {}", "Config error".red(), e);
            std::process::exit(2);
        }
    };

    let supervisor = match Supervisor::new(supervisor_config) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "failed to start supervisor");
            eprintln!("{}: {}", "Startup failed".red(), e);
            std::process::exit(1);
        }
    };
    println!(
        "  Data directory {}",
        supervisor.data_dir().display().to_string().bold()
    );

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        let supervisor = Arc::clone(&supervisor);
        // The interactive shell is blocked on stdin, so it cannot observe
        // the flag; stop everything from the handler and exit.
        let exit_from_handler = mode == Mode::Interactive;
        if let Err(e) = ctrlc::set_handler(move || {
            println!();
            println!("{}", "⚠  Ctrl-C received – shutting down …".yellow().bold());
            shutdown.store(true, Ordering::SeqCst);
            if exit_from_handler {
                let clean = supervisor.stop();
                report_stop(clean);
                std::process::exit(130);
            }
        }) {
            warn!(error = %e, "Failed to install Ctrl-C handler; threads will not be stopped cleanly on Ctrl-C");
        }
    }

    match mode {
        Mode::Interactive => {
            let events = repl::EventLog::attach(supervisor.bus());
            if let Err(e) = supervisor.start_pulse() {
                println!("{}: {}", "Heartbeat failed to start".red(), e);
            }
            if let Err(e) = supervisor.start_watchdog() {
                println!("{}: {}", "Watchdog failed to start".red(), e);
            }
            println!();
            println!("  Type {} for a list of commands.\n", "/help".bold().cyan());
            repl::run(&supervisor, &events, Arc::clone(&shutdown));
        }
        Mode::Watch => {
            attach_printer(&supervisor);
            match supervisor.start_watchdog() {
                Ok(()) => println!(
                    "  {} watching {}",
                    "●".green().bold(),
                    supervisor.heartbeat().path().display()
                ),
                Err(e) => {
                    eprintln!("{}: {}", "Watchdog failed to start".red(), e);
                    std::process::exit(1);
                }
            }
            wait_for(&shutdown);
        }
        Mode::Beat => {
            match supervisor.start_pulse() {
                Ok(()) => println!(
                    "  {} beating as pid {} every {:?}",
                    "●".green().bold(),
                    supervisor.pulse().pid(),
                    supervisor.pulse().interval()
                ),
                Err(e) => {
                    eprintln!("{}: {}", "Heartbeat failed to start".red(), e);
                    std::process::exit(1);
                }
            }
            wait_for(&shutdown);
        }
        Mode::Help => {}
    }

    report_stop(supervisor.stop());
}

fn wait_for(shutdown: &AtomicBool) {
    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }
}

fn report_stop(clean: bool) {
    if clean {
        println!("{}", "  ✓ Background threads stopped.".green());
    } else {
        println!(
            "{}",
            "  ⚠ A background thread did not stop in time and was detached.".yellow()
        );
    }
}

/// Print watchdog-relevant events as they happen.
fn attach_printer(supervisor: &Supervisor) {
    let print = |event: &Event| -> Result<(), HandlerError> {
        let line = format!("{} {}", event.kind.as_str(), event.data);
        let stamp = event.timestamp.format("%H:%M:%S").to_string();
        match event.kind {
            EventKind::HeartbeatRecovered => println!("  {} {}", stamp.dimmed(), line.green()),
            EventKind::HeartbeatMissed => println!("  {} {}", stamp.dimmed(), line.yellow()),
            _ => println!("  {} {}", stamp.dimmed(), line.red().bold()),
        }
        Ok(())
    };
    for kind in [
        EventKind::HeartbeatMissed,
        EventKind::HeartbeatRecovered,
        EventKind::EscalationTriggered,
        EventKind::SafetyModeChanged,
        EventKind::SnapshotCreated,
        EventKind::TrustScoreChanged,
    ] {
        supervisor.bus().subscribe(kind, print);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// First-Run Wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_first_run_wizard() -> config::Config {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║        Vigil First-Run Wizard        ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!();
    println!("  No configuration found.  Let's set up Vigil.\n");

    let mut cfg = config::Config::default();

    let data_dir = cfg.data_dir.display().to_string();
    let answer = prompt_line(&format!("  Data directory [{data_dir}]: "), &data_dir);
    cfg.data_dir = answer.trim().into();

    let timeout = cfg.watchdog.timeout_secs.to_string();
    let answer = prompt_line(
        &format!("  Seconds of silence before the watchdog escalates [{timeout}]: "),
        &timeout,
    );
    if let Ok(secs) = answer.trim().parse::<f64>()
        && secs > 0.0
    {
        cfg.watchdog.timeout_secs = secs;
    }

    let answer = prompt_line(
        "  Paths to include in snapshots (comma-separated, blank for none): ",
        "",
    );
    cfg.snapshot.include_paths = answer
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(Into::into)
        .collect();

    match config::save(&cfg) {
        Ok(()) => println!(
            "\n  {} Config saved to {}\n",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    config::apply_env_overrides(&mut cfg);
    cfg
}

/// Print `prompt`, read a line from stdin, and return it (or `default` if
/// the user just pressed Enter).
fn prompt_line(prompt: &str, default: &str) -> String {
    print!("{prompt}");
    io::stdout().flush().ok();
    let mut buf = String::new();
    if io::stdin().read_line(&mut buf).is_err() {
        return default.to_string();
    }
    let trimmed = buf.trim();
    if trimmed.is_empty() {
        default.to_string()
    } else {
        trimmed.to_string()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"  _    ___       _ __"#.bold().cyan());
    println!("{}", r#" | |  / (_)___ _(_) /"#.bold().cyan());
    println!("{}", r#" | | / / / __ `/ / / "#.bold().cyan());
    println!("{}", r#" | |/ / / /_/ / / /  "#.bold().cyan());
    println!("{}", r#" |___/_/\__, /_/_/   "#.bold().cyan());
    println!("{}", r#"       /____/        "#.bold().cyan());
    println!();
    println!("  {}", "Self-monitoring supervision core".dimmed());
    println!();
}

fn print_usage() {
    println!("{}", "Usage:".bold());
    println!("  vigil          interactive shell with heartbeat and watchdog");
    println!("  vigil watch    run the watchdog only");
    println!("  vigil beat     write heartbeats only");
    println!();
    println!("Configuration is read from {}.", config::config_path().display());
}
