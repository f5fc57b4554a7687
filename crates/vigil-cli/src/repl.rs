//! REPL – the operator shell over a running [`Supervisor`].
//!
//! Supported slash-commands:
//!   /status                    – liveness, watchdog, safety mode and trust at a glance
//!   /beat                      – write one heartbeat now
//!   /pause | /resume           – stop/restart heartbeat writes (simulates a hang)
//!   /reset-stats               – zero the heartbeat counters and intervals
//!   /tick                      – run one watchdog check immediately
//!   /trust [delta]             – show statistics, or apply a manual adjustment
//!   /op <tier> [ok|fail] [--approve NAME] [description]
//!                              – run a simulated operation through the gate
//!   /snapshot [description]    – take a snapshot of the configured paths
//!   /snapshots                 – list snapshots, newest first
//!   /verify <id>               – re-hash a snapshot against its manifest
//!   /safety [enter <level> | exit [--override]]
//!   /freezes                   – show the freeze log
//!   /events [n]                – show the last `n` bus events (default 10)
//!   /quit | /exit              – stop the supervisor and exit

use colored::Colorize;
use std::collections::VecDeque;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use vigil_kernel::{HeartbeatStats, StepStatus};
use vigil_middleware::EventBus;
use vigil_runtime::{OperationRequest, Supervisor};
use vigil_types::{Approval, CapabilityTier, Event, EventKind, SafetyLevel};

const EVENT_LOG_CAPACITY: usize = 200;

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum SafetyAction {
    Show,
    Enter(SafetyLevel),
    Exit { override_lockdown: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Status,
    Beat,
    Pause,
    Resume,
    ResetStats,
    Tick,
    Trust { adjust: Option<f64> },
    Op {
        tier: CapabilityTier,
        succeed: bool,
        approval: Approval,
        description: String,
    },
    Snapshot { description: String },
    Snapshots,
    Verify(String),
    Safety(SafetyAction),
    Freezes,
    Events(usize),
    Quit,
}

/// Parse one input line.  The error is a user-facing message.
pub fn parse(line: &str) -> Result<Command, String> {
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return Err("empty command".to_string());
    };
    let rest: Vec<&str> = words.collect();

    match head {
        "/help" => Ok(Command::Help),
        "/status" => Ok(Command::Status),
        "/beat" => Ok(Command::Beat),
        "/pause" => Ok(Command::Pause),
        "/resume" => Ok(Command::Resume),
        "/reset-stats" => Ok(Command::ResetStats),
        "/tick" => Ok(Command::Tick),
        "/trust" => match rest.first() {
            None => Ok(Command::Trust { adjust: None }),
            Some(raw) => raw
                .parse::<f64>()
                .ok()
                .filter(|d| d.is_finite())
                .map(|d| Command::Trust { adjust: Some(d) })
                .ok_or_else(|| format!("'{raw}' is not a number")),
        },
        "/op" => parse_op(&rest),
        "/snapshot" => Ok(Command::Snapshot {
            description: if rest.is_empty() {
                "manual snapshot".to_string()
            } else {
                rest.join(" ")
            },
        }),
        "/snapshots" => Ok(Command::Snapshots),
        "/verify" => rest
            .first()
            .map(|id| Command::Verify((*id).to_string()))
            .ok_or_else(|| "usage: /verify <snapshot-id>".to_string()),
        "/safety" => parse_safety(&rest),
        "/freezes" => Ok(Command::Freezes),
        "/events" => match rest.first() {
            None => Ok(Command::Events(10)),
            Some(raw) => raw
                .parse::<usize>()
                .map(Command::Events)
                .map_err(|_| format!("'{raw}' is not a count")),
        },
        "/quit" | "/exit" => Ok(Command::Quit),
        other => Err(format!("unknown command '{other}'")),
    }
}

fn parse_op(args: &[&str]) -> Result<Command, String> {
    const USAGE: &str = "usage: /op <tier> [ok|fail] [--approve NAME] [description]";
    let Some(raw_tier) = args.first() else {
        return Err(USAGE.to_string());
    };
    let tier = raw_tier
        .parse::<CapabilityTier>()
        .map_err(|e| e.to_string())?;

    let mut succeed = true;
    let mut approval = Approval::Absent;
    let mut description = Vec::new();
    let mut iter = args[1..].iter();
    while let Some(&word) = iter.next() {
        match word {
            "ok" if description.is_empty() => succeed = true,
            "fail" if description.is_empty() => succeed = false,
            "--approve" => {
                let name = iter.next().ok_or_else(|| USAGE.to_string())?;
                approval = Approval::Granted((*name).to_string());
            }
            other => description.push(other),
        }
    }

    Ok(Command::Op {
        tier,
        succeed,
        approval,
        description: if description.is_empty() {
            format!("{tier} operation")
        } else {
            description.join(" ")
        },
    })
}

fn parse_safety(args: &[&str]) -> Result<Command, String> {
    match args {
        [] => Ok(Command::Safety(SafetyAction::Show)),
        ["enter", level] => level
            .parse::<SafetyLevel>()
            .map(|l| Command::Safety(SafetyAction::Enter(l)))
            .map_err(|e| e.to_string()),
        ["exit"] => Ok(Command::Safety(SafetyAction::Exit {
            override_lockdown: false,
        })),
        ["exit", "--override"] => Ok(Command::Safety(SafetyAction::Exit {
            override_lockdown: true,
        })),
        _ => Err("usage: /safety [enter <level> | exit [--override]]".to_string()),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Event log
// ─────────────────────────────────────────────────────────────────────────────

/// Bounded in-memory copy of everything published on the bus.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<VecDeque<Event>>>,
}

impl EventLog {
    /// Subscribe to every event kind on `bus`.
    pub fn attach(bus: &EventBus) -> Self {
        let log = Self::default();
        for kind in EventKind::ALL {
            let events = Arc::clone(&log.events);
            bus.subscribe(kind, move |event| {
                let mut events = events.lock();
                if events.len() == EVENT_LOG_CAPACITY {
                    events.pop_front();
                }
                events.push_back(event.clone());
                Ok(())
            });
        }
        log
    }

    /// The last `n` events, oldest first.
    pub fn recent(&self, n: usize) -> Vec<Event> {
        let events = self.events.lock();
        let skip = events.len().saturating_sub(n);
        events.iter().skip(skip).cloned().collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Loop
// ─────────────────────────────────────────────────────────────────────────────

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled each iteration; when set the REPL exits cleanly.
pub fn run(supervisor: &Supervisor, events: &EventLog, shutdown: Arc<AtomicBool>) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        print!("{} ", "vigil>".bold().cyan());
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
        if input.is_empty() {
            continue;
        }

        match parse(input) {
            Ok(Command::Quit) => {
                println!("{}", "Goodbye.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Ok(cmd) => execute(supervisor, events, cmd),
            Err(msg) => println!(
                "{} {}. Type {} for available commands.",
                "Error:".red(),
                msg.yellow(),
                "/help".bold()
            ),
        }
    }
}

fn execute(sup: &Supervisor, events: &EventLog, cmd: Command) {
    match cmd {
        Command::Help => cmd_help(),
        Command::Status => cmd_status(sup),
        Command::Beat => match sup.pulse().beat_now() {
            Ok(r) => println!(
                "  {} heartbeat written (pid {}, trust {:.1})",
                "✓".green().bold(),
                r.pid,
                r.trust_score
            ),
            Err(e) => println!("  {} {}", "✗".red().bold(), e),
        },
        Command::Pause => {
            sup.pulse().pause();
            println!(
                "  {} heartbeat paused; the watchdog escalates after {} missed checks",
                "⚠".yellow().bold(),
                sup.watchdog().config().max_misses
            );
        }
        Command::Resume => {
            sup.pulse().resume();
            println!("  {} heartbeat resumed", "✓".green().bold());
        }
        Command::ResetStats => match sup.heartbeat().reset_stats() {
            Ok(()) => println!("  {} heartbeat stats reset", "✓".green().bold()),
            Err(e) => println!("  {} {}", "✗".red().bold(), e),
        },
        Command::Tick => cmd_tick(sup),
        Command::Trust { adjust } => cmd_trust(sup, adjust),
        Command::Op {
            tier,
            succeed,
            approval,
            description,
        } => cmd_op(sup, tier, succeed, approval, description),
        Command::Snapshot { description } => {
            match sup.create_snapshot(&description, CapabilityTier::Tier3) {
                Ok(outcome) => {
                    println!(
                        "  {} {} ({}/{} files)",
                        "✓".green().bold(),
                        outcome.snapshot_id.bold(),
                        outcome.manifest.copied_files,
                        outcome.manifest.total_files
                    );
                    for skipped in &outcome.skipped {
                        println!(
                            "    {} {}: {}",
                            "skipped".yellow(),
                            skipped.path.display(),
                            skipped.reason
                        );
                    }
                }
                Err(e) => println!("  {} {}", "✗".red().bold(), e),
            }
        }
        Command::Snapshots => cmd_snapshots(sup),
        Command::Verify(id) => match sup.snapshots().verify(&id) {
            Ok(v) if v.valid => println!("  {} {}", "✓".green().bold(), v.message),
            Ok(v) => {
                println!("  {} {}", "✗".red().bold(), v.message);
                for f in &v.details.missing_files {
                    println!("    {} {}", "missing".red(), f);
                }
                for f in &v.details.checksum_mismatch {
                    println!("    {} {}", "mismatch".red(), f);
                }
            }
            Err(e) => println!("  {} {}", "✗".red().bold(), e),
        },
        Command::Safety(action) => cmd_safety(sup, action),
        Command::Freezes => match sup.freeze_log().read_all() {
            Ok(entries) if entries.is_empty() => println!("  {}", "No freeze events.".dimmed()),
            Ok(entries) => {
                for e in entries {
                    println!(
                        "  {}  misses={}  last_beat={}  safety={}",
                        e.timestamp.to_rfc3339().dimmed(),
                        e.consecutive_misses,
                        e.last_heartbeat_time
                            .map(|t| t.to_rfc3339())
                            .unwrap_or_else(|| "never".to_string()),
                        e.safety_mode_entered
                            .map(|l| l.to_string())
                            .unwrap_or_else(|| "-".to_string())
                    );
                }
            }
            Err(e) => println!("  {} {}", "✗".red().bold(), e),
        },
        Command::Events(n) => {
            let recent = events.recent(n);
            if recent.is_empty() {
                println!("  {}", "No events yet.".dimmed());
            }
            for e in recent {
                println!(
                    "  {} {:<22} {} {}",
                    e.timestamp.format("%H:%M:%S%.3f").to_string().dimmed(),
                    e.kind.as_str().bold(),
                    e.source.dimmed(),
                    e.data
                );
            }
        }
        Command::Quit => {}
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_help() {
    println!();
    println!("  {}", "Available commands:".bold());
    let rows = [
        ("/status", "Liveness, watchdog, safety mode and trust"),
        ("/beat", "Write one heartbeat now"),
        ("/pause", "Stop heartbeat writes (simulates a hang)"),
        ("/resume", "Restart heartbeat writes"),
        ("/reset-stats", "Zero heartbeat counters and intervals"),
        ("/tick", "Run one watchdog check immediately"),
        ("/trust [delta]", "Show trust statistics or adjust the score"),
        ("/op <tier> [ok|fail] [--approve NAME] [desc]", "Run a simulated operation"),
        ("/snapshot [desc]", "Snapshot the configured paths"),
        ("/snapshots", "List snapshots"),
        ("/verify <id>", "Verify a snapshot's checksums"),
        ("/safety [enter <level> | exit [--override]]", "Show or change the safety mode"),
        ("/freezes", "Show the freeze log"),
        ("/events [n]", "Show recent bus events"),
        ("/quit", "Stop the supervisor and exit"),
    ];
    for (cmd, desc) in rows {
        println!("    {:<46} {}", cmd.bold().cyan(), desc);
    }
    println!();
}

fn cmd_status(sup: &Supervisor) {
    let beat = sup.heartbeat().check();
    let wd = sup.watchdog().status();
    let (level, trust, band) = {
        let level = sup.safety().lock().level();
        let trust = sup.trust().lock();
        (level, trust.score(), trust.band())
    };

    println!();
    let liveness = if beat.ok {
        "ok".green().bold()
    } else {
        beat.error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown".to_string())
            .red()
            .bold()
    };
    print!("  {:<12} {}", "Heartbeat".bold(), liveness);
    if let Some(age) = beat.age_secs {
        print!("  ({age:.1}s old)");
    }
    if sup.pulse().is_paused() {
        print!("  {}", "[paused]".yellow());
    }
    println!();
    println!("  {:<12} {}", "", beat_summary(&sup.heartbeat().stats()).dimmed());

    println!(
        "  {:<12} {}  misses={}/{}  escalations={}",
        "Watchdog".bold(),
        if wd.running {
            "running".green()
        } else {
            "stopped".yellow()
        },
        wd.consecutive_misses,
        sup.watchdog().config().max_misses,
        wd.escalations
    );

    let level_str = match level {
        SafetyLevel::Normal => level.to_string().green(),
        SafetyLevel::Degraded => level.to_string().yellow(),
        SafetyLevel::Safe | SafetyLevel::Lockdown => level.to_string().red().bold(),
    };
    println!("  {:<12} {}", "Safety".bold(), level_str);
    println!("  {:<12} {:.1} ({})", "Trust".bold(), trust, band);
    println!();
}

fn beat_summary(stats: &HeartbeatStats) -> String {
    let mut line = format!(
        "writes={} checks={} failures={}",
        stats.total_writes, stats.total_checks, stats.total_failures
    );
    if let (Some(min), Some(avg), Some(max)) = (
        stats.min_interval_secs,
        stats.avg_interval_secs,
        stats.max_interval_secs,
    ) {
        line.push_str(&format!("  interval min/avg/max={min:.2}/{avg:.2}/{max:.2}s"));
    }
    if let Some(last) = stats.last_beat_time {
        line.push_str(&format!("  last={}", last.format("%H:%M:%S")));
    }
    line
}

fn cmd_tick(sup: &Supervisor) {
    let outcome = sup.watchdog().tick();
    if outcome.healthy {
        println!("  {} heartbeat healthy", "✓".green().bold());
        return;
    }
    let reason = outcome
        .failure
        .map(|e| e.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    println!(
        "  {} check failed ({}); {} consecutive",
        "✗".red().bold(),
        reason,
        outcome.consecutive_misses
    );
    if let Some(report) = outcome.escalation {
        println!("  {}", "Escalation triggered:".red().bold());
        for step in &report.steps {
            let status = match &step.status {
                StepStatus::Succeeded => "ok".green(),
                StepStatus::Failed(why) => format!("failed: {why}").red(),
                StepStatus::Skipped(why) => format!("skipped: {why}").yellow(),
            };
            println!("    {:<12} {}", format!("{:?}", step.step), status);
        }
    }
}

fn cmd_trust(sup: &Supervisor, adjust: Option<f64>) {
    if let Some(delta) = adjust {
        match sup.adjust_trust(delta) {
            Ok(u) => println!(
                "  {} {:.1} → {:.1}{}",
                "✓".green().bold(),
                u.old,
                u.new,
                if u.clamped { " (clamped)" } else { "" }
            ),
            Err(e) => println!("  {} {}", "✗".red().bold(), e),
        }
        return;
    }
    let stats = sup.trust_statistics();
    println!();
    println!("  {:<18} {:.1} ({})", "Score".bold(), stats.current_score, stats.band);
    println!("  {:<18} {}", "Records".bold(), stats.total_records);
    println!("  {:<18} {:+.2}", "Recent avg delta".bold(), stats.recent_avg_delta);
    println!("  {:<18} {:.0}%", "Recent success".bold(), stats.recent_success_rate);
    println!(
        "  {:<18} {:.1} – {:.1}",
        "Range seen".bold(),
        stats.min_score_seen,
        stats.max_score_seen
    );
    println!();
}

fn cmd_op(
    sup: &Supervisor,
    tier: CapabilityTier,
    succeed: bool,
    approval: Approval,
    description: String,
) {
    let request = OperationRequest::new(description, tier).with_approval(approval);
    let result = sup.run_operation(request, || {
        if succeed {
            Ok(())
        } else {
            Err("simulated failure")
        }
    });
    match result {
        Ok(outcome) => {
            let r = outcome.report;
            let mark = if r.success {
                "✓".green().bold()
            } else {
                "✗".yellow().bold()
            };
            print!("  {} {} {}", mark, r.operation_id.bold(), r.tier);
            if let Some(err) = &r.error {
                print!("  error: {}", err.yellow());
            }
            if let Some(id) = &r.snapshot_id {
                print!("  snapshot: {}", id.dimmed());
            }
            match r.score_update {
                Some(u) => println!("  trust {:.1} → {:.1}", u.old, u.new),
                None => println!("  trust unchanged"),
            }
        }
        Err(e) => println!("  {} {}", "Refused:".red().bold(), e),
    }
}

fn cmd_snapshots(sup: &Supervisor) {
    match sup.snapshots().list() {
        Ok(list) if list.is_empty() => println!("  {}", "No snapshots.".dimmed()),
        Ok(list) => {
            for m in list {
                println!(
                    "  {}  {}  {:>4} files  {}",
                    m.snapshot_id.bold(),
                    m.tier,
                    m.copied_files,
                    m.description.dimmed()
                );
            }
        }
        Err(e) => println!("  {} {}", "✗".red().bold(), e),
    }
}

fn cmd_safety(sup: &Supervisor, action: SafetyAction) {
    let result = match action {
        SafetyAction::Show => {
            let safety = sup.safety().lock();
            println!();
            println!("  {:<10} {}", "Level".bold(), safety.level());
            if let Some(at) = safety.entered_at() {
                println!("  {:<10} {}", "Since".bold(), at.to_rfc3339());
            }
            let join = |set: &std::collections::BTreeSet<String>| {
                set.iter().cloned().collect::<Vec<_>>().join(", ")
            };
            println!("  {:<10} {}", "Enabled".bold(), join(safety.enabled_features()).green());
            println!("  {:<10} {}", "Disabled".bold(), join(safety.disabled_features()).red());
            println!();
            return;
        }
        SafetyAction::Enter(level) => sup.enter_safety_mode(level),
        SafetyAction::Exit { override_lockdown } => sup.exit_safety_mode(override_lockdown),
    };
    match result {
        Ok(t) if !t.changed => println!("  {} already {}", "·".dimmed(), t.to),
        Ok(t) => {
            println!("  {} {} → {}", "✓".green().bold(), t.from, t.to.to_string().bold());
            if !t.persisted {
                println!("  {} change could not be persisted", "⚠".yellow().bold());
            }
        }
        Err(e) => println!("  {} {}", "✗".red().bold(), e),
    }
}
