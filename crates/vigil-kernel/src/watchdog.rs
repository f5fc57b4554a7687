//! [`Watchdog`] – the dead-man's switch.
//!
//! The watchdog runs on its own OS thread, independent of whatever it is
//! watching.  Every `check_interval` it performs **dual validation**:
//!
//! 1. the liveness record must pass [`HeartbeatMonitor::check`], and
//! 2. the supervised process must still exist.
//!
//! Each failed tick increments a miss counter; any healthy tick resets it.
//! Once `max_misses` consecutive ticks have failed the escalation sequence
//! runs, exactly once per continuous miss streak:
//!
//! | Step | Action |
//! |---|---|
//! | [`EscalationStep::Terminate`] | SIGTERM, wait `grace_period`, then SIGKILL |
//! | [`EscalationStep::Snapshot`] | emergency snapshot |
//! | [`EscalationStep::SafetyMode`] | enter `Safe` (or `Lockdown` on a repeat) |
//! | [`EscalationStep::FreezeLog`] | append a [`FreezeEvent`] |
//!
//! A failing step never prevents the following ones, and the freeze log is
//! always attempted.
//!
//! # Timing
//!
//! The loop sleeps before it ticks.  With no heartbeat ever written,
//! escalation therefore happens `max_misses * check_interval` after
//! [`Watchdog::start`].
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use parking_lot::Mutex;
//! use vigil_kernel::{
//!     HeartbeatMonitor, OsProcessControl, SafetyModeManager, TrustConfig, TrustScorer,
//!     Watchdog, WatchdogConfig, WatchdogServices,
//! };
//! use vigil_memory::{FreezeLog, SnapshotService};
//! use vigil_middleware::EventBus;
//!
//! let dir = tempfile::tempdir().unwrap();
//! let services = WatchdogServices {
//!     heartbeat: Arc::new(HeartbeatMonitor::new(dir.path().join("beat.json"), Duration::from_secs(10))),
//!     safety: Arc::new(Mutex::new(SafetyModeManager::load(dir.path().join("safety.json")))),
//!     trust: Arc::new(Mutex::new(
//!         TrustScorer::load(dir.path().join("trust.json"), TrustConfig::default()).unwrap(),
//!     )),
//!     snapshots: SnapshotService::new(dir.path().join("backups"), vec![], 5),
//!     freeze_log: FreezeLog::new(dir.path().join("freeze.jsonl")),
//!     bus: EventBus::new(),
//!     process: Arc::new(OsProcessControl),
//! };
//! let watchdog = Watchdog::new(WatchdogConfig::default(), services);
//!
//! // No heartbeat yet: the tick fails but one miss is not enough to escalate.
//! let outcome = watchdog.tick();
//! assert!(!outcome.healthy);
//! assert!(outcome.escalation.is_none());
//! ```

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};
use vigil_memory::{FreezeEvent, FreezeLog, SnapshotRequest, SnapshotService};
use vigil_middleware::EventBus;
use vigil_types::{CapabilityTier, EventKind, SafetyLevel, VigilError};

use crate::heartbeat::HeartbeatMonitor;
use crate::process::{ProcessControl, is_signalable_pid};
use crate::safety_mode::SafetyModeManager;
use crate::trust::TrustScorer;

const SOURCE: &str = "vigil-kernel::watchdog";
const TERMINATE_POLL: Duration = Duration::from_millis(100);

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Watchdog timing and targeting.
///
/// A tick only counts as a miss once the liveness record is older than the
/// heartbeat monitor's `max_age` (or is missing or corrupt).  After the
/// supervised process falls silent, escalation therefore lands roughly
/// `max_age + max_misses * check_interval` after its last write, not
/// `max_misses * check_interval`.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchdogConfig {
    /// Time between ticks.  The first tick runs one interval after start.
    pub check_interval: Duration,
    /// Consecutive failed ticks before escalation.
    pub max_misses: u32,
    /// How long to wait after SIGTERM before sending SIGKILL.
    pub grace_period: Duration,
    /// Upper bound on how long [`Watchdog::stop`] waits for the thread.
    pub join_timeout: Duration,
    /// File holding the supervised PID.  When `None` the PID comes from the
    /// last trusted liveness record.
    pub pid_file: Option<PathBuf>,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            max_misses: 6,
            grace_period: Duration::from_secs(5),
            join_timeout: Duration::from_secs(10),
            pid_file: None,
        }
    }
}

impl WatchdogConfig {
    /// Derive `max_misses` from an absolute timeout:
    /// `ceil(timeout / check_interval)`, at least 1.
    pub fn from_timeout(timeout: Duration, check_interval: Duration) -> Self {
        let interval = check_interval.as_secs_f64();
        let max_misses = if interval > 0.0 {
            (timeout.as_secs_f64() / interval).ceil().max(1.0) as u32
        } else {
            1
        };
        Self {
            check_interval,
            max_misses,
            ..Self::default()
        }
    }
}

/// Everything the watchdog acts on, constructed by the caller.
#[derive(Clone)]
pub struct WatchdogServices {
    pub heartbeat: Arc<HeartbeatMonitor>,
    pub safety: Arc<Mutex<SafetyModeManager>>,
    pub trust: Arc<Mutex<TrustScorer>>,
    pub snapshots: SnapshotService,
    pub freeze_log: FreezeLog,
    pub bus: EventBus,
    pub process: Arc<dyn ProcessControl>,
}

// ────────────────────────────────────────────────────────────────────────────
// Reports
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStep {
    Terminate,
    Snapshot,
    SafetyMode,
    FreezeLog,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed(String),
    Skipped(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepOutcome {
    pub step: EscalationStep,
    pub status: StepStatus,
    pub elapsed: Duration,
}

/// What happened during one escalation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EscalationReport {
    pub triggered_at: DateTime<Utc>,
    pub consecutive_misses: u32,
    pub pid: Option<u32>,
    pub steps: Vec<StepOutcome>,
    pub snapshot_id: Option<String>,
    pub safety_mode_entered: Option<SafetyLevel>,
}

impl EscalationReport {
    pub fn step(&self, step: EscalationStep) -> Option<&StepOutcome> {
        self.steps.iter().find(|s| s.step == step)
    }
}

/// Result of a single [`Watchdog::tick`].
#[derive(Debug, Clone)]
pub struct TickOutcome {
    pub healthy: bool,
    pub consecutive_misses: u32,
    pub failure: Option<VigilError>,
    pub escalation: Option<EscalationReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WatchdogStatus {
    pub running: bool,
    pub consecutive_misses: u32,
    pub escalations: u32,
    pub last_heartbeat_time: Option<DateTime<Utc>>,
    pub last_report: Option<EscalationReport>,
}

// ────────────────────────────────────────────────────────────────────────────
// Internal state
// ────────────────────────────────────────────────────────────────────────────

struct MissState {
    consecutive_misses: u32,
    /// Cleared when an escalation fires, set again by the next healthy tick.
    armed: bool,
    escalations: u32,
    last_heartbeat_time: Option<DateTime<Utc>>,
    last_report: Option<EscalationReport>,
}

struct Core {
    config: WatchdogConfig,
    services: WatchdogServices,
    state: Mutex<MissState>,
}

struct RunningThread {
    stop_tx: mpsc::Sender<()>,
    done_rx: mpsc::Receiver<()>,
    handle: JoinHandle<()>,
}

// ────────────────────────────────────────────────────────────────────────────
// Watchdog
// ────────────────────────────────────────────────────────────────────────────

/// Dead-man's switch over a heartbeat file and a process.
pub struct Watchdog {
    core: Arc<Core>,
    thread: Mutex<Option<RunningThread>>,
}

impl Watchdog {
    pub fn new(config: WatchdogConfig, services: WatchdogServices) -> Self {
        Self {
            core: Arc::new(Core {
                config,
                services,
                state: Mutex::new(MissState {
                    consecutive_misses: 0,
                    armed: true,
                    escalations: 0,
                    last_heartbeat_time: None,
                    last_report: None,
                }),
            }),
            thread: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.core.config
    }

    /// Spawn the monitoring thread.
    ///
    /// # Errors
    ///
    /// [`VigilError::AlreadyRunning`] if the thread is already running, or
    /// [`VigilError::ProcessControl`] if the OS refuses to spawn it.
    pub fn start(&self) -> Result<(), VigilError> {
        let mut slot = self.thread.lock();
        if slot.is_some() {
            return Err(VigilError::AlreadyRunning);
        }

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let core = Arc::clone(&self.core);
        let handle = thread::Builder::new()
            .name("vigil-watchdog".into())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(core.config.check_interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            core.tick();
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                let _ = done_tx.send(());
            })
            .map_err(|e| VigilError::ProcessControl(format!("spawning watchdog thread: {e}")))?;

        info!(
            interval_ms = self.core.config.check_interval.as_millis() as u64,
            max_misses = self.core.config.max_misses,
            "watchdog started"
        );
        *slot = Some(RunningThread {
            stop_tx,
            done_rx,
            handle,
        });
        Ok(())
    }

    /// Signal the thread and wait up to `join_timeout` for it to exit.
    ///
    /// Returns `false` if the thread did not finish in time; it is then
    /// detached.  Stopping a watchdog that is not running returns `true`.
    pub fn stop(&self) -> bool {
        let Some(running) = self.thread.lock().take() else {
            return true;
        };
        let _ = running.stop_tx.send(());
        match running.done_rx.recv_timeout(self.core.config.join_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let _ = running.handle.join();
                info!("watchdog stopped");
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    timeout_ms = self.core.config.join_timeout.as_millis() as u64,
                    "watchdog thread did not stop in time; detaching"
                );
                false
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.lock().is_some()
    }

    /// Run one validation cycle on the calling thread.
    pub fn tick(&self) -> TickOutcome {
        self.core.tick()
    }

    pub fn status(&self) -> WatchdogStatus {
        let state = self.core.state.lock();
        WatchdogStatus {
            running: self.is_running(),
            consecutive_misses: state.consecutive_misses,
            escalations: state.escalations,
            last_heartbeat_time: state.last_heartbeat_time,
            last_report: state.last_report.clone(),
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Core {
    fn tick(&self) -> TickOutcome {
        let services = &self.services;
        let heartbeat = services.heartbeat.check();
        let record_pid = heartbeat
            .record
            .as_ref()
            .map(|r| r.pid)
            .filter(|&p| is_signalable_pid(p));
        let pid = self.resolve_pid(record_pid);

        let failure = match heartbeat.error {
            Some(e) => Some(VigilError::Liveness(e)),
            None => match pid {
                None => Some(VigilError::ProcessNotFound(None)),
                Some(p) if !services.process.is_alive(p) => {
                    Some(VigilError::ProcessNotFound(Some(p)))
                }
                Some(_) => None,
            },
        };

        // Decide under the lock; publish and escalate after releasing it.
        let (misses, recovered, escalate, last_heartbeat_time) = {
            let mut state = self.state.lock();
            if let Some(record) = &heartbeat.record {
                state.last_heartbeat_time = Some(record.timestamp);
            }
            match &failure {
                None => {
                    let recovered = state.consecutive_misses > 0;
                    state.consecutive_misses = 0;
                    state.armed = true;
                    (0, recovered, false, state.last_heartbeat_time)
                }
                Some(_) => {
                    state.consecutive_misses += 1;
                    let escalate =
                        state.armed && state.consecutive_misses >= self.config.max_misses;
                    if escalate {
                        state.armed = false;
                    }
                    (
                        state.consecutive_misses,
                        false,
                        escalate,
                        state.last_heartbeat_time,
                    )
                }
            }
        };

        if recovered {
            info!("heartbeat recovered");
            services
                .bus
                .publish(EventKind::HeartbeatRecovered, json!({ "pid": pid }), SOURCE);
        }
        if let Some(e) = &failure {
            warn!(consecutive_misses = misses, max_misses = self.config.max_misses, error = %e, "watchdog check failed");
            services.bus.publish(
                EventKind::HeartbeatMissed,
                json!({
                    "consecutive_misses": misses,
                    "max_misses": self.config.max_misses,
                    "error": e.to_string(),
                    "pid": pid,
                }),
                SOURCE,
            );
        }

        let escalation = escalate.then(|| self.escalate(misses, pid, last_heartbeat_time));

        TickOutcome {
            healthy: failure.is_none(),
            consecutive_misses: misses,
            failure,
            escalation,
        }
    }

    fn resolve_pid(&self, record_pid: Option<u32>) -> Option<u32> {
        let Some(path) = &self.config.pid_file else {
            return record_pid;
        };
        match std::fs::read_to_string(path) {
            Ok(raw) => match raw.trim().parse::<u32>() {
                Ok(pid) if is_signalable_pid(pid) => Some(pid),
                _ => {
                    warn!(path = %path.display(), "invalid PID file");
                    None
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "PID file unreadable");
                None
            }
        }
    }

    fn escalate(
        &self,
        misses: u32,
        pid: Option<u32>,
        last_heartbeat_time: Option<DateTime<Utc>>,
    ) -> EscalationReport {
        let services = &self.services;
        let triggered_at = Utc::now();
        let repeat = self.state.lock().escalations > 0;
        error!(consecutive_misses = misses, ?pid, repeat, "watchdog escalation triggered");
        services.bus.publish(
            EventKind::EscalationTriggered,
            json!({ "consecutive_misses": misses, "pid": pid, "repeat": repeat }),
            SOURCE,
        );

        let mut steps = Vec::with_capacity(4);

        steps.push(run_step(EscalationStep::Terminate, || self.terminate(pid)));

        let mut snapshot_id = None;
        steps.push(run_step(EscalationStep::Snapshot, || {
            let trust_score_before = services.trust.lock().score();
            let outcome = services
                .snapshots
                .create(SnapshotRequest {
                    description: "emergency".into(),
                    tier: CapabilityTier::Tier3,
                    operation_id: Some("watchdog_emergency".into()),
                    trust_score_before,
                    include_paths: None,
                })
                .map_err(|e| e.to_string())?;
            services.bus.publish(
                EventKind::SnapshotCreated,
                json!({
                    "snapshot_id": outcome.snapshot_id,
                    "copied_files": outcome.manifest.copied_files,
                    "total_files": outcome.manifest.total_files,
                    "reason": "watchdog_emergency",
                }),
                SOURCE,
            );
            snapshot_id = Some(outcome.snapshot_id);
            Ok(StepStatus::Succeeded)
        }));

        let mut safety_mode_entered = None;
        steps.push(run_step(EscalationStep::SafetyMode, || {
            let transition = {
                let mut safety = services.safety.lock();
                let target = if repeat || safety.level() >= SafetyLevel::Safe {
                    SafetyLevel::Lockdown
                } else {
                    SafetyLevel::Safe
                };
                safety.enter(target).map_err(|e| e.to_string())?
            };
            safety_mode_entered = Some(transition.to);
            if transition.changed {
                services.bus.publish(
                    EventKind::SafetyModeChanged,
                    json!({
                        "from": transition.from,
                        "to": transition.to,
                        "reason": "watchdog_escalation",
                    }),
                    SOURCE,
                );
            }
            Ok(StepStatus::Succeeded)
        }));

        let freeze_event = FreezeEvent {
            timestamp: triggered_at,
            event: "watchdog_escalation".into(),
            consecutive_misses: misses,
            last_heartbeat_time,
            safety_mode_entered,
        };
        steps.push(run_step(EscalationStep::FreezeLog, || {
            services
                .freeze_log
                .append(&freeze_event)
                .map(|()| StepStatus::Succeeded)
                .map_err(|e| e.to_string())
        }));

        for outcome in &steps {
            if let StepStatus::Failed(msg) = &outcome.status {
                error!(step = ?outcome.step, error = %msg, "escalation step failed");
            }
        }

        let report = EscalationReport {
            triggered_at,
            consecutive_misses: misses,
            pid,
            steps,
            snapshot_id,
            safety_mode_entered,
        };
        let mut state = self.state.lock();
        state.escalations += 1;
        state.last_report = Some(report.clone());
        report
    }

    fn terminate(&self, pid: Option<u32>) -> Result<StepStatus, String> {
        let process = &self.services.process;
        let Some(pid) = pid else {
            return Ok(StepStatus::Skipped("no supervised pid known".into()));
        };
        if !is_signalable_pid(pid) {
            return Ok(StepStatus::Skipped(format!("{pid} is not a valid process id")));
        }
        if pid == std::process::id() {
            return Ok(StepStatus::Skipped("pid belongs to the watchdog itself".into()));
        }
        if !process.is_alive(pid) {
            return Ok(StepStatus::Skipped(format!("process {pid} already gone")));
        }

        process.terminate(pid).map_err(|e| e.to_string())?;
        let deadline = Instant::now() + self.config.grace_period;
        while Instant::now() < deadline {
            if !process.is_alive(pid) {
                info!(pid, "supervised process exited after SIGTERM");
                return Ok(StepStatus::Succeeded);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            thread::sleep(remaining.min(TERMINATE_POLL));
        }
        if !process.is_alive(pid) {
            return Ok(StepStatus::Succeeded);
        }

        warn!(pid, grace_ms = self.config.grace_period.as_millis() as u64, "grace period expired; sending SIGKILL");
        process.kill(pid).map_err(|e| e.to_string())?;
        Ok(StepStatus::Succeeded)
    }
}

fn run_step<F>(step: EscalationStep, f: F) -> StepOutcome
where
    F: FnOnce() -> Result<StepStatus, String>,
{
    let started = Instant::now();
    let status = match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(status)) => status,
        Ok(Err(msg)) => StepStatus::Failed(msg),
        Err(_) => StepStatus::Failed("step panicked".into()),
    };
    StepOutcome {
        step,
        status,
        elapsed: started.elapsed(),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heartbeat::LivenessRecord;
    use crate::trust::TrustConfig;
    use chrono::SubsecRound;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use vigil_memory::atomic::write_json_atomic;
    use vigil_types::LivenessError;

    const WATCHED_PID: u32 = 4242;

    #[derive(Default)]
    struct FakeProcess {
        dead: AtomicBool,
        ignores_sigterm: bool,
        terminated: AtomicU32,
        killed: AtomicU32,
    }

    impl ProcessControl for FakeProcess {
        fn is_alive(&self, _pid: u32) -> bool {
            !self.dead.load(Ordering::SeqCst)
        }

        fn terminate(&self, _pid: u32) -> Result<(), VigilError> {
            self.terminated.fetch_add(1, Ordering::SeqCst);
            if !self.ignores_sigterm {
                self.dead.store(true, Ordering::SeqCst);
            }
            Ok(())
        }

        fn kill(&self, _pid: u32) -> Result<(), VigilError> {
            self.killed.fetch_add(1, Ordering::SeqCst);
            self.dead.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Harness {
        dir: tempfile::TempDir,
        services: WatchdogServices,
        process: Arc<FakeProcess>,
    }

    fn harness_with(process: FakeProcess) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let process = Arc::new(process);
        let services = WatchdogServices {
            heartbeat: Arc::new(HeartbeatMonitor::new(
                dir.path().join("heartbeat").join("last_beat.json"),
                Duration::from_secs(5),
            )),
            safety: Arc::new(Mutex::new(SafetyModeManager::load(
                dir.path().join("safety_mode").join("config.json"),
            ))),
            trust: Arc::new(Mutex::new(
                TrustScorer::load(dir.path().join("trust.json"), TrustConfig::default()).unwrap(),
            )),
            snapshots: SnapshotService::new(dir.path().join("backups"), vec![], 10),
            freeze_log: FreezeLog::new(dir.path().join("guardian").join("freeze_events.jsonl")),
            bus: EventBus::new(),
            process: process.clone(),
        };
        Harness {
            dir,
            services,
            process,
        }
    }

    fn harness() -> Harness {
        harness_with(FakeProcess::default())
    }

    fn config(max_misses: u32) -> WatchdogConfig {
        WatchdogConfig {
            check_interval: Duration::from_millis(20),
            max_misses,
            grace_period: Duration::from_millis(50),
            join_timeout: Duration::from_secs(2),
            pid_file: None,
        }
    }

    fn write_stale_beat(h: &Harness, pid: u32) {
        let mut record = LivenessRecord::new(pid, "alive", 50.0);
        record.timestamp = (Utc::now() - chrono::Duration::seconds(60)).trunc_subsecs(6);
        record.checksum = record.compute_checksum();
        write_json_atomic(h.services.heartbeat.path(), &record).unwrap();
    }

    #[test]
    fn healthy_tick_keeps_counter_at_zero() {
        let h = harness();
        h.services.heartbeat.write(WATCHED_PID, "alive", 50.0).unwrap();
        let wd = Watchdog::new(config(3), h.services.clone());
        let outcome = wd.tick();
        assert!(outcome.healthy);
        assert_eq!(outcome.consecutive_misses, 0);
        assert!(wd.status().last_heartbeat_time.is_some());
    }

    #[test]
    fn three_misses_escalate_exactly_once() {
        let h = harness();
        let wd = Watchdog::new(config(3), h.services.clone());

        assert!(wd.tick().escalation.is_none());
        assert!(wd.tick().escalation.is_none());
        let third = wd.tick();
        assert_eq!(third.consecutive_misses, 3);
        assert!(matches!(
            third.failure,
            Some(VigilError::Liveness(LivenessError::MissingRecord))
        ));
        let report = third.escalation.expect("escalation on third miss");

        assert!(matches!(
            report.step(EscalationStep::Terminate).unwrap().status,
            StepStatus::Skipped(_)
        ));
        for step in [EscalationStep::Snapshot, EscalationStep::SafetyMode, EscalationStep::FreezeLog] {
            assert_eq!(report.step(step).unwrap().status, StepStatus::Succeeded, "{step:?}");
        }
        assert_eq!(report.safety_mode_entered, Some(SafetyLevel::Safe));
        assert!(report.snapshot_id.is_some());

        // Streak continues, but escalation is not repeated.
        let fourth = wd.tick();
        assert_eq!(fourth.consecutive_misses, 4);
        assert!(fourth.escalation.is_none());

        let log = h.services.freeze_log.read_all().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].consecutive_misses, 3);
        assert_eq!(log[0].safety_mode_entered, Some(SafetyLevel::Safe));
        assert_eq!(h.services.safety.lock().level(), SafetyLevel::Safe);
        assert_eq!(wd.status().escalations, 1);
    }

    #[test]
    fn recovery_rearms_and_repeat_escalation_locks_down() {
        let h = harness();
        let wd = Watchdog::new(config(2), h.services.clone());
        wd.tick();
        assert!(wd.tick().escalation.is_some());

        h.services.heartbeat.write(WATCHED_PID, "alive", 50.0).unwrap();
        let healthy = wd.tick();
        assert!(healthy.healthy);
        assert_eq!(healthy.consecutive_misses, 0);

        h.process.dead.store(true, Ordering::SeqCst);
        let first = wd.tick();
        assert!(matches!(
            first.failure,
            Some(VigilError::ProcessNotFound(Some(WATCHED_PID)))
        ));
        let report = wd.tick().escalation.expect("second streak escalates again");
        assert_eq!(report.safety_mode_entered, Some(SafetyLevel::Lockdown));
        assert_eq!(h.services.freeze_log.read_all().unwrap().len(), 2);
    }

    #[test]
    fn stale_heartbeat_terminates_gracefully() {
        let h = harness();
        write_stale_beat(&h, WATCHED_PID);
        let wd = Watchdog::new(config(1), h.services.clone());

        let outcome = wd.tick();
        assert!(matches!(
            outcome.failure,
            Some(VigilError::Liveness(LivenessError::StaleRecord))
        ));
        let report = outcome.escalation.unwrap();
        assert_eq!(report.pid, Some(WATCHED_PID));
        assert_eq!(
            report.step(EscalationStep::Terminate).unwrap().status,
            StepStatus::Succeeded
        );
        assert_eq!(h.process.terminated.load(Ordering::SeqCst), 1);
        assert_eq!(h.process.killed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stubborn_process_is_killed_after_grace() {
        let h = harness_with(FakeProcess {
            ignores_sigterm: true,
            ..FakeProcess::default()
        });
        write_stale_beat(&h, WATCHED_PID);
        let wd = Watchdog::new(config(1), h.services.clone());

        let report = wd.tick().escalation.unwrap();
        let terminate = report.step(EscalationStep::Terminate).unwrap();
        assert_eq!(terminate.status, StepStatus::Succeeded);
        assert!(terminate.elapsed >= Duration::from_millis(50));
        assert_eq!(h.process.killed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn never_terminates_its_own_process() {
        let h = harness();
        write_stale_beat(&h, std::process::id());
        let wd = Watchdog::new(config(1), h.services.clone());
        let report = wd.tick().escalation.unwrap();
        assert!(matches!(
            report.step(EscalationStep::Terminate).unwrap().status,
            StepStatus::Skipped(_)
        ));
        assert_eq!(h.process.terminated.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn pid_file_overrides_record_pid() {
        let h = harness();
        h.services.heartbeat.write(WATCHED_PID, "alive", 50.0).unwrap();
        let pid_file = h.dir.path().join("app.pid");
        std::fs::write(&pid_file, "not-a-pid\n").unwrap();
        let wd = Watchdog::new(
            WatchdogConfig {
                pid_file: Some(pid_file.clone()),
                ..config(3)
            },
            h.services.clone(),
        );
        assert!(matches!(wd.tick().failure, Some(VigilError::ProcessNotFound(None))));

        std::fs::write(&pid_file, "31337\n").unwrap();
        assert!(wd.tick().healthy);
    }

    /// Reports every pid alive and remembers each one it was asked to signal.
    #[derive(Default)]
    struct RecordingProcess {
        signalled: Mutex<Vec<u32>>,
    }

    impl ProcessControl for RecordingProcess {
        fn is_alive(&self, _pid: u32) -> bool {
            true
        }

        fn terminate(&self, pid: u32) -> Result<(), VigilError> {
            self.signalled.lock().push(pid);
            Ok(())
        }

        fn kill(&self, pid: u32) -> Result<(), VigilError> {
            self.signalled.lock().push(pid);
            Ok(())
        }
    }

    #[test]
    fn stale_record_for_pid_zero_never_signals() {
        let mut h = harness();
        let recorder = Arc::new(RecordingProcess::default());
        h.services.process = recorder.clone();
        write_stale_beat(&h, 0);
        let wd = Watchdog::new(config(2), h.services.clone());

        let first = wd.tick();
        assert!(matches!(
            first.failure,
            Some(VigilError::Liveness(LivenessError::CorruptRecord))
        ));
        assert!(first.escalation.is_none());

        let report = wd.tick().escalation.expect("escalates on second miss");
        assert_eq!(report.pid, None);
        assert!(matches!(
            report.step(EscalationStep::Terminate).unwrap().status,
            StepStatus::Skipped(_)
        ));
        assert!(recorder.signalled.lock().is_empty());
    }

    #[test]
    fn pid_file_with_zero_is_not_a_target() {
        let mut h = harness();
        let recorder = Arc::new(RecordingProcess::default());
        h.services.process = recorder.clone();
        h.services.heartbeat.write(WATCHED_PID, "alive", 50.0).unwrap();
        let pid_file = h.dir.path().join("app.pid");
        std::fs::write(&pid_file, "0\n").unwrap();
        let wd = Watchdog::new(
            WatchdogConfig {
                pid_file: Some(pid_file),
                ..config(1)
            },
            h.services.clone(),
        );

        let outcome = wd.tick();
        assert!(matches!(outcome.failure, Some(VigilError::ProcessNotFound(None))));
        let report = outcome.escalation.expect("single miss escalates");
        assert!(matches!(
            report.step(EscalationStep::Terminate).unwrap().status,
            StepStatus::Skipped(_)
        ));
        assert!(recorder.signalled.lock().is_empty());
    }

    #[test]
    fn terminate_refuses_invalid_pid_even_when_asked_directly() {
        let mut h = harness();
        let recorder = Arc::new(RecordingProcess::default());
        h.services.process = recorder.clone();
        let wd = Watchdog::new(config(1), h.services.clone());

        let status = wd.core.terminate(Some(0)).unwrap();
        assert!(matches!(status, StepStatus::Skipped(_)));
        assert!(recorder.signalled.lock().is_empty());
    }

    #[test]
    fn corrupt_record_counts_as_a_miss() {
        let h = harness();
        h.services.heartbeat.write(WATCHED_PID, "alive", 50.0).unwrap();
        std::fs::write(h.services.heartbeat.path(), b"hello").unwrap();
        let wd = Watchdog::new(config(3), h.services.clone());

        let outcome = wd.tick();
        assert!(!outcome.healthy);
        assert_eq!(outcome.consecutive_misses, 1);
        assert!(matches!(
            outcome.failure,
            Some(VigilError::Liveness(LivenessError::CorruptRecord))
        ));
        assert!(outcome.escalation.is_none());
    }

    #[test]
    fn escalation_fires_on_exactly_the_max_misses_tick() {
        for max_misses in [1, 2, 4, 6] {
            let h = harness();
            let wd = Watchdog::new(config(max_misses), h.services.clone());
            for n in 1..max_misses {
                let outcome = wd.tick();
                assert_eq!(outcome.consecutive_misses, n);
                assert!(outcome.escalation.is_none(), "tick {n} of {max_misses}");
            }
            let last = wd.tick();
            assert_eq!(last.consecutive_misses, max_misses);
            assert!(last.escalation.is_some(), "tick {max_misses} of {max_misses}");
        }
    }

    #[test]
    fn background_escalation_lands_within_the_miss_window() {
        let h = harness();
        let interval = Duration::from_millis(50);
        let max_misses = 4;
        let fired_at = Arc::new(Mutex::new(None));
        {
            let fired_at = Arc::clone(&fired_at);
            h.services.bus.subscribe(EventKind::EscalationTriggered, move |_| {
                fired_at.lock().get_or_insert_with(Instant::now);
                Ok(())
            });
        }
        let wd = Watchdog::new(
            WatchdogConfig {
                check_interval: interval,
                ..config(max_misses)
            },
            h.services.clone(),
        );

        let started = Instant::now();
        wd.start().unwrap();
        let deadline = started + Duration::from_secs(5);
        while fired_at.lock().is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(wd.stop());

        let elapsed = fired_at.lock().expect("escalation fired") - started;
        assert!(elapsed >= interval * (max_misses - 1), "fired after {elapsed:?}");
        assert!(
            elapsed <= interval * max_misses + Duration::from_secs(2),
            "fired after {elapsed:?}"
        );
    }

    #[test]
    fn failed_snapshot_still_writes_freeze_log() {
        let mut h = harness();
        let blocker = h.dir.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();
        h.services.snapshots = SnapshotService::new(blocker.join("backups"), vec![], 10);
        let wd = Watchdog::new(config(1), h.services.clone());

        let report = wd.tick().escalation.unwrap();
        assert!(matches!(
            report.step(EscalationStep::Snapshot).unwrap().status,
            StepStatus::Failed(_)
        ));
        assert_eq!(
            report.step(EscalationStep::FreezeLog).unwrap().status,
            StepStatus::Succeeded
        );
        assert_eq!(h.services.freeze_log.read_all().unwrap().len(), 1);
    }

    #[test]
    fn events_are_published_during_escalation() {
        let h = harness();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for kind in [
            EventKind::HeartbeatMissed,
            EventKind::EscalationTriggered,
            EventKind::SnapshotCreated,
            EventKind::SafetyModeChanged,
            EventKind::HeartbeatRecovered,
        ] {
            let seen = Arc::clone(&seen);
            h.services.bus.subscribe(kind, move |event| {
                seen.lock().push(event.kind);
                Ok(())
            });
        }
        let wd = Watchdog::new(config(1), h.services.clone());
        wd.tick();
        h.services.heartbeat.write(WATCHED_PID, "alive", 50.0).unwrap();
        wd.tick();

        let kinds: HashSet<EventKind> = seen.lock().iter().copied().collect();
        assert_eq!(kinds.len(), 5, "{kinds:?}");
        assert_eq!(seen.lock()[0], EventKind::HeartbeatMissed);
        assert_eq!(seen.lock()[1], EventKind::EscalationTriggered);
    }

    #[test]
    fn background_thread_escalates_and_stops() {
        let h = harness();
        let wd = Watchdog::new(config(3), h.services.clone());
        wd.start().unwrap();
        assert_eq!(wd.start(), Err(VigilError::AlreadyRunning));

        let deadline = Instant::now() + Duration::from_secs(5);
        while wd.status().escalations == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(wd.status().escalations, 1);
        assert!(wd.stop());
        assert!(!wd.is_running());
        assert_eq!(h.services.freeze_log.read_all().unwrap().len(), 1);
    }

    #[test]
    fn stop_without_start_is_trivially_true() {
        let h = harness();
        let wd = Watchdog::new(config(3), h.services.clone());
        assert!(wd.stop());
    }

    #[test]
    fn max_misses_from_timeout_rounds_up() {
        let c = WatchdogConfig::from_timeout(Duration::from_secs(30), Duration::from_secs(5));
        assert_eq!(c.max_misses, 6);
        let c = WatchdogConfig::from_timeout(Duration::from_secs(31), Duration::from_secs(5));
        assert_eq!(c.max_misses, 7);
        let c = WatchdogConfig::from_timeout(Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(c.max_misses, 1);
    }
}
