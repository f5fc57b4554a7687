//! [`Supervisor`] – owns and wires every supervision service.
//!
//! All services are constructed explicitly in [`Supervisor::new`] from a
//! [`SupervisorConfig`]; nothing is looked up globally.  The supervisor is
//! also the place where operations run:
//!
//! ```text
//! run_operation(request, op)
//!   ├─ KernelGate::authorize            refused → OperationRefused
//!   ├─ Tier3+: SnapshotService::create  fatal   → OperationRefused
//!   ├─ op()
//!   ├─ TrustScorer::apply_outcome       only while `trust_updates` is allowed
//!   └─ OperationCompleted / TrustScoreChanged
//! ```
//!
//! Locks on the trust scorer and safety-mode manager are always released
//! before anything is published on the bus.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;
use vigil_kernel::safety_mode::features;
use vigil_kernel::{
    HeartbeatMonitor, KernelGate, OperationAssessment, OsProcessControl, ProcessControl,
    ReasonCode, SafetyModeManager, SafetyTransition, ScoreUpdate, TrustConfig, TrustScorer,
    TrustStatistics, Watchdog, WatchdogConfig, WatchdogServices,
};
use vigil_memory::{FreezeLog, SnapshotOutcome, SnapshotRequest, SnapshotService};
use vigil_middleware::EventBus;
use vigil_types::{Approval, CapabilityTier, EventKind, SafetyLevel, VigilError};

use crate::pulse::Pulse;

const SOURCE: &str = "vigil-runtime::supervisor";

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Root for every persisted artifact.
    pub data_dir: PathBuf,
    pub heartbeat_interval: Duration,
    pub heartbeat_max_age: Duration,
    pub watchdog: WatchdogConfig,
    pub trust: TrustConfig,
    /// Entries considered "recent" by [`Supervisor::trust_statistics`].
    pub stats_window: usize,
    /// Score change applied on every watchdog escalation.
    pub escalation_penalty: f64,
    pub max_snapshots: usize,
    /// Paths captured by snapshots that do not name their own.
    pub snapshot_paths: Vec<PathBuf>,
}

impl SupervisorConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            heartbeat_interval: Duration::from_secs(2),
            heartbeat_max_age: Duration::from_secs(10),
            watchdog: WatchdogConfig::default(),
            trust: TrustConfig::default(),
            stats_window: 10,
            escalation_penalty: -10.0,
            max_snapshots: 50,
            snapshot_paths: Vec::new(),
        }
    }

    pub fn heartbeat_path(&self) -> PathBuf {
        self.data_dir.join("heartbeat").join("last_beat.json")
    }

    pub fn heartbeat_stats_path(&self) -> PathBuf {
        self.data_dir.join("heartbeat").join("stats.json")
    }

    pub fn safety_mode_path(&self) -> PathBuf {
        self.data_dir.join("safety_mode").join("config.json")
    }

    pub fn trust_path(&self) -> PathBuf {
        self.data_dir.join("trust").join("trust_history.json")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }

    pub fn freeze_log_path(&self) -> PathBuf {
        self.data_dir.join("guardian").join("freeze_events.jsonl")
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Operations
// ────────────────────────────────────────────────────────────────────────────

/// A unit of work submitted to [`Supervisor::run_operation`].
#[derive(Debug, Clone)]
pub struct OperationRequest {
    pub operation_id: String,
    pub description: String,
    pub tier: CapabilityTier,
    pub approval: Approval,
    pub assessment: OperationAssessment,
}

impl OperationRequest {
    pub fn new(description: impl Into<String>, tier: CapabilityTier) -> Self {
        Self {
            operation_id: format!("op-{}", Uuid::new_v4().simple()),
            description: description.into(),
            tier,
            approval: Approval::Absent,
            assessment: OperationAssessment::default(),
        }
    }

    pub fn with_approval(mut self, approval: Approval) -> Self {
        self.approval = approval;
        self
    }

    pub fn with_assessment(mut self, assessment: OperationAssessment) -> Self {
        self.assessment = assessment;
        self
    }

    pub fn with_id(mut self, operation_id: impl Into<String>) -> Self {
        self.operation_id = operation_id.into();
        self
    }
}

/// What happened to an admitted operation.
#[derive(Debug, Clone, Serialize)]
pub struct OperationReport {
    pub operation_id: String,
    pub tier: CapabilityTier,
    pub success: bool,
    pub error: Option<String>,
    pub snapshot_id: Option<String>,
    /// `None` when trust updates were disabled by the safety mode or the
    /// update could not be persisted.
    pub score_update: Option<ScoreUpdate>,
}

#[derive(Debug)]
pub struct OperationOutcome<T> {
    pub report: OperationReport,
    pub value: Option<T>,
}

// ────────────────────────────────────────────────────────────────────────────
// Supervisor
// ────────────────────────────────────────────────────────────────────────────

pub struct Supervisor {
    config: SupervisorConfig,
    heartbeat: Arc<HeartbeatMonitor>,
    safety: Arc<Mutex<SafetyModeManager>>,
    trust: Arc<Mutex<TrustScorer>>,
    snapshots: SnapshotService,
    freeze_log: FreezeLog,
    bus: EventBus,
    gate: KernelGate,
    watchdog: Watchdog,
    pulse: Pulse,
}

impl Supervisor {
    /// Build every service with OS process control.
    pub fn new(config: SupervisorConfig) -> Result<Self, VigilError> {
        Self::with_process_control(config, Arc::new(OsProcessControl))
    }

    pub fn with_process_control(
        config: SupervisorConfig,
        process: Arc<dyn ProcessControl>,
    ) -> Result<Self, VigilError> {
        let heartbeat = Arc::new(
            HeartbeatMonitor::new(config.heartbeat_path(), config.heartbeat_max_age)
                .with_stats_file(config.heartbeat_stats_path()),
        );
        let safety = Arc::new(Mutex::new(SafetyModeManager::load(config.safety_mode_path())));
        let trust = Arc::new(Mutex::new(TrustScorer::load(
            config.trust_path(),
            config.trust.clone(),
        )?));
        let snapshots = SnapshotService::new(
            config.backups_dir(),
            config.snapshot_paths.clone(),
            config.max_snapshots,
        );
        let freeze_log = FreezeLog::new(config.freeze_log_path());
        let bus = EventBus::new();
        let gate = KernelGate::new(Arc::clone(&safety), Arc::clone(&trust));

        let watchdog = Watchdog::new(
            config.watchdog.clone(),
            WatchdogServices {
                heartbeat: Arc::clone(&heartbeat),
                safety: Arc::clone(&safety),
                trust: Arc::clone(&trust),
                snapshots: snapshots.clone(),
                freeze_log: freeze_log.clone(),
                bus: bus.clone(),
                process,
            },
        );
        let pulse = Pulse::new(
            Arc::clone(&heartbeat),
            Arc::clone(&trust),
            std::process::id(),
            config.heartbeat_interval,
            config.watchdog.join_timeout,
        );

        let supervisor = Self {
            config,
            heartbeat,
            safety,
            trust,
            snapshots,
            freeze_log,
            bus,
            gate,
            watchdog,
            pulse,
        };
        supervisor.wire_escalation_penalty();
        info!(data_dir = %supervisor.config.data_dir.display(), "supervisor initialised");
        supervisor.bus.publish(
            EventKind::SystemStart,
            json!({ "pid": std::process::id() }),
            SOURCE,
        );
        Ok(supervisor)
    }

    /// The trust scorer observes escalations and applies the configured
    /// penalty, independent of the `trust_updates` feature.
    fn wire_escalation_penalty(&self) {
        let trust = Arc::clone(&self.trust);
        let bus = self.bus.clone();
        let penalty = self.config.escalation_penalty;
        self.bus
            .subscribe(EventKind::EscalationTriggered, move |_event| {
                let update = trust
                    .lock()
                    .update_score(penalty, ReasonCode::WatchdogEscalation, None)
                    .map_err(|e| vigil_middleware::HandlerError::new(e.to_string()))?;
                publish_score_change(&bus, &update, ReasonCode::WatchdogEscalation, None);
                Ok(())
            });
    }

    // ── accessors ───────────────────────────────────────────────────────────

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    pub fn heartbeat(&self) -> &Arc<HeartbeatMonitor> {
        &self.heartbeat
    }

    pub fn safety(&self) -> &Arc<Mutex<SafetyModeManager>> {
        &self.safety
    }

    pub fn trust(&self) -> &Arc<Mutex<TrustScorer>> {
        &self.trust
    }

    pub fn snapshots(&self) -> &SnapshotService {
        &self.snapshots
    }

    pub fn freeze_log(&self) -> &FreezeLog {
        &self.freeze_log
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn gate(&self) -> &KernelGate {
        &self.gate
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    pub fn pulse(&self) -> &Pulse {
        &self.pulse
    }

    // ── lifecycle ───────────────────────────────────────────────────────────

    pub fn start_watchdog(&self) -> Result<(), VigilError> {
        self.watchdog.start()
    }

    pub fn start_pulse(&self) -> Result<(), VigilError> {
        self.pulse.start()
    }

    /// Stop both threads and drop every bus subscriber.  Returns `false`
    /// if either thread had to be detached.
    pub fn stop(&self) -> bool {
        let pulse_stopped = self.pulse.stop();
        let watchdog_stopped = self.watchdog.stop();
        self.bus.publish(
            EventKind::SystemShutdown,
            json!({ "clean": pulse_stopped && watchdog_stopped }),
            SOURCE,
        );
        self.bus.clear_subscribers();
        pulse_stopped && watchdog_stopped
    }

    // ── operations ──────────────────────────────────────────────────────────

    /// Gate, snapshot (Tier3 and above), run, and score an operation.
    ///
    /// # Errors
    ///
    /// Refusals by the gate and fatal pre-operation snapshot failures.  A
    /// failing `op` is not an error; it is reported in the outcome.
    pub fn run_operation<T, E, F>(
        &self,
        request: OperationRequest,
        op: F,
    ) -> Result<OperationOutcome<T>, VigilError>
    where
        E: fmt::Display,
        F: FnOnce() -> Result<T, E>,
    {
        let OperationRequest {
            operation_id,
            description,
            tier,
            approval,
            assessment,
        } = request;

        if let Err(e) = self.gate.authorize(tier, &approval) {
            self.publish_refusal(&operation_id, tier, &e);
            return Err(e);
        }

        let mut snapshot_id = None;
        if tier >= CapabilityTier::Tier3 {
            let trust_score_before = self.trust.lock().score();
            match self.snapshots.create(SnapshotRequest {
                description: format!("pre-operation: {description}"),
                tier,
                operation_id: Some(operation_id.clone()),
                trust_score_before,
                include_paths: None,
            }) {
                Ok(outcome) => {
                    self.publish_snapshot(&outcome);
                    snapshot_id = Some(outcome.snapshot_id);
                }
                Err(e) => {
                    let err = VigilError::Snapshot(e.to_string());
                    self.publish_refusal(&operation_id, tier, &err);
                    return Err(err);
                }
            }
        }

        let result = op();
        let (success, error, value) = match result {
            Ok(v) => (true, None, Some(v)),
            Err(e) => (false, Some(e.to_string()), None),
        };

        let trust_updates = self
            .safety
            .lock()
            .check_feature_allowed(features::TRUST_UPDATES);
        let score_update = if trust_updates {
            let applied =
                self.trust
                    .lock()
                    .apply_outcome(tier, success, assessment, Some(&operation_id));
            match applied {
                Ok(update) => {
                    let reason = if success {
                        ReasonCode::OperationSuccess
                    } else {
                        ReasonCode::OperationFailure
                    };
                    publish_score_change(&self.bus, &update, reason, Some(&operation_id));
                    Some(update)
                }
                Err(e) => {
                    warn!(operation_id = %operation_id, error = %e, "trust update failed");
                    self.bus.publish(
                        EventKind::ErrorOccurred,
                        json!({ "operation_id": operation_id, "error": e.to_string() }),
                        SOURCE,
                    );
                    None
                }
            }
        } else {
            info!(operation_id = %operation_id, "trust updates frozen by safety mode");
            None
        };

        let report = OperationReport {
            operation_id,
            tier,
            success,
            error,
            snapshot_id,
            score_update,
        };
        info!(operation_id = %report.operation_id, %tier, success, "operation completed");
        self.bus.publish(
            EventKind::OperationCompleted,
            serde_json::to_value(&report).unwrap_or_default(),
            SOURCE,
        );
        Ok(OperationOutcome { report, value })
    }

    // ── operator actions ────────────────────────────────────────────────────

    pub fn enter_safety_mode(&self, level: SafetyLevel) -> Result<SafetyTransition, VigilError> {
        let transition = self.safety.lock().enter(level)?;
        self.publish_transition(&transition, "operator");
        Ok(transition)
    }

    pub fn exit_safety_mode(&self, override_lockdown: bool) -> Result<SafetyTransition, VigilError> {
        let transition = self.safety.lock().exit(override_lockdown)?;
        self.publish_transition(&transition, "operator");
        Ok(transition)
    }

    pub fn adjust_trust(&self, delta: f64) -> Result<ScoreUpdate, VigilError> {
        let update = self
            .trust
            .lock()
            .update_score(delta, ReasonCode::ManualAdjustment, None)?;
        publish_score_change(&self.bus, &update, ReasonCode::ManualAdjustment, None);
        Ok(update)
    }

    pub fn create_snapshot(
        &self,
        description: &str,
        tier: CapabilityTier,
    ) -> Result<SnapshotOutcome, VigilError> {
        let trust_score_before = self.trust.lock().score();
        let outcome = self
            .snapshots
            .create(SnapshotRequest {
                description: description.to_string(),
                tier,
                operation_id: None,
                trust_score_before,
                include_paths: None,
            })
            .map_err(|e| VigilError::Snapshot(e.to_string()))?;
        self.publish_snapshot(&outcome);
        Ok(outcome)
    }

    pub fn trust_statistics(&self) -> TrustStatistics {
        self.trust.lock().statistics(self.config.stats_window)
    }

    // ── publishing helpers ──────────────────────────────────────────────────

    fn publish_refusal(&self, operation_id: &str, tier: CapabilityTier, error: &VigilError) {
        warn!(operation_id, %tier, error = %error, "operation refused");
        self.bus.publish(
            EventKind::OperationRefused,
            json!({ "operation_id": operation_id, "tier": tier, "reason": error.to_string() }),
            SOURCE,
        );
    }

    fn publish_snapshot(&self, outcome: &SnapshotOutcome) {
        self.bus.publish(
            EventKind::SnapshotCreated,
            json!({
                "snapshot_id": outcome.snapshot_id,
                "copied_files": outcome.manifest.copied_files,
                "total_files": outcome.manifest.total_files,
            }),
            SOURCE,
        );
    }

    fn publish_transition(&self, transition: &SafetyTransition, reason: &str) {
        if transition.changed {
            self.bus.publish(
                EventKind::SafetyModeChanged,
                json!({ "from": transition.from, "to": transition.to, "reason": reason }),
                SOURCE,
            );
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        // Subscribers hold clones of the bus; clearing breaks the cycle.
        self.bus.clear_subscribers();
    }
}

fn publish_score_change(
    bus: &EventBus,
    update: &ScoreUpdate,
    reason: ReasonCode,
    operation_id: Option<&str>,
) {
    bus.publish(
        EventKind::TrustScoreChanged,
        json!({
            "old_score": update.old,
            "new_score": update.new,
            "delta": update.delta,
            "clamped": update.clamped,
            "reason_code": reason,
            "operation_id": operation_id,
        }),
        SOURCE,
    );
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
