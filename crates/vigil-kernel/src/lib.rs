//! `vigil-kernel` – Supervision & Enforcement
//!
//! The part of Vigil that decides whether the system is alive and what it is
//! allowed to do.  It does not perform work itself; it watches and restricts.
//!
//! # Modules
//!
//! - [`heartbeat`] – [`HeartbeatMonitor`][heartbeat::HeartbeatMonitor]:
//!   writes and validates the checksummed liveness record.
//! - [`watchdog`] – [`Watchdog`][watchdog::Watchdog]: the dead-man's switch.
//!   Runs on its own thread, counts consecutive failed checks and runs the
//!   escalation sequence (terminate, snapshot, safety mode, freeze log).
//! - [`safety_mode`] – [`SafetyModeManager`][safety_mode::SafetyModeManager]:
//!   four escalating restriction levels with per-feature gating.
//! - [`trust`] – [`TrustScorer`][trust::TrustScorer]: bounded score with an
//!   audit trail and per-tier thresholds.
//! - [`kernel_gate`] – [`KernelGate`][kernel_gate::KernelGate]: admits an
//!   operation only when both the safety mode and the trust score allow its
//!   tier.
//! - [`process`] – [`ProcessControl`][process::ProcessControl]: the seam
//!   through which the watchdog checks and signals the supervised process.

pub mod heartbeat;
pub mod kernel_gate;
pub mod process;
pub mod safety_mode;
pub mod trust;
pub mod watchdog;

pub use heartbeat::{HeartbeatMonitor, HeartbeatStats, HeartbeatStatus, LivenessRecord};
pub use kernel_gate::KernelGate;
pub use process::{OsProcessControl, ProcessControl};
pub use safety_mode::{FeatureChange, SafetyModeManager, SafetyTransition};
pub use trust::{
    Authorization, OperationAssessment, ReasonCode, RefusalReason, ScoreUpdate, TierTable,
    TrustBand, TrustConfig, TrustScorer, TrustStatistics,
};
pub use watchdog::{
    EscalationReport, EscalationStep, StepStatus, TickOutcome, Watchdog, WatchdogConfig,
    WatchdogServices, WatchdogStatus,
};
