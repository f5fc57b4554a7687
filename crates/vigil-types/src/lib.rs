use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Ordered permission level an operation runs at.  Higher tiers require a
/// strictly higher trust score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityTier {
    /// Observe only: reads, status queries.
    Tier1,
    /// Operate: reversible actions.
    Tier2,
    /// Change: persistent modifications, snapshotted first.
    Tier3,
    /// Ecosystem: long-lived grants, requires explicit approval.
    Tier4,
}

impl CapabilityTier {
    pub const ALL: [CapabilityTier; 4] = [
        CapabilityTier::Tier1,
        CapabilityTier::Tier2,
        CapabilityTier::Tier3,
        CapabilityTier::Tier4,
    ];

    /// Name of the safety-mode feature that gates this tier.
    pub fn feature(&self) -> &'static str {
        match self {
            CapabilityTier::Tier1 => "tier1",
            CapabilityTier::Tier2 => "tier2",
            CapabilityTier::Tier3 => "tier3",
            CapabilityTier::Tier4 => "tier4",
        }
    }

    /// Zero-based position in [`CapabilityTier::ALL`].
    pub fn index(&self) -> usize {
        match self {
            CapabilityTier::Tier1 => 0,
            CapabilityTier::Tier2 => 1,
            CapabilityTier::Tier3 => 2,
            CapabilityTier::Tier4 => 3,
        }
    }
}

impl fmt::Display for CapabilityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tier{}", self.index() + 1)
    }
}

impl FromStr for CapabilityTier {
    type Err = VigilError;

    /// Accepts `"3"`, `"tier3"`, `"Tier3"` and `"t3"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let digits = lower
            .strip_prefix("tier")
            .or_else(|| lower.strip_prefix('t'))
            .unwrap_or(&lower);
        match digits {
            "1" => Ok(CapabilityTier::Tier1),
            "2" => Ok(CapabilityTier::Tier2),
            "3" => Ok(CapabilityTier::Tier3),
            "4" => Ok(CapabilityTier::Tier4),
            _ => Err(VigilError::Config(format!("unknown capability tier '{s}'"))),
        }
    }
}

/// The four safety modes, ordered from least to most restrictive.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SafetyLevel {
    #[default]
    Normal,
    /// Non-core features restricted.
    Degraded,
    /// Core features only.
    Safe,
    /// Everything frozen until an operator intervenes.
    Lockdown,
}

impl SafetyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyLevel::Normal => "normal",
            SafetyLevel::Degraded => "degraded",
            SafetyLevel::Safe => "safe",
            SafetyLevel::Lockdown => "lockdown",
        }
    }
}

impl fmt::Display for SafetyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SafetyLevel {
    type Err = VigilError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "normal" => Ok(SafetyLevel::Normal),
            "degraded" => Ok(SafetyLevel::Degraded),
            "safe" => Ok(SafetyLevel::Safe),
            "lockdown" => Ok(SafetyLevel::Lockdown),
            other => Err(VigilError::Config(format!("unknown safety level '{other}'"))),
        }
    }
}

/// An externally supplied approval signal for tiers that require one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Approval {
    #[default]
    Absent,
    /// Approval granted by the named operator.
    Granted(String),
}

impl Approval {
    pub fn is_granted(&self) -> bool {
        matches!(self, Approval::Granted(_))
    }
}

/// Routing key for the in-process event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SystemStart,
    SystemShutdown,
    HeartbeatMissed,
    HeartbeatRecovered,
    EscalationTriggered,
    SafetyModeChanged,
    TrustScoreChanged,
    SnapshotCreated,
    OperationCompleted,
    OperationRefused,
    ErrorOccurred,
}

impl EventKind {
    pub const ALL: [EventKind; 11] = [
        EventKind::SystemStart,
        EventKind::SystemShutdown,
        EventKind::HeartbeatMissed,
        EventKind::HeartbeatRecovered,
        EventKind::EscalationTriggered,
        EventKind::SafetyModeChanged,
        EventKind::TrustScoreChanged,
        EventKind::SnapshotCreated,
        EventKind::OperationCompleted,
        EventKind::OperationRefused,
        EventKind::ErrorOccurred,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SystemStart => "system_start",
            EventKind::SystemShutdown => "system_shutdown",
            EventKind::HeartbeatMissed => "heartbeat_missed",
            EventKind::HeartbeatRecovered => "heartbeat_recovered",
            EventKind::EscalationTriggered => "escalation_triggered",
            EventKind::SafetyModeChanged => "safety_mode_changed",
            EventKind::TrustScoreChanged => "trust_score_changed",
            EventKind::SnapshotCreated => "snapshot_created",
            EventKind::OperationCompleted => "operation_completed",
            EventKind::OperationRefused => "operation_refused",
            EventKind::ErrorOccurred => "error_occurred",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single bus message.  Exists only for the duration of a publish call
/// unless a subscriber chooses to keep a copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub kind: EventKind,
    pub data: serde_json::Value,
    /// e.g. "vigil-kernel::watchdog"
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: EventKind, data: serde_json::Value, source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            data,
            source: source.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Why a liveness record could not be trusted.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LivenessError {
    #[error("MissingRecord")]
    MissingRecord,
    #[error("StaleRecord")]
    StaleRecord,
    #[error("CorruptRecord")]
    CorruptRecord,
}

/// Error type shared by every vigil crate.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VigilError {
    #[error("Liveness check failed: {0}")]
    Liveness(LivenessError),

    #[error("Process not found: {0:?}")]
    ProcessNotFound(Option<u32>),

    #[error("Operation at {tier} refused: {reason}")]
    Unauthorized { tier: CapabilityTier, reason: String },

    #[error("Feature '{0}' is disabled by the current safety mode")]
    FeatureDisabled(String),

    #[error("Refusing to move from {from} to {to}: safety modes only escalate")]
    NotAnEscalation { from: SafetyLevel, to: SafetyLevel },

    #[error("Leaving lockdown requires an explicit override")]
    LockdownOverrideRequired,

    #[error("Watchdog is already running")]
    AlreadyRunning,

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid tier table: {0}")]
    InvalidTierTable(String),

    #[error("Process control error: {0}")]
    ProcessControl(String),
}

impl From<LivenessError> for VigilError {
    fn from(e: LivenessError) -> Self {
        VigilError::Liveness(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_are_ordered() {
        assert!(CapabilityTier::Tier1 < CapabilityTier::Tier2);
        assert!(CapabilityTier::Tier3 < CapabilityTier::Tier4);
        assert_eq!(CapabilityTier::ALL.iter().max(), Some(&CapabilityTier::Tier4));
    }

    #[test]
    fn tier_parses_loose_spellings() {
        assert_eq!("3".parse::<CapabilityTier>().unwrap(), CapabilityTier::Tier3);
        assert_eq!("Tier4".parse::<CapabilityTier>().unwrap(), CapabilityTier::Tier4);
        assert_eq!("t2".parse::<CapabilityTier>().unwrap(), CapabilityTier::Tier2);
        assert!("tier9".parse::<CapabilityTier>().is_err());
    }

    #[test]
    fn tier_serializes_lowercase() {
        let json = serde_json::to_string(&CapabilityTier::Tier3).unwrap();
        assert_eq!(json, "\"tier3\"");
    }

    #[test]
    fn safety_levels_escalate_in_declaration_order() {
        assert!(SafetyLevel::Normal < SafetyLevel::Degraded);
        assert!(SafetyLevel::Degraded < SafetyLevel::Safe);
        assert!(SafetyLevel::Safe < SafetyLevel::Lockdown);
        assert_eq!(SafetyLevel::default(), SafetyLevel::Normal);
    }

    #[test]
    fn safety_level_roundtrips_through_str() {
        for level in [
            SafetyLevel::Normal,
            SafetyLevel::Degraded,
            SafetyLevel::Safe,
            SafetyLevel::Lockdown,
        ] {
            assert_eq!(level.as_str().parse::<SafetyLevel>().unwrap(), level);
        }
    }

    #[test]
    fn liveness_error_display_is_kind_name() {
        assert_eq!(LivenessError::CorruptRecord.to_string(), "CorruptRecord");
        let err: VigilError = LivenessError::StaleRecord.into();
        assert!(err.to_string().contains("StaleRecord"));
    }

    #[test]
    fn event_new_stamps_id_and_time() {
        let a = Event::new(EventKind::SystemStart, serde_json::json!({}), "test");
        let b = Event::new(EventKind::SystemStart, serde_json::json!({}), "test");
        assert_ne!(a.id, b.id);
        assert_eq!(a.kind.as_str(), "system_start");
    }

    #[test]
    fn approval_granted_flag() {
        assert!(!Approval::Absent.is_granted());
        assert!(Approval::Granted("operator".into()).is_granted());
    }

    #[test]
    fn vigil_error_display() {
        let err = VigilError::Unauthorized {
            tier: CapabilityTier::Tier4,
            reason: "approval missing".into(),
        };
        assert!(err.to_string().contains("Tier4"));
        let err = VigilError::NotAnEscalation {
            from: SafetyLevel::Safe,
            to: SafetyLevel::Normal,
        };
        assert!(err.to_string().contains("safe"));
    }
}
