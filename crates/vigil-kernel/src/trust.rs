//! [`TrustScorer`] – bounded, auditable trust score.
//!
//! The score lives in `[min, max]` and every change is recorded as an
//! immutable [`TrustHistoryEntry`].  Operation outcomes move the score
//! asymmetrically: a failure at a tier costs more than a success at the same
//! tier earns.
//!
//! Each [`CapabilityTier`] has a minimum score and an optional approval
//! requirement, held in a [`TierTable`] whose thresholds must be strictly
//! increasing.
//!
//! # Example
//!
//! ```
//! use vigil_kernel::trust::{Authorization, OperationAssessment, TrustConfig, TrustScorer};
//! use vigil_types::{Approval, CapabilityTier};
//!
//! let dir = tempfile::tempdir().unwrap();
//! let mut scorer = TrustScorer::load(dir.path().join("trust.json"), TrustConfig::default()).unwrap();
//! assert_eq!(scorer.score(), 50.0);
//!
//! let update = scorer
//!     .apply_outcome(CapabilityTier::Tier2, true, OperationAssessment::default(), Some("op-1"))
//!     .unwrap();
//! assert!(update.delta > 0.0);
//!
//! assert_eq!(
//!     scorer.can_perform_operation(CapabilityTier::Tier3, &Approval::Absent),
//!     Authorization::Allowed
//! );
//! ```

use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use vigil_memory::atomic::{read_json, write_json_atomic};
use vigil_types::{Approval, CapabilityTier, VigilError};

// ────────────────────────────────────────────────────────────────────────────
// Tier table
// ────────────────────────────────────────────────────────────────────────────

/// What a single tier demands before an operation may run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierRequirement {
    pub required_score: f64,
    pub approval_required: bool,
}

/// Per-tier requirements, indexed by [`CapabilityTier::index`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TierTable {
    requirements: [TierRequirement; 4],
}

impl TierTable {
    /// Reject tables whose required scores are not strictly increasing from
    /// Tier1 to Tier4.
    pub fn new(requirements: [TierRequirement; 4]) -> Result<Self, VigilError> {
        for pair in requirements.windows(2) {
            let (lo, hi) = (pair[0].required_score, pair[1].required_score);
            if hi.partial_cmp(&lo) != Some(Ordering::Greater) {
                return Err(VigilError::InvalidTierTable(format!(
                    "thresholds must strictly increase, got {lo} then {hi}"
                )));
            }
        }
        Ok(Self { requirements })
    }

    pub fn requirement(&self, tier: CapabilityTier) -> TierRequirement {
        self.requirements[tier.index()]
    }
}

impl Default for TierTable {
    fn default() -> Self {
        let req = |required_score, approval_required| TierRequirement {
            required_score,
            approval_required,
        };
        Self {
            requirements: [req(0.0, false), req(30.0, false), req(50.0, false), req(70.0, true)],
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct TrustConfig {
    pub min: f64,
    pub max: f64,
    pub initial: f64,
    pub tiers: TierTable,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            min: 0.0,
            max: 100.0,
            initial: 50.0,
            tiers: TierTable::default(),
        }
    }
}

impl TrustConfig {
    fn validate(&self) -> Result<(), VigilError> {
        if self.min.partial_cmp(&self.max) != Some(Ordering::Less) {
            return Err(VigilError::Config(format!(
                "trust min ({}) must be below max ({})",
                self.min, self.max
            )));
        }
        if !(self.min..=self.max).contains(&self.initial) {
            return Err(VigilError::Config(format!(
                "initial trust {} outside [{}, {}]",
                self.initial, self.min, self.max
            )));
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// History & results
// ────────────────────────────────────────────────────────────────────────────

/// Why the score changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    OperationSuccess,
    OperationFailure,
    ManualAdjustment,
    SystemHealth,
    WatchdogEscalation,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::OperationSuccess => "operation_success",
            ReasonCode::OperationFailure => "operation_failure",
            ReasonCode::ManualAdjustment => "manual_adjustment",
            ReasonCode::SystemHealth => "system_health",
            ReasonCode::WatchdogEscalation => "watchdog_escalation",
        }
    }

    fn is_operation(&self) -> bool {
        matches!(self, ReasonCode::OperationSuccess | ReasonCode::OperationFailure)
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustHistoryEntry {
    pub old_score: f64,
    pub new_score: f64,
    pub delta: f64,
    pub reason_code: ReasonCode,
    pub operation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Result of [`TrustScorer::update_score`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreUpdate {
    pub old: f64,
    pub new: f64,
    /// The change actually applied, after clamping.
    pub delta: f64,
    /// `true` when the requested change hit a bound.
    pub clamped: bool,
}

/// Multipliers applied to an operation's base delta.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OperationAssessment {
    pub importance: f64,
    pub clarity: f64,
    /// In `[0, 1]`; shrinks success bonuses and grows failure penalties.
    pub risk: f64,
}

impl Default for OperationAssessment {
    fn default() -> Self {
        Self {
            importance: 1.5,
            clarity: 1.5,
            risk: 0.2,
        }
    }
}

/// Coarse label for a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustBand {
    Critical,
    Low,
    Medium,
    High,
    Excellent,
}

impl TrustBand {
    pub fn for_score(score: f64) -> Self {
        match score {
            s if s < 30.0 => TrustBand::Critical,
            s if s < 50.0 => TrustBand::Low,
            s if s < 70.0 => TrustBand::Medium,
            s if s < 90.0 => TrustBand::High,
            _ => TrustBand::Excellent,
        }
    }
}

impl fmt::Display for TrustBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrustBand::Critical => "critical",
            TrustBand::Low => "low",
            TrustBand::Medium => "medium",
            TrustBand::High => "high",
            TrustBand::Excellent => "excellent",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RefusalReason {
    InsufficientTrust { score: f64, required: f64 },
    ApprovalMissing { tier: CapabilityTier },
}

impl fmt::Display for RefusalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefusalReason::InsufficientTrust { score, required } => {
                write!(f, "trust score {score:.1} below required {required:.1}")
            }
            RefusalReason::ApprovalMissing { tier } => write!(f, "{tier} requires approval"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Authorization {
    Allowed,
    Refused(RefusalReason),
}

impl Authorization {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Authorization::Allowed)
    }
}

/// Summary returned by [`TrustScorer::statistics`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrustStatistics {
    pub current_score: f64,
    pub band: TrustBand,
    pub total_records: usize,
    pub recent_avg_delta: f64,
    /// Percentage of recent operation outcomes that succeeded; `0.0` when
    /// the window holds no operations.
    pub recent_success_rate: f64,
    pub max_score_seen: f64,
    pub min_score_seen: f64,
}

#[derive(Serialize, Deserialize)]
struct TrustFile {
    score: f64,
    #[serde(default)]
    history: Vec<TrustHistoryEntry>,
}

fn base_deltas(tier: CapabilityTier) -> (f64, f64) {
    match tier {
        CapabilityTier::Tier1 => (0.0, 0.0),
        CapabilityTier::Tier2 => (3.0, 5.0),
        CapabilityTier::Tier3 => (7.0, 10.0),
        CapabilityTier::Tier4 => (10.0, 15.0),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// TrustScorer
// ────────────────────────────────────────────────────────────────────────────

/// Owns the score and its history; persists after every change.
///
/// Not internally synchronised; share as `Arc<parking_lot::Mutex<_>>`.
#[derive(Debug)]
pub struct TrustScorer {
    path: PathBuf,
    config: TrustConfig,
    score: f64,
    history: Vec<TrustHistoryEntry>,
}

impl TrustScorer {
    /// Load history from `path`.  A missing file starts at
    /// `config.initial`; an unreadable one does too, with a warning.
    ///
    /// # Errors
    ///
    /// [`VigilError::Config`] for an inconsistent `config`.
    pub fn load(path: impl Into<PathBuf>, config: TrustConfig) -> Result<Self, VigilError> {
        config.validate()?;
        let path = path.into();
        let (score, history) = match read_json::<TrustFile>(&path) {
            Ok(Some(file)) => {
                let score = file.history.last().map_or(file.score, |e| e.new_score);
                (score.clamp(config.min, config.max), file.history)
            }
            Ok(None) => (config.initial, Vec::new()),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "trust history unreadable; starting fresh");
                (config.initial, Vec::new())
            }
        };
        debug!(score, records = history.len(), "trust scorer loaded");
        Ok(Self {
            path,
            config,
            score,
            history,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &TrustConfig {
        &self.config
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn band(&self) -> TrustBand {
        TrustBand::for_score(self.score)
    }

    pub fn history(&self) -> &[TrustHistoryEntry] {
        &self.history
    }

    /// Apply `delta`, clamped to `[min, max]`, and persist.
    ///
    /// On a persistence failure the change is rolled back.
    pub fn update_score(
        &mut self,
        delta: f64,
        reason_code: ReasonCode,
        operation_id: Option<&str>,
    ) -> Result<ScoreUpdate, VigilError> {
        if !delta.is_finite() {
            return Err(VigilError::Config(format!("non-finite trust delta {delta}")));
        }
        let old = self.score;
        let requested = old + delta;
        let new = requested.clamp(self.config.min, self.config.max);
        let update = ScoreUpdate {
            old,
            new,
            delta: new - old,
            clamped: new != requested,
        };

        self.history.push(TrustHistoryEntry {
            old_score: old,
            new_score: new,
            delta: update.delta,
            reason_code,
            operation_id: operation_id.map(str::to_owned),
            timestamp: Utc::now(),
        });
        self.score = new;

        if let Err(e) = self.persist() {
            self.history.pop();
            self.score = old;
            return Err(e);
        }

        if update.clamped {
            info!(old, requested, new, "trust score clamped");
        }
        info!(old, new, reason = %reason_code, "trust score updated");
        Ok(update)
    }

    /// Turn an operation result into a score change.
    pub fn apply_outcome(
        &mut self,
        tier: CapabilityTier,
        success: bool,
        assessment: OperationAssessment,
        operation_id: Option<&str>,
    ) -> Result<ScoreUpdate, VigilError> {
        let delta = Self::outcome_delta(tier, success, assessment);
        let reason = if success {
            ReasonCode::OperationSuccess
        } else {
            ReasonCode::OperationFailure
        };
        self.update_score(delta, reason, operation_id)
    }

    /// `base * importance * clarity * (1 - risk)` on success,
    /// `-(penalty * importance * clarity * (1 + risk))` on failure.
    pub fn outcome_delta(tier: CapabilityTier, success: bool, assessment: OperationAssessment) -> f64 {
        let (bonus, penalty) = base_deltas(tier);
        let risk = assessment.risk.clamp(0.0, 1.0);
        let scale = assessment.importance * assessment.clarity;
        if success {
            bonus * scale * (1.0 - risk)
        } else {
            -(penalty * scale * (1.0 + risk))
        }
    }

    pub fn can_perform_operation(&self, tier: CapabilityTier, approval: &Approval) -> Authorization {
        let req = self.config.tiers.requirement(tier);
        if self.score < req.required_score {
            return Authorization::Refused(RefusalReason::InsufficientTrust {
                score: self.score,
                required: req.required_score,
            });
        }
        if req.approval_required && !approval.is_granted() {
            return Authorization::Refused(RefusalReason::ApprovalMissing { tier });
        }
        Authorization::Allowed
    }

    /// Aggregate view over the whole history and the last `window` entries.
    pub fn statistics(&self, window: usize) -> TrustStatistics {
        let start = self.history.len().saturating_sub(window);
        let recent = &self.history[start..];

        let recent_avg_delta = if recent.is_empty() {
            0.0
        } else {
            recent.iter().map(|e| e.delta).sum::<f64>() / recent.len() as f64
        };
        let operations = recent.iter().filter(|e| e.reason_code.is_operation()).count();
        let successes = recent
            .iter()
            .filter(|e| e.reason_code == ReasonCode::OperationSuccess)
            .count();
        let recent_success_rate = if operations == 0 {
            0.0
        } else {
            successes as f64 / operations as f64 * 100.0
        };

        let seen = self
            .history
            .first()
            .map(|e| e.old_score)
            .into_iter()
            .chain(self.history.iter().map(|e| e.new_score));
        TrustStatistics {
            current_score: self.score,
            band: self.band(),
            total_records: self.history.len(),
            recent_avg_delta,
            recent_success_rate,
            max_score_seen: seen.clone().fold(self.score, f64::max),
            min_score_seen: seen.fold(self.score, f64::min),
        }
    }

    fn persist(&self) -> Result<(), VigilError> {
        let file = TrustFile {
            score: self.score,
            history: self.history.clone(),
        };
        write_json_atomic(&self.path, &file)
            .map_err(|e| VigilError::Persistence(format!("writing {}: {e}", self.path.display())))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn scorer(dir: &tempfile::TempDir) -> TrustScorer {
        TrustScorer::load(dir.path().join("trust").join("trust_history.json"), TrustConfig::default())
            .unwrap()
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn fresh_scorer_starts_at_initial() {
        let dir = tempfile::tempdir().unwrap();
        let s = scorer(&dir);
        assert_eq!(s.score(), 50.0);
        assert!(s.history().is_empty());
        assert_eq!(s.band(), TrustBand::Medium);
    }

    #[test]
    fn clamps_at_upper_bound_and_reports_it() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = scorer(&dir);
        let u = s.update_score(80.0, ReasonCode::ManualAdjustment, None).unwrap();
        assert_eq!(u.new, 100.0);
        assert!(u.clamped);
        assert_eq!(u.delta, 50.0);
        assert_eq!(s.history().last().unwrap().new_score, 100.0);
    }

    #[test]
    fn clamps_at_lower_bound() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = scorer(&dir);
        let u = s.update_score(-500.0, ReasonCode::SystemHealth, None).unwrap();
        assert_eq!(u.new, 0.0);
        assert!(u.clamped);
    }

    #[test]
    fn non_finite_delta_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = scorer(&dir);
        assert!(s.update_score(f64::NAN, ReasonCode::ManualAdjustment, None).is_err());
        assert_eq!(s.score(), 50.0);
        assert!(s.history().is_empty());
    }

    #[test]
    fn outcome_deltas_are_loss_averse() {
        let a = OperationAssessment::default();
        for tier in [CapabilityTier::Tier2, CapabilityTier::Tier3, CapabilityTier::Tier4] {
            let gain = TrustScorer::outcome_delta(tier, true, a);
            let loss = TrustScorer::outcome_delta(tier, false, a);
            assert!(gain > 0.0);
            assert!(loss.abs() > gain, "{tier}: {loss} vs {gain}");
        }
        assert_eq!(TrustScorer::outcome_delta(CapabilityTier::Tier1, true, a), 0.0);
    }

    #[test]
    fn outcome_delta_uses_documented_formula() {
        let a = OperationAssessment::default();
        // 3 * 1.5 * 1.5 * 0.8
        assert!(approx(TrustScorer::outcome_delta(CapabilityTier::Tier2, true, a), 5.4));
        // -(10 * 1.5 * 1.5 * 1.2)
        assert!(approx(TrustScorer::outcome_delta(CapabilityTier::Tier3, false, a), -27.0));
    }

    #[test]
    fn history_and_score_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut s = scorer(&dir);
            s.apply_outcome(CapabilityTier::Tier2, true, OperationAssessment::default(), Some("a"))
                .unwrap();
            s.update_score(-3.0, ReasonCode::ManualAdjustment, None).unwrap();
        }
        let s = scorer(&dir);
        assert_eq!(s.history().len(), 2);
        assert!(approx(s.score(), 52.4));
        assert_eq!(s.history()[0].operation_id.as_deref(), Some("a"));
        assert_eq!(s.history()[0].reason_code, ReasonCode::OperationSuccess);
    }

    #[test]
    fn corrupt_history_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trust_history.json");
        std::fs::write(&path, b"not json").unwrap();
        let s = TrustScorer::load(&path, TrustConfig::default()).unwrap();
        assert_eq!(s.score(), 50.0);
    }

    #[test]
    fn persistence_failure_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let mut s = TrustScorer::load(blocker.join("trust.json"), TrustConfig::default()).unwrap();
        let err = s.update_score(5.0, ReasonCode::ManualAdjustment, None).unwrap_err();
        assert!(matches!(err, VigilError::Persistence(_)));
        assert_eq!(s.score(), 50.0);
        assert!(s.history().is_empty());
    }

    #[test]
    fn authorization_checks_score_then_approval() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = scorer(&dir);
        assert!(s.can_perform_operation(CapabilityTier::Tier3, &Approval::Absent).is_allowed());
        assert_eq!(
            s.can_perform_operation(CapabilityTier::Tier4, &Approval::Absent),
            Authorization::Refused(RefusalReason::InsufficientTrust {
                score: 50.0,
                required: 70.0
            })
        );

        s.update_score(25.0, ReasonCode::ManualAdjustment, None).unwrap();
        assert_eq!(
            s.can_perform_operation(CapabilityTier::Tier4, &Approval::Absent),
            Authorization::Refused(RefusalReason::ApprovalMissing {
                tier: CapabilityTier::Tier4
            })
        );
        assert!(
            s.can_perform_operation(CapabilityTier::Tier4, &Approval::Granted("ops".into()))
                .is_allowed()
        );
    }

    #[test]
    fn statistics_use_recent_window() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = scorer(&dir);
        let a = OperationAssessment::default();
        s.apply_outcome(CapabilityTier::Tier3, false, a, None).unwrap();
        s.apply_outcome(CapabilityTier::Tier2, true, a, None).unwrap();
        s.apply_outcome(CapabilityTier::Tier2, true, a, None).unwrap();
        s.update_score(1.0, ReasonCode::ManualAdjustment, None).unwrap();

        let all = s.statistics(10);
        assert_eq!(all.total_records, 4);
        assert!(approx(all.recent_success_rate, 200.0 / 3.0));
        assert!(approx(all.max_score_seen, 50.0));
        assert!(approx(all.min_score_seen, 23.0));

        let last_two = s.statistics(2);
        assert!(approx(last_two.recent_success_rate, 100.0));
        assert!(approx(last_two.recent_avg_delta, (5.4 + 1.0) / 2.0));
    }

    #[test]
    fn bands_follow_thresholds() {
        assert_eq!(TrustBand::for_score(0.0), TrustBand::Critical);
        assert_eq!(TrustBand::for_score(30.0), TrustBand::Low);
        assert_eq!(TrustBand::for_score(69.9), TrustBand::Medium);
        assert_eq!(TrustBand::for_score(70.0), TrustBand::High);
        assert_eq!(TrustBand::for_score(90.0), TrustBand::Excellent);
    }

    #[test]
    fn tier_table_rejects_non_increasing_thresholds() {
        let req = |s| TierRequirement {
            required_score: s,
            approval_required: false,
        };
        assert!(TierTable::new([req(0.0), req(30.0), req(30.0), req(70.0)]).is_err());
        assert!(TierTable::new([req(0.0), req(10.0), req(20.0), req(30.0)]).is_ok());
    }

    #[test]
    fn inconsistent_bounds_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrustConfig {
            min: 10.0,
            max: 5.0,
            ..TrustConfig::default()
        };
        assert!(TrustScorer::load(dir.path().join("t.json"), config).is_err());
    }
}
