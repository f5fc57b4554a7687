//! [`SafetyModeManager`] – graded restriction of system capability.
//!
//! The manager holds one of four [`SafetyLevel`]s together with the sets of
//! features explicitly enabled or disabled at that level.  Outside
//! [`SafetyLevel::Normal`] a feature is allowed only when it is explicitly
//! enabled and not disabled.
//!
//! Transitions only escalate: [`SafetyModeManager::enter`] refuses to move to
//! a less restrictive level, and the only way down is
//! [`SafetyModeManager::exit`], which requires an explicit override when
//! leaving [`SafetyLevel::Lockdown`].
//!
//! State is persisted as JSON after every change.  A missing or unreadable
//! file on startup yields `Normal` with a logged warning.
//!
//! # Example
//!
//! ```
//! use vigil_kernel::safety_mode::{features, SafetyModeManager};
//! use vigil_types::SafetyLevel;
//!
//! let dir = tempfile::tempdir().unwrap();
//! let mut manager = SafetyModeManager::load(dir.path().join("config.json"));
//!
//! manager.enter(SafetyLevel::Safe).unwrap();
//! assert!(manager.check_feature_allowed(features::HEARTBEAT));
//! assert!(!manager.check_feature_allowed(features::TIER3));
//! assert!(manager.enter(SafetyLevel::Degraded).is_err());
//! ```

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use vigil_memory::atomic::{read_json, write_json_atomic};
use vigil_types::{SafetyLevel, VigilError};

/// Well-known feature names checked against the current safety mode.
pub mod features {
    pub const HEARTBEAT: &str = "heartbeat";
    pub const LOGGING: &str = "logging";
    pub const SNAPSHOT: &str = "snapshot";
    pub const TRUST_UPDATES: &str = "trust_updates";
    pub const TIER1: &str = "tier1";
    pub const TIER2: &str = "tier2";
    pub const TIER3: &str = "tier3";
    pub const TIER4: &str = "tier4";
}

/// Persisted safety-mode configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyModeState {
    pub level: SafetyLevel,
    #[serde(default)]
    pub enabled_features: BTreeSet<String>,
    #[serde(default)]
    pub disabled_features: BTreeSet<String>,
    #[serde(default)]
    pub entered_at: Option<DateTime<Utc>>,
}

/// Result of [`SafetyModeManager::enter`] / [`SafetyModeManager::exit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetyTransition {
    pub from: SafetyLevel,
    pub to: SafetyLevel,
    /// `false` when the call was a no-op.
    pub changed: bool,
    /// `false` when the in-memory change could not be written to disk.
    pub persisted: bool,
}

/// Result of [`SafetyModeManager::add_enabled_feature`] /
/// [`SafetyModeManager::add_disabled_feature`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureChange {
    /// `false` when the feature already had the requested state.
    pub changed: bool,
    /// `false` when the in-memory change could not be written to disk.
    pub persisted: bool,
}

fn default_features(level: SafetyLevel) -> (BTreeSet<String>, BTreeSet<String>) {
    use features::*;
    let (enabled, disabled): (&[&str], &[&str]) = match level {
        SafetyLevel::Normal => (&[], &[]),
        SafetyLevel::Degraded => (
            &[HEARTBEAT, LOGGING, SNAPSHOT, TIER1, TIER2, TRUST_UPDATES],
            &[TIER3, TIER4],
        ),
        SafetyLevel::Safe => (
            &[HEARTBEAT, LOGGING, SNAPSHOT, TIER1],
            &[TIER2, TIER3, TIER4, TRUST_UPDATES],
        ),
        SafetyLevel::Lockdown => (
            &[HEARTBEAT, LOGGING, SNAPSHOT],
            &[TIER1, TIER2, TIER3, TIER4, TRUST_UPDATES],
        ),
    };
    let to_set = |names: &[&str]| names.iter().map(|s| s.to_string()).collect();
    (to_set(enabled), to_set(disabled))
}

fn restriction_summary(level: SafetyLevel) -> &'static str {
    match level {
        SafetyLevel::Normal => "all restrictions lifted",
        SafetyLevel::Degraded => "non-core features restricted; tier3/tier4 refused",
        SafetyLevel::Safe => "core features only; trust score frozen",
        SafetyLevel::Lockdown => "system frozen until operator override",
    }
}

/// Owns the current [`SafetyModeState`] and its on-disk copy.
///
/// Not internally synchronised; share as `Arc<parking_lot::Mutex<_>>`.
#[derive(Debug)]
pub struct SafetyModeManager {
    path: PathBuf,
    state: SafetyModeState,
}

impl SafetyModeManager {
    /// Load state from `path`, falling back to `Normal` if the file is
    /// missing or unparseable.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match read_json::<SafetyModeState>(&path) {
            Ok(Some(state)) => {
                info!(level = %state.level, "safety mode restored from disk");
                state
            }
            Ok(None) => SafetyModeState::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "safety mode config unreadable; starting in normal mode");
                SafetyModeState::default()
            }
        };
        Self { path, state }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn level(&self) -> SafetyLevel {
        self.state.level
    }

    pub fn state(&self) -> &SafetyModeState {
        &self.state
    }

    pub fn entered_at(&self) -> Option<DateTime<Utc>> {
        self.state.entered_at
    }

    pub fn is_in_safety_mode(&self) -> bool {
        self.state.level != SafetyLevel::Normal
    }

    pub fn enabled_features(&self) -> &BTreeSet<String> {
        &self.state.enabled_features
    }

    pub fn disabled_features(&self) -> &BTreeSet<String> {
        &self.state.disabled_features
    }

    /// Escalate to `level`.
    ///
    /// Entering the current level is a no-op that keeps the original
    /// `entered_at`.
    ///
    /// # Errors
    ///
    /// [`VigilError::NotAnEscalation`] when `level` is less restrictive than
    /// the current level.
    pub fn enter(&mut self, level: SafetyLevel) -> Result<SafetyTransition, VigilError> {
        let from = self.state.level;
        if level < from {
            return Err(VigilError::NotAnEscalation { from, to: level });
        }
        if level == from {
            return Ok(SafetyTransition {
                from,
                to: level,
                changed: false,
                persisted: true,
            });
        }

        let (enabled, disabled) = default_features(level);
        self.state = SafetyModeState {
            level,
            enabled_features: enabled,
            disabled_features: disabled,
            entered_at: Some(Utc::now()),
        };
        warn!(from = %from, to = %level, "entering safety mode: {}", restriction_summary(level));
        let persisted = self.persist();
        Ok(SafetyTransition {
            from,
            to: level,
            changed: true,
            persisted,
        })
    }

    /// Return to `Normal`.
    ///
    /// # Errors
    ///
    /// [`VigilError::LockdownOverrideRequired`] when the current level is
    /// `Lockdown` and `override_lockdown` is `false`.
    pub fn exit(&mut self, override_lockdown: bool) -> Result<SafetyTransition, VigilError> {
        let from = self.state.level;
        if from == SafetyLevel::Normal {
            return Ok(SafetyTransition {
                from,
                to: from,
                changed: false,
                persisted: true,
            });
        }
        if from == SafetyLevel::Lockdown && !override_lockdown {
            return Err(VigilError::LockdownOverrideRequired);
        }

        self.state = SafetyModeState::default();
        info!(from = %from, "leaving safety mode: {}", restriction_summary(SafetyLevel::Normal));
        let persisted = self.persist();
        Ok(SafetyTransition {
            from,
            to: SafetyLevel::Normal,
            changed: true,
            persisted,
        })
    }

    /// `Normal` allows everything.  Otherwise a feature must be enabled and
    /// not disabled; unknown features are denied.
    pub fn check_feature_allowed(&self, feature: &str) -> bool {
        if self.state.level == SafetyLevel::Normal {
            return true;
        }
        if self.state.disabled_features.contains(feature) {
            warn!(feature, level = %self.state.level, "feature disabled by safety mode");
            return false;
        }
        if !self.state.enabled_features.contains(feature) {
            warn!(feature, level = %self.state.level, "feature not enabled in safety mode");
            return false;
        }
        true
    }

    /// Explicitly allow `feature` at the current level.
    pub fn add_enabled_feature(&mut self, feature: &str) -> FeatureChange {
        let changed = self.state.disabled_features.remove(feature)
            | self.state.enabled_features.insert(feature.to_string());
        self.feature_change(changed)
    }

    /// Explicitly deny `feature` at the current level.
    pub fn add_disabled_feature(&mut self, feature: &str) -> FeatureChange {
        let changed = self.state.enabled_features.remove(feature)
            | self.state.disabled_features.insert(feature.to_string());
        self.feature_change(changed)
    }

    fn feature_change(&self, changed: bool) -> FeatureChange {
        FeatureChange {
            changed,
            persisted: !changed || self.persist(),
        }
    }

    fn persist(&self) -> bool {
        match write_json_atomic(&self.path, &self.state) {
            Ok(()) => true,
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "failed to persist safety mode");
                false
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
