//! [`KernelGate`] – single admission point for tiered operations.
//!
//! Every operation passes through [`KernelGate::authorize`] before it runs.
//! Two independent checks are applied in order:
//!
//! 1. **Safety mode** ([`SafetyModeManager`]): the tier's feature
//!    (`tier1`..`tier4`) must be allowed at the current level, otherwise
//!    [`VigilError::FeatureDisabled`].
//! 2. **Trust** ([`TrustScorer`]): the score must meet the tier's threshold
//!    and any required approval must be present, otherwise
//!    [`VigilError::Unauthorized`].
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use parking_lot::Mutex;
//! use vigil_kernel::{KernelGate, SafetyModeManager, TrustConfig, TrustScorer};
//! use vigil_types::{Approval, CapabilityTier, SafetyLevel};
//!
//! let dir = tempfile::tempdir().unwrap();
//! let safety = Arc::new(Mutex::new(SafetyModeManager::load(dir.path().join("safety.json"))));
//! let trust = Arc::new(Mutex::new(
//!     TrustScorer::load(dir.path().join("trust.json"), TrustConfig::default()).unwrap(),
//! ));
//! let gate = KernelGate::new(Arc::clone(&safety), trust);
//!
//! assert!(gate.authorize(CapabilityTier::Tier2, &Approval::Absent).is_ok());
//!
//! safety.lock().enter(SafetyLevel::Safe).unwrap();
//! assert!(gate.authorize(CapabilityTier::Tier2, &Approval::Absent).is_err());
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};
use vigil_types::{Approval, CapabilityTier, VigilError};

use crate::safety_mode::SafetyModeManager;
use crate::trust::{Authorization, TrustScorer};

/// Combines the safety-mode and trust checks in one call.
#[derive(Clone)]
pub struct KernelGate {
    safety: Arc<Mutex<SafetyModeManager>>,
    trust: Arc<Mutex<TrustScorer>>,
}

impl KernelGate {
    pub fn new(safety: Arc<Mutex<SafetyModeManager>>, trust: Arc<Mutex<TrustScorer>>) -> Self {
        Self { safety, trust }
    }

    /// Admit or refuse an operation at `tier`.
    ///
    /// The two locks are taken one after the other, never together.
    pub fn authorize(&self, tier: CapabilityTier, approval: &Approval) -> Result<(), VigilError> {
        let feature = tier.feature();
        if !self.safety.lock().check_feature_allowed(feature) {
            return Err(VigilError::FeatureDisabled(feature.to_string()));
        }

        let decision = self.trust.lock().can_perform_operation(tier, approval);
        match decision {
            Authorization::Allowed => {
                debug!(%tier, "operation admitted");
                Ok(())
            }
            Authorization::Refused(reason) => {
                warn!(%tier, %reason, "operation refused by trust check");
                Err(VigilError::Unauthorized {
                    tier,
                    reason: reason.to_string(),
                })
            }
        }
    }
}
