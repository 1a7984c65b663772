//! Engine configuration
//!
//! Configuration file:
//! - ~/.config/trustgate/engine.yaml
//!
//! Every field carries a default, so a partial file (or none at all) works.

use crate::error::ConfigError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Tunables for scoring, decay, and enforcement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Trust decay per idle minute (λ)
    #[serde(default = "default_decay_rate")]
    pub decay_rate: f64,

    /// Transfers above this amount are flagged HIGH_AMOUNT_TRANSFER
    #[serde(default = "default_high_amount_threshold")]
    pub high_amount_threshold: f64,

    /// Recent outcomes kept per identity for adaptive weighting
    #[serde(default = "default_history_window")]
    pub high_risk_history_window: usize,

    /// Transfers below this trust need step-up
    #[serde(default = "default_step_up_trust_threshold")]
    pub step_up_trust_threshold: f64,

    /// Trust below this is denied before any rule runs
    #[serde(default = "default_min_trust_hard_block")]
    pub min_trust_hard_block: f64,

    /// Risk strictly above this is denied before any rule runs
    #[serde(default = "default_auto_deny_risk")]
    pub auto_deny_risk: f64,

    /// Trust below this classifies as LOW_TRUST
    #[serde(default = "default_low_trust_threshold")]
    pub low_trust_threshold: f64,

    #[serde(default)]
    pub risk_thresholds: RiskThresholds,

    #[serde(default)]
    pub risk_weights: RiskWeights,

    #[serde(default)]
    pub adaptive: AdaptiveWeighting,

    #[serde(default)]
    pub overrides: OverrideBumps,

    #[serde(default)]
    pub trust_deltas: TrustDeltas,

    /// Base trust at or below this revokes every session of the identity
    #[serde(default)]
    pub trust_collapse_threshold: f64,

    /// Queue depth for channel observers
    #[serde(default = "default_observer_buffer")]
    pub observer_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            decay_rate: default_decay_rate(),
            high_amount_threshold: default_high_amount_threshold(),
            high_risk_history_window: default_history_window(),
            step_up_trust_threshold: default_step_up_trust_threshold(),
            min_trust_hard_block: default_min_trust_hard_block(),
            auto_deny_risk: default_auto_deny_risk(),
            low_trust_threshold: default_low_trust_threshold(),
            risk_thresholds: RiskThresholds::default(),
            risk_weights: RiskWeights::default(),
            adaptive: AdaptiveWeighting::default(),
            overrides: OverrideBumps::default(),
            trust_deltas: TrustDeltas::default(),
            trust_collapse_threshold: 0.0,
            observer_buffer: default_observer_buffer(),
        }
    }
}

fn default_decay_rate() -> f64 {
    0.015
}

fn default_high_amount_threshold() -> f64 {
    10_000.0
}

fn default_history_window() -> usize {
    20
}

fn default_step_up_trust_threshold() -> f64 {
    0.7
}

fn default_min_trust_hard_block() -> f64 {
    0.2
}

fn default_auto_deny_risk() -> f64 {
    0.85
}

fn default_low_trust_threshold() -> f64 {
    0.4
}

fn default_observer_buffer() -> usize {
    64
}

impl EngineConfig {
    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read engine config from {:?}", path))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse engine config from {:?}", path))?;
        config
            .validate()
            .with_context(|| format!("Invalid engine config in {:?}", path))?;
        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write engine config to {:?}", path))?;
        Ok(())
    }

    /// Reject settings the pipeline cannot honour
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.decay_rate.is_finite() || self.decay_rate < 0.0 {
            return Err(ConfigError::InvalidDecayRate(self.decay_rate));
        }
        if self.high_risk_history_window == 0 {
            return Err(ConfigError::Zero("high_risk_history_window"));
        }
        if self.observer_buffer == 0 {
            return Err(ConfigError::Zero("observer_buffer"));
        }

        let unit = [
            ("step_up_trust_threshold", self.step_up_trust_threshold),
            ("min_trust_hard_block", self.min_trust_hard_block),
            ("auto_deny_risk", self.auto_deny_risk),
            ("low_trust_threshold", self.low_trust_threshold),
            ("risk_thresholds.medium", self.risk_thresholds.medium),
            ("risk_thresholds.high", self.risk_thresholds.high),
            ("trust_collapse_threshold", self.trust_collapse_threshold),
        ];
        for (name, value) in unit {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::OutOfRange { name, value });
            }
        }

        if self.risk_thresholds.medium >= self.risk_thresholds.high {
            return Err(ConfigError::ThresholdOrder {
                medium: self.risk_thresholds.medium,
                high: self.risk_thresholds.high,
            });
        }

        Ok(())
    }
}

/// Risk band boundaries (inclusive lower bounds)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskThresholds {
    #[serde(default = "default_medium")]
    pub medium: f64,
    #[serde(default = "default_high")]
    pub high: f64,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            medium: default_medium(),
            high: default_high(),
        }
    }
}

fn default_medium() -> f64 {
    0.40
}

fn default_high() -> f64 {
    0.70
}

/// Base weights for the behavioural signal vocabulary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskWeights {
    pub auth_fail: f64,
    pub deny: f64,
    pub trust_decay: f64,
    pub anomaly: f64,
    pub session_abuse: f64,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            auth_fail: 0.25,
            deny: 0.20,
            trust_decay: 0.20,
            anomaly: 0.25,
            session_abuse: 0.10,
        }
    }
}

/// Weight scaling for identities with a run of HIGH outcomes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveWeighting {
    pub min_high_risk_events: usize,
    pub anomaly_multiplier: f64,
    pub session_abuse_multiplier: f64,
}

impl Default for AdaptiveWeighting {
    fn default() -> Self {
        Self {
            min_high_risk_events: 3,
            anomaly_multiplier: 1.3,
            session_abuse_multiplier: 1.2,
        }
    }
}

/// Risk added by request-specific overrides
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverrideBumps {
    pub device_mismatch_bump: f64,
    pub high_amount_bump: f64,
}

impl Default for OverrideBumps {
    fn default() -> Self {
        Self {
            device_mismatch_bump: 0.25,
            high_amount_bump: 0.30,
        }
    }
}

/// Signed trust adjustments per event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustDeltas {
    pub allow: f64,
    pub step_up: f64,
    pub deny: f64,
    pub login_failure: f64,
    pub otp_success: f64,
    pub step_up_verified: f64,
    pub policy_violation: f64,
}

impl Default for TrustDeltas {
    fn default() -> Self {
        Self {
            allow: 0.02,
            step_up: -0.05,
            deny: -0.10,
            login_failure: -0.05,
            otp_success: 0.02,
            step_up_verified: 0.30,
            policy_violation: -0.07,
        }
    }
}
