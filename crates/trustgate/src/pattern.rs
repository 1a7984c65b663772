//! Behavioural pattern classification
//!
//! Base classification is a pure function of (resource, action, trust).
//! Two request-specific overrides sit on top of it: a device fingerprint that
//! does not match the bound one, and a transfer above the amount threshold.
//! Overrides win the reported pattern and add their risk bump.

use crate::config::EngineConfig;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse behavioural tag for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Pattern {
    Normal,
    LowTrust,
    TransferAttempt,
    DestructiveAction,
    DeviceFingerprintMismatch,
    HighAmountTransfer,
}

impl Pattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            Pattern::Normal => "NORMAL",
            Pattern::LowTrust => "LOW_TRUST",
            Pattern::TransferAttempt => "TRANSFER_ATTEMPT",
            Pattern::DestructiveAction => "DESTRUCTIVE_ACTION",
            Pattern::DeviceFingerprintMismatch => "DEVICE_FINGERPRINT_MISMATCH",
            Pattern::HighAmountTransfer => "HIGH_AMOUNT_TRANSFER",
        }
    }

    /// Patterns that warrant a second factor when no policy says otherwise
    pub fn is_sensitive(&self) -> bool {
        matches!(self, Pattern::TransferAttempt | Pattern::DestructiveAction)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Trust below which a request classifies as LOW_TRUST
pub const LOW_TRUST_THRESHOLD: f64 = 0.4;

/// Classify a request with the default low-trust threshold
pub fn detect(resource: &str, action: &str, trust: f64) -> Pattern {
    detect_with(resource, action, trust, LOW_TRUST_THRESHOLD)
}

/// Classify a request
pub fn detect_with(resource: &str, action: &str, trust: f64, low_trust_threshold: f64) -> Pattern {
    if is_transfer(resource, action) {
        Pattern::TransferAttempt
    } else if resource == "files" && action == "delete" {
        Pattern::DestructiveAction
    } else if trust < low_trust_threshold {
        Pattern::LowTrust
    } else {
        Pattern::Normal
    }
}

fn is_transfer(resource: &str, action: &str) -> bool {
    resource == "transactions" && action == "transfer"
}

/// Request facts the caller layer contributes
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RequestOverrides {
    pub device_mismatch: bool,
    pub amount: Option<f64>,
}

/// Final pattern plus the risk it adds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PatternOutcome {
    pub pattern: Pattern,
    pub risk_bump: f64,
}

/// Merge request overrides into a base classification.
///
/// Both bumps accumulate; HIGH_AMOUNT_TRANSFER is reported when both fire.
pub fn apply_overrides(
    base: Pattern,
    resource: &str,
    action: &str,
    overrides: RequestOverrides,
    config: &EngineConfig,
) -> PatternOutcome {
    let mut outcome = PatternOutcome {
        pattern: base,
        risk_bump: 0.0,
    };

    if overrides.device_mismatch {
        outcome.pattern = Pattern::DeviceFingerprintMismatch;
        outcome.risk_bump += config.overrides.device_mismatch_bump;
    }

    let high_amount = overrides
        .amount
        .is_some_and(|amount| amount > config.high_amount_threshold);
    if high_amount && is_transfer(resource, action) {
        outcome.pattern = Pattern::HighAmountTransfer;
        outcome.risk_bump += config.overrides.high_amount_bump;
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_classification() {
        assert_eq!(detect("transactions", "transfer", 0.9), Pattern::TransferAttempt);
        assert_eq!(detect("files", "delete", 0.9), Pattern::DestructiveAction);
        assert_eq!(detect("files", "read", 0.3), Pattern::LowTrust);
        assert_eq!(detect("files", "read", 0.9), Pattern::Normal);
        assert_eq!(detect("files", "read", 0.4), Pattern::Normal);
    }

    #[test]
    fn test_sensitive_patterns_beat_low_trust() {
        assert_eq!(detect("transactions", "transfer", 0.1), Pattern::TransferAttempt);
        assert_eq!(detect("files", "delete", 0.1), Pattern::DestructiveAction);
    }

    #[test]
    fn test_high_amount_override() {
        let config = EngineConfig::default();
        let overrides = RequestOverrides {
            amount: Some(15_000.0),
            ..Default::default()
        };
        let outcome = apply_overrides(
            Pattern::TransferAttempt,
            "transactions",
            "transfer",
            overrides,
            &config,
        );
        assert_eq!(outcome.pattern, Pattern::HighAmountTransfer);
        assert!((outcome.risk_bump - 0.30).abs() < 1e-9);

        let at_threshold = RequestOverrides {
            amount: Some(10_000.0),
            ..Default::default()
        };
        let outcome = apply_overrides(
            Pattern::TransferAttempt,
            "transactions",
            "transfer",
            at_threshold,
            &config,
        );
        assert_eq!(outcome.pattern, Pattern::TransferAttempt);
        assert_eq!(outcome.risk_bump, 0.0);
    }

    #[test]
    fn test_amount_ignored_outside_transfers() {
        let config = EngineConfig::default();
        let overrides = RequestOverrides {
            amount: Some(50_000.0),
            ..Default::default()
        };
        let outcome = apply_overrides(Pattern::Normal, "files", "read", overrides, &config);
        assert_eq!(outcome.pattern, Pattern::Normal);
        assert_eq!(outcome.risk_bump, 0.0);
    }

    #[test]
    fn test_overrides_accumulate() {
        let config = EngineConfig::default();
        let overrides = RequestOverrides {
            device_mismatch: true,
            amount: Some(20_000.0),
        };
        let outcome = apply_overrides(
            Pattern::TransferAttempt,
            "transactions",
            "transfer",
            overrides,
            &config,
        );
        assert_eq!(outcome.pattern, Pattern::HighAmountTransfer);
        assert!((outcome.risk_bump - 0.55).abs() < 1e-9);
    }

    #[test]
    fn test_device_mismatch_override() {
        let config = EngineConfig::default();
        let overrides = RequestOverrides {
            device_mismatch: true,
            amount: None,
        };
        let outcome = apply_overrides(Pattern::Normal, "files", "read", overrides, &config);
        assert_eq!(outcome.pattern, Pattern::DeviceFingerprintMismatch);
        assert!((outcome.risk_bump - 0.25).abs() < 1e-9);
    }
}
