//! Risk Engine - weighted scoring over behavioural signals
//!
//! score = Σ weight(k) · signal(k) over a fixed vocabulary, with the anomaly
//! and session-abuse terms scaled up for identities that keep producing HIGH
//! outcomes. The result is clamped to [0, 1] and rounded to two decimals.
//!
//! Requests without signals are scored as `1 - trust`. Both paths classify
//! through the same `classify`, so band boundaries never diverge.

use crate::config::{AdaptiveWeighting, EngineConfig, RiskThresholds, RiskWeights};
use crate::history::{count_high, RiskOutcome};
use crate::level::RiskLevel;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

pub const AUTH_FAIL: &str = "auth_fail";
pub const DENY: &str = "deny";
pub const TRUST_DECAY: &str = "trust_decay";
pub const ANOMALY: &str = "anomaly";
pub const SESSION_ABUSE: &str = "session_abuse";

/// The signal vocabulary the engine weighs
pub const SIGNAL_NAMES: [&str; 5] = [AUTH_FAIL, DENY, TRUST_DECAY, ANOMALY, SESSION_ABUSE];

/// Sanitised behavioural signals: every value finite and non-negative
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Signals(BTreeMap<String, f64>);

impl Signals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Coerce loosely typed input. Numbers pass through, booleans become 0/1,
    /// numeric strings are parsed. Anything else becomes 0 with a warning.
    pub fn from_raw(raw: &BTreeMap<String, Value>) -> Self {
        let mut signals = Self::new();
        for (name, value) in raw {
            signals.insert(name, coerce(name, value));
        }
        signals
    }

    /// Set a signal; negative or non-finite values become 0
    pub fn insert(&mut self, name: &str, value: f64) {
        let value = if value.is_finite() && value >= 0.0 {
            value
        } else {
            warn!(signal = name, value, "invalid signal value coerced to 0");
            0.0
        };
        self.0.insert(name.to_string(), value);
    }

    pub fn with(mut self, name: &str, value: f64) -> Self {
        self.insert(name, value);
        self
    }

    /// Signal value, 0 when absent
    pub fn get(&self, name: &str) -> f64 {
        self.0.get(name).copied().unwrap_or(0.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &f64)> {
        self.0.iter()
    }
}

fn coerce(name: &str, value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::Bool(b) => f64::from(u8::from(*b)),
        Value::String(s) => match s.trim().parse::<f64>() {
            Ok(v) => v,
            Err(_) => {
                warn!(signal = name, raw = %s, "non-numeric signal coerced to 0");
                0.0
            }
        },
        Value::Null => 0.0,
        other => {
            warn!(signal = name, raw = %other, "non-numeric signal coerced to 0");
            0.0
        }
    }
}

/// A scored and classified risk
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub score: f64,
    pub level: RiskLevel,
    /// Whether adaptive weighting was in effect
    #[serde(default)]
    pub adapted: bool,
}

pub struct RiskEngine {
    weights: RiskWeights,
    thresholds: RiskThresholds,
    adaptive: AdaptiveWeighting,
}

impl RiskEngine {
    pub fn new(
        weights: RiskWeights,
        thresholds: RiskThresholds,
        adaptive: AdaptiveWeighting,
    ) -> Self {
        Self {
            weights,
            thresholds,
            adaptive,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.risk_weights.clone(),
            config.risk_thresholds.clone(),
            config.adaptive.clone(),
        )
    }

    /// Score signals against an identity's recent outcomes
    pub fn score(&self, signals: &Signals, recent: &[RiskOutcome]) -> RiskAssessment {
        let high_count = count_high(recent);
        let adapted = high_count >= self.adaptive.min_high_risk_events;

        let mut anomaly = self.weights.anomaly * signals.get(ANOMALY);
        let mut session_abuse = self.weights.session_abuse * signals.get(SESSION_ABUSE);
        if adapted {
            anomaly *= self.adaptive.anomaly_multiplier;
            session_abuse *= self.adaptive.session_abuse_multiplier;
        }

        let raw = self.weights.auth_fail * signals.get(AUTH_FAIL)
            + self.weights.deny * signals.get(DENY)
            + self.weights.trust_decay * signals.get(TRUST_DECAY)
            + anomaly
            + session_abuse;

        let score = round2(raw);
        debug!(score, high_count, adapted, "risk scored from signals");
        RiskAssessment {
            score,
            level: self.classify(score),
            adapted,
        }
    }

    /// Score from trust alone, for requests without behavioural signals
    pub fn from_trust(&self, trust: f64) -> RiskAssessment {
        let score = round2(1.0 - trust);
        RiskAssessment {
            score,
            level: self.classify(score),
            adapted: false,
        }
    }

    /// Add an override bump and reclassify
    pub fn bump(&self, base: RiskAssessment, bump: f64) -> RiskAssessment {
        if bump == 0.0 {
            return base;
        }
        let score = round2(base.score + bump);
        RiskAssessment {
            score,
            level: self.classify(score),
            adapted: base.adapted,
        }
    }

    /// The single threshold function every score goes through
    pub fn classify(&self, score: f64) -> RiskLevel {
        classify(score, &self.thresholds)
    }
}

impl Default for RiskEngine {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Map a score onto a band. Lower bounds are inclusive.
pub fn classify(score: f64, thresholds: &RiskThresholds) -> RiskLevel {
    if score >= thresholds.high {
        RiskLevel::High
    } else if score >= thresholds.medium {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

fn round2(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    (value.clamp(0.0, 1.0) * 100.0).round() / 100.0
}
