//! Recent risk outcomes per identity
//!
//! A bounded ring per identity, fed by the enforcement dispatcher after each
//! decision and read by the risk engine to decide whether adaptive weighting
//! applies. In-process only.

use crate::level::{RiskLevel, Verdict};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{PoisonError, RwLock};

/// What one decision looked like, risk-wise
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskOutcome {
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub decision: Verdict,
    pub timestamp: DateTime<Utc>,
}

impl RiskOutcome {
    pub fn new(risk_score: f64, risk_level: RiskLevel, decision: Verdict) -> Self {
        Self {
            risk_score,
            risk_level,
            decision,
            timestamp: Utc::now(),
        }
    }
}

pub struct RiskHistory {
    window: usize,
    entries: RwLock<HashMap<String, VecDeque<RiskOutcome>>>,
}

impl RiskHistory {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Append an outcome, evicting the oldest past the window
    pub fn record(&self, identity_id: &str, outcome: RiskOutcome) {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let ring = entries.entry(identity_id.to_string()).or_default();
        ring.push_back(outcome);
        while ring.len() > self.window {
            ring.pop_front();
        }
    }

    /// Outcomes in the window, oldest first
    pub fn recent(&self, identity_id: &str) -> Vec<RiskOutcome> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identity_id)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn high_risk_count(&self, identity_id: &str) -> usize {
        count_high(&self.recent(identity_id))
    }
}

/// Number of HIGH outcomes in a slice
pub fn count_high(outcomes: &[RiskOutcome]) -> usize {
    outcomes
        .iter()
        .filter(|o| o.risk_level == RiskLevel::High)
        .count()
}
