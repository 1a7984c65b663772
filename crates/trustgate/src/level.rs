//! Ordered levels used throughout the engine
//!
//! Three small enums carry most of the decision vocabulary:
//! - `AccessLevel`: read < write < transfer, the hard ceiling per identity
//! - `RiskLevel`: LOW < MEDIUM < HIGH, the classified risk band
//! - `Verdict`: ALLOW < STEP_UP < DENY, ordered by strictness

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum operation class an identity may ever perform
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    /// Look, don't touch
    #[default]
    Read,
    /// Create and modify
    Write,
    /// Move value out of the system
    Transfer,
}

impl AccessLevel {
    /// Parse from string
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "read" => Some(AccessLevel::Read),
            "write" => Some(AccessLevel::Write),
            "transfer" => Some(AccessLevel::Transfer),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::Read => "read",
            AccessLevel::Write => "write",
            AccessLevel::Transfer => "transfer",
        }
    }

    /// Check if this ceiling covers an operation that needs `required`
    pub fn can_do(&self, required: AccessLevel) -> bool {
        *self >= required
    }

    /// The level an action needs.
    ///
    /// Reads are the only thing a read-capped identity may do. Anything that
    /// is not recognisably a read or a transfer counts as a write, so unknown
    /// verbs fail toward the stricter class.
    pub fn required_for(action: &str) -> Self {
        match action.to_lowercase().as_str() {
            "read" | "view" | "list" => AccessLevel::Read,
            "transfer" => AccessLevel::Transfer,
            _ => AccessLevel::Write,
        }
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Classified risk band
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "LOW" => Some(RiskLevel::Low),
            "MEDIUM" => Some(RiskLevel::Medium),
            "HIGH" => Some(RiskLevel::High),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Outcome of an access decision, ordered from most to least permissive
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    /// Proceed
    Allow,
    /// Proceed only after an additional authentication factor
    StepUp,
    /// Refuse
    Deny,
}

impl Verdict {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().replace('-', "_").as_str() {
            "ALLOW" => Some(Verdict::Allow),
            "STEP_UP" | "STEPUP" => Some(Verdict::StepUp),
            "DENY" => Some(Verdict::Deny),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Allow => "ALLOW",
            Verdict::StepUp => "STEP_UP",
            Verdict::Deny => "DENY",
        }
    }

    /// The stricter of two verdicts
    pub fn stricter(self, other: Verdict) -> Verdict {
        self.max(other)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}
