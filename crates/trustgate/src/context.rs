//! Per-request decision context
//!
//! Built once, then only ever handed out by shared reference. Rules,
//! policy lookup, and the dispatcher all read the same record.

use crate::level::{AccessLevel, RiskLevel};
use crate::pattern::Pattern;
use crate::risk::{RiskAssessment, Signals, AUTH_FAIL};
use crate::trust_store::Identity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectAttrs {
    pub identity_id: String,
    pub role: String,
    /// Effective trust at decision time
    pub trust_level: f64,
    /// Stored base trust, before decay
    pub base_trust: f64,
    /// Recent authentication failures, from the `auth_fail` signal
    pub auth_failures: f64,
    pub max_access_level: AccessLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceAttrs {
    pub name: String,
    pub sensitivity: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionAttrs {
    pub session_id: Option<String>,
    pub idle_minutes: f64,
    pub location: Option<String>,
    pub device_trust: Option<String>,
    /// Fingerprint presented with the request
    #[serde(default)]
    pub device_fingerprint: Option<String>,
    pub step_up_completed: bool,
}

/// Everything the reasoner may look at for one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub timestamp: DateTime<Utc>,
    pub subject: SubjectAttrs,
    pub resource: ResourceAttrs,
    pub action: String,
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub pattern: Pattern,
    pub signals: Signals,
    pub session: SessionAttrs,
    pub amount: Option<f64>,
}

impl Context {
    pub fn builder(identity: &Identity, resource: &str, action: &str) -> ContextBuilder {
        ContextBuilder::new(identity, resource, action)
    }

    pub fn trust(&self) -> f64 {
        self.subject.trust_level
    }

    pub fn signal(&self, name: &str) -> f64 {
        self.signals.get(name)
    }

    /// Access ordinal the action needs
    pub fn required_access(&self) -> AccessLevel {
        AccessLevel::required_for(&self.action)
    }
}

pub struct ContextBuilder {
    identity_id: String,
    base_trust: f64,
    max_access_level: AccessLevel,
    resource: String,
    action: String,
    trust: Option<f64>,
    role: Option<String>,
    sensitivity: Option<String>,
    risk: Option<RiskAssessment>,
    pattern: Pattern,
    signals: Signals,
    session: SessionAttrs,
    amount: Option<f64>,
    timestamp: Option<DateTime<Utc>>,
}

impl ContextBuilder {
    pub fn new(identity: &Identity, resource: &str, action: &str) -> Self {
        Self {
            identity_id: identity.id.clone(),
            base_trust: identity.trust_score,
            max_access_level: identity.max_access_level,
            resource: resource.to_string(),
            action: action.to_string(),
            trust: None,
            role: None,
            sensitivity: None,
            risk: None,
            pattern: Pattern::Normal,
            signals: Signals::new(),
            session: SessionAttrs::default(),
            amount: None,
            timestamp: None,
        }
    }

    /// Effective trust; defaults to the identity's base trust
    pub fn trust(mut self, trust: f64) -> Self {
        self.trust = Some(trust);
        self
    }

    pub fn role(mut self, role: Option<String>) -> Self {
        self.role = role;
        self
    }

    pub fn sensitivity(mut self, sensitivity: Option<String>) -> Self {
        self.sensitivity = sensitivity;
        self
    }

    pub fn risk(mut self, risk: RiskAssessment) -> Self {
        self.risk = Some(risk);
        self
    }

    pub fn pattern(mut self, pattern: Pattern) -> Self {
        self.pattern = pattern;
        self
    }

    pub fn signals(mut self, signals: Signals) -> Self {
        self.signals = signals;
        self
    }

    pub fn session(mut self, session: SessionAttrs) -> Self {
        self.session = session;
        self
    }

    pub fn amount(mut self, amount: Option<f64>) -> Self {
        self.amount = amount;
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn build(self) -> Context {
        let trust = self.trust.unwrap_or(self.base_trust);
        let (risk_score, risk_level) = match self.risk {
            Some(risk) => (risk.score, risk.level),
            None => (0.0, RiskLevel::Low),
        };
        let sensitivity = self
            .sensitivity
            .unwrap_or_else(|| default_sensitivity(&self.resource).to_string());

        Context {
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            subject: SubjectAttrs {
                identity_id: self.identity_id,
                role: self.role.unwrap_or_else(|| "agent".to_string()),
                trust_level: trust,
                base_trust: self.base_trust,
                auth_failures: self.signals.get(AUTH_FAIL),
                max_access_level: self.max_access_level,
            },
            resource: ResourceAttrs {
                name: self.resource,
                sensitivity,
            },
            action: self.action,
            risk_score,
            risk_level,
            pattern: self.pattern,
            signals: self.signals,
            session: self.session,
            amount: self.amount,
        }
    }
}

fn default_sensitivity(resource: &str) -> &'static str {
    match resource {
        "transactions" | "accounts" | "admin" => "high",
        _ => "standard",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let identity = Identity::new("alice", 0.8, AccessLevel::Write);
        let ctx = Context::builder(&identity, "files", "read").build();
        assert_eq!(ctx.trust(), 0.8);
        assert_eq!(ctx.subject.role, "agent");
        assert_eq!(ctx.resource.sensitivity, "standard");
        assert_eq!(ctx.risk_level, RiskLevel::Low);
        assert_eq!(ctx.required_access(), AccessLevel::Read);
    }

    #[test]
    fn test_builder_carries_request_facts() {
        let identity = Identity::new("alice", 0.8, AccessLevel::Transfer);
        let ctx = Context::builder(&identity, "transactions", "transfer")
            .trust(0.5)
            .signals(Signals::new().with(AUTH_FAIL, 2.0))
            .amount(Some(250.0))
            .build();
        assert_eq!(ctx.trust(), 0.5);
        assert_eq!(ctx.subject.base_trust, 0.8);
        assert_eq!(ctx.subject.auth_failures, 2.0);
        assert_eq!(ctx.resource.sensitivity, "high");
        assert_eq!(ctx.amount, Some(250.0));
    }
}
