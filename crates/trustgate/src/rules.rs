//! Static PBAC rules
//!
//! A rule is an id, an effect, and a pure predicate over `Context`. The set
//! is assembled at startup and never changes while the engine runs. Every
//! rule is evaluated; one that fails is logged and left out of the match set
//! without affecting the others.

use crate::config::EngineConfig;
use crate::context::Context;
use crate::error::RuleError;
use crate::level::{RiskLevel, Verdict};
use crate::pattern::Pattern;
use crate::risk::ANOMALY;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

pub type Predicate = Box<dyn Fn(&Context) -> Result<bool, RuleError> + Send + Sync>;

pub struct Rule {
    pub id: String,
    pub effect: Verdict,
    predicate: Predicate,
}

impl Rule {
    pub fn new<F>(id: &str, effect: Verdict, predicate: F) -> Self
    where
        F: Fn(&Context) -> Result<bool, RuleError> + Send + Sync + 'static,
    {
        Self {
            id: id.to_string(),
            effect,
            predicate: Box::new(predicate),
        }
    }

    /// A rule whose predicate cannot fail
    pub fn when<F>(id: &str, effect: Verdict, predicate: F) -> Self
    where
        F: Fn(&Context) -> bool + Send + Sync + 'static,
    {
        Self::new(id, effect, move |ctx| Ok(predicate(ctx)))
    }

    pub fn matches(&self, ctx: &Context) -> Result<bool, RuleError> {
        (self.predicate)(ctx)
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("id", &self.id)
            .field("effect", &self.effect)
            .finish_non_exhaustive()
    }
}

/// A rule that matched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleMatch {
    pub id: String,
    pub effect: Verdict,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleEvaluation {
    pub matched: Vec<RuleMatch>,
    /// Rules whose predicate failed, with the error
    pub failed: Vec<(String, String)>,
}

impl RuleEvaluation {
    pub fn matched_ids(&self) -> Vec<String> {
        self.matched.iter().map(|m| m.id.clone()).collect()
    }

    /// Resolve the matched effects by strict priority
    pub fn derive(&self) -> Verdict {
        derive(&self.matched)
    }
}

/// DENY over STEP_UP over ALLOW; nothing matched resolves to DENY
pub fn derive(matched: &[RuleMatch]) -> Verdict {
    matched
        .iter()
        .map(|m| m.effect)
        .max()
        .unwrap_or(Verdict::Deny)
}

#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// The deployment's standard rules, thresholds taken from config
    pub fn standard(config: &EngineConfig) -> Self {
        let step_up_trust = config.step_up_trust_threshold;

        Self::new(vec![
            Rule::when("LOW_TRUST_TRANSFER", Verdict::StepUp, move |ctx| {
                ctx.action == "transfer" && ctx.trust() < step_up_trust
            }),
            Rule::when("HIGH_RISK_LEVEL_DENY", Verdict::Deny, |ctx| {
                ctx.risk_level == RiskLevel::High
            }),
            Rule::when("MEDIUM_RISK_STEP_UP", Verdict::StepUp, |ctx| {
                ctx.risk_level == RiskLevel::Medium
            }),
            Rule::when("ANOMALY_SPIKE_DENY", Verdict::Deny, |ctx| {
                ctx.signal(ANOMALY) >= 1.0 && ctx.risk_score > 0.5
            }),
            Rule::when("DEVICE_MISMATCH_STEP_UP", Verdict::StepUp, |ctx| {
                ctx.pattern == Pattern::DeviceFingerprintMismatch && !ctx.session.step_up_completed
            }),
            Rule::when("LOW_RISK_ALLOW", Verdict::Allow, |ctx| {
                ctx.risk_level == RiskLevel::Low
            }),
        ])
    }

    pub fn push(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    pub fn with(mut self, rule: Rule) -> Self {
        self.push(rule);
        self
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Evaluate every rule against the context
    pub fn evaluate(&self, ctx: &Context) -> RuleEvaluation {
        let mut evaluation = RuleEvaluation::default();

        for rule in &self.rules {
            match rule.matches(ctx) {
                Ok(true) => evaluation.matched.push(RuleMatch {
                    id: rule.id.clone(),
                    effect: rule.effect,
                }),
                Ok(false) => {}
                Err(e) => {
                    warn!(rule = %rule.id, error = %e, "rule evaluation failed, skipping");
                    evaluation.failed.push((rule.id.clone(), e.to_string()));
                }
            }
        }

        debug!(
            matched = ?evaluation.matched_ids(),
            failed = evaluation.failed.len(),
            "rules evaluated"
        );
        evaluation
    }
}
