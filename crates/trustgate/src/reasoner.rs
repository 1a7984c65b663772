//! Policy Reasoner - from context to verdict
//!
//! Stages, always in this order:
//! 1. Context build (done by the caller through `Context::builder`)
//! 2. Rule evaluation: every rule, broken ones skipped
//! 3. Derivation: DENY > STEP_UP > ALLOW, nothing matched is DENY
//! 4. Policy lookup: identity row, then `ALL` row, else a default heuristic
//! 5. Hard cap: the identity's access ceiling, which nothing overrides
//!
//! The cheap fail-fast checks in `short_circuit` run before any of this.

use crate::config::EngineConfig;
use crate::context::Context;
use crate::level::{AccessLevel, RiskLevel, Verdict};
use crate::pattern::Pattern;
use crate::policy::{self, Policy, PolicyStore};
use crate::rules::RuleSet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Machine-readable explanation attached to every decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    /// Derived from matched rules
    RuleMatch,
    /// No rule matched and no policy applied
    NoRuleMatched,
    /// A policy row decided
    PolicyMatch,
    MinTrustNotMet,
    MaxRiskExceeded,
    MaxAmountExceeded,
    MfaRequired,
    /// Default heuristic: sensitive pattern
    HighRiskPattern,
    /// Default heuristic: trust below the low-trust threshold
    LowTrust,
    TrustTooLow,
    DestructiveAction,
    AutoDenyHighRisk,
    IdentityInactive,
    SessionInvalid,
    SessionRevoked,
    MaxAccessCap,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::RuleMatch => "rule_match",
            Reason::NoRuleMatched => "no_rule_matched",
            Reason::PolicyMatch => "policy_match",
            Reason::MinTrustNotMet => "min_trust_not_met",
            Reason::MaxRiskExceeded => "max_risk_exceeded",
            Reason::MaxAmountExceeded => "max_amount_exceeded",
            Reason::MfaRequired => "mfa_required",
            Reason::HighRiskPattern => "high_risk_pattern",
            Reason::LowTrust => "low_trust",
            Reason::TrustTooLow => "trust_too_low",
            Reason::DestructiveAction => "destructive_action",
            Reason::AutoDenyHighRisk => "auto_deny_high_risk",
            Reason::IdentityInactive => "identity_inactive",
            Reason::SessionInvalid => "session_invalid",
            Reason::SessionRevoked => "session_revoked",
            Reason::MaxAccessCap => "max_access_cap",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Result of reasoning about one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub decision: Verdict,
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub pattern: Pattern,
    pub reason: Reason,
    #[serde(default)]
    pub matched_rule_ids: Vec<String>,
    /// ID of the policy row that decided, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
}

impl Decision {
    /// A decision that skipped the pipeline
    pub fn short_circuit(ctx: &Context, decision: Verdict, reason: Reason) -> Self {
        Self {
            decision,
            risk_score: ctx.risk_score,
            risk_level: ctx.risk_level,
            pattern: ctx.pattern,
            reason,
            matched_rule_ids: Vec::new(),
            policy_id: None,
        }
    }
}

/// Thresholds the reasoner and its pre-checks consult
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReasonerLimits {
    pub min_trust_hard_block: f64,
    pub low_trust_threshold: f64,
    pub auto_deny_risk: f64,
}

impl From<&EngineConfig> for ReasonerLimits {
    fn from(config: &EngineConfig) -> Self {
        Self {
            min_trust_hard_block: config.min_trust_hard_block,
            low_trust_threshold: config.low_trust_threshold,
            auto_deny_risk: config.auto_deny_risk,
        }
    }
}

/// Fail-fast block check, run before the pipeline
pub fn short_circuit(
    trust: f64,
    pattern: Pattern,
    risk_level: RiskLevel,
    limits: &ReasonerLimits,
) -> Option<Reason> {
    if trust < limits.min_trust_hard_block {
        return Some(Reason::TrustTooLow);
    }
    if pattern == Pattern::DestructiveAction && risk_level >= RiskLevel::Medium {
        return Some(Reason::DestructiveAction);
    }
    None
}

/// Force DENY when the action needs more than the identity's ceiling
pub fn apply_hard_cap(mut decision: Decision, max_access: AccessLevel, action: &str) -> Decision {
    let required = AccessLevel::required_for(action);
    if !max_access.can_do(required) {
        debug!(%max_access, %required, "access ceiling exceeded");
        decision.decision = Verdict::Deny;
        decision.reason = Reason::MaxAccessCap;
    }
    decision
}

pub struct PolicyReasoner {
    rules: RuleSet,
    policies: Arc<dyn PolicyStore>,
    limits: ReasonerLimits,
}

impl PolicyReasoner {
    pub fn new(rules: RuleSet, policies: Arc<dyn PolicyStore>, limits: ReasonerLimits) -> Self {
        Self {
            rules,
            policies,
            limits,
        }
    }

    pub fn limits(&self) -> &ReasonerLimits {
        &self.limits
    }

    /// Stages 2 to 5 over a built context
    pub async fn evaluate(&self, ctx: &Context) -> Decision {
        let evaluation = self.rules.evaluate(ctx);
        let derived = evaluation.derive();
        let derived_reason = if evaluation.matched.is_empty() {
            Reason::NoRuleMatched
        } else {
            Reason::RuleMatch
        };
        debug!(decision = %derived, "rules derived");

        let mut decision = Decision {
            decision: derived,
            risk_score: ctx.risk_score,
            risk_level: ctx.risk_level,
            pattern: ctx.pattern,
            reason: derived_reason,
            matched_rule_ids: evaluation.matched_ids(),
            policy_id: None,
        };

        let found = policy::lookup(
            self.policies.as_ref(),
            &ctx.subject.identity_id,
            &ctx.resource.name,
            &ctx.action,
        )
        .await;

        match found {
            Ok(Some(policy)) => {
                let (verdict, reason) = self.apply_policy(&policy, ctx);
                debug!(
                    policy = %policy.id,
                    scope = %policy.scope,
                    decision = %verdict,
                    %reason,
                    "policy applied"
                );
                decision.decision = verdict;
                decision.reason = reason;
                decision.policy_id = Some(policy.id);
            }
            Ok(None) => self.refine(&mut decision, ctx),
            Err(e) => {
                warn!(error = %e, "policy lookup failed, using default heuristic");
                self.refine(&mut decision, ctx);
            }
        }

        apply_hard_cap(decision, ctx.subject.max_access_level, &ctx.action)
    }

    fn apply_policy(&self, policy: &Policy, ctx: &Context) -> (Verdict, Reason) {
        if ctx.trust() < policy.min_trust {
            return (Verdict::Deny, Reason::MinTrustNotMet);
        }
        if ctx.risk_level > policy.max_risk {
            return (Verdict::Deny, Reason::MaxRiskExceeded);
        }
        if let (Some(limit), Some(amount)) = (policy.max_amount, ctx.amount) {
            if amount > limit {
                return (Verdict::Deny, Reason::MaxAmountExceeded);
            }
        }
        if policy.effect == Verdict::Allow && policy.require_mfa && !ctx.session.step_up_completed {
            return (Verdict::StepUp, Reason::MfaRequired);
        }
        (policy.effect, Reason::PolicyMatch)
    }

    /// No policy row: tighten the rule result with the default heuristic
    fn refine(&self, decision: &mut Decision, ctx: &Context) {
        let (heuristic, reason) = if ctx.pattern.is_sensitive() {
            (Verdict::StepUp, Reason::HighRiskPattern)
        } else if ctx.trust() < self.limits.low_trust_threshold {
            (Verdict::Deny, Reason::LowTrust)
        } else {
            (Verdict::Allow, decision.reason)
        };

        let stricter = decision.decision.stricter(heuristic);
        if stricter != decision.decision {
            decision.decision = stricter;
            decision.reason = reason;
        }
    }
}
