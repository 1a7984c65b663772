//! Decision engine - the request pipeline end to end
//!
//! decide():
//!   identity → session → pattern → risk → overrides → fail-fast checks
//!   → rules → policy → hard cap → enforcement
//!
//! Everything before enforcement only reads state. Enforcement runs on its
//! own task: dropping a `decide` future before that point leaves no trace,
//! and once enforcement starts it completes even if the caller goes away.

use crate::audit::{HistoryRecord, HistorySink, InMemoryHistory};
use crate::config::EngineConfig;
use crate::context::{Context, SessionAttrs};
use crate::dispatcher::{AppliedAction, EnforcementDispatcher};
use crate::error::{ConfigError, EngineError};
use crate::history::RiskHistory;
use crate::level::{RiskLevel, Verdict};
use crate::observer::{DecisionObserver, FeedEvent, ObserverRegistry, SubscriptionId};
use crate::pattern::{self, Pattern, RequestOverrides};
use crate::policy::{InMemoryPolicyStore, PolicyStore};
use crate::reasoner::{self, Decision, PolicyReasoner, Reason, ReasonerLimits};
use crate::risk::{RiskEngine, Signals};
use crate::rules::RuleSet;
use crate::session::decayed_trust;
use crate::trust_store::{DeviceCheck, Identity, TrustEvent, TrustReason, TrustStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Caller-supplied facts about a request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestMetadata {
    #[serde(default)]
    pub session_id: Option<String>,
    /// Transfer amount, if any
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub device_fingerprint: Option<String>,
    /// Behavioural signals; values are coerced to numbers
    #[serde(default)]
    pub signals: BTreeMap<String, Value>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub device_trust: Option<String>,
    #[serde(default)]
    pub sensitivity: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessRequest {
    pub identity_id: String,
    pub resource: String,
    pub action: String,
    #[serde(default)]
    pub metadata: RequestMetadata,
}

impl AccessRequest {
    pub fn new(identity_id: &str, resource: &str, action: &str) -> Self {
        Self {
            identity_id: identity_id.to_string(),
            resource: resource.to_string(),
            action: action.to_string(),
            metadata: RequestMetadata::default(),
        }
    }

    pub fn session(mut self, session_id: &str) -> Self {
        self.metadata.session_id = Some(session_id.to_string());
        self
    }

    pub fn amount(mut self, amount: f64) -> Self {
        self.metadata.amount = Some(amount);
        self
    }

    pub fn device(mut self, fingerprint: &str) -> Self {
        self.metadata.device_fingerprint = Some(fingerprint.to_string());
        self
    }

    pub fn signal(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.metadata.signals.insert(name.to_string(), value.into());
        self
    }
}

/// What `decide` hands back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionOutcome {
    pub decision: Verdict,
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub pattern: Pattern,
    pub reason: Reason,
    /// Base trust after this decision's delta
    pub trust: f64,
    pub matched_rule_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
    pub actions: Vec<AppliedAction>,
}

/// Authentication-adjacent events that move trust outside any decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthEvent {
    LoginFailure,
    OtpSuccess,
    /// An additional factor was verified for this session
    StepUpVerified { session_id: String },
    PolicyViolation,
}

pub struct EngineBuilder {
    config: EngineConfig,
    trust: Option<Arc<TrustStore>>,
    policies: Option<Arc<dyn PolicyStore>>,
    sink: Option<Arc<dyn HistorySink>>,
    rules: Option<RuleSet>,
    observers: Option<Arc<ObserverRegistry>>,
}

impl EngineBuilder {
    pub fn trust_store(mut self, trust: Arc<TrustStore>) -> Self {
        self.trust = Some(trust);
        self
    }

    pub fn policy_store(mut self, policies: Arc<dyn PolicyStore>) -> Self {
        self.policies = Some(policies);
        self
    }

    pub fn history_sink(mut self, sink: Arc<dyn HistorySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn rules(mut self, rules: RuleSet) -> Self {
        self.rules = Some(rules);
        self
    }

    pub fn observers(mut self, observers: Arc<ObserverRegistry>) -> Self {
        self.observers = Some(observers);
        self
    }

    pub fn build(self) -> Result<DecisionEngine, ConfigError> {
        let config = self.config;
        config.validate()?;

        let trust = self.trust.unwrap_or_else(|| {
            Arc::new(TrustStore::new(
                config.decay_rate,
                config.trust_collapse_threshold,
            ))
        });
        let policies: Arc<dyn PolicyStore> = match self.policies {
            Some(policies) => policies,
            None => Arc::new(InMemoryPolicyStore::new()),
        };
        let sink: Arc<dyn HistorySink> = match self.sink {
            Some(sink) => sink,
            None => Arc::new(InMemoryHistory::new()),
        };
        let rules = self.rules.unwrap_or_else(|| RuleSet::standard(&config));
        let observers = self
            .observers
            .unwrap_or_else(|| Arc::new(ObserverRegistry::new(config.observer_buffer)));
        let history = Arc::new(RiskHistory::new(config.high_risk_history_window));

        let dispatcher = Arc::new(EnforcementDispatcher::new(
            Arc::clone(&trust),
            Arc::clone(&history),
            Arc::clone(&sink),
            Arc::clone(&observers),
            config.trust_deltas.clone(),
        ));

        Ok(DecisionEngine {
            risk: RiskEngine::from_config(&config),
            reasoner: PolicyReasoner::new(rules, policies, ReasonerLimits::from(&config)),
            config,
            trust,
            history,
            sink,
            observers,
            dispatcher,
        })
    }
}

/// Session facts resolved for one request
struct SessionState {
    attrs: SessionAttrs,
    trust: f64,
    gate: Option<Reason>,
}

pub struct DecisionEngine {
    config: EngineConfig,
    trust: Arc<TrustStore>,
    risk: RiskEngine,
    reasoner: PolicyReasoner,
    history: Arc<RiskHistory>,
    sink: Arc<dyn HistorySink>,
    observers: Arc<ObserverRegistry>,
    dispatcher: Arc<EnforcementDispatcher>,
}

impl DecisionEngine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            trust: None,
            policies: None,
            sink: None,
            rules: None,
            observers: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn trust_store(&self) -> &Arc<TrustStore> {
        &self.trust
    }

    pub fn risk_history(&self) -> &Arc<RiskHistory> {
        &self.history
    }

    pub fn observers(&self) -> &Arc<ObserverRegistry> {
        &self.observers
    }

    pub fn subscribe(&self, observer: Arc<dyn DecisionObserver>) -> SubscriptionId {
        self.observers.subscribe(observer)
    }

    /// Decide one access request
    pub async fn decide(&self, request: AccessRequest) -> Result<DecisionOutcome, EngineError> {
        let AccessRequest {
            identity_id,
            resource,
            action,
            metadata,
        } = request;

        let identity = self
            .trust
            .identity(&identity_id)
            .ok_or_else(|| EngineError::IdentityNotFound(identity_id.clone()))?;
        let now = Utc::now();

        let session = self.resolve_session(&identity, &metadata, now);
        let trust = session.trust;

        let device_mismatch = match metadata.device_fingerprint.as_deref() {
            Some(fingerprint) => {
                self.trust.check_device(&identity.id, fingerprint)? == DeviceCheck::Mismatch
            }
            None => false,
        };

        let base_pattern =
            pattern::detect_with(&resource, &action, trust, self.config.low_trust_threshold);

        let signals = Signals::from_raw(&metadata.signals);
        let base_risk = if signals.is_empty() {
            self.risk.from_trust(trust)
        } else {
            self.risk.score(&signals, &self.history.recent(&identity.id))
        };

        let overrides = RequestOverrides {
            device_mismatch,
            amount: metadata.amount,
        };
        let outcome =
            pattern::apply_overrides(base_pattern, &resource, &action, overrides, &self.config);
        let risk = self.risk.bump(base_risk, outcome.risk_bump);
        debug!(
            identity = %identity.id,
            trust,
            pattern = %outcome.pattern,
            risk = risk.score,
            level = %risk.level,
            "request classified"
        );

        let gate = if !identity.active {
            Some(Reason::IdentityInactive)
        } else if session.gate.is_some() {
            session.gate
        } else if risk.score > self.config.auto_deny_risk {
            Some(Reason::AutoDenyHighRisk)
        } else {
            reasoner::short_circuit(trust, outcome.pattern, risk.level, self.reasoner.limits())
        };

        let context = Context::builder(&identity, &resource, &action)
            .trust(trust)
            .role(metadata.role)
            .sensitivity(metadata.sensitivity)
            .risk(risk)
            .pattern(outcome.pattern)
            .signals(signals)
            .session(session.attrs)
            .amount(metadata.amount)
            .at(now)
            .build();

        let decision = match gate {
            Some(reason) => {
                debug!(identity = %identity.id, %reason, "short-circuit deny");
                Decision::short_circuit(&context, Verdict::Deny, reason)
            }
            None => self.reasoner.evaluate(&context).await,
        };
        let decision = reasoner::apply_hard_cap(decision, identity.max_access_level, &action);

        let dispatcher = Arc::clone(&self.dispatcher);
        let enforced = decision.clone();
        let enforcement = tokio::spawn(async move {
            dispatcher
                .enforce(&enforced, &identity.id, &context)
                .await
        });
        let result = enforcement
            .await
            .map_err(|e| EngineError::Enforcement(e.to_string()))??;

        Ok(DecisionOutcome {
            decision: decision.decision,
            risk_score: decision.risk_score,
            risk_level: decision.risk_level,
            pattern: decision.pattern,
            reason: decision.reason,
            trust: result.trust,
            matched_rule_ids: decision.matched_rule_ids,
            policy_id: decision.policy_id,
            actions: result.actions,
        })
    }

    /// Apply an authentication-adjacent trust event.
    ///
    /// These bypass the dispatcher: they write the trust store directly, then
    /// record and broadcast the resulting trust event.
    pub async fn record_auth_event(
        &self,
        identity_id: &str,
        event: AuthEvent,
    ) -> Result<TrustEvent, EngineError> {
        if self.trust.identity(identity_id).is_none() {
            return Err(EngineError::IdentityNotFound(identity_id.to_string()));
        }

        let deltas = &self.config.trust_deltas;
        let (delta, reason) = match &event {
            AuthEvent::LoginFailure => (deltas.login_failure, TrustReason::LoginFailure),
            AuthEvent::OtpSuccess => (deltas.otp_success, TrustReason::OtpSuccess),
            AuthEvent::StepUpVerified { session_id } => {
                let session = self
                    .trust
                    .session(session_id)
                    .ok_or_else(|| EngineError::SessionNotFound(session_id.clone()))?;
                if session.identity_id != identity_id {
                    return Err(EngineError::SessionMismatch {
                        session_id: session_id.clone(),
                        identity_id: identity_id.to_string(),
                    });
                }
                if !self.trust.mark_step_up(session_id) {
                    warn!(session = %session_id, "step-up verified on a revoked session");
                }
                (deltas.step_up_verified, TrustReason::StepUpVerified)
            }
            AuthEvent::PolicyViolation => (deltas.policy_violation, TrustReason::PolicyViolation),
        };

        self.commit_trust_event(identity_id, delta, reason).await
    }

    /// Operator adjustment of base trust
    pub async fn adjust_trust(
        &self,
        identity_id: &str,
        delta: f64,
    ) -> Result<TrustEvent, EngineError> {
        self.commit_trust_event(identity_id, delta, TrustReason::Manual)
            .await
    }

    async fn commit_trust_event(
        &self,
        identity_id: &str,
        delta: f64,
        reason: TrustReason,
    ) -> Result<TrustEvent, EngineError> {
        let event = self.trust.apply_event(identity_id, delta, reason)?;

        if let Err(e) = self.sink.record(HistoryRecord::Trust(event.clone())).await {
            warn!(identity = identity_id, error = %e, "failed to record trust event");
        }
        self.observers.notify(&FeedEvent::TrustUpdate {
            identity_id: identity_id.to_string(),
            trust: event.resulting_score,
            delta: event.delta,
            reason,
            timestamp: event.timestamp,
        });

        info!(
            identity = identity_id,
            %reason,
            trust = event.resulting_score,
            "trust event recorded"
        );
        Ok(event)
    }

    fn resolve_session(
        &self,
        identity: &Identity,
        metadata: &RequestMetadata,
        now: DateTime<Utc>,
    ) -> SessionState {
        let base = SessionAttrs {
            session_id: None,
            idle_minutes: 0.0,
            location: metadata.location.clone(),
            device_trust: metadata.device_trust.clone(),
            device_fingerprint: metadata.device_fingerprint.clone(),
            step_up_completed: false,
        };

        let Some(session_id) = metadata.session_id.as_deref() else {
            return SessionState {
                attrs: base,
                trust: identity.trust_score,
                gate: None,
            };
        };

        let gated = |reason| SessionState {
            attrs: base.clone(),
            trust: identity.trust_score,
            gate: Some(reason),
        };

        let session = match self.trust.session(session_id) {
            Some(session) if session.identity_id == identity.id => session,
            _ => return gated(Reason::SessionInvalid),
        };
        if !session.is_live() {
            return gated(Reason::SessionRevoked);
        }

        let idle_minutes = session.idle_minutes(now);
        SessionState {
            trust: decayed_trust(identity.trust_score, idle_minutes, self.trust.decay_rate()),
            attrs: SessionAttrs {
                session_id: Some(session.session_id),
                idle_minutes,
                step_up_completed: session.step_up_completed,
                ..base
            },
            gate: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::RecordKind;
    use crate::error::{ObserverError, SinkError};
    use crate::level::AccessLevel;
    use crate::policy::{Policy, PolicyScope};
    use crate::rules::Rule;
    use crate::session::SessionHandle;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;

    /// Holds every write until released
    struct HeldSink {
        inner: InMemoryHistory,
        open: AtomicBool,
        release: Notify,
    }

    impl HeldSink {
        fn new() -> Self {
            Self {
                inner: InMemoryHistory::new(),
                open: AtomicBool::new(false),
                release: Notify::new(),
            }
        }

        fn release(&self) {
            self.open.store(true, Ordering::SeqCst);
            self.release.notify_waiters();
        }
    }

    #[async_trait]
    impl HistorySink for HeldSink {
        async fn record(&self, record: HistoryRecord) -> Result<(), SinkError> {
            let released = self.release.notified();
            if !self.open.load(Ordering::SeqCst) {
                released.await;
            }
            self.inner.record(record).await
        }
    }

    struct Harness {
        engine: DecisionEngine,
        history: Arc<InMemoryHistory>,
    }

    fn harness(identities: Vec<Identity>, policies: Vec<Policy>) -> Harness {
        let history = Arc::new(InMemoryHistory::new());
        let engine = DecisionEngine::builder(EngineConfig::default())
            .policy_store(Arc::new(InMemoryPolicyStore::with_policies(policies)))
            .history_sink(history.clone())
            .build()
            .unwrap();
        for identity in identities {
            engine.trust_store().provision(identity);
        }
        Harness { engine, history }
    }

    fn trust_of(engine: &DecisionEngine, id: &str) -> f64 {
        engine.trust_store().identity(id).unwrap().trust_score
    }

    #[tokio::test]
    async fn test_trusted_read_is_allowed() {
        let h = harness(vec![Identity::new("alice", 0.9, AccessLevel::Write)], vec![]);
        let outcome = h
            .engine
            .decide(AccessRequest::new("alice", "files", "read"))
            .await
            .unwrap();

        assert_eq!(outcome.decision, Verdict::Allow);
        assert_eq!(outcome.pattern, Pattern::Normal);
        assert_eq!(outcome.risk_level, RiskLevel::Low);
        assert!((outcome.trust - 0.92).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_low_trust_transfer_steps_up() {
        let h = harness(vec![Identity::new("bob", 0.5, AccessLevel::Transfer)], vec![]);
        let outcome = h
            .engine
            .decide(AccessRequest::new("bob", "transactions", "transfer"))
            .await
            .unwrap();

        assert!(outcome.matched_rule_ids.contains(&"LOW_TRUST_TRANSFER".to_string()));
        assert_eq!(outcome.decision, Verdict::StepUp);
        assert_eq!(outcome.pattern, Pattern::TransferAttempt);
        assert!((outcome.trust - 0.45).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_read_only_identity_cannot_write() {
        let h = harness(
            vec![Identity::new("reader", 1.0, AccessLevel::Read)],
            vec![Policy::new(PolicyScope::identity("reader"), "files", "write", Verdict::Allow)],
        );
        for action in ["write", "transfer"] {
            let outcome = h
                .engine
                .decide(AccessRequest::new("reader", "files", action))
                .await
                .unwrap();
            assert_eq!(outcome.decision, Verdict::Deny, "action {}", action);
            assert_eq!(outcome.reason, Reason::MaxAccessCap);
        }

        let read = h
            .engine
            .decide(AccessRequest::new("reader", "files", "read"))
            .await
            .unwrap();
        assert_eq!(read.decision, Verdict::Allow);
    }

    #[tokio::test]
    async fn test_cap_applies_even_at_zero_risk() {
        let h = harness(vec![Identity::new("reader", 1.0, AccessLevel::Read)], vec![]);
        let outcome = h
            .engine
            .decide(AccessRequest::new("reader", "files", "write"))
            .await
            .unwrap();
        assert_eq!(outcome.risk_score, 0.0);
        assert_eq!(outcome.decision, Verdict::Deny);
        assert_eq!(outcome.reason, Reason::MaxAccessCap);
    }

    #[tokio::test]
    async fn test_high_amount_transfer() {
        let h = harness(
            vec![
                Identity::new("carol", 0.9, AccessLevel::Transfer),
                Identity::new("dave", 0.4, AccessLevel::Transfer),
            ],
            vec![],
        );

        let bumped = h
            .engine
            .decide(AccessRequest::new("carol", "transactions", "transfer").amount(15_000.0))
            .await
            .unwrap();
        assert_eq!(bumped.pattern, Pattern::HighAmountTransfer);
        // 1 - 0.9 baseline plus 0.30
        assert_eq!(bumped.risk_score, 0.4);
        assert_ne!(bumped.reason, Reason::AutoDenyHighRisk);

        let denied = h
            .engine
            .decide(AccessRequest::new("dave", "transactions", "transfer").amount(15_000.0))
            .await
            .unwrap();
        assert_eq!(denied.pattern, Pattern::HighAmountTransfer);
        assert_eq!(denied.risk_score, 0.9);
        assert_eq!(denied.decision, Verdict::Deny);
        assert_eq!(denied.reason, Reason::AutoDenyHighRisk);
    }

    #[tokio::test]
    async fn test_idle_session_decays_trust() {
        let h = harness(vec![Identity::new("erin", 0.8, AccessLevel::Write)], vec![]);
        let session = SessionHandle::started_at("erin", Utc::now() - Duration::minutes(60));
        h.engine.trust_store().insert_session(session.clone()).unwrap();

        let effective = h.engine.trust_store().effective_trust(&session.session_id).unwrap();
        assert!((effective - 0.325).abs() < 0.01, "got {}", effective);

        let outcome = h
            .engine
            .decide(AccessRequest::new("erin", "files", "read").session(&session.session_id))
            .await
            .unwrap();
        assert_eq!(outcome.pattern, Pattern::LowTrust);
        assert_eq!(outcome.decision, Verdict::Deny);
        assert_eq!(outcome.reason, Reason::LowTrust);

        // The decision reset the decay clock.
        let refreshed = h.engine.trust_store().effective_trust(&session.session_id).unwrap();
        assert!(refreshed > 0.65, "got {}", refreshed);
    }

    #[tokio::test]
    async fn test_unknown_identity_is_an_error() {
        let h = harness(vec![], vec![]);
        let err = h
            .engine
            .decide(AccessRequest::new("ghost", "files", "read"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::IdentityNotFound(id) if id == "ghost"));
        assert!(h.history.records().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_pair_fails_closed() {
        let history = Arc::new(InMemoryHistory::new());
        let engine = DecisionEngine::builder(EngineConfig::default())
            .rules(RuleSet::default())
            .history_sink(history)
            .build()
            .unwrap();
        engine
            .trust_store()
            .provision(Identity::new("alice", 0.9, AccessLevel::Transfer));

        let outcome = engine
            .decide(AccessRequest::new("alice", "reactor", "vent"))
            .await
            .unwrap();
        assert_eq!(outcome.decision, Verdict::Deny);
        assert_eq!(outcome.reason, Reason::NoRuleMatched);
    }

    #[tokio::test]
    async fn test_short_circuits() {
        let h = harness(
            vec![
                Identity::new("weak", 0.18, AccessLevel::Transfer),
                Identity::new("weaker", 0.1, AccessLevel::Transfer),
                Identity::new("wiper", 0.5, AccessLevel::Write),
            ],
            vec![],
        );

        // Below the hard block but not risky enough to auto-deny
        let weak = h
            .engine
            .decide(AccessRequest::new("weak", "files", "read"))
            .await
            .unwrap();
        assert_eq!(weak.risk_score, 0.82);
        assert_eq!(weak.decision, Verdict::Deny);
        assert_eq!(weak.reason, Reason::TrustTooLow);
        assert!(weak.matched_rule_ids.is_empty());

        // Auto-deny is checked first
        let weaker = h
            .engine
            .decide(AccessRequest::new("weaker", "files", "read"))
            .await
            .unwrap();
        assert_eq!(weaker.risk_score, 0.9);
        assert_eq!(weaker.decision, Verdict::Deny);
        assert_eq!(weaker.reason, Reason::AutoDenyHighRisk);
        assert!(weaker.matched_rule_ids.is_empty());

        let wiper = h
            .engine
            .decide(AccessRequest::new("wiper", "files", "delete"))
            .await
            .unwrap();
        assert_eq!(wiper.decision, Verdict::Deny);
        assert_eq!(wiper.reason, Reason::DestructiveAction);
    }

    #[tokio::test]
    async fn test_inactive_identity() {
        let mut identity = Identity::new("gone", 0.9, AccessLevel::Write);
        identity.active = false;
        let h = harness(vec![identity], vec![]);
        let outcome = h
            .engine
            .decide(AccessRequest::new("gone", "files", "read"))
            .await
            .unwrap();
        assert_eq!(outcome.decision, Verdict::Deny);
        assert_eq!(outcome.reason, Reason::IdentityInactive);
    }

    #[tokio::test]
    async fn test_session_checks() {
        let h = harness(
            vec![
                Identity::new("alice", 0.9, AccessLevel::Write),
                Identity::new("mallory", 0.9, AccessLevel::Write),
            ],
            vec![],
        );
        let store = h.engine.trust_store();

        let unknown = h
            .engine
            .decide(AccessRequest::new("alice", "files", "read").session("ses_nope"))
            .await
            .unwrap();
        assert_eq!(unknown.reason, Reason::SessionInvalid);

        let theirs = store.open_session("mallory").unwrap();
        let stolen = h
            .engine
            .decide(AccessRequest::new("alice", "files", "read").session(&theirs.session_id))
            .await
            .unwrap();
        assert_eq!(stolen.reason, Reason::SessionInvalid);

        let mine = store.open_session("alice").unwrap();
        store.revoke_session(&mine.session_id);
        let revoked = h
            .engine
            .decide(AccessRequest::new("alice", "files", "read").session(&mine.session_id))
            .await
            .unwrap();
        assert_eq!(revoked.decision, Verdict::Deny);
        assert_eq!(revoked.reason, Reason::SessionRevoked);
    }

    #[tokio::test]
    async fn test_device_mismatch_then_step_up() {
        let h = harness(
            vec![Identity::new("alice", 0.9, AccessLevel::Write).with_device("laptop")],
            vec![],
        );
        let session = h.engine.trust_store().open_session("alice").unwrap();

        let challenged = h
            .engine
            .decide(
                AccessRequest::new("alice", "files", "read")
                    .session(&session.session_id)
                    .device("phone"),
            )
            .await
            .unwrap();
        assert_eq!(challenged.pattern, Pattern::DeviceFingerprintMismatch);
        assert_eq!(challenged.decision, Verdict::StepUp);
        assert!(challenged
            .matched_rule_ids
            .contains(&"DEVICE_MISMATCH_STEP_UP".to_string()));

        let event = h
            .engine
            .record_auth_event(
                "alice",
                AuthEvent::StepUpVerified {
                    session_id: session.session_id.clone(),
                },
            )
            .await
            .unwrap();
        assert_eq!(event.reason, TrustReason::StepUpVerified);
        assert_eq!(event.resulting_score, 1.0);

        let cleared = h
            .engine
            .decide(
                AccessRequest::new("alice", "files", "read")
                    .session(&session.session_id)
                    .device("phone"),
            )
            .await
            .unwrap();
        assert_eq!(cleared.decision, Verdict::Allow);
    }

    #[tokio::test]
    async fn test_first_device_is_bound() {
        let h = harness(vec![Identity::new("alice", 0.9, AccessLevel::Write)], vec![]);
        h.engine
            .decide(AccessRequest::new("alice", "files", "read").device("laptop"))
            .await
            .unwrap();
        let identity = h.engine.trust_store().identity("alice").unwrap();
        assert_eq!(identity.device_fingerprint.as_deref(), Some("laptop"));
    }

    #[tokio::test]
    async fn test_denied_request_does_not_bind_device() {
        let mut dormant = Identity::new("dormant", 0.9, AccessLevel::Write);
        dormant.active = false;
        let h = harness(
            vec![Identity::new("alice", 0.9, AccessLevel::Write), dormant],
            vec![],
        );

        let rejected = h
            .engine
            .decide(
                AccessRequest::new("alice", "files", "read")
                    .session("ses_bogus")
                    .device("attacker"),
            )
            .await
            .unwrap();
        assert_eq!(rejected.decision, Verdict::Deny);
        assert_eq!(rejected.reason, Reason::SessionInvalid);
        assert_eq!(h.engine.trust_store().identity("alice").unwrap().device_fingerprint, None);

        let inactive = h
            .engine
            .decide(AccessRequest::new("dormant", "files", "read").device("attacker"))
            .await
            .unwrap();
        assert_eq!(inactive.reason, Reason::IdentityInactive);
        assert_eq!(
            h.engine.trust_store().identity("dormant").unwrap().device_fingerprint,
            None
        );

        let legit = h
            .engine
            .decide(AccessRequest::new("alice", "files", "read").device("laptop"))
            .await
            .unwrap();
        assert_eq!(legit.pattern, Pattern::Normal);
        assert_eq!(legit.decision, Verdict::Allow);
        assert!(legit.actions.contains(&AppliedAction::DeviceBound));
        assert_eq!(
            h.engine.trust_store().identity("alice").unwrap().device_fingerprint.as_deref(),
            Some("laptop")
        );
    }

    #[tokio::test]
    async fn test_mfa_policy_needs_step_up() {
        let h = harness(
            vec![Identity::new("alice", 0.9, AccessLevel::Write)],
            vec![Policy::new(PolicyScope::All, "files", "write", Verdict::Allow).require_mfa()],
        );
        let session = h.engine.trust_store().open_session("alice").unwrap();
        let request = AccessRequest::new("alice", "files", "write").session(&session.session_id);

        let first = h.engine.decide(request.clone()).await.unwrap();
        assert_eq!(first.decision, Verdict::StepUp);
        assert_eq!(first.reason, Reason::MfaRequired);

        h.engine
            .record_auth_event(
                "alice",
                AuthEvent::StepUpVerified {
                    session_id: session.session_id.clone(),
                },
            )
            .await
            .unwrap();

        let second = h.engine.decide(request).await.unwrap();
        assert_eq!(second.decision, Verdict::Allow);
        assert_eq!(second.reason, Reason::PolicyMatch);
    }

    #[tokio::test]
    async fn test_auth_events() {
        let h = harness(
            vec![
                Identity::new("alice", 0.5, AccessLevel::Write),
                Identity::new("bob", 0.5, AccessLevel::Write),
            ],
            vec![],
        );

        let failed = h
            .engine
            .record_auth_event("alice", AuthEvent::LoginFailure)
            .await
            .unwrap();
        assert_eq!(failed.resulting_score, 0.45);

        let otp = h
            .engine
            .record_auth_event("alice", AuthEvent::OtpSuccess)
            .await
            .unwrap();
        assert_eq!(otp.resulting_score, 0.47);

        let violation = h
            .engine
            .record_auth_event("alice", AuthEvent::PolicyViolation)
            .await
            .unwrap();
        assert_eq!(violation.resulting_score, 0.4);

        let bobs = h.engine.trust_store().open_session("bob").unwrap();
        let err = h
            .engine
            .record_auth_event(
                "alice",
                AuthEvent::StepUpVerified {
                    session_id: bobs.session_id,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SessionMismatch { .. }));

        let trust_records = h
            .history
            .query(&crate::audit::HistoryQuery::default().kind(RecordKind::Trust))
            .await;
        assert_eq!(trust_records.len(), 3);
    }

    #[tokio::test]
    async fn test_adaptive_weighting_after_high_risk_run() {
        let h = harness(vec![Identity::new("alice", 0.9, AccessLevel::Write)], vec![]);
        let sample = || {
            AccessRequest::new("alice", "files", "read")
                .signal("anomaly", 2.0)
                .signal("session_abuse", 1.0)
        };

        let before = h.engine.decide(sample()).await.unwrap();
        assert_eq!(before.risk_score, 0.6);

        for _ in 0..3 {
            let hot = h
                .engine
                .decide(
                    AccessRequest::new("alice", "files", "read")
                        .signal("auth_fail", 1.0)
                        .signal("deny", 1.0)
                        .signal("anomaly", 1.0),
                )
                .await
                .unwrap();
            assert_eq!(hot.risk_level, RiskLevel::High);
        }
        assert_eq!(h.engine.risk_history().high_risk_count("alice"), 3);

        let after = h.engine.decide(sample()).await.unwrap();
        assert_eq!(after.risk_score, 0.77);
        assert_eq!(after.risk_level, RiskLevel::High);
    }

    #[tokio::test]
    async fn test_malformed_signal_does_not_fail_request() {
        let h = harness(vec![Identity::new("alice", 0.9, AccessLevel::Write)], vec![]);
        let outcome = h
            .engine
            .decide(AccessRequest::new("alice", "files", "read").signal("anomaly", "very"))
            .await
            .unwrap();
        assert_eq!(outcome.risk_score, 0.0);
        assert_eq!(outcome.decision, Verdict::Allow);
    }

    #[tokio::test]
    async fn test_broken_rule_does_not_abort() {
        let config = EngineConfig::default();
        let rules = RuleSet::standard(&config).with(Rule::new("BROKEN", Verdict::Deny, |_| {
            Err(crate::error::RuleError::Predicate("boom".to_string()))
        }));
        let engine = DecisionEngine::builder(config).rules(rules).build().unwrap();
        engine
            .trust_store()
            .provision(Identity::new("alice", 0.9, AccessLevel::Write));

        let outcome = engine
            .decide(AccessRequest::new("alice", "files", "read"))
            .await
            .unwrap();
        assert_eq!(outcome.decision, Verdict::Allow);
        assert!(!outcome.matched_rule_ids.contains(&"BROKEN".to_string()));
    }

    #[tokio::test]
    async fn test_dead_observer_does_not_fail_request() {
        let h = harness(vec![Identity::new("alice", 0.9, AccessLevel::Write)], vec![]);
        h.engine
            .observers()
            .subscribe_fn(|_| Err(ObserverError::Closed));
        let (_, mut live) = h.engine.observers().channel();

        let outcome = h
            .engine
            .decide(AccessRequest::new("alice", "files", "read"))
            .await
            .unwrap();
        assert_eq!(outcome.decision, Verdict::Allow);
        assert_eq!(h.engine.observers().len(), 1);
        assert!(matches!(
            live.recv().await,
            Some(FeedEvent::AccessDecision { .. })
        ));
        assert!((trust_of(&h.engine, "alice") - 0.92).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_history_trail() {
        let h = harness(vec![Identity::new("bob", 0.5, AccessLevel::Transfer)], vec![]);
        h.engine
            .decide(AccessRequest::new("bob", "transactions", "transfer"))
            .await
            .unwrap();

        let records = h.history.records().await;
        let kinds: Vec<RecordKind> = records.iter().map(|r| r.kind()).collect();
        assert_eq!(
            kinds,
            vec![RecordKind::Decision, RecordKind::Audit, RecordKind::Trust]
        );
    }

    #[tokio::test]
    async fn test_dropped_caller_still_completes_enforcement() {
        let sink = Arc::new(HeldSink::new());
        let engine = DecisionEngine::builder(EngineConfig::default())
            .history_sink(sink.clone())
            .build()
            .unwrap();
        engine
            .trust_store()
            .provision(Identity::new("bob", 0.5, AccessLevel::Transfer));
        let (_, mut feed) = engine.observers().channel();

        // The sink blocks the first write, so the caller gives up mid-enforcement
        let abandoned = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            engine.decide(AccessRequest::new("bob", "transactions", "transfer")),
        )
        .await;
        assert!(abandoned.is_err());

        sink.release();

        let wait = std::time::Duration::from_secs(5);
        let first = tokio::time::timeout(wait, feed.recv()).await.unwrap();
        assert!(matches!(
            first,
            Some(FeedEvent::AccessDecision {
                decision: Verdict::StepUp,
                ..
            })
        ));
        let second = tokio::time::timeout(wait, feed.recv()).await.unwrap();
        assert!(matches!(second, Some(FeedEvent::TrustUpdate { .. })));

        assert!((trust_of(&engine, "bob") - 0.45).abs() < 1e-9);
        let kinds: Vec<RecordKind> = sink.inner.records().await.iter().map(|r| r.kind()).collect();
        assert_eq!(
            kinds,
            vec![RecordKind::Decision, RecordKind::Audit, RecordKind::Trust]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_decisions_keep_every_delta() {
        let h = harness(
            vec![Identity::new("alice", 0.5, AccessLevel::Write)],
            vec![Policy::new(PolicyScope::All, "files", "read", Verdict::Allow)],
        );
        let engine = Arc::new(h.engine);

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    engine
                        .decide(AccessRequest::new("alice", "files", "read"))
                        .await
                })
            })
            .collect();
        for task in tasks {
            let outcome = task.await.unwrap().unwrap();
            assert_eq!(outcome.decision, Verdict::Allow);
        }

        assert!((trust_of(&engine, "alice") - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_build_rejects_bad_config() {
        let mut config = EngineConfig::default();
        config.risk_thresholds.medium = 0.9;
        assert!(DecisionEngine::builder(config).build().is_err());
    }
}
