//! Enforcement Dispatcher - where a decision takes effect
//!
//! For every resolved decision, in order:
//! 1. Apply the verdict's trust delta (the only decision-driven trust write)
//! 2. Bind a first-seen device fingerprint, unless the request was denied
//! 3. Advance the session clock and record the risk outcome
//! 4. Persist the decision record, the audit entry for DENY/STEP_UP, and the
//!    trust event
//! 5. Notify observers
//!
//! Persistence and delivery failures are logged and counted. They never undo
//! the trust change.

use crate::audit::{AccessDecisionRecord, AuditLogEntry, HistoryRecord, HistorySink};
use crate::config::TrustDeltas;
use crate::context::Context;
use crate::error::EngineError;
use crate::history::{RiskHistory, RiskOutcome};
use crate::level::Verdict;
use crate::observer::{FeedEvent, ObserverRegistry};
use crate::reasoner::Decision;
use crate::trust_store::{TrustReason, TrustStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One side effect the dispatcher carried out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppliedAction {
    Permitted,
    Blocked,
    StepUpRequired,
    TrustAdjusted { delta: f64, trust: f64 },
    DeviceBound,
    SessionTouched { session_id: String },
    DecisionRecorded,
    AuditLogged,
    TrustEventRecorded,
    ObserversNotified { delivered: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnforcementResult {
    pub identity_id: String,
    pub decision: Verdict,
    pub actions: Vec<AppliedAction>,
    /// Base trust after the delta
    pub trust: f64,
    /// History writes that failed
    pub persist_failures: usize,
}

pub struct EnforcementDispatcher {
    trust: Arc<TrustStore>,
    history: Arc<RiskHistory>,
    sink: Arc<dyn HistorySink>,
    observers: Arc<ObserverRegistry>,
    deltas: TrustDeltas,
}

impl EnforcementDispatcher {
    pub fn new(
        trust: Arc<TrustStore>,
        history: Arc<RiskHistory>,
        sink: Arc<dyn HistorySink>,
        observers: Arc<ObserverRegistry>,
        deltas: TrustDeltas,
    ) -> Self {
        Self {
            trust,
            history,
            sink,
            observers,
            deltas,
        }
    }

    pub fn delta_for(&self, verdict: Verdict) -> (f64, TrustReason) {
        match verdict {
            Verdict::Allow => (self.deltas.allow, TrustReason::DecisionAllow),
            Verdict::StepUp => (self.deltas.step_up, TrustReason::DecisionStepUp),
            Verdict::Deny => (self.deltas.deny, TrustReason::DecisionDeny),
        }
    }

    pub async fn enforce(
        &self,
        decision: &Decision,
        identity_id: &str,
        context: &Context,
    ) -> Result<EnforcementResult, EngineError> {
        let mut actions = vec![match decision.decision {
            Verdict::Allow => AppliedAction::Permitted,
            Verdict::StepUp => AppliedAction::StepUpRequired,
            Verdict::Deny => AppliedAction::Blocked,
        }];

        let (delta, reason) = self.delta_for(decision.decision);
        let event = self.trust.apply_event(identity_id, delta, reason)?;
        actions.push(AppliedAction::TrustAdjusted {
            delta,
            trust: event.resulting_score,
        });

        if decision.decision != Verdict::Deny {
            if let Some(fingerprint) = &context.session.device_fingerprint {
                if self.trust.bind_device(identity_id, fingerprint)? {
                    debug!(identity = identity_id, "device bound on first use");
                    actions.push(AppliedAction::DeviceBound);
                }
            }
        }

        if let Some(session_id) = &context.session.session_id {
            if self.trust.touch_session(session_id, context.timestamp) {
                actions.push(AppliedAction::SessionTouched {
                    session_id: session_id.clone(),
                });
            }
        }

        self.history.record(
            identity_id,
            RiskOutcome::new(decision.risk_score, decision.risk_level, decision.decision),
        );

        let record = AccessDecisionRecord::new(
            decision,
            identity_id,
            context.session.session_id.as_deref(),
            &context.resource.name,
            &context.action,
            event.resulting_score,
        );
        let audit = AuditLogEntry::for_record(&record);

        let mut persist_failures = 0;
        if self.persist(HistoryRecord::Decision(record)).await {
            actions.push(AppliedAction::DecisionRecorded);
        } else {
            persist_failures += 1;
        }
        if let Some(entry) = audit {
            if self.persist(HistoryRecord::Audit(entry)).await {
                actions.push(AppliedAction::AuditLogged);
            } else {
                persist_failures += 1;
            }
        }
        if self.persist(HistoryRecord::Trust(event.clone())).await {
            actions.push(AppliedAction::TrustEventRecorded);
        } else {
            persist_failures += 1;
        }

        let mut delivered = self.observers.notify(&FeedEvent::AccessDecision {
            identity_id: identity_id.to_string(),
            resource: context.resource.name.clone(),
            action: context.action.clone(),
            decision: decision.decision,
            risk_score: decision.risk_score,
            risk_level: decision.risk_level,
            pattern: decision.pattern,
            reason: decision.reason,
            trust: event.resulting_score,
            timestamp: context.timestamp,
        });
        delivered += self.observers.notify(&FeedEvent::TrustUpdate {
            identity_id: identity_id.to_string(),
            trust: event.resulting_score,
            delta,
            reason,
            timestamp: event.timestamp,
        });
        actions.push(AppliedAction::ObserversNotified { delivered });

        info!(
            identity = identity_id,
            resource = %context.resource.name,
            action = %context.action,
            decision = %decision.decision,
            reason = %decision.reason,
            risk = decision.risk_score,
            trust = event.resulting_score,
            "decision enforced"
        );

        Ok(EnforcementResult {
            identity_id: identity_id.to_string(),
            decision: decision.decision,
            actions,
            trust: event.resulting_score,
            persist_failures,
        })
    }

    async fn persist(&self, record: HistoryRecord) -> bool {
        let kind = record.kind();
        match self.sink.record(record).await {
            Ok(()) => true,
            Err(e) => {
                warn!(?kind, error = %e, "history write failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryHistory;
    use crate::context::SessionAttrs;
    use crate::error::SinkError;
    use crate::level::{AccessLevel, RiskLevel};
    use crate::pattern::Pattern;
    use crate::reasoner::Reason;
    use crate::trust_store::Identity;
    use async_trait::async_trait;

    struct BrokenSink;

    #[async_trait]
    impl HistorySink for BrokenSink {
        async fn record(&self, _record: HistoryRecord) -> Result<(), SinkError> {
            Err(SinkError::Closed)
        }
    }

    fn decision(verdict: Verdict) -> Decision {
        Decision {
            decision: verdict,
            risk_score: 0.5,
            risk_level: RiskLevel::Medium,
            pattern: Pattern::Normal,
            reason: Reason::RuleMatch,
            matched_rule_ids: vec![],
            policy_id: None,
        }
    }

    fn setup(sink: Arc<dyn HistorySink>) -> (EnforcementDispatcher, Arc<TrustStore>, Context) {
        let store = Arc::new(TrustStore::default());
        let identity = Identity::new("alice", 0.5, AccessLevel::Write);
        store.provision(identity.clone());
        let dispatcher = EnforcementDispatcher::new(
            Arc::clone(&store),
            Arc::new(RiskHistory::new(20)),
            sink,
            Arc::new(ObserverRegistry::default()),
            TrustDeltas::default(),
        );
        let ctx = Context::builder(&identity, "files", "write").build();
        (dispatcher, store, ctx)
    }

    #[tokio::test]
    async fn test_deny_applies_delta_and_audits() {
        let history = Arc::new(InMemoryHistory::new());
        let (dispatcher, store, ctx) = setup(history.clone());

        let result = dispatcher
            .enforce(&decision(Verdict::Deny), "alice", &ctx)
            .await
            .unwrap();

        assert_eq!(result.trust, 0.4);
        assert_eq!(store.identity("alice").unwrap().trust_score, 0.4);
        assert!(result.actions.contains(&AppliedAction::Blocked));
        assert!(result.actions.contains(&AppliedAction::AuditLogged));
        assert_eq!(history.records().await.len(), 3);
    }

    #[tokio::test]
    async fn test_allow_skips_audit_entry() {
        let history = Arc::new(InMemoryHistory::new());
        let (dispatcher, _, ctx) = setup(history.clone());

        let result = dispatcher
            .enforce(&decision(Verdict::Allow), "alice", &ctx)
            .await
            .unwrap();

        assert_eq!(result.trust, 0.52);
        assert!(!result.actions.contains(&AppliedAction::AuditLogged));
        assert_eq!(history.records().await.len(), 2);
    }

    #[tokio::test]
    async fn test_device_bound_only_when_not_denied() {
        let (dispatcher, store, ctx) = setup(Arc::new(InMemoryHistory::new()));
        let ctx = Context {
            session: SessionAttrs {
                device_fingerprint: Some("laptop".to_string()),
                ..SessionAttrs::default()
            },
            ..ctx
        };

        let denied = dispatcher
            .enforce(&decision(Verdict::Deny), "alice", &ctx)
            .await
            .unwrap();
        assert!(!denied.actions.contains(&AppliedAction::DeviceBound));
        assert_eq!(store.identity("alice").unwrap().device_fingerprint, None);

        let challenged = dispatcher
            .enforce(&decision(Verdict::StepUp), "alice", &ctx)
            .await
            .unwrap();
        assert!(challenged.actions.contains(&AppliedAction::DeviceBound));
        assert_eq!(
            store.identity("alice").unwrap().device_fingerprint.as_deref(),
            Some("laptop")
        );
    }

    #[tokio::test]
    async fn test_sink_failure_keeps_trust_change() {
        let (dispatcher, store, ctx) = setup(Arc::new(BrokenSink));

        let result = dispatcher
            .enforce(&decision(Verdict::StepUp), "alice", &ctx)
            .await
            .unwrap();

        assert_eq!(result.persist_failures, 3);
        assert_eq!(result.trust, 0.45);
        assert_eq!(store.identity("alice").unwrap().trust_score, 0.45);
    }

    #[tokio::test]
    async fn test_observers_see_both_events() {
        let history = Arc::new(InMemoryHistory::new());
        let store = Arc::new(TrustStore::default());
        let identity = Identity::new("alice", 0.5, AccessLevel::Write);
        store.provision(identity.clone());
        let observers = Arc::new(ObserverRegistry::new(8));
        let (_, mut rx) = observers.channel();
        let dispatcher = EnforcementDispatcher::new(
            Arc::clone(&store),
            Arc::new(RiskHistory::new(20)),
            history,
            Arc::clone(&observers),
            TrustDeltas::default(),
        );
        let ctx = Context::builder(&identity, "files", "write").build();

        let result = dispatcher
            .enforce(&decision(Verdict::Allow), "alice", &ctx)
            .await
            .unwrap();
        assert!(result
            .actions
            .contains(&AppliedAction::ObserversNotified { delivered: 2 }));

        assert!(matches!(rx.recv().await, Some(FeedEvent::AccessDecision { .. })));
        assert!(matches!(rx.recv().await, Some(FeedEvent::TrustUpdate { .. })));
    }

    #[tokio::test]
    async fn test_unknown_identity() {
        let (dispatcher, _, ctx) = setup(Arc::new(InMemoryHistory::new()));
        let err = dispatcher
            .enforce(&decision(Verdict::Allow), "ghost", &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::IdentityNotFound(_)));
    }
}
