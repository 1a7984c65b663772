//! Trustgate - Continuous authorization with time-decaying trust
//!
//! "Never trust, always verify. Then verify again."
//!
//! Classic access control asks a single question once: "Is this identity
//! allowed to touch this resource?" Trustgate asks it on EVERY request and
//! folds in everything it has learned since the last time:
//! - How long has the session been idle? Trust decays while nobody is looking.
//! - What do the behavioural signals say right now? Risk is rescored each call.
//! - Has this identity misbehaved recently? Weights adapt to repeat offenders.
//!
//! Every verdict feeds back into the identity's trust score, lands in the
//! decision history, and is pushed to any live observers.

pub mod audit;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod history;
pub mod level;
pub mod observer;
pub mod pattern;
pub mod policy;
pub mod reasoner;
pub mod risk;
pub mod rules;
pub mod session;
pub mod trust_store;

pub use audit::{HistoryRecord, HistorySink, InMemoryHistory, JsonlHistorySink};
pub use config::EngineConfig;
pub use context::Context;
pub use dispatcher::{EnforcementDispatcher, EnforcementResult};
pub use engine::{AccessRequest, AuthEvent, DecisionEngine, DecisionOutcome, RequestMetadata};
pub use error::EngineError;
pub use level::{AccessLevel, RiskLevel, Verdict};
pub use observer::{FeedEvent, ObserverRegistry};
pub use pattern::Pattern;
pub use policy::{InMemoryPolicyStore, Policy, PolicyScope, PolicyStore};
pub use reasoner::{Decision, PolicyReasoner, Reason};
pub use risk::{RiskAssessment, RiskEngine, Signals};
pub use rules::{Rule, RuleSet};
pub use session::SessionHandle;
pub use trust_store::{Identity, TrustEvent, TrustReason, TrustStore};
