//! Error types for the decision engine
//!
//! Only a missing identity is fatal to a request. Everything else (broken
//! rules, an unreachable policy store, a full history sink, a dead observer)
//! is logged and absorbed so the engine keeps answering.

use thiserror::Error;

/// Errors surfaced to callers of the engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("identity not found: {0}")]
    IdentityNotFound(String),

    #[error("session {session_id} does not belong to identity {identity_id}")]
    SessionMismatch {
        session_id: String,
        identity_id: String,
    },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("enforcement task failed: {0}")]
    Enforcement(String),
}

/// A rule predicate could not be evaluated against the context
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("context is missing field '{0}'")]
    MissingField(&'static str),

    #[error("{0}")]
    Predicate(String),
}

/// Policy storage failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("policy store unavailable: {0}")]
    Unavailable(String),
}

/// History sink failures
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("sink is closed")]
    Closed,
}

/// Observer delivery failures. Any of these removes the observer.
#[derive(Debug, Error)]
pub enum ObserverError {
    #[error("observer buffer is full")]
    Full,

    #[error("observer has disconnected")]
    Closed,

    #[error("observer rejected event: {0}")]
    Rejected(String),
}

/// Configuration validation failures
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be within [0, 1], got {value}")]
    OutOfRange { name: &'static str, value: f64 },

    #[error("medium risk threshold ({medium}) must be below high ({high})")]
    ThresholdOrder { medium: f64, high: f64 },

    #[error("decay rate must be a non-negative finite number, got {0}")]
    InvalidDecayRate(f64),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}
