//! Trust Store - base trust per identity, decay at read time
//!
//! The base score moves only through `apply_event`. Every call takes the
//! identity's own lock for the read-modify-write, so concurrent decisions for
//! one identity never lose a delta while different identities never contend.
//! Effective trust is projected from the base score and the session clock on
//! every read and is never written back.

use crate::error::EngineError;
use crate::level::AccessLevel;
use crate::session::{decayed_trust, SessionHandle};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use tracing::{debug, warn};

/// A principal under evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    /// Unique identity ID
    pub id: String,

    /// Base trust in [0, 1]
    pub trust_score: f64,

    /// Ceiling on the operations this identity may perform
    #[serde(default)]
    pub max_access_level: AccessLevel,

    /// Deactivated identities are denied everything
    #[serde(default = "default_active")]
    pub active: bool,

    /// Device fingerprint bound on first use
    #[serde(default)]
    pub device_fingerprint: Option<String>,
}

fn default_active() -> bool {
    true
}

impl Identity {
    pub fn new(id: &str, trust_score: f64, max_access_level: AccessLevel) -> Self {
        Self {
            id: id.to_string(),
            trust_score: clamp_unit(trust_score),
            max_access_level,
            active: true,
            device_fingerprint: None,
        }
    }

    pub fn with_device(mut self, fingerprint: &str) -> Self {
        self.device_fingerprint = Some(fingerprint.to_string());
        self
    }
}

/// Why a trust delta was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustReason {
    DecisionAllow,
    DecisionStepUp,
    DecisionDeny,
    LoginFailure,
    OtpSuccess,
    StepUpVerified,
    PolicyViolation,
    /// Operator adjustment
    Manual,
}

impl TrustReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustReason::DecisionAllow => "decision_allow",
            TrustReason::DecisionStepUp => "decision_step_up",
            TrustReason::DecisionDeny => "decision_deny",
            TrustReason::LoginFailure => "login_failure",
            TrustReason::OtpSuccess => "otp_success",
            TrustReason::StepUpVerified => "step_up_verified",
            TrustReason::PolicyViolation => "policy_violation",
            TrustReason::Manual => "manual",
        }
    }
}

impl fmt::Display for TrustReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// One committed change to an identity's base trust
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustEvent {
    pub identity_id: String,
    pub delta: f64,
    pub reason: TrustReason,
    pub resulting_score: f64,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of presenting a device fingerprint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCheck {
    /// Nothing stored yet
    Unbound,
    Matched,
    Mismatch,
}

/// Serializable view of the whole store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    #[serde(default)]
    pub identities: Vec<Identity>,
    #[serde(default)]
    pub sessions: Vec<SessionHandle>,
}

/// Owner of all mutable trust state
pub struct TrustStore {
    identities: RwLock<HashMap<String, Arc<Mutex<Identity>>>>,
    sessions: RwLock<HashMap<String, SessionHandle>>,
    decay_rate: f64,
    collapse_threshold: f64,
}

impl TrustStore {
    pub fn new(decay_rate: f64, collapse_threshold: f64) -> Self {
        Self {
            identities: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            decay_rate,
            collapse_threshold,
        }
    }

    /// Rebuild a store from a snapshot
    pub fn restore(snapshot: StoreSnapshot, decay_rate: f64, collapse_threshold: f64) -> Self {
        let store = Self::new(decay_rate, collapse_threshold);
        for identity in snapshot.identities {
            store.provision(identity);
        }
        {
            let mut sessions = write(&store.sessions);
            for session in snapshot.sessions {
                sessions.insert(session.session_id.clone(), session);
            }
        }
        store
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let mut sessions: Vec<SessionHandle> = read(&self.sessions).values().cloned().collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        StoreSnapshot {
            identities: self.identities(),
            sessions,
        }
    }

    pub fn decay_rate(&self) -> f64 {
        self.decay_rate
    }

    /// Insert or replace an identity
    pub fn provision(&self, mut identity: Identity) {
        identity.trust_score = clamp_unit(identity.trust_score);
        let id = identity.id.clone();
        write(&self.identities).insert(id, Arc::new(Mutex::new(identity)));
    }

    /// Snapshot of one identity
    pub fn identity(&self, identity_id: &str) -> Option<Identity> {
        let record = read(&self.identities).get(identity_id).cloned()?;
        let identity = lock(&record).clone();
        Some(identity)
    }

    /// All identities, sorted by ID
    pub fn identities(&self) -> Vec<Identity> {
        let records: Vec<Arc<Mutex<Identity>>> =
            read(&self.identities).values().cloned().collect();
        let mut identities: Vec<Identity> = records.iter().map(|r| lock(r).clone()).collect();
        identities.sort_by(|a, b| a.id.cmp(&b.id));
        identities
    }

    /// Soft-delete: the identity stays but is denied everything
    pub fn deactivate(&self, identity_id: &str) -> Result<(), EngineError> {
        let record = self.record(identity_id)?;
        lock(&record).active = false;
        let revoked = self.revoke_sessions_for(identity_id);
        debug!(identity = identity_id, revoked, "identity deactivated");
        Ok(())
    }

    /// Apply a signed delta to base trust.
    ///
    /// The new score is clamped to [0, 1] and rounded to three decimals. When
    /// it lands at or below the collapse threshold every session of the
    /// identity is revoked.
    pub fn apply_event(
        &self,
        identity_id: &str,
        delta: f64,
        reason: TrustReason,
    ) -> Result<TrustEvent, EngineError> {
        let record = self.record(identity_id)?;
        let delta = if delta.is_finite() {
            delta
        } else {
            warn!(identity = identity_id, %reason, "non-finite trust delta ignored");
            0.0
        };

        let event = {
            let mut identity = lock(&record);
            let resulting = round3(clamp_unit(identity.trust_score + delta));
            identity.trust_score = resulting;
            TrustEvent {
                identity_id: identity_id.to_string(),
                delta,
                reason,
                resulting_score: resulting,
                timestamp: Utc::now(),
            }
        };

        debug!(
            identity = identity_id,
            delta,
            %reason,
            trust = event.resulting_score,
            "trust event applied"
        );

        if event.resulting_score <= self.collapse_threshold {
            let revoked = self.revoke_sessions_for(identity_id);
            if revoked > 0 {
                warn!(identity = identity_id, revoked, "trust collapsed, sessions revoked");
            }
        }

        Ok(event)
    }

    /// Compare a presented fingerprint with the stored one
    pub fn check_device(
        &self,
        identity_id: &str,
        fingerprint: &str,
    ) -> Result<DeviceCheck, EngineError> {
        let record = self.record(identity_id)?;
        let identity = lock(&record);
        let check = match identity.device_fingerprint.as_deref() {
            None => DeviceCheck::Unbound,
            Some(stored) if stored == fingerprint => DeviceCheck::Matched,
            Some(_) => DeviceCheck::Mismatch,
        };
        Ok(check)
    }

    /// Bind a fingerprint if the identity has none yet.
    ///
    /// Returns false when a fingerprint was already bound, including when a
    /// concurrent request won the race.
    pub fn bind_device(&self, identity_id: &str, fingerprint: &str) -> Result<bool, EngineError> {
        let record = self.record(identity_id)?;
        let mut identity = lock(&record);
        if identity.device_fingerprint.is_some() {
            return Ok(false);
        }
        identity.device_fingerprint = Some(fingerprint.to_string());
        Ok(true)
    }

    // Sessions

    /// Open a session for an existing identity
    pub fn open_session(&self, identity_id: &str) -> Result<SessionHandle, EngineError> {
        let session = SessionHandle::new(identity_id);
        self.insert_session(session.clone())?;
        Ok(session)
    }

    /// Register a session created elsewhere
    pub fn insert_session(&self, session: SessionHandle) -> Result<(), EngineError> {
        self.record(&session.identity_id)?;
        write(&self.sessions).insert(session.session_id.clone(), session);
        Ok(())
    }

    pub fn session(&self, session_id: &str) -> Option<SessionHandle> {
        read(&self.sessions).get(session_id).cloned()
    }

    pub fn sessions_for(&self, identity_id: &str) -> Vec<SessionHandle> {
        read(&self.sessions)
            .values()
            .filter(|s| s.identity_id == identity_id)
            .cloned()
            .collect()
    }

    /// Advance the decay clock of a session
    pub fn touch_session(&self, session_id: &str, at: DateTime<Utc>) -> bool {
        match write(&self.sessions).get_mut(session_id) {
            Some(session) => {
                session.touch(at);
                true
            }
            None => false,
        }
    }

    pub fn revoke_session(&self, session_id: &str) -> bool {
        match write(&self.sessions).get_mut(session_id) {
            Some(session) => {
                session.revoked = true;
                true
            }
            None => false,
        }
    }

    /// Mark a session as having passed an additional factor
    pub fn mark_step_up(&self, session_id: &str) -> bool {
        match write(&self.sessions).get_mut(session_id) {
            Some(session) if session.is_live() => {
                session.step_up_completed = true;
                true
            }
            _ => false,
        }
    }

    /// Effective trust for a session right now
    pub fn effective_trust(&self, session_id: &str) -> Result<f64, EngineError> {
        self.effective_trust_at(session_id, Utc::now())
    }

    /// Effective trust for a session at a given instant.
    ///
    /// A revoked session is worth nothing.
    pub fn effective_trust_at(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<f64, EngineError> {
        let session = self
            .session(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;
        if !session.is_live() {
            return Ok(0.0);
        }
        let identity = self
            .identity(&session.identity_id)
            .ok_or_else(|| EngineError::IdentityNotFound(session.identity_id.clone()))?;
        Ok(decayed_trust(
            identity.trust_score,
            session.idle_minutes(now),
            self.decay_rate,
        ))
    }

    fn record(&self, identity_id: &str) -> Result<Arc<Mutex<Identity>>, EngineError> {
        read(&self.identities)
            .get(identity_id)
            .cloned()
            .ok_or_else(|| EngineError::IdentityNotFound(identity_id.to_string()))
    }

    fn revoke_sessions_for(&self, identity_id: &str) -> usize {
        let mut sessions = write(&self.sessions);
        let mut revoked = 0;
        for session in sessions.values_mut() {
            if session.identity_id == identity_id && session.is_live() {
                session.revoked = true;
                revoked += 1;
            }
        }
        revoked
    }
}

impl Default for TrustStore {
    fn default() -> Self {
        Self::new(0.015, 0.0)
    }
}

pub(crate) fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
