//! Session handles and the trust decay clock
//!
//! A session owns no trust of its own. It only carries the clock that decay
//! is measured against: the longer a session sits idle, the less its
//! identity's base trust is worth when the next request arrives.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A live interaction tied to an identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionHandle {
    /// Unique session ID
    pub session_id: String,

    /// Owning identity
    pub identity_id: String,

    /// When the session was established
    pub created_at: DateTime<Utc>,

    /// Last decision made in this session
    pub last_activity_at: DateTime<Utc>,

    /// Whether an additional factor has been verified
    #[serde(default)]
    pub step_up_completed: bool,

    /// Revoked sessions never become live again
    #[serde(default)]
    pub revoked: bool,
}

impl SessionHandle {
    /// Create a new session starting now
    pub fn new(identity_id: &str) -> Self {
        Self::started_at(identity_id, Utc::now())
    }

    /// Create a session whose clock started at `at`
    pub fn started_at(identity_id: &str, at: DateTime<Utc>) -> Self {
        Self {
            session_id: generate_session_id(),
            identity_id: identity_id.to_string(),
            created_at: at,
            last_activity_at: at,
            step_up_completed: false,
            revoked: false,
        }
    }

    /// Minutes since last activity, never negative
    pub fn idle_minutes(&self, now: DateTime<Utc>) -> f64 {
        let idle = now.signed_duration_since(self.last_activity_at);
        (idle.num_milliseconds() as f64 / 60_000.0).max(0.0)
    }

    /// Record activity
    pub fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.last_activity_at {
            self.last_activity_at = at;
        }
    }

    pub fn is_live(&self) -> bool {
        !self.revoked
    }
}

/// Project base trust forward over an idle period.
///
/// `base * e^(-rate * idle)`, clamped to [0, 1]. Pure: decay never writes back.
pub fn decayed_trust(base: f64, idle_minutes: f64, rate: f64) -> f64 {
    let idle = if idle_minutes.is_finite() {
        idle_minutes.max(0.0)
    } else {
        0.0
    };
    let projected = base * (-rate * idle).exp();
    if projected.is_nan() {
        return 0.0;
    }
    projected.clamp(0.0, 1.0)
}

fn generate_session_id() -> String {
    format!("ses_{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_idle_minutes() {
        let start = Utc::now() - Duration::minutes(30);
        let session = SessionHandle::started_at("alice", start);
        let idle = session.idle_minutes(start + Duration::minutes(30));
        assert!((idle - 30.0).abs() < 1e-9);
        assert_eq!(session.idle_minutes(start - Duration::minutes(5)), 0.0);
    }

    #[test]
    fn test_touch_never_moves_clock_backwards() {
        let start = Utc::now();
        let mut session = SessionHandle::started_at("alice", start);
        session.touch(start - Duration::minutes(10));
        assert_eq!(session.last_activity_at, start);
        session.touch(start + Duration::minutes(1));
        assert_eq!(session.last_activity_at, start + Duration::minutes(1));
    }

    #[test]
    fn test_decay_sixty_idle_minutes() {
        let effective = decayed_trust(0.8, 60.0, 0.015);
        assert!((effective - 0.325).abs() < 0.01, "got {}", effective);
    }

    #[test]
    fn test_decay_strictly_decreasing() {
        let mut previous = decayed_trust(0.9, 0.0, 0.015);
        assert_eq!(previous, 0.9);
        for minute in 1..=240 {
            let current = decayed_trust(0.9, minute as f64, 0.015);
            assert!(current < previous, "not decreasing at minute {}", minute);
            assert!((0.0..=1.0).contains(&current));
            previous = current;
        }
    }

    #[test]
    fn test_decay_stays_in_unit_interval() {
        assert_eq!(decayed_trust(1.0, -5.0, 0.015), 1.0);
        assert_eq!(decayed_trust(0.0, 100.0, 0.015), 0.0);
        assert_eq!(decayed_trust(0.7, f64::NAN, 0.015), 0.7);
        assert!(decayed_trust(0.7, 1e9, 0.015) >= 0.0);
    }

    #[test]
    fn test_session_ids_are_unique() {
        let a = SessionHandle::new("alice");
        let b = SessionHandle::new("alice");
        assert_ne!(a.session_id, b.session_id);
        assert!(a.session_id.starts_with("ses_"));
    }
}
