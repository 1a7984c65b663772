//! Real-time decision feed
//!
//! Observers receive every decision and trust change as it is committed.
//! Delivery is best-effort and at most once: an observer that errors, falls
//! behind, or disconnects is removed, and the request carries on regardless.

use crate::error::ObserverError;
use crate::level::{RiskLevel, Verdict};
use crate::pattern::Pattern;
use crate::reasoner::Reason;
use crate::trust_store::TrustReason;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// What observers receive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeedEvent {
    AccessDecision {
        identity_id: String,
        resource: String,
        action: String,
        decision: Verdict,
        risk_score: f64,
        risk_level: RiskLevel,
        pattern: Pattern,
        reason: Reason,
        trust: f64,
        timestamp: DateTime<Utc>,
    },
    TrustUpdate {
        identity_id: String,
        trust: f64,
        delta: f64,
        reason: TrustReason,
        timestamp: DateTime<Utc>,
    },
}

impl FeedEvent {
    pub fn identity_id(&self) -> &str {
        match self {
            FeedEvent::AccessDecision { identity_id, .. } => identity_id,
            FeedEvent::TrustUpdate { identity_id, .. } => identity_id,
        }
    }
}

/// Receiver of feed events. Must not block.
pub trait DecisionObserver: Send + Sync {
    fn on_event(&self, event: &FeedEvent) -> Result<(), ObserverError>;
}

impl DecisionObserver for mpsc::Sender<FeedEvent> {
    fn on_event(&self, event: &FeedEvent) -> Result<(), ObserverError> {
        self.try_send(event.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ObserverError::Full,
            mpsc::error::TrySendError::Closed(_) => ObserverError::Closed,
        })
    }
}

/// Adapter for plain callbacks
pub struct FnObserver<F>(F);

impl<F> DecisionObserver for FnObserver<F>
where
    F: Fn(&FeedEvent) -> Result<(), ObserverError> + Send + Sync,
{
    fn on_event(&self, event: &FeedEvent) -> Result<(), ObserverError> {
        (self.0)(event)
    }
}

pub type SubscriptionId = u64;

pub struct ObserverRegistry {
    observers: Mutex<Vec<(SubscriptionId, Arc<dyn DecisionObserver>)>>,
    next_id: AtomicU64,
    buffer: usize,
}

impl ObserverRegistry {
    /// `buffer` sizes the queue of observers created through `channel`
    pub fn new(buffer: usize) -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        }
    }

    pub fn subscribe(&self, observer: Arc<dyn DecisionObserver>) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, observer));
        debug!(subscription = id, "observer subscribed");
        id
    }

    pub fn subscribe_fn<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&FeedEvent) -> Result<(), ObserverError> + Send + Sync + 'static,
    {
        self.subscribe(Arc::new(FnObserver(callback)))
    }

    /// Subscribe through a bounded channel
    pub fn channel(&self) -> (SubscriptionId, mpsc::Receiver<FeedEvent>) {
        let (tx, rx) = mpsc::channel(self.buffer);
        (self.subscribe(Arc::new(tx)), rx)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = observers.len();
        observers.retain(|(sid, _)| *sid != id);
        observers.len() != before
    }

    pub fn len(&self) -> usize {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver to every observer; returns how many accepted the event
    pub fn notify(&self, event: &FeedEvent) -> usize {
        let snapshot: Vec<(SubscriptionId, Arc<dyn DecisionObserver>)> = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, observer) in &snapshot {
            match observer.on_event(event) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(subscription = id, error = %e, "dropping observer");
                    dead.push(*id);
                }
            }
        }

        if !dead.is_empty() {
            self.observers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|(id, _)| !dead.contains(id));
        }
        delivered
    }
}

impl Default for ObserverRegistry {
    fn default() -> Self {
        Self::new(64)
    }
}
