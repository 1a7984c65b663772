//! Declarative policy rows and where they come from
//!
//! Policies are owned by an administrative collaborator; the engine only
//! reads them. Lookup tries the identity's own row first and falls back to
//! the global `ALL` row for the same (resource, action).
//!
//! Policy file: ~/.config/trustgate/policies.yaml

use crate::error::StoreError;
use crate::level::{RiskLevel, Verdict};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tokio::sync::RwLock;
use uuid::Uuid;

const ALL: &str = "ALL";

/// Who a policy applies to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PolicyScope {
    /// Every identity without a more specific row
    All,
    Identity(String),
}

impl PolicyScope {
    pub fn identity(id: &str) -> Self {
        PolicyScope::Identity(id.to_string())
    }
}

impl From<String> for PolicyScope {
    fn from(s: String) -> Self {
        if s == ALL {
            PolicyScope::All
        } else {
            PolicyScope::Identity(s)
        }
    }
}

impl From<PolicyScope> for String {
    fn from(scope: PolicyScope) -> Self {
        match scope {
            PolicyScope::All => ALL.to_string(),
            PolicyScope::Identity(id) => id,
        }
    }
}

impl fmt::Display for PolicyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyScope::All => write!(f, "{}", ALL),
            PolicyScope::Identity(id) => write!(f, "{}", id),
        }
    }
}

/// A declarative access rule row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default = "new_policy_id")]
    pub id: String,

    /// Identity ID or `ALL`
    #[serde(default = "default_scope")]
    pub scope: PolicyScope,

    pub resource: String,
    pub action: String,
    pub effect: Verdict,

    /// Trust below this is denied regardless of effect
    #[serde(default)]
    pub min_trust: f64,

    /// Risk above this band is denied regardless of effect
    #[serde(default = "default_max_risk")]
    pub max_risk: RiskLevel,

    /// Largest amount this row covers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_amount: Option<f64>,

    /// ALLOW becomes STEP_UP until the session has stepped up
    #[serde(default)]
    pub require_mfa: bool,

    /// Higher wins among rows for the same scope
    #[serde(default = "default_priority")]
    pub priority: i32,

    #[serde(default = "default_active")]
    pub active: bool,
}

fn new_policy_id() -> String {
    format!("pol_{}", Uuid::new_v4().simple())
}

fn default_scope() -> PolicyScope {
    PolicyScope::All
}

fn default_max_risk() -> RiskLevel {
    RiskLevel::High
}

fn default_priority() -> i32 {
    1
}

fn default_active() -> bool {
    true
}

impl Policy {
    pub fn new(scope: PolicyScope, resource: &str, action: &str, effect: Verdict) -> Self {
        Self {
            id: new_policy_id(),
            scope,
            resource: resource.to_string(),
            action: action.to_string(),
            effect,
            min_trust: 0.0,
            max_risk: default_max_risk(),
            max_amount: None,
            require_mfa: false,
            priority: default_priority(),
            active: true,
        }
    }

    pub fn min_trust(mut self, min_trust: f64) -> Self {
        self.min_trust = min_trust;
        self
    }

    pub fn max_risk(mut self, max_risk: RiskLevel) -> Self {
        self.max_risk = max_risk;
        self
    }

    pub fn max_amount(mut self, max_amount: f64) -> Self {
        self.max_amount = Some(max_amount);
        self
    }

    pub fn require_mfa(mut self) -> Self {
        self.require_mfa = true;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    fn applies(&self, scope: &PolicyScope, resource: &str, action: &str) -> bool {
        self.active && self.scope == *scope && self.resource == resource && self.action == action
    }
}

/// Read access to policy rows
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// The active row for exactly this scope, highest priority first
    async fn find_policy(
        &self,
        scope: &PolicyScope,
        resource: &str,
        action: &str,
    ) -> Result<Option<Policy>, StoreError>;
}

/// Identity-scoped row if there is one, else the `ALL` row
pub async fn lookup(
    store: &dyn PolicyStore,
    identity_id: &str,
    resource: &str,
    action: &str,
) -> Result<Option<Policy>, StoreError> {
    let scoped = store
        .find_policy(&PolicyScope::identity(identity_id), resource, action)
        .await?;
    if scoped.is_some() {
        return Ok(scoped);
    }
    store.find_policy(&PolicyScope::All, resource, action).await
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PolicyFile {
    #[serde(default)]
    policies: Vec<Policy>,
}

/// Policy rows held in memory, optionally backed by a YAML file
#[derive(Debug, Default)]
pub struct InMemoryPolicyStore {
    policies: RwLock<Vec<Policy>>,
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policies(policies: Vec<Policy>) -> Self {
        Self {
            policies: RwLock::new(policies),
        }
    }

    /// Load a policy file; a missing file gives an empty store
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read policies from {:?}", path))?;
        let file: PolicyFile = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse policies from {:?}", path))?;
        Ok(Self::with_policies(file.policies))
    }

    pub async fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = PolicyFile {
            policies: self.list().await,
        };
        let content = serde_yaml::to_string(&file)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write policies to {:?}", path))?;
        Ok(())
    }

    /// Insert or replace by ID
    pub async fn upsert(&self, policy: Policy) {
        let mut policies = self.policies.write().await;
        match policies.iter_mut().find(|p| p.id == policy.id) {
            Some(existing) => *existing = policy,
            None => policies.push(policy),
        }
    }

    pub async fn remove(&self, id: &str) -> bool {
        let mut policies = self.policies.write().await;
        let before = policies.len();
        policies.retain(|p| p.id != id);
        policies.len() != before
    }

    pub async fn list(&self) -> Vec<Policy> {
        self.policies.read().await.clone()
    }
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn find_policy(
        &self,
        scope: &PolicyScope,
        resource: &str,
        action: &str,
    ) -> Result<Option<Policy>, StoreError> {
        let policies = self.policies.read().await;
        Ok(policies
            .iter()
            .filter(|p| p.applies(scope, resource, action))
            .max_by_key(|p| p.priority)
            .cloned())
    }
}
