//! Decision history and audit trail
//!
//! Every decision becomes an `AccessDecisionRecord`; DENY and STEP_UP also
//! raise an `AuditLogEntry`; every trust change is kept as a `TrustEvent`.
//! Records are append-only.
//!
//! Storage: ~/.local/share/trustgate/history.jsonl (JSON lines)

use crate::error::SinkError;
use crate::level::{RiskLevel, Verdict};
use crate::pattern::Pattern;
use crate::reasoner::{Decision, Reason};
use crate::trust_store::TrustEvent;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use trustgate_core::Paths;
use uuid::Uuid;

/// Immutable record of one access decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessDecisionRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub identity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub resource: String,
    pub action: String,
    pub decision: Verdict,
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub pattern: Pattern,
    pub reason: Reason,
    #[serde(default)]
    pub matched_rule_ids: Vec<String>,
    /// Base trust after the decision's delta
    pub trust_after: f64,
}

impl AccessDecisionRecord {
    pub fn new(
        decision: &Decision,
        identity_id: &str,
        session_id: Option<&str>,
        resource: &str,
        action: &str,
        trust_after: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            identity_id: identity_id.to_string(),
            session_id: session_id.map(str::to_string),
            resource: resource.to_string(),
            action: action.to_string(),
            decision: decision.decision,
            risk_score: decision.risk_score,
            risk_level: decision.risk_level,
            pattern: decision.pattern,
            reason: decision.reason,
            matched_rule_ids: decision.matched_rule_ids.clone(),
            trust_after,
        }
    }
}

/// Incident raised for a refused or challenged request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub identity_id: String,
    /// Decision record this entry belongs to
    pub decision_id: Uuid,
    pub decision: Verdict,
    pub reason: Reason,
    pub message: String,
}

impl AuditLogEntry {
    /// Only DENY and STEP_UP produce an entry
    pub fn for_record(record: &AccessDecisionRecord) -> Option<Self> {
        let verb = match record.decision {
            Verdict::Allow => return None,
            Verdict::StepUp => "challenged",
            Verdict::Deny => "denied",
        };
        Some(Self {
            id: Uuid::new_v4(),
            timestamp: record.timestamp,
            identity_id: record.identity_id.clone(),
            decision_id: record.id,
            decision: record.decision,
            reason: record.reason,
            message: format!(
                "{} {} on {} {} ({}, risk {:.2})",
                record.identity_id,
                verb,
                record.action,
                record.resource,
                record.reason,
                record.risk_score
            ),
        })
    }
}

/// Anything the engine writes to history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryRecord {
    Decision(AccessDecisionRecord),
    Audit(AuditLogEntry),
    Trust(TrustEvent),
}

impl HistoryRecord {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            HistoryRecord::Decision(r) => r.timestamp,
            HistoryRecord::Audit(r) => r.timestamp,
            HistoryRecord::Trust(r) => r.timestamp,
        }
    }

    pub fn identity_id(&self) -> &str {
        match self {
            HistoryRecord::Decision(r) => &r.identity_id,
            HistoryRecord::Audit(r) => &r.identity_id,
            HistoryRecord::Trust(r) => &r.identity_id,
        }
    }

    pub fn kind(&self) -> RecordKind {
        match self {
            HistoryRecord::Decision(_) => RecordKind::Decision,
            HistoryRecord::Audit(_) => RecordKind::Audit,
            HistoryRecord::Trust(_) => RecordKind::Trust,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Decision,
    Audit,
    Trust,
}

/// Write side of decision history
#[async_trait]
pub trait HistorySink: Send + Sync {
    async fn record(&self, record: HistoryRecord) -> Result<(), SinkError>;
}

/// Query parameters for history
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    identity_id: Option<String>,
    kind: Option<RecordKind>,
    decision: Option<Verdict>,
    since: Option<DateTime<Utc>>,
    limit: Option<usize>,
}

impl HistoryQuery {
    /// Filter by identity
    pub fn identity(mut self, identity_id: &str) -> Self {
        self.identity_id = Some(identity_id.to_string());
        self
    }

    /// Filter by record kind
    pub fn kind(mut self, kind: RecordKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Only decision and audit records with this verdict
    pub fn decision(mut self, decision: Verdict) -> Self {
        self.decision = Some(decision);
        self
    }

    /// Filter by time
    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    /// Limit results
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, record: &HistoryRecord) -> bool {
        if let Some(ref identity) = self.identity_id {
            if record.identity_id() != identity {
                return false;
            }
        }

        if let Some(kind) = self.kind {
            if record.kind() != kind {
                return false;
            }
        }

        if let Some(decision) = self.decision {
            let verdict = match record {
                HistoryRecord::Decision(r) => Some(r.decision),
                HistoryRecord::Audit(r) => Some(r.decision),
                HistoryRecord::Trust(_) => None,
            };
            if verdict != Some(decision) {
                return false;
            }
        }

        if let Some(since) = self.since {
            if record.timestamp() < since {
                return false;
            }
        }

        true
    }

    /// Filter, newest first, then limit
    fn apply(&self, records: impl Iterator<Item = HistoryRecord>) -> Vec<HistoryRecord> {
        let mut matched: Vec<HistoryRecord> = records.filter(|r| self.matches(r)).collect();
        matched.sort_by_key(|r| std::cmp::Reverse(r.timestamp()));
        if let Some(limit) = self.limit {
            matched.truncate(limit);
        }
        matched
    }
}

/// Decision counts over a window
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DecisionStats {
    pub total: usize,
    pub allowed: usize,
    pub denied: usize,
    pub stepped_up: usize,
    /// Audit entries raised
    pub incidents: usize,
    pub trust_events: usize,
    /// Mean risk across decisions
    pub mean_risk: f64,
}

impl DecisionStats {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a HistoryRecord>) -> Self {
        let mut stats = Self::default();
        let mut risk_total = 0.0;

        for record in records {
            match record {
                HistoryRecord::Decision(r) => {
                    stats.total += 1;
                    risk_total += r.risk_score;
                    match r.decision {
                        Verdict::Allow => stats.allowed += 1,
                        Verdict::Deny => stats.denied += 1,
                        Verdict::StepUp => stats.stepped_up += 1,
                    }
                }
                HistoryRecord::Audit(_) => stats.incidents += 1,
                HistoryRecord::Trust(_) => stats.trust_events += 1,
            }
        }

        if stats.total > 0 {
            stats.mean_risk = risk_total / stats.total as f64;
        }
        stats
    }

    /// Share of decisions that were denied, in percent
    pub fn deny_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.denied as f64) / (self.total as f64) * 100.0
    }
}

/// History held in memory
#[derive(Debug, Default)]
pub struct InMemoryHistory {
    records: RwLock<Vec<HistoryRecord>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<HistoryRecord> {
        self.records.read().await.clone()
    }

    pub async fn query(&self, query: &HistoryQuery) -> Vec<HistoryRecord> {
        let records = self.records.read().await;
        query.apply(records.iter().cloned())
    }

    pub async fn stats(&self, since: Option<DateTime<Utc>>) -> DecisionStats {
        let records = self.records.read().await;
        let in_window = |r: &&HistoryRecord| since.map_or(true, |s| r.timestamp() >= s);
        DecisionStats::from_records(records.iter().filter(in_window))
    }
}

#[async_trait]
impl HistorySink for InMemoryHistory {
    async fn record(&self, record: HistoryRecord) -> Result<(), SinkError> {
        self.records.write().await.push(record);
        Ok(())
    }
}

/// Append-only JSON lines file
pub struct JsonlHistorySink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlHistorySink {
    /// History at the default location
    pub fn new() -> Self {
        Self::with_path(Paths::new().history())
    }

    /// Create with custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Most recent records
    pub fn recent(&self, limit: usize) -> Result<Vec<HistoryRecord>> {
        self.query(HistoryQuery::default().limit(limit))
    }

    /// Query with custom filter
    pub fn query(&self, query: HistoryQuery) -> Result<Vec<HistoryRecord>> {
        Ok(query.apply(self.read_all()?.into_iter()))
    }

    pub fn stats(&self, since: Option<DateTime<Utc>>) -> Result<DecisionStats> {
        let mut query = HistoryQuery::default();
        if let Some(since) = since {
            query = query.since(since);
        }
        let records = self.query(query)?;
        Ok(DecisionStats::from_records(&records))
    }

    /// Drop records older than the retention window; returns how many went.
    ///
    /// Lines that do not parse are left in place.
    pub async fn cleanup(&self, retention_days: i64) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        if !self.path.exists() {
            return Ok(0);
        }

        let threshold = Utc::now() - Duration::days(retention_days);
        let content = tokio::fs::read_to_string(&self.path).await?;

        let mut kept = String::with_capacity(content.len());
        let mut removed = 0;

        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<HistoryRecord>(line) {
                Ok(record) if record.timestamp() < threshold => removed += 1,
                _ => {
                    kept.push_str(line);
                    kept.push('\n');
                }
            }
        }

        if removed > 0 {
            tokio::fs::write(&self.path, kept).await?;
        }

        Ok(removed)
    }

    fn read_all(&self) -> Result<Vec<HistoryRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&self.path)?);
        Ok(reader
            .lines()
            .map_while(|line| line.ok())
            .filter_map(|line| serde_json::from_str(&line).ok())
            .collect())
    }
}

impl Default for JsonlHistorySink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HistorySink for JsonlHistorySink {
    async fn record(&self, record: HistoryRecord) -> Result<(), SinkError> {
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
