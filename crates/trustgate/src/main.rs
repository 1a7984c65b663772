//! trustgate - Continuous authorization from the command line
//!
//! "Never trust, always verify. Then verify again."

use anyhow::{bail, Context as _, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use trustgate::{
    audit::{HistoryQuery, JsonlHistorySink, RecordKind},
    config::EngineConfig,
    engine::{AccessRequest, AuthEvent, DecisionEngine},
    level::{AccessLevel, RiskLevel, Verdict},
    policy::{InMemoryPolicyStore, Policy, PolicyScope},
    trust_store::{Identity, StoreSnapshot, TrustStore},
    HistoryRecord,
};
use trustgate_core::{
    format::{relative_time, score_bar, truncate},
    Paths,
};

/// trustgate - Continuous authorization with time-decaying trust
#[derive(Parser)]
#[command(name = "trustgate")]
#[command(version)]
#[command(about = "Continuous authorization with time-decaying trust")]
#[command(long_about = "Continuous authorization with time-decaying trust.\n\n\
    Every request is rescored: behavioural signals, idle time, and recent\n\
    history all feed into a fresh ALLOW / STEP_UP / DENY, and every verdict\n\
    feeds back into the identity's trust.")]
pub struct Cli {
    /// Keep config and state under this directory instead of the user dirs
    #[arg(long, global = true)]
    home: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write default config, sample policies, and sample identities
    Init {
        /// Overwrite existing files
        #[arg(long)]
        force: bool,
    },

    /// Decide an access request
    Decide {
        identity: String,
        resource: String,
        action: String,

        /// Transfer amount
        #[arg(long)]
        amount: Option<f64>,

        /// Device fingerprint presented with the request
        #[arg(long)]
        device: Option<String>,

        /// Session ID
        #[arg(long)]
        session: Option<String>,

        /// Behavioural signal as name=value (repeatable)
        #[arg(long = "signal", value_name = "NAME=VALUE")]
        signals: Vec<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show base and effective trust for an identity
    Trust {
        identity: String,

        /// Adjust base trust by this signed delta
        #[arg(long, allow_hyphen_values = true)]
        adjust: Option<f64>,
    },

    /// Record an authentication event
    Event {
        identity: String,

        /// login-failure, otp-success, step-up, or violation
        kind: String,

        /// Session the step-up was verified for
        #[arg(long)]
        session: Option<String>,
    },

    /// Create or replace an identity
    Provision {
        identity: String,

        #[arg(long, default_value = "0.5")]
        trust: f64,

        /// read, write, or transfer
        #[arg(long, default_value = "read")]
        max_access: String,
    },

    /// Open a session for an identity
    Session { identity: String },

    /// Query decision history
    Audit {
        /// Filter by identity
        #[arg(long)]
        identity: Option<String>,

        /// Show only denied decisions
        #[arg(long)]
        denied: bool,

        /// Show entries since (e.g., "1h", "1d", "1w")
        #[arg(long)]
        since: Option<String>,

        /// Limit number of results
        #[arg(long, default_value = "20")]
        limit: usize,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show decision statistics
    Stats {
        /// Show stats since (e.g., "1h", "1d", "1w")
        #[arg(long)]
        since: Option<String>,
    },

    /// List policy rows
    Policies {
        #[arg(long)]
        json: bool,
    },

    /// List identities and their trust
    Identities {
        #[arg(long)]
        json: bool,
    },

    /// Drop history older than the retention window
    Cleanup {
        #[arg(long, default_value = "30")]
        days: i64,
    },
}

/// Engine plus everything needed to persist it again
struct Workspace {
    paths: Paths,
    engine: DecisionEngine,
    policies: Arc<InMemoryPolicyStore>,
}

impl Workspace {
    fn open(paths: Paths) -> Result<Self> {
        let config = EngineConfig::load_from(&paths.engine_config())?;
        let snapshot = load_snapshot(&paths.identities())?;
        let trust = Arc::new(TrustStore::restore(
            snapshot,
            config.decay_rate,
            config.trust_collapse_threshold,
        ));
        let policies = Arc::new(InMemoryPolicyStore::load_from(&paths.policies())?);
        let sink = Arc::new(JsonlHistorySink::with_path(paths.history()));

        let engine = DecisionEngine::builder(config)
            .trust_store(trust)
            .policy_store(policies.clone())
            .history_sink(sink)
            .build()?;

        Ok(Self {
            paths,
            engine,
            policies,
        })
    }

    fn save(&self) -> Result<()> {
        save_snapshot(&self.paths.identities(), &self.engine.trust_store().snapshot())
    }

    fn history(&self) -> JsonlHistorySink {
        JsonlHistorySink::with_path(self.paths.history())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let paths = match cli.home {
        Some(home) => Paths::rooted(shellexpand::tilde(&home).into_owned()),
        None => Paths::new(),
    };

    match cli.command {
        Commands::Init { force } => cmd_init(&paths, force).await,
        Commands::Decide {
            identity,
            resource,
            action,
            amount,
            device,
            session,
            signals,
            json,
        } => {
            let mut request = AccessRequest::new(&identity, &resource, &action);
            request.metadata.amount = amount;
            request.metadata.device_fingerprint = device;
            request.metadata.session_id = session;
            for raw in signals {
                let (name, value) = parse_signal(&raw)?;
                request.metadata.signals.insert(name, value);
            }
            cmd_decide(Workspace::open(paths)?, request, json).await
        }
        Commands::Trust { identity, adjust } => {
            cmd_trust(Workspace::open(paths)?, &identity, adjust).await
        }
        Commands::Event {
            identity,
            kind,
            session,
        } => cmd_event(Workspace::open(paths)?, &identity, &kind, session).await,
        Commands::Provision {
            identity,
            trust,
            max_access,
        } => cmd_provision(Workspace::open(paths)?, &identity, trust, &max_access),
        Commands::Session { identity } => cmd_session(Workspace::open(paths)?, &identity),
        Commands::Audit {
            identity,
            denied,
            since,
            limit,
            json,
        } => cmd_audit(&paths, identity, denied, since, limit, json),
        Commands::Stats { since } => cmd_stats(&paths, since),
        Commands::Policies { json } => cmd_policies(Workspace::open(paths)?, json).await,
        Commands::Identities { json } => cmd_identities(Workspace::open(paths)?, json),
        Commands::Cleanup { days } => {
            let removed = JsonlHistorySink::with_path(paths.history())
                .cleanup(days)
                .await?;
            println!("Removed {} history records older than {} days", removed, days);
            Ok(())
        }
    }
}

async fn cmd_init(paths: &Paths, force: bool) -> Result<()> {
    let config_path = paths.engine_config();
    if config_path.exists() && !force {
        println!("Config already exists at {:?}", config_path);
        println!("Use --force to overwrite");
        return Ok(());
    }

    EngineConfig::default().save_to(&config_path)?;
    println!("Created default engine config at {:?}", config_path);

    let policies = InMemoryPolicyStore::with_policies(sample_policies());
    policies.save_to(&paths.policies()).await?;
    println!("Created sample policies at {:?}", paths.policies());

    let snapshot = StoreSnapshot {
        identities: vec![
            Identity::new("finance-bot", 0.9, AccessLevel::Transfer),
            Identity::new("support-agent", 0.75, AccessLevel::Write),
            Identity::new("report-reader", 0.6, AccessLevel::Read),
        ],
        sessions: Vec::new(),
    };
    save_snapshot(&paths.identities(), &snapshot)?;
    println!("Created sample identities at {:?}", paths.identities());

    Ok(())
}

fn sample_policies() -> Vec<Policy> {
    vec![
        Policy::new(PolicyScope::All, "transactions", "transfer", Verdict::StepUp)
            .min_trust(0.6)
            .max_risk(RiskLevel::Medium)
            .max_amount(50_000.0),
        Policy::new(
            PolicyScope::identity("finance-bot"),
            "transactions",
            "transfer",
            Verdict::Allow,
        )
        .min_trust(0.7)
        .max_amount(25_000.0)
        .require_mfa()
        .priority(10),
        Policy::new(PolicyScope::All, "files", "delete", Verdict::StepUp).min_trust(0.8),
    ]
}

async fn cmd_decide(workspace: Workspace, request: AccessRequest, json_output: bool) -> Result<()> {
    let outcome = workspace.engine.decide(request).await?;
    workspace.save()?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    println!("Decision: {}", outcome.decision);
    println!("  Reason:  {}", outcome.reason);
    println!("  Pattern: {}", outcome.pattern);
    println!("  Risk:    {} {}", score_bar(outcome.risk_score, 20), outcome.risk_level);
    println!("  Trust:   {}", score_bar(outcome.trust, 20));
    if !outcome.matched_rule_ids.is_empty() {
        println!("  Rules:   {}", outcome.matched_rule_ids.join(", "));
    }
    if let Some(policy) = &outcome.policy_id {
        println!("  Policy:  {}", policy);
    }

    Ok(())
}

async fn cmd_trust(workspace: Workspace, identity_id: &str, adjust: Option<f64>) -> Result<()> {
    if let Some(delta) = adjust {
        let event = workspace.engine.adjust_trust(identity_id, delta).await?;
        workspace.save()?;
        println!(
            "Adjusted {} by {:+.3} -> {:.3}",
            identity_id, delta, event.resulting_score
        );
        return Ok(());
    }

    let store = workspace.engine.trust_store();
    let identity = store
        .identity(identity_id)
        .with_context(|| format!("Unknown identity: {}", identity_id))?;

    println!("Identity: {}", identity.id);
    println!("  Base trust: {}", score_bar(identity.trust_score, 20));
    println!("  Max access: {}", identity.max_access_level);
    println!("  Active:     {}", identity.active);
    if let Some(device) = &identity.device_fingerprint {
        println!("  Device:     {}", truncate(device, 24));
    }

    let sessions = store.sessions_for(identity_id);
    if !sessions.is_empty() {
        println!();
        println!(
            "{:<38} {:<10} {:<8} {:<24} {}",
            "SESSION", "EFFECTIVE", "STEP-UP", "TRUST", "LAST ACTIVITY"
        );
        println!("{}", "-".repeat(100));
        for session in sessions {
            let effective = store.effective_trust(&session.session_id)?;
            let state = if session.revoked { "revoked" } else { "" };
            println!(
                "{:<38} {:<10.3} {:<8} {:<24} {} {}",
                session.session_id,
                effective,
                session.step_up_completed,
                score_bar(effective, 10),
                relative_time(session.last_activity_at),
                state
            );
        }
    }

    Ok(())
}

async fn cmd_event(
    workspace: Workspace,
    identity_id: &str,
    kind: &str,
    session: Option<String>,
) -> Result<()> {
    let event = match kind {
        "login-failure" => AuthEvent::LoginFailure,
        "otp-success" => AuthEvent::OtpSuccess,
        "violation" => AuthEvent::PolicyViolation,
        "step-up" => match session {
            Some(session_id) => AuthEvent::StepUpVerified { session_id },
            None => bail!("step-up needs --session"),
        },
        other => bail!("Unknown event kind: {}", other),
    };

    let trust_event = workspace.engine.record_auth_event(identity_id, event).await?;
    workspace.save()?;
    println!(
        "{} {} ({:+.2}) -> trust {:.3}",
        identity_id, trust_event.reason, trust_event.delta, trust_event.resulting_score
    );
    Ok(())
}

fn cmd_provision(
    workspace: Workspace,
    identity_id: &str,
    trust: f64,
    max_access: &str,
) -> Result<()> {
    let Some(level) = AccessLevel::parse(max_access) else {
        bail!("Unknown access level: {} (use read, write, or transfer)", max_access);
    };
    let mut identity = Identity::new(identity_id, trust, level);
    if let Some(existing) = workspace.engine.trust_store().identity(identity_id) {
        identity.device_fingerprint = existing.device_fingerprint;
    }
    workspace.engine.trust_store().provision(identity.clone());
    workspace.save()?;
    println!(
        "Provisioned {} with trust {:.3}, max access {}",
        identity.id, identity.trust_score, identity.max_access_level
    );
    Ok(())
}

fn cmd_session(workspace: Workspace, identity_id: &str) -> Result<()> {
    let session = workspace.engine.trust_store().open_session(identity_id)?;
    workspace.save()?;
    println!("{}", session.session_id);
    Ok(())
}

fn cmd_audit(
    paths: &Paths,
    identity: Option<String>,
    denied: bool,
    since: Option<String>,
    limit: usize,
    json_output: bool,
) -> Result<()> {
    let history = JsonlHistorySink::with_path(paths.history());

    let mut query = HistoryQuery::default()
        .kind(RecordKind::Decision)
        .limit(limit);

    if let Some(id) = identity {
        query = query.identity(&id);
    }

    if denied {
        query = query.decision(Verdict::Deny);
    }

    if let Some(since_str) = since {
        query = query.since(parse_duration(&since_str)?);
    }

    let records = history.query(query)?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    println!(
        "{:<18} {:<16} {:<9} {:<22} {:<6} {}",
        "TIMESTAMP", "IDENTITY", "DECISION", "REQUEST", "RISK", "REASON"
    );
    println!("{}", "-".repeat(90));

    for record in records {
        let HistoryRecord::Decision(r) = record else {
            continue;
        };
        let request = format!("{} {}", r.action, r.resource);
        println!(
            "{:<18} {:<16} {:<9} {:<22} {:<6.2} {}",
            r.timestamp.format("%Y-%m-%d %H:%M"),
            truncate(&r.identity_id, 16),
            r.decision,
            truncate(&request, 22),
            r.risk_score,
            r.reason
        );
    }

    Ok(())
}

fn cmd_stats(paths: &Paths, since: Option<String>) -> Result<()> {
    let history = JsonlHistorySink::with_path(paths.history());

    let since_time = match since {
        Some(s) => Some(parse_duration(&s)?),
        None => None,
    };

    let stats = history.stats(since_time)?;

    println!("Decision Statistics");
    println!("{}", "=".repeat(40));
    println!();
    println!("Total decisions: {}", stats.total);
    println!("  Allowed:   {}", stats.allowed);
    println!("  Stepped up: {}", stats.stepped_up);
    println!("  Denied:    {}", stats.denied);
    println!();
    println!("Incidents:     {}", stats.incidents);
    println!("Trust events:  {}", stats.trust_events);
    println!("Mean risk:     {}", score_bar(stats.mean_risk, 20));
    println!();
    println!("Deny rate: {:.1}%", stats.deny_rate());

    Ok(())
}

async fn cmd_policies(workspace: Workspace, json_output: bool) -> Result<()> {
    let policies = workspace.policies.list().await;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&policies)?);
        return Ok(());
    }

    if policies.is_empty() {
        println!("No policies (run `trustgate init` for samples)");
        return Ok(());
    }

    println!(
        "{:<16} {:<14} {:<10} {:<8} {:<6} {:<7} {:<10} {:<4} {}",
        "SCOPE", "RESOURCE", "ACTION", "EFFECT", "TRUST", "RISK", "AMOUNT", "MFA", "PRIO"
    );
    println!("{}", "-".repeat(90));

    for policy in policies {
        let amount = policy
            .max_amount
            .map(|a| format!("{:.0}", a))
            .unwrap_or_else(|| "-".to_string());
        let scope = if policy.active {
            policy.scope.to_string()
        } else {
            format!("{} (off)", policy.scope)
        };
        println!(
            "{:<16} {:<14} {:<10} {:<8} {:<6.2} {:<7} {:<10} {:<4} {}",
            truncate(&scope, 16),
            policy.resource,
            policy.action,
            policy.effect,
            policy.min_trust,
            policy.max_risk,
            amount,
            if policy.require_mfa { "yes" } else { "no" },
            policy.priority
        );
    }

    Ok(())
}

fn cmd_identities(workspace: Workspace, json_output: bool) -> Result<()> {
    let identities = workspace.engine.trust_store().identities();

    if json_output {
        println!("{}", serde_json::to_string_pretty(&identities)?);
        return Ok(());
    }

    if identities.is_empty() {
        println!("No identities (run `trustgate init` for samples)");
        return Ok(());
    }

    let history = workspace.history();
    println!(
        "{:<20} {:<24} {:<10} {:<8} {}",
        "ID", "TRUST", "ACCESS", "ACTIVE", "LAST DECISION"
    );
    println!("{}", "-".repeat(80));

    for identity in identities {
        let last = history
            .query(
                HistoryQuery::default()
                    .identity(&identity.id)
                    .kind(RecordKind::Decision)
                    .limit(1),
            )?
            .first()
            .map(|r| relative_time(r.timestamp()))
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{:<20} {:<24} {:<10} {:<8} {}",
            truncate(&identity.id, 20),
            score_bar(identity.trust_score, 10),
            identity.max_access_level,
            identity.active,
            last
        );
    }

    Ok(())
}

fn load_snapshot(path: &Path) -> Result<StoreSnapshot> {
    if !path.exists() {
        return Ok(StoreSnapshot::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read identities from {:?}", path))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse identities from {:?}", path))
}

fn save_snapshot(path: &Path, snapshot: &StoreSnapshot) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(snapshot)?;
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write identities to {:?}", path))?;
    Ok(())
}

/// Parse `name=value`; numeric values become numbers, anything else is left
/// for the engine to coerce
fn parse_signal(raw: &str) -> Result<(String, Value)> {
    let Some((name, value)) = raw.split_once('=') else {
        bail!("Signal must look like name=value, got {:?}", raw);
    };
    let value = match value.trim().parse::<f64>() {
        Ok(number) => serde_json::json!(number),
        Err(_) => Value::String(value.trim().to_string()),
    };
    Ok((name.trim().to_string(), value))
}

/// Parse a duration string like "1h", "1d", "1w" into a DateTime
fn parse_duration(s: &str) -> Result<DateTime<Utc>> {
    let s = s.trim();
    if s.len() < 2 {
        bail!("Duration must look like 30m, 1h, 1d, or 1w");
    }
    let (num, unit) = s.split_at(s.len() - 1);
    let num: i64 = num.parse()?;

    let duration = match unit {
        "h" => Duration::hours(num),
        "d" => Duration::days(num),
        "w" => Duration::weeks(num),
        "m" => Duration::minutes(num),
        _ => bail!("Unknown duration unit: {}", unit),
    };

    Ok(Utc::now() - duration)
}
