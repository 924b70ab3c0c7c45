use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{TimerInstance, TimerSpec};

/// Outcome reported by a downstream executor when it acknowledges a fired
/// timer.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SettleOutcome {
    Success,
    Failure { reason: String },
}

/// A durable command. These four kinds are the only mutations the write-ahead
/// log carries; everything else the kernel does is derived state.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimerCommand {
    Schedule {
        timer: TimerInstance,
    },
    Cancel {
        tenant_id: String,
        timer_id: Uuid,
        cancelled_by: Option<String>,
        reason: Option<String>,
        at: DateTime<Utc>,
    },
    Fire {
        tenant_id: String,
        timer_id: Uuid,
        at: DateTime<Utc>,
    },
    Settle {
        tenant_id: String,
        timer_id: Uuid,
        outcome: SettleOutcome,
        at: DateTime<Utc>,
    },
}

impl TimerCommand {
    pub fn timer_id(&self) -> Uuid {
        match self {
            TimerCommand::Schedule { timer } => timer.id,
            TimerCommand::Cancel { timer_id, .. } => *timer_id,
            TimerCommand::Fire { timer_id, .. } => *timer_id,
            TimerCommand::Settle { timer_id, .. } => *timer_id,
        }
    }

    pub fn tenant_id(&self) -> &str {
        match self {
            TimerCommand::Schedule { timer } => &timer.tenant_id,
            TimerCommand::Cancel { tenant_id, .. } => tenant_id,
            TimerCommand::Fire { tenant_id, .. } => tenant_id,
            TimerCommand::Settle { tenant_id, .. } => tenant_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TimerCommand::Schedule { .. } => "schedule",
            TimerCommand::Cancel { .. } => "cancel",
            TimerCommand::Fire { .. } => "fire",
            TimerCommand::Settle { .. } => "settle",
        }
    }
}

/// A committed log entry. `sequence` is assigned by the leader immediately
/// before the write-ahead append and totally orders all commands.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandEntry {
    pub sequence: u64,
    pub command: TimerCommand,
    pub received_at: DateTime<Utc>,
    pub signature: String,
}

/// Canonical hash of the client-visible schedule payload, used to decide
/// whether a repeated schedule is an idempotent retry or a conflict. The hash
/// deliberately excludes kernel-computed instants (`created_at`, a `fire_at`
/// derived from a relative duration) so retries of the same request collide.
pub fn schedule_payload_hash(spec: &TimerSpec) -> String {
    let mut hasher = Sha256::new();
    let mut feed = |label: &str, value: &str| {
        hasher.update(label.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\x1f");
    };

    feed("tenant_id", &spec.tenant_id);
    feed("requested_by", &spec.requested_by);
    if let Some(name) = &spec.name {
        feed("name", name);
    }
    feed("duration_ms", &spec.duration_ms.to_string());
    if let Some(fire_at) = &spec.fire_at {
        feed("fire_at", &fire_at.to_rfc3339());
    }
    if let Some(client_timer_id) = &spec.client_timer_id {
        feed("client_timer_id", client_timer_id);
    }

    // Labels are a HashMap; order them before hashing.
    let mut labels: Vec<_> = spec.labels.iter().collect();
    labels.sort();
    for (key, value) in labels {
        feed("label", &format!("{key}:{value}"));
    }

    // serde_json maps are BTree-backed, so Value serialization is stable.
    if let Some(metadata) = &spec.metadata {
        feed("metadata", &metadata.to_string());
    }
    if let Some(bundle) = &spec.action_bundle {
        feed(
            "action_bundle",
            &serde_json::to_string(bundle).unwrap_or_default(),
        );
    }
    if let Some(binding) = &spec.agent_binding {
        feed(
            "agent_binding",
            &serde_json::to_string(binding).unwrap_or_default(),
        );
    }
    if let Some(policy) = &spec.jitter_policy {
        feed(
            "jitter_policy",
            &serde_json::to_string(policy).unwrap_or_default(),
        );
    }
    if let Some(graph) = &spec.temporal_graph {
        feed(
            "temporal_graph",
            &serde_json::to_string(graph).unwrap_or_default(),
        );
    }

    hex::encode(hasher.finalize())
}
