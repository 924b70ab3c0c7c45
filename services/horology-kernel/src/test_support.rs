//! Shared fixtures for unit and integration tests.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::admission::AdmissionGate;
use crate::command::{schedule_payload_hash, CommandEntry, SettleOutcome, TimerCommand};
use crate::policy::{ApiKeyRecord, PolicyStore, Principal, QuotaConfig, TenantPolicy};
use crate::signing::EventSigner;
use crate::{TimerInstance, TimerSpec, TimerStatus};

pub fn schedule_spec(tenant_id: &str, duration_ms: u64) -> TimerSpec {
    let mut spec = TimerSpec::new(tenant_id, "test-agent", duration_ms);
    spec.name = Some("test-timer".into());
    spec
}

/// A freshly admitted timer the way the gate would build it.
pub fn sample_timer(tenant_id: &str) -> TimerInstance {
    let spec = schedule_spec(tenant_id, 1_000);
    let now = Utc::now();
    TimerInstance {
        id: Uuid::new_v4(),
        tenant_id: tenant_id.to_string(),
        requested_by: spec.requested_by.clone(),
        name: spec.name.clone().unwrap_or_default(),
        duration_ms: spec.duration_ms,
        created_at: now,
        fire_at: now + chrono::Duration::milliseconds(spec.duration_ms as i64),
        status: TimerStatus::Scheduled,
        metadata: None,
        labels: Default::default(),
        action_bundle: None,
        agent_binding: None,
        jitter_policy: None,
        jitter_offset_ms: 0,
        temporal_graph: None,
        graph_root_id: None,
        graph_node_id: None,
        client_timer_id: None,
        payload_hash: schedule_payload_hash(&spec),
        state_version: 1,
        fired_at: None,
        cancelled_at: None,
        settled_at: None,
        cancel_reason: None,
        cancelled_by: None,
        failure_reason: None,
    }
}

pub fn schedule_entry(sequence: u64, timer: TimerInstance) -> CommandEntry {
    CommandEntry {
        sequence,
        received_at: timer.created_at,
        signature: String::new(),
        command: TimerCommand::Schedule { timer },
    }
}

pub fn cancel_entry(sequence: u64, timer: &TimerInstance, reason: Option<String>) -> CommandEntry {
    CommandEntry {
        sequence,
        received_at: Utc::now(),
        signature: String::new(),
        command: TimerCommand::Cancel {
            tenant_id: timer.tenant_id.clone(),
            timer_id: timer.id,
            cancelled_by: Some("test-agent".into()),
            reason,
            at: Utc::now(),
        },
    }
}

pub fn fire_entry(sequence: u64, timer: &TimerInstance) -> CommandEntry {
    CommandEntry {
        sequence,
        received_at: Utc::now(),
        signature: String::new(),
        command: TimerCommand::Fire {
            tenant_id: timer.tenant_id.clone(),
            timer_id: timer.id,
            at: Utc::now(),
        },
    }
}

pub fn settle_entry(sequence: u64, timer: &TimerInstance, outcome: SettleOutcome) -> CommandEntry {
    CommandEntry {
        sequence,
        received_at: Utc::now(),
        signature: String::new(),
        command: TimerCommand::Settle {
            tenant_id: timer.tenant_id.clone(),
            timer_id: timer.id,
            outcome,
            at: Utc::now(),
        },
    }
}

pub fn tenant_policy(tenant_id: &str, api_key: &str, daily_limit: u32) -> TenantPolicy {
    TenantPolicy {
        tenant_id: tenant_id.to_string(),
        api_keys: vec![ApiKeyRecord {
            key_id: format!("{tenant_id}-key"),
            secret: api_key.to_string(),
            principal_id: format!("{tenant_id}-principal"),
            roles: vec!["admin".into()],
            active: true,
        }],
        quotas: QuotaConfig {
            daily_timer_limit: daily_limit,
            ..QuotaConfig::default()
        },
    }
}

/// Gate over a seeded single-tenant policy store, plus the authenticated
/// principal for that tenant.
pub fn seeded_gate(tenant_id: &str, daily_limit: u32) -> (AdmissionGate, Principal) {
    let store = Arc::new(PolicyStore::seeded(vec![tenant_policy(
        tenant_id, "test-key", daily_limit,
    )]));
    let gate = AdmissionGate::new(store.clone(), Arc::new(EventSigner::insecure_dev()), None);
    let principal = store
        .authenticate(tenant_id, "test-key")
        .expect("seeded key authenticates");
    (gate, principal)
}
