use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::command::{schedule_payload_hash, SettleOutcome, TimerCommand};
use crate::jitter::draw_offset_ms;
use crate::policy::{
    PolicyStore, Principal, PERM_TIMER_CANCEL, PERM_TIMER_READ, PERM_TIMER_SETTLE,
    PERM_TIMER_WRITE,
};
use crate::signing::EventSigner;
use crate::{KernelError, TimerInstance, TimerSpec, TimerStatus};

/// Serialized size cap for each opaque payload tree.
const MAX_PAYLOAD_BYTES: usize = 64 * 1024;
/// Nesting cap for opaque payload trees.
const MAX_PAYLOAD_DEPTH: usize = 16;
const MAX_LABELS: usize = 64;
const MAX_LABEL_LEN: usize = 256;

/// A command the gate has authenticated, quota-checked and signed. Downstream
/// stages treat it as authoritative and never re-reject for policy reasons.
#[derive(Clone, Debug)]
pub struct SignedCommand {
    pub command: TimerCommand,
    pub tenant_id: String,
    pub principal_id: String,
    pub request_id: Uuid,
    pub issued_at: DateTime<Utc>,
    pub signature: String,
}

/// The only component allowed to reject a command for authorization or quota
/// reasons. Resolves api keys, checks permissions, enforces quotas
/// transactionally, normalises durations and signs the command envelope.
pub struct AdmissionGate {
    policies: Arc<PolicyStore>,
    signer: Arc<EventSigner>,
    max_duration_ms: Option<u64>,
}

impl AdmissionGate {
    pub fn new(
        policies: Arc<PolicyStore>,
        signer: Arc<EventSigner>,
        max_duration_ms: Option<u64>,
    ) -> Self {
        Self {
            policies,
            signer,
            max_duration_ms,
        }
    }

    pub fn policies(&self) -> &Arc<PolicyStore> {
        &self.policies
    }

    pub fn authenticate(&self, tenant_id: &str, api_key: &str) -> Result<Principal, KernelError> {
        self.policies.authenticate(tenant_id, api_key)
    }

    pub fn authorize_read(&self, principal: &Principal) -> Result<(), KernelError> {
        self.policies.authorize(principal, PERM_TIMER_READ)
    }

    /// Admit a schedule request: permission, validation, quota reservation,
    /// jitter draw, then the signed command. On success the quota reservation
    /// is held; the caller releases it if the commit fails or collapses onto
    /// an existing timer.
    pub fn admit_schedule(
        &self,
        principal: &Principal,
        spec: &TimerSpec,
        now: DateTime<Utc>,
    ) -> Result<SignedCommand, KernelError> {
        self.policies.authorize(principal, PERM_TIMER_WRITE)?;
        if spec.tenant_id != principal.tenant_id {
            return Err(KernelError::PermissionDenied(
                "tenant mismatch for schedule request".into(),
            ));
        }
        if spec.requested_by.is_empty() {
            return Err(KernelError::Validation("requested_by is required".into()));
        }

        // Normalise the two ways of expressing the deadline into both fields.
        let (duration_ms, fire_at) = match spec.fire_at {
            Some(fire_at) => {
                if fire_at <= now {
                    return Err(KernelError::Validation(
                        "fire_at must be in the future".into(),
                    ));
                }
                let duration = fire_at
                    .signed_duration_since(now)
                    .num_milliseconds()
                    .max(1) as u64;
                (duration, fire_at)
            }
            None => {
                if spec.duration_ms == 0 {
                    return Err(KernelError::Validation(
                        "duration must be greater than zero".into(),
                    ));
                }
                (
                    spec.duration_ms,
                    now + chrono::Duration::milliseconds(spec.duration_ms as i64),
                )
            }
        };
        if let Some(max) = self.max_duration_ms {
            if duration_ms > max {
                return Err(KernelError::Validation(format!(
                    "duration exceeds the maximum of {max}ms"
                )));
            }
        }

        if spec.labels.len() > MAX_LABELS {
            return Err(KernelError::Validation(format!(
                "at most {MAX_LABELS} labels are allowed"
            )));
        }
        for (key, value) in &spec.labels {
            if key.len() > MAX_LABEL_LEN || value.len() > MAX_LABEL_LEN {
                return Err(KernelError::Validation(format!(
                    "label entries are capped at {MAX_LABEL_LEN} bytes"
                )));
            }
        }
        if let Some(metadata) = &spec.metadata {
            check_payload_bounds("metadata", metadata)?;
        }
        if let Some(bundle) = &spec.action_bundle {
            let as_value = serde_json::to_value(bundle)
                .map_err(|err| KernelError::Validation(format!("invalid action bundle: {err}")))?;
            check_payload_bounds("action_bundle", &as_value)?;
        }
        if let Some(binding) = &spec.agent_binding {
            let as_value = serde_json::to_value(binding)
                .map_err(|err| KernelError::Validation(format!("invalid agent binding: {err}")))?;
            check_payload_bounds("agent_binding", &as_value)?;
        }

        // Quota checks and increments happen under one policy-store lock.
        self.policies.reserve_schedule(&spec.tenant_id, now)?;

        let jitter_offset_ms = spec
            .jitter_policy
            .as_ref()
            .map(|policy| draw_offset_ms(policy, &mut rand::thread_rng()))
            .unwrap_or(0);

        let mut normalized = spec.clone();
        normalized.duration_ms = duration_ms;
        let timer = TimerInstance {
            id: Uuid::new_v4(),
            tenant_id: spec.tenant_id.clone(),
            requested_by: spec.requested_by.clone(),
            name: spec
                .name
                .clone()
                .unwrap_or_else(|| format!("timer-{}", now.timestamp_millis())),
            duration_ms,
            created_at: now,
            fire_at,
            status: TimerStatus::Scheduled,
            metadata: spec.metadata.clone(),
            labels: spec.labels.clone(),
            action_bundle: spec.action_bundle.clone(),
            agent_binding: spec.agent_binding.clone(),
            jitter_policy: spec.jitter_policy.clone(),
            jitter_offset_ms,
            temporal_graph: spec.temporal_graph.clone(),
            graph_root_id: spec.graph_root_id,
            graph_node_id: spec.graph_node_id.clone(),
            client_timer_id: spec.client_timer_id.clone(),
            payload_hash: schedule_payload_hash(&normalized),
            state_version: 1,
            fired_at: None,
            cancelled_at: None,
            settled_at: None,
            cancel_reason: None,
            cancelled_by: None,
            failure_reason: None,
        };

        Ok(self.sign(
            TimerCommand::Schedule { timer },
            &spec.tenant_id,
            &principal.principal_id,
            now,
        ))
    }

    pub fn admit_cancel(
        &self,
        principal: &Principal,
        timer_id: Uuid,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<SignedCommand, KernelError> {
        self.policies.authorize(principal, PERM_TIMER_CANCEL)?;
        self.policies.record_cancel(&principal.tenant_id, now)?;
        Ok(self.sign(
            TimerCommand::Cancel {
                tenant_id: principal.tenant_id.clone(),
                timer_id,
                cancelled_by: Some(principal.principal_id.clone()),
                reason,
                at: now,
            },
            &principal.tenant_id,
            &principal.principal_id,
            now,
        ))
    }

    pub fn admit_settle(
        &self,
        principal: &Principal,
        timer_id: Uuid,
        outcome: SettleOutcome,
        now: DateTime<Utc>,
    ) -> Result<SignedCommand, KernelError> {
        self.policies.authorize(principal, PERM_TIMER_SETTLE)?;
        Ok(self.sign(
            TimerCommand::Settle {
                tenant_id: principal.tenant_id.clone(),
                timer_id,
                outcome,
                at: now,
            },
            &principal.tenant_id,
            &principal.principal_id,
            now,
        ))
    }

    /// Sign a kernel-originated command (wheel fires, temporal-graph child
    /// schedules). These bypass quota but still travel signed.
    pub fn sign_internal(&self, command: TimerCommand, now: DateTime<Utc>) -> SignedCommand {
        let tenant = command.tenant_id().to_string();
        self.sign(command, &tenant, "kernel", now)
    }

    fn sign(
        &self,
        command: TimerCommand,
        tenant_id: &str,
        principal_id: &str,
        issued_at: DateTime<Utc>,
    ) -> SignedCommand {
        let request_id = Uuid::new_v4();
        let signature = self.signer.sign_pairs(&signature_pairs(
            &command,
            tenant_id,
            principal_id,
            request_id,
            issued_at,
        ));
        SignedCommand {
            command,
            tenant_id: tenant_id.to_string(),
            principal_id: principal_id.to_string(),
            request_id,
            issued_at,
            signature,
        }
    }

    /// Downstream stages re-check provenance before appending to the log.
    pub fn verify(&self, signed: &SignedCommand) -> bool {
        self.signer.verify_pairs(
            &signature_pairs(
                &signed.command,
                &signed.tenant_id,
                &signed.principal_id,
                signed.request_id,
                signed.issued_at,
            ),
            &signed.signature,
        )
    }

    pub fn release_reservation(&self, tenant_id: &str) {
        self.policies.release_reservation(tenant_id);
    }

    pub fn release_active(&self, tenant_id: &str) {
        self.policies.release_active(tenant_id);
    }
}

fn signature_pairs(
    command: &TimerCommand,
    tenant_id: &str,
    principal_id: &str,
    request_id: Uuid,
    issued_at: DateTime<Utc>,
) -> Vec<(&'static str, String)> {
    vec![
        ("command_kind", command.kind().to_string()),
        ("timer_id", command.timer_id().to_string()),
        ("tenant_id", tenant_id.to_string()),
        ("principal_id", principal_id.to_string()),
        ("request_id", request_id.to_string()),
        ("issued_at", issued_at.to_rfc3339()),
    ]
}

/// Parse the external duration syntax: a bare integer is milliseconds,
/// otherwise `^\d+(ms|s|m|h|d)$`, case-insensitive.
pub fn parse_duration_ms(text: &str) -> Result<u64, KernelError> {
    let trimmed = text.trim().to_ascii_lowercase();
    if trimmed.is_empty() {
        return Err(KernelError::Validation("duration must not be empty".into()));
    }

    let digits_end = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, suffix) = trimmed.split_at(digits_end);
    let value: u64 = digits.parse().map_err(|_| {
        KernelError::Validation(format!("invalid duration '{text}': missing numeric part"))
    })?;

    let multiplier = match suffix {
        "" | "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        other => {
            return Err(KernelError::Validation(format!(
                "invalid duration unit '{other}', expected ms|s|m|h|d"
            )))
        }
    };

    value
        .checked_mul(multiplier)
        .ok_or_else(|| KernelError::Validation(format!("duration '{text}' overflows")))
}

fn check_payload_bounds(label: &str, value: &Value) -> Result<(), KernelError> {
    let serialized = value.to_string();
    if serialized.len() > MAX_PAYLOAD_BYTES {
        return Err(KernelError::Validation(format!(
            "{label} exceeds {MAX_PAYLOAD_BYTES} serialized bytes"
        )));
    }
    if depth_of(value) > MAX_PAYLOAD_DEPTH {
        return Err(KernelError::Validation(format!(
            "{label} exceeds the nesting depth of {MAX_PAYLOAD_DEPTH}"
        )));
    }
    Ok(())
}

fn depth_of(value: &Value) -> usize {
    match value {
        Value::Array(items) => 1 + items.iter().map(depth_of).max().unwrap_or(0),
        Value::Object(map) => 1 + map.values().map(depth_of).max().unwrap_or(0),
        _ => 1,
    }
}
