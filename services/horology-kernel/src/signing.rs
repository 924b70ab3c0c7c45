use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::events::{derive_event_id, EventEnvelope, TimerEvent};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_VERSION: &str = "v1-hmac-sha256";

const DEV_SECRET: &[u8] = b"minoots-insecure-dev-secret";

/// HMAC signer shared by the admission gate (command envelopes) and the event
/// bus (lifecycle envelopes). Downstream consumers hold the same secret and
/// verify provenance before acting.
#[derive(Clone)]
pub struct EventSigner {
    key: Vec<u8>,
}

impl EventSigner {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: secret.to_vec(),
        }
    }

    /// Development-only secret for local runs and tests.
    pub fn insecure_dev() -> Self {
        Self::new(DEV_SECRET)
    }

    fn hmac_hex(&self, payload: &[u8]) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Sign canonical `key=value` pairs. Pairs are sorted before hashing so
    /// the caller does not have to care about ordering.
    pub fn sign_pairs(&self, pairs: &[(&str, String)]) -> String {
        let mut sorted: Vec<_> = pairs
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        sorted.sort();
        self.hmac_hex(sorted.join("\n").as_bytes())
    }

    pub fn verify_pairs(&self, pairs: &[(&str, String)], signature: &str) -> bool {
        let expected = self.sign_pairs(pairs);
        expected.as_bytes().ct_eq(signature.as_bytes()).unwrap_u8() == 1
    }

    /// Wrap a lifecycle event into a signed envelope. `event_id` is derived
    /// from `(tenant, timer, state_version, kind)` so a log replay regenerates
    /// the same ids.
    pub fn sign_event(
        &self,
        event: TimerEvent,
        bus_sequence: u64,
        drift_ms: Option<i64>,
    ) -> EventEnvelope {
        let timer = event.timer();
        let tenant_id = timer.tenant_id.clone();
        let timer_id = timer.id;
        let state_version = timer.state_version;
        let kind = event.topic().to_string();
        let occurred_at = event.occurred_at();
        let event_id = derive_event_id(&tenant_id, timer_id, state_version, &kind);

        let signature = self.event_signature(
            event_id,
            &tenant_id,
            timer_id,
            &kind,
            occurred_at,
            state_version,
        );

        EventEnvelope {
            event_id,
            bus_sequence,
            tenant_id,
            timer_id,
            kind,
            occurred_at,
            state_version,
            drift_ms,
            event,
            signature,
            signature_version: SIGNATURE_VERSION.to_string(),
        }
    }

    pub fn verify_event(&self, envelope: &EventEnvelope) -> bool {
        if envelope.signature_version != SIGNATURE_VERSION {
            return false;
        }
        let expected = self.event_signature(
            envelope.event_id,
            &envelope.tenant_id,
            envelope.timer_id,
            &envelope.kind,
            envelope.occurred_at,
            envelope.state_version,
        );
        expected
            .as_bytes()
            .ct_eq(envelope.signature.as_bytes())
            .unwrap_u8()
            == 1
    }

    fn event_signature(
        &self,
        event_id: Uuid,
        tenant_id: &str,
        timer_id: Uuid,
        kind: &str,
        occurred_at: DateTime<Utc>,
        state_version: u64,
    ) -> String {
        self.sign_pairs(&[
            ("event_id", event_id.to_string()),
            ("tenant_id", tenant_id.to_string()),
            ("timer_id", timer_id.to_string()),
            ("kind", kind.to_string()),
            ("occurred_at", occurred_at.to_rfc3339()),
            ("state_version", state_version.to_string()),
        ])
    }
}
