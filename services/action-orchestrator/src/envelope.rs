use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_VERSION: &str = "v1-hmac-sha256";

/// The kernel's signed lifecycle envelope as it arrives on the wire. The
/// nested event stays opaque JSON; the orchestrator only digs out the timer
/// snapshot and its action bundle.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub bus_sequence: u64,
    pub tenant_id: String,
    pub timer_id: Uuid,
    pub kind: String,
    pub occurred_at: DateTime<Utc>,
    pub state_version: u64,
    #[serde(default)]
    pub drift_ms: Option<i64>,
    pub event: serde_json::Value,
    pub signature: String,
    pub signature_version: String,
}

impl EventEnvelope {
    /// Recompute the kernel's canonical signature and compare in constant
    /// time. Envelopes that fail this check are never executed.
    pub fn verify(&self, secret: &[u8]) -> bool {
        if self.signature_version != SIGNATURE_VERSION {
            return false;
        }
        let mut pairs = vec![
            format!("event_id={}", self.event_id),
            format!("tenant_id={}", self.tenant_id),
            format!("timer_id={}", self.timer_id),
            format!("kind={}", self.kind),
            format!("occurred_at={}", self.occurred_at.to_rfc3339()),
            format!("state_version={}", self.state_version),
        ];
        pairs.sort();
        let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
        mac.update(pairs.join("\n").as_bytes());
        let expected = hex::encode(mac.finalize().into_bytes());
        expected
            .as_bytes()
            .ct_eq(self.signature.as_bytes())
            .unwrap_u8()
            == 1
    }

    /// The timer snapshot inside the event: `data` for single-timer variants,
    /// `data.timer` for the struct variants (Cancelled, Failed).
    pub fn timer_snapshot(&self) -> Option<&serde_json::Value> {
        let data = self.event.get("data")?;
        if data.get("timer").is_some() {
            data.get("timer")
        } else {
            Some(data)
        }
    }

    pub fn timer_name(&self) -> String {
        self.timer_snapshot()
            .and_then(|timer| timer.get("name"))
            .and_then(|name| name.as_str())
            .unwrap_or("unnamed")
            .to_string()
    }

    pub fn action_bundle(&self) -> Option<ActionBundle> {
        let bundle = self.timer_snapshot()?.get("actionBundle")?.clone();
        serde_json::from_value(bundle).ok()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionBundle {
    pub actions: Vec<TimerAction>,
    #[serde(default)]
    pub concurrency: Option<u32>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerAction {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_initial_ms: u64,
    pub backoff_multiplier: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"minoots-insecure-dev-secret";

    fn signed_envelope() -> EventEnvelope {
        // Mirror of the kernel's canonical scheme, built by hand so the test
        // stands alone on the wire contract.
        let event_id = Uuid::parse_str("11111111-2222-3333-4444-555555555555").expect("uuid");
        let timer_id = Uuid::parse_str("aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee").expect("uuid");
        let occurred_at: DateTime<Utc> = "2025-06-01T12:00:00Z".parse().expect("timestamp");

        let mut pairs = vec![
            format!("event_id={event_id}"),
            "tenant_id=tenant-a".to_string(),
            format!("timer_id={timer_id}"),
            "kind=timer.fired".to_string(),
            format!("occurred_at={}", occurred_at.to_rfc3339()),
            "state_version=2".to_string(),
        ];
        pairs.sort();
        let mut mac = HmacSha256::new_from_slice(SECRET).expect("hmac key");
        mac.update(pairs.join("\n").as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        EventEnvelope {
            event_id,
            bus_sequence: 7,
            tenant_id: "tenant-a".into(),
            timer_id,
            kind: "timer.fired".into(),
            occurred_at,
            state_version: 2,
            drift_ms: Some(12),
            event: serde_json::json!({
                "type": "Fired",
                "data": {
                    "name": "invoice-reminder",
                    "actionBundle": {
                        "actions": [
                            {
                                "id": "webhook-primary",
                                "kind": "webhook",
                                "parameters": { "url": "https://example.test/hook" }
                            }
                        ],
                        "retryPolicy": {
                            "maxAttempts": 3,
                            "backoffInitialMs": 100,
                            "backoffMultiplier": 2.0
                        }
                    }
                }
            }),
            signature,
            signature_version: SIGNATURE_VERSION.into(),
        }
    }

    #[test]
    fn valid_signatures_verify() {
        assert!(signed_envelope().verify(SECRET));
    }

    #[test]
    fn tampered_envelopes_fail_verification() {
        let mut envelope = signed_envelope();
        envelope.tenant_id = "tenant-b".into();
        assert!(!envelope.verify(SECRET));

        let mut wrong_version = signed_envelope();
        wrong_version.signature_version = "v0-none".into();
        assert!(!wrong_version.verify(SECRET));

        assert!(!signed_envelope().verify(b"some-other-secret"));
    }

    #[test]
    fn action_bundles_are_extracted_from_the_snapshot() {
        let envelope = signed_envelope();
        assert_eq!(envelope.timer_name(), "invoice-reminder");
        let bundle = envelope.action_bundle().expect("bundle present");
        assert_eq!(bundle.actions.len(), 1);
        assert_eq!(bundle.actions[0].kind, "webhook");
        assert_eq!(
            bundle.actions[0].parameters["url"],
            serde_json::json!("https://example.test/hook")
        );
        let retry = bundle.retry_policy.expect("retry policy");
        assert_eq!(retry.max_attempts, 3);
    }

    #[test]
    fn cancelled_envelopes_expose_the_nested_timer() {
        let mut envelope = signed_envelope();
        envelope.event = serde_json::json!({
            "type": "Cancelled",
            "data": {
                "timer": { "name": "wrapped" },
                "reason": "user"
            }
        });
        assert_eq!(envelope.timer_name(), "wrapped");
    }
}
