use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::signing::EventSigner;
use crate::TimerInstance;

pub mod jetstream;

/// Lifecycle event emitted by the state machine on every transition.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum TimerEvent {
    Scheduled(TimerInstance),
    Armed(TimerInstance),
    Fired(TimerInstance),
    Cancelled {
        timer: TimerInstance,
        reason: Option<String>,
    },
    Failed {
        timer: TimerInstance,
        reason: Option<String>,
    },
    Settled(TimerInstance),
}

impl TimerEvent {
    pub fn timer(&self) -> &TimerInstance {
        match self {
            TimerEvent::Scheduled(timer)
            | TimerEvent::Armed(timer)
            | TimerEvent::Fired(timer)
            | TimerEvent::Settled(timer) => timer,
            TimerEvent::Cancelled { timer, .. } | TimerEvent::Failed { timer, .. } => timer,
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.timer().tenant_id
    }

    pub fn topic(&self) -> &'static str {
        match self {
            TimerEvent::Scheduled(_) => "timer.scheduled",
            TimerEvent::Armed(_) => "timer.armed",
            TimerEvent::Fired(_) => "timer.fired",
            TimerEvent::Cancelled { .. } => "timer.cancelled",
            TimerEvent::Failed { .. } => "timer.failed",
            TimerEvent::Settled(_) => "timer.settled",
        }
    }

    /// The instant the transition took effect. Sourced from the timestamps
    /// the command carried so a replayed log reproduces the same envelope,
    /// except for `Armed`, which is volatile scheduling state.
    pub fn occurred_at(&self) -> DateTime<Utc> {
        let timer = self.timer();
        match self {
            TimerEvent::Scheduled(_) => timer.created_at,
            TimerEvent::Armed(_) => Utc::now(),
            TimerEvent::Fired(_) => timer.fired_at.unwrap_or(timer.created_at),
            TimerEvent::Cancelled { .. } => timer.cancelled_at.unwrap_or(timer.created_at),
            TimerEvent::Failed { .. } | TimerEvent::Settled(_) => {
                timer.settled_at.unwrap_or(timer.created_at)
            }
        }
    }
}

/// Signed wire record published to subscribers and to the durable queue.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub bus_sequence: u64,
    pub tenant_id: String,
    pub timer_id: Uuid,
    pub kind: String,
    pub occurred_at: DateTime<Utc>,
    pub state_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drift_ms: Option<i64>,
    pub event: TimerEvent,
    pub signature: String,
    pub signature_version: String,
}

/// Envelope that exhausted its delivery budget, parked on the DLQ subject.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub occurred_at: DateTime<Utc>,
    pub error_description: String,
    pub envelope: EventEnvelope,
}

/// Deterministic envelope identity: replaying the log regenerates the same
/// ids, and consumers dedupe redeliveries on it.
pub fn derive_event_id(tenant_id: &str, timer_id: Uuid, state_version: u64, kind: &str) -> Uuid {
    let mut hasher = Sha256::new();
    hasher.update(tenant_id.as_bytes());
    hasher.update(b"/");
    hasher.update(timer_id.as_bytes());
    hasher.update(b"/");
    hasher.update(state_version.to_be_bytes());
    hasher.update(b"/");
    hasher.update(kind.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes)
}

struct Retention {
    ring: VecDeque<EventEnvelope>,
    next_sequence: u64,
    capacity: usize,
}

/// In-process fan-out plus a bounded retention ring. Live subscribers attach
/// through the broadcast channel; stream resume replays the ring from a
/// `bus_sequence` cursor before going live.
pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
    retention: Mutex<Retention>,
    signer: Arc<EventSigner>,
}

impl EventBus {
    pub fn new(signer: Arc<EventSigner>, retention_capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self {
            tx,
            retention: Mutex::new(Retention {
                ring: VecDeque::with_capacity(retention_capacity.min(1024)),
                next_sequence: 1,
                capacity: retention_capacity.max(1),
            }),
            signer,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: TimerEvent, drift_ms: Option<i64>) -> EventEnvelope {
        let envelope = {
            let mut retention = self.retention.lock().expect("event retention poisoned");
            let sequence = retention.next_sequence;
            retention.next_sequence += 1;
            let envelope = self.signer.sign_event(event, sequence, drift_ms);
            if retention.ring.len() == retention.capacity {
                retention.ring.pop_front();
            }
            retention.ring.push_back(envelope.clone());
            envelope
        };
        // No receivers is fine; the retention ring still holds the envelope.
        let _ = self.tx.send(envelope.clone());
        envelope
    }

    /// Retained envelopes for a tenant with a bus sequence beyond the cursor.
    pub fn replay_after(&self, tenant_id: &str, after_bus_sequence: u64) -> Vec<EventEnvelope> {
        let retention = self.retention.lock().expect("event retention poisoned");
        retention
            .ring
            .iter()
            .filter(|envelope| {
                envelope.bus_sequence > after_bus_sequence && envelope.tenant_id == tenant_id
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_timer;

    fn bus() -> EventBus {
        EventBus::new(Arc::new(EventSigner::insecure_dev()), 8)
    }

    #[tokio::test]
    async fn publish_reaches_live_subscribers() {
        let bus = bus();
        let mut rx = bus.subscribe();
        let envelope = bus.publish(TimerEvent::Scheduled(sample_timer("tenant-a")), None);
        let received = rx.recv().await.expect("live envelope");
        assert_eq!(received.event_id, envelope.event_id);
        assert_eq!(received.kind, "timer.scheduled");
        assert_eq!(received.bus_sequence, 1);
    }

    #[test]
    fn replay_filters_by_tenant_and_cursor() {
        let bus = bus();
        bus.publish(TimerEvent::Scheduled(sample_timer("tenant-a")), None);
        bus.publish(TimerEvent::Scheduled(sample_timer("tenant-b")), None);
        bus.publish(TimerEvent::Fired(sample_timer("tenant-a")), None);

        let replayed = bus.replay_after("tenant-a", 0);
        assert_eq!(replayed.len(), 2);
        assert!(replayed.iter().all(|e| e.tenant_id == "tenant-a"));

        let after_first = bus.replay_after("tenant-a", replayed[0].bus_sequence);
        assert_eq!(after_first.len(), 1);
    }

    #[test]
    fn retention_ring_is_bounded() {
        let bus = bus();
        for _ in 0..20 {
            bus.publish(TimerEvent::Scheduled(sample_timer("tenant-a")), None);
        }
        let retained = bus.replay_after("tenant-a", 0);
        assert_eq!(retained.len(), 8);
        assert_eq!(retained.last().expect("newest").bus_sequence, 20);
    }

    #[test]
    fn event_id_derivation_distinguishes_kinds_and_versions() {
        let id = Uuid::new_v4();
        let a = derive_event_id("t", id, 1, "timer.scheduled");
        let b = derive_event_id("t", id, 1, "timer.fired");
        let c = derive_event_id("t", id, 2, "timer.fired");
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!(a, derive_event_id("t", id, 1, "timer.scheduled"));
    }
}
