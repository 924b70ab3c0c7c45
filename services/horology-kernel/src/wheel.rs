use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::clock::KernelClock;

/// Whether an inserted timer went straight into the hot heap (armed) or was
/// parked in the cold store until its deadline approaches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArmDecision {
    Armed,
    Deferred,
}

/// A timer whose deadline has passed, handed to the firing loop.
#[derive(Clone, Debug)]
pub struct DueTimer {
    pub tenant_id: String,
    pub timer_id: Uuid,
    /// The effective (jitter-adjusted) deadline the wheel slept on; drift is
    /// measured against it.
    pub nominal_fire_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct WheelEntry {
    deadline: Instant,
    nominal_fire_at: DateTime<Utc>,
    tenant_id: String,
    timer_id: Uuid,
}

impl Ord for WheelEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then_with(|| self.timer_id.cmp(&other.timer_id))
    }
}

impl PartialOrd for WheelEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct WheelInner {
    heap: BinaryHeap<Reverse<WheelEntry>>,
    cold: BTreeMap<(DateTime<Utc>, Uuid), String>,
    cold_index: HashMap<(String, Uuid), DateTime<Utc>>,
    // Cancelled entries are tombstoned and skipped lazily on drain; a binary
    // heap has no cheap random removal.
    tombstones: HashSet<(String, Uuid)>,
}

/// Monotonic-time priority queue of armed timers plus a cold store for
/// deadlines beyond the arm-ahead horizon, which bounds heap memory. The
/// apply task inserts and removes; the firing loop drains.
pub struct TimerWheel {
    inner: Mutex<WheelInner>,
    notify: Notify,
    horizon: Duration,
}

impl TimerWheel {
    pub fn new(horizon: Duration) -> Self {
        Self {
            inner: Mutex::new(WheelInner::default()),
            notify: Notify::new(),
            horizon,
        }
    }

    pub fn horizon(&self) -> Duration {
        self.horizon
    }

    pub fn insert(
        &self,
        clock: &KernelClock,
        now: DateTime<Utc>,
        tenant_id: &str,
        timer_id: Uuid,
        effective_fire_at: DateTime<Utc>,
    ) -> ArmDecision {
        let key = (tenant_id.to_string(), timer_id);
        let mut inner = self.inner.lock().expect("wheel poisoned");
        inner.tombstones.remove(&key);

        let until_due = effective_fire_at.signed_duration_since(now);
        let within_horizon = until_due
            .to_std()
            .map(|ahead| ahead <= self.horizon)
            .unwrap_or(true); // already overdue

        if within_horizon {
            inner.heap.push(Reverse(WheelEntry {
                deadline: clock.deadline_for(effective_fire_at),
                nominal_fire_at: effective_fire_at,
                tenant_id: tenant_id.to_string(),
                timer_id,
            }));
            drop(inner);
            self.notify.notify_one();
            ArmDecision::Armed
        } else {
            inner.cold.insert(
                (effective_fire_at, timer_id),
                tenant_id.to_string(),
            );
            inner.cold_index.insert(key, effective_fire_at);
            ArmDecision::Deferred
        }
    }

    pub fn remove(&self, tenant_id: &str, timer_id: Uuid) {
        let key = (tenant_id.to_string(), timer_id);
        let mut inner = self.inner.lock().expect("wheel poisoned");
        if let Some(when) = inner.cold_index.remove(&key) {
            inner.cold.remove(&(when, timer_id));
        } else {
            inner.tombstones.insert(key);
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        let inner = self.inner.lock().expect("wheel poisoned");
        inner.heap.peek().map(|Reverse(entry)| entry.deadline)
    }

    /// Pop every entry whose deadline has passed, up to `max_batch`, skipping
    /// tombstoned (cancelled) entries.
    pub fn drain_due(&self, now: Instant, max_batch: usize) -> Vec<DueTimer> {
        let mut inner = self.inner.lock().expect("wheel poisoned");
        let mut due = Vec::new();
        while due.len() < max_batch {
            match inner.heap.peek() {
                Some(Reverse(entry)) if entry.deadline <= now => {
                    let Reverse(entry) = inner.heap.pop().expect("peeked entry");
                    let key = (entry.tenant_id.clone(), entry.timer_id);
                    if inner.tombstones.remove(&key) {
                        continue;
                    }
                    due.push(DueTimer {
                        tenant_id: entry.tenant_id,
                        timer_id: entry.timer_id,
                        nominal_fire_at: entry.nominal_fire_at,
                    });
                }
                _ => break,
            }
        }
        due
    }

    /// Remove cold entries whose deadline has entered the horizon and return
    /// them so the apply task can arm them properly.
    pub fn take_liftable(&self, now: DateTime<Utc>) -> Vec<(String, Uuid, DateTime<Utc>)> {
        let boundary = now
            + chrono::Duration::from_std(self.horizon)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let mut inner = self.inner.lock().expect("wheel poisoned");
        let mut lifted = Vec::new();
        loop {
            let key = match inner.cold.keys().next() {
                Some((when, id)) if *when <= boundary => (*when, *id),
                _ => break,
            };
            let tenant_id = inner.cold.remove(&key).expect("cold entry present");
            inner.cold_index.remove(&(tenant_id.clone(), key.1));
            lifted.push((tenant_id, key.1, key.0));
        }
        lifted
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("wheel poisoned");
        inner.heap.clear();
        inner.cold.clear();
        inner.cold_index.clear();
        inner.tombstones.clear();
    }

    pub fn armed_len(&self) -> usize {
        self.inner.lock().expect("wheel poisoned").heap.len()
    }

    pub fn cold_len(&self) -> usize {
        self.inner.lock().expect("wheel poisoned").cold.len()
    }

    /// Wait until an insert changes the earliest deadline.
    pub async fn changed(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wheel() -> TimerWheel {
        TimerWheel::new(Duration::from_secs(60))
    }

    #[tokio::test]
    async fn near_deadlines_arm_and_drain_in_order() {
        let wheel = wheel();
        let clock = KernelClock::new();
        let now = Utc::now();
        let later = Uuid::new_v4();
        let sooner = Uuid::new_v4();

        assert_eq!(
            wheel.insert(&clock, now, "t", later, now + chrono::Duration::milliseconds(40)),
            ArmDecision::Armed
        );
        assert_eq!(
            wheel.insert(&clock, now, "t", sooner, now + chrono::Duration::milliseconds(10)),
            ArmDecision::Armed
        );

        let due = wheel.drain_due(Instant::now() + Duration::from_millis(100), 16);
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].timer_id, sooner);
        assert_eq!(due[1].timer_id, later);
    }

    #[tokio::test]
    async fn far_deadlines_defer_to_the_cold_store_and_lift() {
        let wheel = wheel();
        let clock = KernelClock::new();
        let now = Utc::now();
        let id = Uuid::new_v4();

        let decision = wheel.insert(&clock, now, "t", id, now + chrono::Duration::seconds(300));
        assert_eq!(decision, ArmDecision::Deferred);
        assert_eq!(wheel.cold_len(), 1);
        assert_eq!(wheel.armed_len(), 0);

        // Not liftable yet.
        assert!(wheel.take_liftable(now).is_empty());

        // Once the horizon reaches the deadline it is handed back for arming.
        let lifted = wheel.take_liftable(now + chrono::Duration::seconds(250));
        assert_eq!(lifted.len(), 1);
        assert_eq!(lifted[0].1, id);
        assert_eq!(wheel.cold_len(), 0);
    }

    #[tokio::test]
    async fn removed_entries_do_not_fire() {
        let wheel = wheel();
        let clock = KernelClock::new();
        let now = Utc::now();
        let cancelled = Uuid::new_v4();
        let kept = Uuid::new_v4();

        wheel.insert(&clock, now, "t", cancelled, now + chrono::Duration::milliseconds(5));
        wheel.insert(&clock, now, "t", kept, now + chrono::Duration::milliseconds(5));
        wheel.remove("t", cancelled);

        let due = wheel.drain_due(Instant::now() + Duration::from_millis(50), 16);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].timer_id, kept);
    }

    #[tokio::test]
    async fn overdue_inserts_are_armed_immediately() {
        let wheel = wheel();
        let clock = KernelClock::new();
        let now = Utc::now();
        let id = Uuid::new_v4();

        let decision = wheel.insert(&clock, now, "t", id, now - chrono::Duration::seconds(30));
        assert_eq!(decision, ArmDecision::Armed);
        let due = wheel.drain_due(Instant::now(), 16);
        assert_eq!(due.len(), 1);
    }

    #[tokio::test]
    async fn cold_removal_clears_the_entry() {
        let wheel = wheel();
        let clock = KernelClock::new();
        let now = Utc::now();
        let id = Uuid::new_v4();

        wheel.insert(&clock, now, "t", id, now + chrono::Duration::seconds(600));
        wheel.remove("t", id);
        assert_eq!(wheel.cold_len(), 0);
        assert!(wheel
            .take_liftable(now + chrono::Duration::seconds(700))
            .is_empty());
    }
}
