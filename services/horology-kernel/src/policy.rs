use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::KernelError;

pub const PERM_TIMER_WRITE: &str = "timer.write";
pub const PERM_TIMER_READ: &str = "timer.read";
pub const PERM_TIMER_CANCEL: &str = "timer.cancel";
pub const PERM_TIMER_SETTLE: &str = "timer.settle";

/// Length of the burst-accounting window.
const BURST_WINDOW_SECS: i64 = 10;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct QuotaConfig {
    pub daily_timer_limit: u32,
    pub burst_timer_limit: u32,
    pub max_active_timers: u32,
    pub schedule_per_minute: u32,
    pub cancel_per_minute: u32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            daily_timer_limit: 10_000,
            burst_timer_limit: 100,
            max_active_timers: 1_000,
            schedule_per_minute: 600,
            cancel_per_minute: 600,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyRecord {
    pub key_id: String,
    pub secret: String,
    pub principal_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantPolicy {
    pub tenant_id: String,
    pub api_keys: Vec<ApiKeyRecord>,
    #[serde(default)]
    pub quotas: QuotaConfig,
}

/// Resolved caller identity attached to every admitted command.
#[derive(Clone, Debug)]
pub struct Principal {
    pub tenant_id: String,
    pub principal_id: String,
    pub key_id: String,
    pub roles: Vec<String>,
    pub permissions: HashSet<String>,
}

impl Principal {
    pub fn can(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }
}

fn role_permissions(role: &str) -> &'static [&'static str] {
    match role {
        "admin" => &[
            PERM_TIMER_WRITE,
            PERM_TIMER_READ,
            PERM_TIMER_CANCEL,
            PERM_TIMER_SETTLE,
        ],
        "scheduler" => &[PERM_TIMER_WRITE, PERM_TIMER_READ, PERM_TIMER_CANCEL],
        "orchestrator" => &[PERM_TIMER_READ, PERM_TIMER_SETTLE],
        "observer" => &[PERM_TIMER_READ],
        _ => &[],
    }
}

fn expand_roles(roles: &[String]) -> HashSet<String> {
    roles
        .iter()
        .flat_map(|role| role_permissions(role).iter().map(|p| p.to_string()))
        .collect()
}

#[derive(Debug)]
struct TenantUsage {
    day: NaiveDate,
    scheduled_today: u32,
    burst_window_start: DateTime<Utc>,
    burst_count: u32,
    schedule_minute: i64,
    schedule_minute_count: u32,
    cancel_minute: i64,
    cancel_minute_count: u32,
    active: u32,
}

impl TenantUsage {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            day: now.date_naive(),
            scheduled_today: 0,
            burst_window_start: now,
            burst_count: 0,
            schedule_minute: minute_slot(now),
            schedule_minute_count: 0,
            cancel_minute: minute_slot(now),
            cancel_minute_count: 0,
            active: 0,
        }
    }

    fn roll(&mut self, now: DateTime<Utc>) {
        if now.date_naive() != self.day {
            self.day = now.date_naive();
            self.scheduled_today = 0;
        }
        if now.signed_duration_since(self.burst_window_start).num_seconds() >= BURST_WINDOW_SECS {
            self.burst_window_start = now;
            self.burst_count = 0;
        }
        let slot = minute_slot(now);
        if slot != self.schedule_minute {
            self.schedule_minute = slot;
            self.schedule_minute_count = 0;
        }
        if slot != self.cancel_minute {
            self.cancel_minute = slot;
            self.cancel_minute_count = 0;
        }
    }
}

fn minute_slot(now: DateTime<Utc>) -> i64 {
    now.timestamp() / 60
}

struct TenantEntry {
    policy: TenantPolicy,
    usage: TenantUsage,
}

/// Tenant policies plus live quota counters. Policies are seeded out-of-band
/// (file or admin tooling) and read on every admission; counters are guarded
/// per store so increments are transactional with the checks.
pub struct PolicyStore {
    tenants: Mutex<HashMap<String, TenantEntry>>,
    /// Development mode: authenticate unknown tenants with default quotas.
    allow_unregistered: bool,
}

impl PolicyStore {
    pub fn seeded(policies: Vec<TenantPolicy>) -> Self {
        let now = Utc::now();
        let tenants = policies
            .into_iter()
            .map(|policy| {
                (
                    policy.tenant_id.clone(),
                    TenantEntry {
                        policy,
                        usage: TenantUsage::new(now),
                    },
                )
            })
            .collect();
        Self {
            tenants: Mutex::new(tenants),
            allow_unregistered: false,
        }
    }

    /// Accept any key for any tenant. Local development and tests only.
    pub fn permissive_dev() -> Self {
        Self {
            tenants: Mutex::new(HashMap::new()),
            allow_unregistered: true,
        }
    }

    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read tenant policy file {path:?}"))?;
        let policies: Vec<TenantPolicy> = serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse tenant policy file {path:?}"))?;
        Ok(Self::seeded(policies))
    }

    pub fn authenticate(&self, tenant_id: &str, api_key: &str) -> Result<Principal, KernelError> {
        if tenant_id.is_empty() || api_key.is_empty() {
            return Err(KernelError::Unauthenticated);
        }

        let mut tenants = self.tenants.lock().expect("policy store poisoned");
        match tenants.get(tenant_id) {
            Some(entry) => {
                let record = entry
                    .policy
                    .api_keys
                    .iter()
                    .find(|record| record.secret == api_key && record.active)
                    .ok_or(KernelError::Unauthenticated)?;
                Ok(Principal {
                    tenant_id: tenant_id.to_string(),
                    principal_id: record.principal_id.clone(),
                    key_id: record.key_id.clone(),
                    roles: record.roles.clone(),
                    permissions: expand_roles(&record.roles),
                })
            }
            None if self.allow_unregistered => {
                let roles = vec!["admin".to_string()];
                tenants.insert(
                    tenant_id.to_string(),
                    TenantEntry {
                        policy: TenantPolicy {
                            tenant_id: tenant_id.to_string(),
                            api_keys: Vec::new(),
                            quotas: QuotaConfig::default(),
                        },
                        usage: TenantUsage::new(Utc::now()),
                    },
                );
                Ok(Principal {
                    tenant_id: tenant_id.to_string(),
                    principal_id: "dev".to_string(),
                    key_id: "dev".to_string(),
                    permissions: expand_roles(&roles),
                    roles,
                })
            }
            None => Err(KernelError::Unauthenticated),
        }
    }

    pub fn authorize(&self, principal: &Principal, permission: &str) -> Result<(), KernelError> {
        if principal.can(permission) {
            Ok(())
        } else {
            Err(KernelError::PermissionDenied(permission.to_string()))
        }
    }

    /// Reserve one schedule slot: daily, burst and per-minute counters plus an
    /// active-timer slot, checked and incremented under one lock.
    pub fn reserve_schedule(&self, tenant_id: &str, now: DateTime<Utc>) -> Result<(), KernelError> {
        let mut tenants = self.tenants.lock().expect("policy store poisoned");
        let entry = tenants
            .get_mut(tenant_id)
            .ok_or(KernelError::Unauthenticated)?;
        entry.usage.roll(now);
        let quotas = &entry.policy.quotas;

        if entry.usage.scheduled_today >= quotas.daily_timer_limit {
            return Err(KernelError::QuotaExceeded(format!(
                "daily timer limit of {} reached",
                quotas.daily_timer_limit
            )));
        }
        if entry.usage.burst_count >= quotas.burst_timer_limit {
            return Err(KernelError::QuotaExceeded(format!(
                "burst limit of {} timers per {BURST_WINDOW_SECS}s reached",
                quotas.burst_timer_limit
            )));
        }
        if entry.usage.schedule_minute_count >= quotas.schedule_per_minute {
            return Err(KernelError::QuotaExceeded(format!(
                "schedule rate of {} per minute reached",
                quotas.schedule_per_minute
            )));
        }
        if entry.usage.active >= quotas.max_active_timers {
            return Err(KernelError::QuotaExceeded(format!(
                "active timer limit of {} reached",
                quotas.max_active_timers
            )));
        }

        entry.usage.scheduled_today += 1;
        entry.usage.burst_count += 1;
        entry.usage.schedule_minute_count += 1;
        entry.usage.active += 1;
        Ok(())
    }

    /// Undo a reservation whose command did not create a timer (idempotent
    /// replay or failed commit).
    pub fn release_reservation(&self, tenant_id: &str) {
        let mut tenants = self.tenants.lock().expect("policy store poisoned");
        if let Some(entry) = tenants.get_mut(tenant_id) {
            entry.usage.scheduled_today = entry.usage.scheduled_today.saturating_sub(1);
            entry.usage.burst_count = entry.usage.burst_count.saturating_sub(1);
            entry.usage.schedule_minute_count =
                entry.usage.schedule_minute_count.saturating_sub(1);
            entry.usage.active = entry.usage.active.saturating_sub(1);
        }
    }

    /// Account for a kernel-originated timer (temporal-graph child) so the
    /// active count stays symmetric with `release_active`.
    pub fn note_active(&self, tenant_id: &str) {
        let mut tenants = self.tenants.lock().expect("policy store poisoned");
        if let Some(entry) = tenants.get_mut(tenant_id) {
            entry.usage.active = entry.usage.active.saturating_add(1);
        }
    }

    /// A timer left the active set (fired, cancelled or failed).
    pub fn release_active(&self, tenant_id: &str) {
        let mut tenants = self.tenants.lock().expect("policy store poisoned");
        if let Some(entry) = tenants.get_mut(tenant_id) {
            entry.usage.active = entry.usage.active.saturating_sub(1);
        }
    }

    pub fn record_cancel(&self, tenant_id: &str, now: DateTime<Utc>) -> Result<(), KernelError> {
        let mut tenants = self.tenants.lock().expect("policy store poisoned");
        let entry = tenants
            .get_mut(tenant_id)
            .ok_or(KernelError::Unauthenticated)?;
        entry.usage.roll(now);
        if entry.usage.cancel_minute_count >= entry.policy.quotas.cancel_per_minute {
            return Err(KernelError::QuotaExceeded(format!(
                "cancel rate of {} per minute reached",
                entry.policy.quotas.cancel_per_minute
            )));
        }
        entry.usage.cancel_minute_count += 1;
        Ok(())
    }

    pub fn active_count(&self, tenant_id: &str) -> u32 {
        let tenants = self.tenants.lock().expect("policy store poisoned");
        tenants.get(tenant_id).map(|e| e.usage.active).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::tenant_policy;

    #[test]
    fn authenticates_known_keys_and_rejects_the_rest() {
        let store = PolicyStore::seeded(vec![tenant_policy("tenant-a", "key-a", 10)]);
        let principal = store
            .authenticate("tenant-a", "key-a")
            .expect("known key authenticates");
        assert_eq!(principal.tenant_id, "tenant-a");
        assert!(principal.can(PERM_TIMER_WRITE));

        assert!(matches!(
            store.authenticate("tenant-a", "wrong"),
            Err(KernelError::Unauthenticated)
        ));
        assert!(matches!(
            store.authenticate("tenant-z", "key-a"),
            Err(KernelError::Unauthenticated)
        ));
    }

    #[test]
    fn inactive_keys_are_rejected() {
        let mut policy = tenant_policy("tenant-a", "key-a", 10);
        policy.api_keys[0].active = false;
        let store = PolicyStore::seeded(vec![policy]);
        assert!(matches!(
            store.authenticate("tenant-a", "key-a"),
            Err(KernelError::Unauthenticated)
        ));
    }

    #[test]
    fn observers_cannot_write() {
        let mut policy = tenant_policy("tenant-a", "key-a", 10);
        policy.api_keys[0].roles = vec!["observer".into()];
        let store = PolicyStore::seeded(vec![policy]);
        let principal = store.authenticate("tenant-a", "key-a").expect("observer");
        assert!(matches!(
            store.authorize(&principal, PERM_TIMER_WRITE),
            Err(KernelError::PermissionDenied(_))
        ));
        store
            .authorize(&principal, PERM_TIMER_READ)
            .expect("observer reads");
    }

    #[test]
    fn daily_limit_rejects_the_overflowing_schedule() {
        let store = PolicyStore::seeded(vec![tenant_policy("tenant-a", "key-a", 3)]);
        let now = Utc::now();
        for _ in 0..3 {
            store
                .reserve_schedule("tenant-a", now)
                .expect("within quota");
        }
        let err = store
            .reserve_schedule("tenant-a", now)
            .expect_err("over quota");
        assert!(matches!(err, KernelError::QuotaExceeded(_)));
    }

    #[test]
    fn released_reservations_do_not_consume_quota() {
        let store = PolicyStore::seeded(vec![tenant_policy("tenant-a", "key-a", 1)]);
        let now = Utc::now();
        store.reserve_schedule("tenant-a", now).expect("first");
        store.release_reservation("tenant-a");
        store.reserve_schedule("tenant-a", now).expect("again");
    }

    #[test]
    fn daily_counter_rolls_over_midnight() {
        let store = PolicyStore::seeded(vec![tenant_policy("tenant-a", "key-a", 1)]);
        let now = Utc::now();
        store.reserve_schedule("tenant-a", now).expect("first");
        store
            .reserve_schedule("tenant-a", now + chrono::Duration::days(1))
            .expect("next day resets the counter");
    }

    #[test]
    fn active_slots_are_freed_on_terminal_transitions() {
        let mut policy = tenant_policy("tenant-a", "key-a", 100);
        policy.quotas.max_active_timers = 1;
        let store = PolicyStore::seeded(vec![policy]);
        let now = Utc::now();
        store.reserve_schedule("tenant-a", now).expect("first");
        assert!(store.reserve_schedule("tenant-a", now).is_err());
        store.release_active("tenant-a");
        store
            .reserve_schedule("tenant-a", now)
            .expect("slot freed after terminal transition");
    }

    #[test]
    fn cancel_rate_is_enforced_per_minute() {
        let mut policy = tenant_policy("tenant-a", "key-a", 100);
        policy.quotas.cancel_per_minute = 2;
        let store = PolicyStore::seeded(vec![policy]);
        let now = Utc::now();
        store.record_cancel("tenant-a", now).expect("one");
        store.record_cancel("tenant-a", now).expect("two");
        assert!(store.record_cancel("tenant-a", now).is_err());
        store
            .record_cancel("tenant-a", now + chrono::Duration::minutes(1))
            .expect("window rolls");
    }

    #[test]
    fn permissive_store_provisions_unknown_tenants() {
        let store = PolicyStore::permissive_dev();
        let principal = store
            .authenticate("anyone", "any-key")
            .expect("dev store accepts");
        assert!(principal.can(PERM_TIMER_WRITE));
        store
            .reserve_schedule("anyone", Utc::now())
            .expect("default quotas apply");
    }
}
