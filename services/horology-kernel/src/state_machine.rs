use std::collections::HashMap;

use thiserror::Error;
use uuid::Uuid;

use crate::command::{CommandEntry, SettleOutcome, TimerCommand};
use crate::events::TimerEvent;
use crate::{TimerInstance, TimerStatus};

pub type TimerKey = (String, Uuid);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApplyError {
    #[error("timer id already exists with a different payload")]
    Conflict,
    #[error("timer not found")]
    NotFound,
    #[error("timer already settled")]
    AlreadySettled,
}

/// Result of applying one committed command.
#[derive(Debug)]
pub struct Applied {
    pub timer: TimerInstance,
    pub events: Vec<TimerEvent>,
    /// True when the command was an idempotent replay (retried schedule,
    /// fire racing a cancel) and mutated nothing.
    pub replayed: bool,
    /// True when the timer left the active set with this command.
    pub released_active: bool,
}

/// Authoritative in-memory map of timers keyed by `(tenant, timer_id)`.
///
/// Apply is deterministic: every mutation uses timestamps carried inside the
/// command, so replaying the log from a snapshot reproduces identical state
/// and an identical event stream. Only the apply task mutates this map.
#[derive(Default)]
pub struct StateMachine {
    timers: HashMap<TimerKey, TimerInstance>,
    by_client: HashMap<(String, String), Uuid>,
    applied_sequence: u64,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn applied_sequence(&self) -> u64 {
        self.applied_sequence
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    pub fn get(&self, tenant_id: &str, timer_id: Uuid) -> Option<&TimerInstance> {
        self.timers.get(&(tenant_id.to_string(), timer_id))
    }

    pub fn list(&self, tenant_id: &str) -> Vec<TimerInstance> {
        let mut timers: Vec<_> = self
            .timers
            .values()
            .filter(|t| t.tenant_id == tenant_id)
            .cloned()
            .collect();
        timers.sort_by(|a, b| a.fire_at.cmp(&b.fire_at).then(a.id.cmp(&b.id)));
        timers
    }

    pub fn non_terminal(&self) -> Vec<TimerInstance> {
        self.timers
            .values()
            .filter(|t| !t.is_terminal())
            .cloned()
            .collect()
    }

    pub fn apply(&mut self, entry: &CommandEntry) -> Result<Applied, ApplyError> {
        let applied = match &entry.command {
            TimerCommand::Schedule { timer } => self.apply_schedule(timer),
            TimerCommand::Cancel {
                tenant_id,
                timer_id,
                cancelled_by,
                reason,
                at,
            } => self.apply_cancel(tenant_id, *timer_id, cancelled_by, reason, *at),
            TimerCommand::Fire {
                tenant_id,
                timer_id,
                at,
            } => self.apply_fire(tenant_id, *timer_id, *at),
            TimerCommand::Settle {
                tenant_id,
                timer_id,
                outcome,
                at,
            } => self.apply_settle(tenant_id, *timer_id, outcome, *at),
        }?;
        self.applied_sequence = self.applied_sequence.max(entry.sequence);
        Ok(applied)
    }

    fn apply_schedule(&mut self, timer: &TimerInstance) -> Result<Applied, ApplyError> {
        let key = (timer.tenant_id.clone(), timer.id);

        // Retried command with the timer id already assigned.
        if let Some(existing) = self.timers.get(&key) {
            return if existing.payload_hash == timer.payload_hash {
                Ok(Applied {
                    timer: existing.clone(),
                    events: Vec::new(),
                    replayed: true,
                    released_active: false,
                })
            } else {
                Err(ApplyError::Conflict)
            };
        }

        // Concurrent retry that was admitted twice: same client id, fresh
        // kernel id. The first committed command wins and later ones collapse
        // onto it.
        if let Some(client_id) = &timer.client_timer_id {
            let client_key = (timer.tenant_id.clone(), client_id.clone());
            if let Some(existing_id) = self.by_client.get(&client_key) {
                let existing = self
                    .timers
                    .get(&(timer.tenant_id.clone(), *existing_id))
                    .expect("client index points at a live timer");
                return if existing.payload_hash == timer.payload_hash {
                    Ok(Applied {
                        timer: existing.clone(),
                        events: Vec::new(),
                        replayed: true,
                        released_active: false,
                    })
                } else {
                    Err(ApplyError::Conflict)
                };
            }
        }

        let mut inserted = timer.clone();
        // Records written by the pre-versioning schema load as version 0;
        // migrate them on first apply.
        if inserted.state_version == 0 {
            inserted.state_version = 1;
        }
        inserted.status = TimerStatus::Scheduled;

        if let Some(client_id) = &inserted.client_timer_id {
            self.by_client
                .insert((inserted.tenant_id.clone(), client_id.clone()), inserted.id);
        }
        self.timers.insert(key, inserted.clone());

        Ok(Applied {
            timer: inserted.clone(),
            events: vec![TimerEvent::Scheduled(inserted)],
            replayed: false,
            released_active: false,
        })
    }

    fn apply_cancel(
        &mut self,
        tenant_id: &str,
        timer_id: Uuid,
        cancelled_by: &Option<String>,
        reason: &Option<String>,
        at: chrono::DateTime<chrono::Utc>,
    ) -> Result<Applied, ApplyError> {
        let entry = self
            .timers
            .get_mut(&(tenant_id.to_string(), timer_id))
            .ok_or(ApplyError::NotFound)?;

        // Never silently succeed on a settled timer; a fire that already won
        // must not be acknowledged as a cancellation.
        if entry.is_terminal() {
            return Err(ApplyError::AlreadySettled);
        }

        entry.status = TimerStatus::Cancelled;
        entry.cancelled_at = Some(at);
        entry.cancel_reason = reason.clone();
        entry.cancelled_by = cancelled_by.clone();
        entry.state_version += 1;
        let snapshot = entry.clone();

        Ok(Applied {
            timer: snapshot.clone(),
            events: vec![TimerEvent::Cancelled {
                timer: snapshot,
                reason: reason.clone(),
            }],
            replayed: false,
            released_active: true,
        })
    }

    fn apply_fire(
        &mut self,
        tenant_id: &str,
        timer_id: Uuid,
        at: chrono::DateTime<chrono::Utc>,
    ) -> Result<Applied, ApplyError> {
        let entry = self
            .timers
            .get_mut(&(tenant_id.to_string(), timer_id))
            .ok_or(ApplyError::NotFound)?;

        // The losing side of a cancel/fire race ordered later in the log.
        if entry.is_terminal() {
            return Ok(Applied {
                timer: entry.clone(),
                events: Vec::new(),
                replayed: true,
                released_active: false,
            });
        }

        entry.status = TimerStatus::Fired;
        entry.fired_at = Some(at);
        entry.state_version += 1;
        let snapshot = entry.clone();

        Ok(Applied {
            timer: snapshot.clone(),
            events: vec![TimerEvent::Fired(snapshot)],
            replayed: false,
            released_active: true,
        })
    }

    fn apply_settle(
        &mut self,
        tenant_id: &str,
        timer_id: Uuid,
        outcome: &SettleOutcome,
        at: chrono::DateTime<chrono::Utc>,
    ) -> Result<Applied, ApplyError> {
        let entry = self
            .timers
            .get_mut(&(tenant_id.to_string(), timer_id))
            .ok_or(ApplyError::NotFound)?;

        if entry.status != TimerStatus::Fired || entry.settled_at.is_some() {
            return Err(ApplyError::AlreadySettled);
        }

        entry.settled_at = Some(at);
        entry.state_version += 1;
        let event = match outcome {
            SettleOutcome::Success => TimerEvent::Settled(entry.clone()),
            SettleOutcome::Failure { reason } => {
                entry.status = TimerStatus::Failed;
                entry.failure_reason = Some(reason.clone());
                TimerEvent::Failed {
                    timer: entry.clone(),
                    reason: Some(reason.clone()),
                }
            }
        };
        let snapshot = entry.clone();

        Ok(Applied {
            timer: snapshot,
            events: vec![event],
            replayed: false,
            released_active: false,
        })
    }

    /// Volatile `scheduled → armed` transition, driven by the wheel when a
    /// deadline enters the arm-ahead horizon. Does not bump `state_version`
    /// (arming is not logged and is re-derived on recovery).
    pub fn arm(&mut self, tenant_id: &str, timer_id: Uuid) -> Option<(TimerInstance, TimerEvent)> {
        let entry = self.timers.get_mut(&(tenant_id.to_string(), timer_id))?;
        if entry.status != TimerStatus::Scheduled {
            return None;
        }
        entry.status = TimerStatus::Armed;
        let snapshot = entry.clone();
        Some((snapshot.clone(), TimerEvent::Armed(snapshot)))
    }

    /// Rebuild from a snapshot payload.
    pub fn restore(&mut self, applied_sequence: u64, timers: Vec<TimerInstance>) {
        self.timers.clear();
        self.by_client.clear();
        self.applied_sequence = applied_sequence;
        for mut timer in timers {
            if timer.state_version == 0 {
                timer.state_version = 1;
            }
            if let Some(client_id) = &timer.client_timer_id {
                self.by_client
                    .insert((timer.tenant_id.clone(), client_id.clone()), timer.id);
            }
            self.timers.insert((timer.tenant_id.clone(), timer.id), timer);
        }
    }

    pub fn snapshot_timers(&self) -> Vec<TimerInstance> {
        let mut timers: Vec<_> = self.timers.values().cloned().collect();
        timers.sort_by(|a, b| (a.tenant_id.as_str(), a.id).cmp(&(b.tenant_id.as_str(), b.id)));
        timers
    }
}
