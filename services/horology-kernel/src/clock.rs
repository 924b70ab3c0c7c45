use std::sync::Mutex;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::time::Instant;

/// Divergence between the wall and monotonic clocks that triggers a
/// recalibration of the translation anchor.
const JUMP_THRESHOLD_MS: i64 = 500;

struct ClockAnchor {
    wall_t0: DateTime<Utc>,
    mono_t0: Instant,
}

/// Translation table between wall-clock instants (how clients express
/// `fire_at`) and the monotonic clock every in-kernel deadline sleeps on.
/// Re-anchored on startup, on leadership changes, and whenever a wall-clock
/// jump is detected; scheduling always keeps firing from the monotonic side.
pub struct KernelClock {
    anchor: Mutex<ClockAnchor>,
}

impl Default for KernelClock {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelClock {
    pub fn new() -> Self {
        Self {
            anchor: Mutex::new(ClockAnchor {
                wall_t0: Utc::now(),
                mono_t0: Instant::now(),
            }),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    /// Monotonic deadline for a wall-clock instant. Instants at or before the
    /// anchor resolve to the anchor itself, which makes overdue timers due
    /// immediately.
    pub fn deadline_for(&self, fire_at: DateTime<Utc>) -> Instant {
        let anchor = self.anchor.lock().expect("clock anchor poisoned");
        let offset = fire_at.signed_duration_since(anchor.wall_t0);
        match offset.to_std() {
            Ok(ahead) => anchor.mono_t0 + ahead,
            Err(_) => anchor.mono_t0,
        }
    }

    pub fn recalibrate(&self) {
        let mut anchor = self.anchor.lock().expect("clock anchor poisoned");
        anchor.wall_t0 = Utc::now();
        anchor.mono_t0 = Instant::now();
    }

    /// Compare elapsed wall time against elapsed monotonic time since the
    /// anchor. Returns the skew in milliseconds when it exceeds the jump
    /// threshold, after re-anchoring.
    pub fn detect_jump(&self) -> Option<i64> {
        let mut anchor = self.anchor.lock().expect("clock anchor poisoned");
        let wall_elapsed = Utc::now().signed_duration_since(anchor.wall_t0);
        let mono_elapsed = ChronoDuration::from_std(anchor.mono_t0.elapsed())
            .unwrap_or_else(|_| ChronoDuration::zero());
        let skew = (wall_elapsed - mono_elapsed).num_milliseconds();
        if skew.abs() > JUMP_THRESHOLD_MS {
            anchor.wall_t0 = Utc::now();
            anchor.mono_t0 = Instant::now();
            Some(skew)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn deadlines_translate_forward() {
        let clock = KernelClock::new();
        let fire_at = Utc::now() + ChronoDuration::milliseconds(250);
        let deadline = clock.deadline_for(fire_at);
        let remaining = deadline.saturating_duration_since(Instant::now());
        assert!(remaining <= Duration::from_millis(260));
        assert!(remaining >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn past_instants_are_due_immediately() {
        let clock = KernelClock::new();
        let fire_at = Utc::now() - ChronoDuration::seconds(30);
        let deadline = clock.deadline_for(fire_at);
        assert!(deadline <= Instant::now());
    }

    #[tokio::test]
    async fn small_skew_is_not_a_jump() {
        let clock = KernelClock::new();
        assert_eq!(clock.detect_jump(), None);
    }
}
