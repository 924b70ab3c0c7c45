use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JitterDistribution {
    #[default]
    Uniform,
    Gaussian,
}

/// Per-timer perturbation bounds plus the drift-compensation knobs. A policy
/// with `max_offset_ms == 0` never perturbs; `max_compensation_ms == 0`
/// disables drift correction for the timer.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JitterPolicy {
    #[serde(default)]
    pub distribution: JitterDistribution,
    #[serde(default)]
    pub max_offset_ms: u64,
    #[serde(default)]
    pub max_compensation_ms: u64,
    #[serde(default = "default_smoothing")]
    pub smoothing_factor: f64,
}

fn default_smoothing() -> f64 {
    0.2
}

impl Default for JitterPolicy {
    fn default() -> Self {
        Self {
            distribution: JitterDistribution::Uniform,
            max_offset_ms: 0,
            max_compensation_ms: 0,
            smoothing_factor: default_smoothing(),
        }
    }
}

/// Draw the deadline offset for a freshly admitted timer. The draw happens
/// once, at admission, and is persisted on the timer so log replay lands on
/// the same effective deadline.
pub fn draw_offset_ms<R: Rng>(policy: &JitterPolicy, rng: &mut R) -> i64 {
    let bound = policy.max_offset_ms as i64;
    if bound == 0 {
        return 0;
    }
    match policy.distribution {
        JitterDistribution::Uniform => rng.gen_range(-bound..=bound),
        JitterDistribution::Gaussian => {
            // Box-Muller with sigma at a third of the bound, clamped.
            let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
            let u2: f64 = rng.gen_range(0.0..1.0);
            let normal = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
            let sample = normal * (bound as f64 / 3.0);
            sample.round().clamp(-(bound as f64), bound as f64) as i64
        }
    }
}

#[derive(Default, Clone)]
struct JitterStats {
    ema_ms: f64,
    last_observed_ms: i64,
    samples: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct JitterSnapshot {
    pub observed_ms: i64,
    pub ema_ms: f64,
}

/// Tracks observed scheduling drift (actual fire instant minus nominal
/// deadline) as an exponentially weighted moving average and hands out the
/// clamped compensation applied when the next timer is armed.
#[derive(Default, Clone)]
pub struct JitterMonitor {
    stats: Arc<RwLock<JitterStats>>,
}

impl JitterMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, drift_ms: i64, policy: Option<&JitterPolicy>) -> JitterSnapshot {
        let mut stats = self.stats.write().await;
        stats.last_observed_ms = drift_ms;
        stats.samples += 1;
        let smoothing = policy
            .map(|p| p.smoothing_factor)
            .unwrap_or_else(default_smoothing);
        if stats.samples == 1 {
            stats.ema_ms = drift_ms as f64;
        } else {
            stats.ema_ms = smoothing * (drift_ms as f64) + (1.0 - smoothing) * stats.ema_ms;
        }
        JitterSnapshot {
            observed_ms: drift_ms,
            ema_ms: stats.ema_ms,
        }
    }

    /// Compensation subtracted from a timer's deadline when it is armed.
    /// Only positive drift (firing late) is compensated; the result is capped
    /// by the timer's policy.
    pub async fn compensation_ms(&self, policy: &JitterPolicy) -> i64 {
        let stats = self.stats.read().await;
        let ema = stats.ema_ms;
        if ema <= 0.0 {
            return 0;
        }
        ema.min(policy.max_compensation_ms as f64) as i64
    }

    pub async fn last_observed_ms(&self) -> i64 {
        self.stats.read().await.last_observed_ms
    }
}
