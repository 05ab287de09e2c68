//! Shape-aware network fallback activation.
//!
//! The predicate is a logical AND over the metrics the shape's idle rule
//! counts: traffic is only generated when *every* protecting metric is at
//! risk, because one healthy metric already keeps the instance alive and
//! extra packets would be pure waste. Time discipline (debounce, min-on,
//! min-off) suppresses flapping; activation ramps the target linearly so the
//! emitted rate has no step edges.

#![allow(missing_docs)]

use serde::Serialize;

use crate::core::config::{FallbackConfig, ShapePolicy};

/// Metric inputs for one activation decision. `None` means unknown, and an
/// unknown metric is never treated as at-risk.
#[derive(Debug, Clone, Copy, Default)]
pub struct FallbackInputs {
    pub cpu_p95: Option<f64>,
    pub net_avg: Option<f64>,
    pub mem_avg: Option<f64>,
}

/// Debug/telemetry view.
#[derive(Debug, Clone, Serialize)]
pub struct FallbackStatus {
    pub active: bool,
    pub activation_count: u64,
    pub seconds_since_change: f64,
    pub ramp_complete: bool,
}

#[derive(Debug)]
pub struct NetFallbackState {
    cfg: FallbackConfig,
    active: bool,
    since_ts: f64,
    last_change_ts: f64,
    last_activation_ts: f64,
    last_deactivation_ts: f64,
    activation_count: u64,
}

impl NetFallbackState {
    #[must_use]
    pub fn new(cfg: FallbackConfig, now: f64) -> Self {
        Self {
            cfg,
            active: false,
            since_ts: now,
            last_change_ts: f64::NEG_INFINITY,
            last_activation_ts: f64::NEG_INFINITY,
            last_deactivation_ts: f64::NEG_INFINITY,
            activation_count: 0,
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Evaluate the activation predicate at `now` and return the state in
    /// force after timing discipline is applied.
    pub fn evaluate(&mut self, shape: ShapePolicy, inputs: FallbackInputs, now: f64) -> bool {
        let wanted = match self.cfg.mode.as_str() {
            "always" => true,
            "adaptive" => self.adaptive_predicate(shape, inputs),
            // "off" and anything unrecognized stay silent.
            _ => false,
        };

        if self.cfg.mode.as_str() == "adaptive" {
            // Anti-flap ordering: min-on/min-off first, then debounce.
            if self.active && (now - self.last_activation_ts) < self.cfg.min_on_sec {
                return true;
            }
            if !self.active && (now - self.last_deactivation_ts) < self.cfg.min_off_sec {
                return false;
            }
            if (now - self.last_change_ts) < self.cfg.debounce_sec {
                return self.active;
            }
        }

        if wanted != self.active {
            self.active = wanted;
            self.last_change_ts = now;
            self.since_ts = now;
            if wanted {
                self.activation_count += 1;
                self.last_activation_ts = now;
                eprintln!("[LK-NET] fallback generation activated");
            } else {
                self.last_deactivation_ts = now;
                eprintln!("[LK-NET] fallback generation deactivated");
            }
        }
        self.active
    }

    fn adaptive_predicate(&self, shape: ShapePolicy, inputs: FallbackInputs) -> bool {
        let cpu_at_risk = inputs
            .cpu_p95
            .is_some_and(|v| v < self.cfg.risk_threshold_pct);
        let net_at_risk = inputs.net_avg.is_some_and(|v| v < self.cfg.start_pct);

        let mut wanted = if shape.counts_memory {
            let mem_at_risk = inputs
                .mem_avg
                .is_some_and(|v| v < self.cfg.risk_threshold_pct);
            cpu_at_risk && net_at_risk && mem_at_risk
        } else {
            cpu_at_risk && net_at_risk
        };

        // Hysteresis on the way out: enough network activity disarms.
        if self.active && inputs.net_avg.is_some_and(|v| v > self.cfg.stop_pct) {
            wanted = false;
        }
        wanted
    }

    /// Effective network target while ramping toward the fallback target.
    #[must_use]
    pub fn ramped_target(&self, base_target: f64, fallback_target: f64, now: f64) -> f64 {
        if !self.active {
            return base_target;
        }
        let elapsed = now - self.last_activation_ts;
        if self.cfg.ramp_sec <= 0.0 || elapsed >= self.cfg.ramp_sec {
            return fallback_target;
        }
        let progress = (elapsed / self.cfg.ramp_sec).clamp(0.0, 1.0);
        (fallback_target - base_target).mul_add(progress, base_target)
    }

    #[must_use]
    pub fn status(&self, now: f64) -> FallbackStatus {
        let ramp_complete = self.active
            && (self.cfg.ramp_sec <= 0.0
                || (now - self.last_activation_ts) >= self.cfg.ramp_sec);
        FallbackStatus {
            active: self.active,
            activation_count: self.activation_count,
            seconds_since_change: now - self.last_change_ts,
            ramp_complete,
        }
    }
}

// ──────────────────── tests ────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> FallbackConfig {
        FallbackConfig::default()
    }

    fn e2_shape() -> ShapePolicy {
        ShapePolicy {
            counts_memory: false,
            requires_external_egress: true,
        }
    }

    fn a1_shape() -> ShapePolicy {
        ShapePolicy {
            counts_memory: true,
            requires_external_egress: false,
        }
    }

    fn at_risk() -> FallbackInputs {
        FallbackInputs {
            cpu_p95: Some(19.5),
            net_avg: Some(18.0),
            mem_avg: Some(15.0),
        }
    }

    #[test]
    fn off_mode_never_activates() {
        let mut cfg = cfg();
        cfg.mode = "off".to_string();
        let mut state = NetFallbackState::new(cfg, 0.0);
        assert!(!state.evaluate(e2_shape(), at_risk(), 100.0));
    }

    #[test]
    fn always_mode_is_unconditional() {
        let mut cfg = cfg();
        cfg.mode = "always".to_string();
        let mut state = NetFallbackState::new(cfg, 0.0);
        assert!(state.evaluate(e2_shape(), FallbackInputs::default(), 1.0));
    }

    #[test]
    fn e2_predicate_ignores_memory() {
        let mut state = NetFallbackState::new(cfg(), 0.0);
        let inputs = FallbackInputs {
            cpu_p95: Some(19.5),
            net_avg: Some(18.0),
            mem_avg: Some(90.0), // memory healthy, but E2 does not care
        };
        assert!(state.evaluate(e2_shape(), inputs, 100.0));
    }

    #[test]
    fn memory_shape_requires_all_three() {
        let mut state = NetFallbackState::new(cfg(), 0.0);
        let mut inputs = at_risk();
        inputs.mem_avg = Some(50.0); // memory alone protects the instance
        assert!(!state.evaluate(a1_shape(), inputs, 100.0));
        inputs.mem_avg = Some(15.0);
        assert!(state.evaluate(a1_shape(), inputs, 100.0));
    }

    #[test]
    fn and_not_or_when_cpu_is_healthy() {
        let mut state = NetFallbackState::new(cfg(), 0.0);
        let inputs = FallbackInputs {
            cpu_p95: Some(24.0), // CPU already protects the instance
            net_avg: Some(5.0),
            mem_avg: Some(5.0),
        };
        assert!(!state.evaluate(a1_shape(), inputs, 100.0));
    }

    #[test]
    fn unknown_metrics_are_not_at_risk() {
        let mut state = NetFallbackState::new(cfg(), 0.0);
        assert!(!state.evaluate(e2_shape(), FallbackInputs::default(), 100.0));
    }

    #[test]
    fn min_on_holds_activation() {
        let mut state = NetFallbackState::new(cfg(), 0.0);
        assert!(state.evaluate(e2_shape(), at_risk(), 100.0));
        // Risk clears immediately, but min_on (60 s) pins the state.
        let healthy = FallbackInputs {
            cpu_p95: Some(30.0),
            net_avg: Some(30.0),
            mem_avg: None,
        };
        assert!(state.evaluate(e2_shape(), healthy, 130.0));
        // After min_on elapses the deactivation goes through.
        assert!(!state.evaluate(e2_shape(), healthy, 161.0));
    }

    #[test]
    fn min_off_holds_deactivation() {
        let mut state = NetFallbackState::new(cfg(), 0.0);
        assert!(state.evaluate(e2_shape(), at_risk(), 100.0));
        let healthy = FallbackInputs {
            cpu_p95: Some(30.0),
            net_avg: Some(30.0),
            mem_avg: None,
        };
        assert!(!state.evaluate(e2_shape(), healthy, 161.0));
        // Risk returns 10 s later; min_off (30 s) refuses the re-activation.
        assert!(!state.evaluate(e2_shape(), at_risk(), 171.0));
        // Once min_off has elapsed it may activate again.
        assert!(state.evaluate(e2_shape(), at_risk(), 192.0));
    }

    #[test]
    fn debounce_suppresses_rapid_flips() {
        let mut c = cfg();
        c.min_on_sec = 0.0;
        c.min_off_sec = 0.0;
        c.debounce_sec = 30.0;
        let mut state = NetFallbackState::new(c, 0.0);
        assert!(state.evaluate(e2_shape(), at_risk(), 100.0));
        let healthy = FallbackInputs {
            cpu_p95: Some(30.0),
            net_avg: Some(30.0),
            mem_avg: None,
        };
        // 10 s after the change: inside debounce, state holds.
        assert!(state.evaluate(e2_shape(), healthy, 110.0));
        // 31 s after: allowed to change.
        assert!(!state.evaluate(e2_shape(), healthy, 131.0));
    }

    #[test]
    fn stop_hysteresis_disarms() {
        let mut state = NetFallbackState::new(cfg(), 0.0);
        assert!(state.evaluate(e2_shape(), at_risk(), 100.0));
        // CPU still at risk but the NIC is busy beyond stop_pct.
        let inputs = FallbackInputs {
            cpu_p95: Some(19.0),
            net_avg: Some(24.0),
            mem_avg: None,
        };
        assert!(!state.evaluate(e2_shape(), inputs, 161.0));
    }

    #[test]
    fn scenario_e2_activation_and_release() {
        // Memory-policy disabled, CPU p95 19.5, net EMA 18: activates after
        // debounce machinery allows, holds min_on, then releases once the
        // CPU p95 climbs to 24 with net still at 18.
        let mut state = NetFallbackState::new(cfg(), 0.0);
        assert!(state.evaluate(e2_shape(), at_risk(), 50.0));
        let recovered = FallbackInputs {
            cpu_p95: Some(24.0),
            net_avg: Some(18.0),
            mem_avg: None,
        };
        // Still pinned by min_on.
        assert!(state.evaluate(e2_shape(), recovered, 100.0));
        // Released: memory is not in the predicate and CPU is no longer at risk.
        assert!(!state.evaluate(e2_shape(), recovered, 111.0));
        assert_eq!(state.status(111.0).activation_count, 1);
    }

    #[test]
    fn ramp_is_linear_then_saturates() {
        let mut state = NetFallbackState::new(cfg(), 0.0);
        assert!(state.evaluate(e2_shape(), at_risk(), 100.0));
        // ramp_sec = 10: halfway at t=105.
        let mid = state.ramped_target(2.0, 19.0, 105.0);
        assert!((mid - 10.5).abs() < 1e-9, "got {mid}");
        let done = state.ramped_target(2.0, 19.0, 120.0);
        assert!((done - 19.0).abs() < 1e-9);
        assert!(state.status(120.0).ramp_complete);
    }

    #[test]
    fn inactive_ramp_returns_base() {
        let state = NetFallbackState::new(cfg(), 0.0);
        assert!((state.ramped_target(7.0, 19.0, 50.0) - 7.0).abs() < 1e-9);
    }
}
