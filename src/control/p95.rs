//! P95-targeting CPU controller: a slot-quantized exceedance-budget state
//! machine that lands the 7-day CPU p95 inside a narrow band.
//!
//! The budget insight: with baseline intensity at the reclamation floor and a
//! small fraction of slots run "high", the observed p95 settles just above the
//! high/baseline boundary. The controller spends that exceedance budget slot
//! by slot — high when under budget, baseline when over — and nudges the
//! budget itself (and the high intensity) depending on which side of the band
//! the measured p95 sits.
//!
//! Everything here takes explicit `now` values so the state machine is
//! deterministic under test.

#![allow(missing_docs)]

use std::path::PathBuf;

use rand::Rng;
use serde::Serialize;

use crate::core::config::CpuP95Config;
use crate::core::errors::Result;
use crate::control::ring::SlotRing;
use crate::metrics::store::{MetricKind, MetricsStore};

// ──────────────────── tuning constants ────────────────────

/// Cooldown after a state change during which the deadband widens.
const STATE_CHANGE_COOLDOWN_SEC: f64 = 300.0;

/// Deadband while stable / right after a state change.
const HYSTERESIS_MEDIUM_PCT: f64 = 1.0;
const HYSTERESIS_XLARGE_PCT: f64 = 2.5;

/// Extra margin required inside the band before settling into Maintaining.
const MAINTAIN_BUFFER_SMALL: f64 = 0.5;
const MAINTAIN_BUFFER_LARGE: f64 = 2.0;

/// Distance from the band that triggers aggressive correction.
const DISTANCE_LARGE: f64 = 5.0;
const DISTANCE_XLARGE: f64 = 10.0;

/// Intensity adjustments by state.
const BUILD_BOOST_NORMAL: f64 = 5.0;
const BUILD_BOOST_AGGRESSIVE: f64 = 8.0;
const REDUCE_CUT_MODERATE: f64 = 2.0;
const REDUCE_CUT_AGGRESSIVE: f64 = 5.0;

/// Proportional gain and clamp margin for Maintaining setpoint control.
const MAINTAIN_GAIN: f64 = 0.2;
const SETPOINT_MARGIN: f64 = 1.0;

/// Exceedance-target adjustments by state, in percent of slots.
const BUILD_EXCEEDANCE_BOOST_NORMAL: f64 = 1.0;
const BUILD_EXCEEDANCE_BOOST_AGGRESSIVE: f64 = 4.0;
const REDUCE_EXCEEDANCE_MODERATE: f64 = 2.5;
const REDUCE_EXCEEDANCE_AGGRESSIVE: f64 = 1.0;
const EXCEEDANCE_SAFETY_CAP: f64 = 12.0;

/// Proportional load scaling: untouched below start, full baseline above full.
const SAFETY_SCALE_START: f64 = 0.5;
const SAFETY_SCALE_FULL: f64 = 0.8;
const SAFETY_MIN_SCALE: f64 = 0.7;

const DITHER_RANGE_PCT: f64 = 1.0;

// ──────────────────── public types ────────────────────

/// Where the measured p95 sits relative to the target band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ControllerState {
    Building,
    Maintaining,
    Reducing,
}

impl ControllerState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Building => "BUILDING",
            Self::Maintaining => "MAINTAINING",
            Self::Reducing => "REDUCING",
        }
    }
}

/// The controller's answer for the current tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlotDecision {
    pub is_high: bool,
    pub intensity_pct: f64,
}

/// Telemetry view of the controller.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub state: ControllerState,
    pub cpu_p95: Option<f64>,
    pub exceedance_pct: f64,
    pub exceedance_target_pct: f64,
    pub current_slot_is_high: bool,
    pub intensity_pct: f64,
    pub slots_recorded: usize,
    pub slots_skipped_safety: u64,
    pub consecutive_skipped_slots: u32,
}

// ──────────────────── controller ────────────────────

#[derive(Debug)]
pub struct P95Controller {
    cfg: CpuP95Config,
    ring: SlotRing,
    ring_path: PathBuf,
    state: ControllerState,
    last_state_change: f64,
    last_known_p95: Option<f64>,

    current_slot_index: Option<u64>,
    current_slot_is_high: bool,
    current_intensity: f64,

    slots_since_flush: u32,
    slots_skipped_safety: u64,
    consecutive_skipped_slots: u32,
    last_high_slot_ts: f64,
}

impl P95Controller {
    /// Restore the ring from `ring_path` (if compatible) and start in
    /// Building: a cold start has no trustworthy p95 yet.
    #[must_use]
    pub fn new(cfg: CpuP95Config, ring_path: PathBuf, now: f64) -> Self {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let slot_len = cfg.slot_duration_sec.max(1.0) as u64;
        let ring = SlotRing::load_or_new(&ring_path, slot_len);
        Self {
            cfg,
            ring,
            ring_path,
            state: ControllerState::Building,
            last_state_change: now,
            last_known_p95: None,
            current_slot_index: None,
            current_slot_is_high: false,
            current_intensity: 0.0,
            slots_since_flush: 0,
            slots_skipped_safety: 0,
            consecutive_skipped_slots: 0,
            last_high_slot_ts: now,
        }
    }

    #[must_use]
    pub fn state(&self) -> ControllerState {
        self.state
    }

    #[must_use]
    pub fn ring(&self) -> &SlotRing {
        &self.ring
    }

    /// Cached 7-day CPU p95, refreshed from the store when it can answer.
    /// A degraded or failing store leaves the last-known value in force.
    pub fn cpu_p95(&mut self, store: &MetricsStore, now: f64) -> Option<f64> {
        #[allow(clippy::cast_possible_truncation)]
        let now_i = now as i64;
        if let Some(fresh) = store.p95(MetricKind::Cpu, now_i) {
            self.last_known_p95 = Some(fresh);
        }
        self.last_known_p95
    }

    // ──────────────────── state machine ────────────────────

    /// Re-evaluate the band position. Unknown p95 leaves the state alone —
    /// a cold controller stays in Building until evidence arrives.
    pub fn update_state(&mut self, cpu_p95: Option<f64>, now: f64) {
        let Some(p95) = cpu_p95 else { return };
        let old = self.state;

        // Wider deadband right after a flip, narrower once settled.
        let recent = (now - self.last_state_change) < STATE_CHANGE_COOLDOWN_SEC;
        let hysteresis = if recent {
            HYSTERESIS_XLARGE_PCT
        } else {
            HYSTERESIS_MEDIUM_PCT
        };
        let maintain_buffer = if recent {
            MAINTAIN_BUFFER_LARGE
        } else {
            MAINTAIN_BUFFER_SMALL
        };

        let min = self.cfg.target_min_pct;
        let max = self.cfg.target_max_pct;

        if p95 < min - hysteresis {
            self.state = ControllerState::Building;
        } else if p95 > max + hysteresis {
            self.state = ControllerState::Reducing;
        } else if (min..=max).contains(&p95)
            && self.state != ControllerState::Maintaining
            && (min + maintain_buffer..=max - maintain_buffer).contains(&p95)
        {
            self.state = ControllerState::Maintaining;
        }

        if old != self.state {
            self.last_state_change = now;
            eprintln!(
                "[LK-P95] controller state {} -> {} (p95={p95:.1}%, deadband={hysteresis:.1}%)",
                old.as_str(),
                self.state.as_str()
            );
        }
    }

    // ──────────────────── targets ────────────────────

    /// Intensity for a high slot, scaled by state and distance from the band.
    #[must_use]
    pub fn target_intensity(&self, cpu_p95: Option<f64>) -> f64 {
        let high = self.cfg.high_intensity_pct;
        let computed = match self.state {
            ControllerState::Building => match cpu_p95 {
                Some(p95) if p95 < self.cfg.target_min_pct - DISTANCE_LARGE => {
                    high + BUILD_BOOST_AGGRESSIVE
                }
                _ => high + BUILD_BOOST_NORMAL,
            },
            ControllerState::Reducing => match cpu_p95 {
                // High slots stay genuinely high; reduction comes from running
                // fewer of them, not from flattening them into the baseline.
                Some(p95) if p95 > self.cfg.target_max_pct + DISTANCE_XLARGE => {
                    high - REDUCE_CUT_AGGRESSIVE
                }
                _ => high - REDUCE_CUT_MODERATE,
            },
            ControllerState::Maintaining => {
                let setpoint = self.cfg.setpoint_pct;
                match cpu_p95 {
                    Some(p95) => {
                        // Above 5% exceedance the p95 collapses onto the high
                        // intensity, so steering the high intensity toward the
                        // setpoint steers the p95 directly.
                        let adjustment = -(p95 - setpoint) * MAINTAIN_GAIN;
                        (setpoint + adjustment).clamp(
                            self.cfg.target_min_pct + SETPOINT_MARGIN,
                            self.cfg.target_max_pct - SETPOINT_MARGIN,
                        )
                    }
                    None => setpoint,
                }
            }
        };

        let base = computed.max(self.cfg.baseline_intensity_pct);
        if self.cfg.dither_enabled {
            let dither = rand::thread_rng().gen_range(-DITHER_RANGE_PCT..=DITHER_RANGE_PCT);
            (base + dither).clamp(self.cfg.baseline_intensity_pct, 100.0)
        } else {
            base
        }
    }

    /// Target exceedance ratio in `[0, 1]`, adapted by state.
    #[must_use]
    pub fn exceedance_target(&self, cpu_p95: Option<f64>) -> f64 {
        let base = self.cfg.exceedance_target_pct;
        let pct = match self.state {
            ControllerState::Building => match cpu_p95 {
                Some(p95) if p95 < self.cfg.target_min_pct - DISTANCE_LARGE => {
                    (base + BUILD_EXCEEDANCE_BOOST_AGGRESSIVE).min(EXCEEDANCE_SAFETY_CAP)
                }
                _ => base + BUILD_EXCEEDANCE_BOOST_NORMAL,
            },
            ControllerState::Reducing => match cpu_p95 {
                Some(p95) if p95 > self.cfg.target_max_pct + DISTANCE_XLARGE => {
                    REDUCE_EXCEEDANCE_AGGRESSIVE
                }
                _ => REDUCE_EXCEEDANCE_MODERATE,
            },
            // Single-variable control while maintaining; moving both the
            // budget and the intensity at once oscillates.
            ControllerState::Maintaining => base,
        };
        pct / 100.0
    }

    // ──────────────────── slot engine ────────────────────

    /// Advance the slot engine to `now` and return the decision in force.
    ///
    /// On each boundary crossing the finished slot's final bit is appended to
    /// the ring (flushing every `ring_flush_every_slots`), then the new slot
    /// is decided: forced-high fallback first, then the load gate, then the
    /// budget comparison.
    pub fn on_tick(
        &mut self,
        cpu_p95: Option<f64>,
        load_per_core: Option<f64>,
        load_gate_enabled: bool,
        load_threshold: f64,
        now: f64,
    ) -> SlotDecision {
        let slot_now = self.ring.slot_index_for(now);

        let rolled_over = match self.current_slot_index {
            None => true,
            Some(current) => slot_now > current,
        };

        if rolled_over {
            if let Some(current) = self.current_slot_index {
                self.end_slot(current);
            }
            self.start_slot(slot_now, cpu_p95, load_per_core, load_gate_enabled, load_threshold, now);
        }

        SlotDecision {
            is_high: self.current_slot_is_high,
            intensity_pct: self.current_intensity,
        }
    }

    /// Downgrade the in-flight slot after an external safety override so the
    /// ring records what actually ran. Skipping this would log forced-baseline
    /// slots as high and permanently overspend the budget.
    pub fn mark_current_slot_low(&mut self) {
        if self.current_slot_is_high {
            self.current_slot_is_high = false;
            self.current_intensity = self.cfg.baseline_intensity_pct;
        }
    }

    /// Flush the ring if it has unwritten slots. Called on shutdown.
    pub fn flush_ring(&mut self) -> Result<()> {
        if self.ring.dirty() {
            self.ring.save(&self.ring_path)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn status(&self) -> ControllerStatus {
        ControllerStatus {
            state: self.state,
            cpu_p95: self.last_known_p95,
            exceedance_pct: self.ring.exceedance_ratio() * 100.0,
            exceedance_target_pct: self.exceedance_target(self.last_known_p95) * 100.0,
            current_slot_is_high: self.current_slot_is_high,
            intensity_pct: self.current_intensity,
            slots_recorded: self.ring.known_count(),
            slots_skipped_safety: self.slots_skipped_safety,
            consecutive_skipped_slots: self.consecutive_skipped_slots,
        }
    }

    fn end_slot(&mut self, slot_index: u64) {
        if !self.ring.record(slot_index, self.current_slot_is_high) {
            return;
        }
        self.slots_since_flush += 1;
        if self.slots_since_flush >= self.cfg.ring_flush_every_slots {
            if let Err(e) = self.ring.save(&self.ring_path) {
                eprintln!("[LK-P95] ring flush failed (will retry next batch): {e}");
            }
            self.slots_since_flush = 0;
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn start_slot(
        &mut self,
        slot_index: u64,
        cpu_p95: Option<f64>,
        load_per_core: Option<f64>,
        load_gate_enabled: bool,
        load_threshold: f64,
        now: f64,
    ) {
        self.current_slot_index = Some(slot_index);

        // Anti-collapse fallback: under sustained load the gate could starve
        // high slots until the p95 sinks through the floor.
        let force_high = self.consecutive_skipped_slots >= self.cfg.max_consecutive_skipped_slots
            || (now - self.last_high_slot_ts) >= self.cfg.min_high_slot_interval_sec;

        let load_hot = load_gate_enabled
            && load_per_core.is_some_and(|load| load > load_threshold);

        if load_hot && !force_high {
            self.slots_skipped_safety += 1;
            self.consecutive_skipped_slots += 1;
            self.current_slot_is_high = false;
            let normal = self.target_intensity(cpu_p95);
            self.current_intensity =
                self.safety_scaled_intensity(load_per_core.unwrap_or(0.0), normal);
            return;
        }

        let ratio = self.ring.exceedance_ratio();
        let target = self.exceedance_target(cpu_p95);

        if force_high {
            self.current_slot_is_high = true;
            let normal = self.target_intensity(cpu_p95);
            self.current_intensity = if load_hot {
                // Forced through a hot gate: run, but gently.
                self.safety_scaled_intensity(load_per_core.unwrap_or(0.0), normal)
            } else {
                normal
            };
            eprintln!(
                "[LK-P95] forced high slot (skipped={}, since_high={:.0}s)",
                self.consecutive_skipped_slots,
                now - self.last_high_slot_ts
            );
        } else if ratio < target {
            self.current_slot_is_high = true;
            self.current_intensity = self.target_intensity(cpu_p95);
        } else {
            self.current_slot_is_high = false;
            self.current_intensity = self.cfg.baseline_intensity_pct;
        }

        if self.current_slot_is_high {
            self.consecutive_skipped_slots = 0;
            self.last_high_slot_ts = now;
        }
    }

    /// Proportional degrade between full intensity and baseline as per-core
    /// load climbs from `SAFETY_SCALE_START` to `SAFETY_SCALE_FULL`.
    fn safety_scaled_intensity(&self, load_per_core: f64, normal: f64) -> f64 {
        if load_per_core <= SAFETY_SCALE_START {
            return normal;
        }
        if load_per_core >= SAFETY_SCALE_FULL {
            return self.cfg.baseline_intensity_pct;
        }
        let progress = (load_per_core - SAFETY_SCALE_START) / (SAFETY_SCALE_FULL - SAFETY_SCALE_START);
        let span = normal - normal * SAFETY_MIN_SCALE;
        (normal - span * progress).clamp(self.cfg.baseline_intensity_pct, self.cfg.high_intensity_pct)
    }
}

// ──────────────────── tests ────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cfg() -> CpuP95Config {
        CpuP95Config {
            dither_enabled: false,
            ..CpuP95Config::default()
        }
    }

    fn controller(dir: &tempfile::TempDir) -> P95Controller {
        P95Controller::new(test_cfg(), dir.path().join("p95_ring_buffer.json"), 0.0)
    }

    #[test]
    fn cold_start_is_building() {
        let dir = tempfile::tempdir().unwrap();
        let ctrl = controller(&dir);
        assert_eq!(ctrl.state(), ControllerState::Building);
    }

    #[test]
    fn unknown_p95_keeps_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctrl = controller(&dir);
        ctrl.update_state(None, 1_000.0);
        assert_eq!(ctrl.state(), ControllerState::Building);
    }

    #[test]
    fn building_to_maintaining_needs_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctrl = controller(&dir);
        // Just inside the band but within the large (post-change) buffer: holds.
        ctrl.update_state(Some(22.5), 10.0);
        assert_eq!(ctrl.state(), ControllerState::Building);
        // Well inside the band, after the cooldown: flips.
        ctrl.update_state(Some(25.0), 400.0);
        assert_eq!(ctrl.state(), ControllerState::Maintaining);
    }

    #[test]
    fn maintaining_flips_to_reducing_above_band() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctrl = controller(&dir);
        ctrl.update_state(Some(25.0), 400.0);
        assert_eq!(ctrl.state(), ControllerState::Maintaining);
        // Within the deadband: no flip.
        ctrl.update_state(Some(28.5), 800.0);
        assert_eq!(ctrl.state(), ControllerState::Maintaining);
        // Well beyond max + deadband: flips.
        ctrl.update_state(Some(31.0), 801.0);
        assert_eq!(ctrl.state(), ControllerState::Reducing);
    }

    #[test]
    fn no_flip_within_deadband() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctrl = controller(&dir);
        ctrl.update_state(Some(25.0), 400.0);
        let settled = ctrl.state();
        // Oscillate within ±hysteresis of both edges; state must hold.
        for (i, p95) in [21.5, 22.4, 28.6, 27.9, 21.2].iter().enumerate() {
            #[allow(clippy::cast_precision_loss)]
            ctrl.update_state(Some(*p95), 1_000.0 + i as f64);
            assert_eq!(ctrl.state(), settled, "flip inside deadband at p95={p95}");
        }
    }

    #[test]
    fn reducing_returns_to_maintaining_inside_band() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctrl = controller(&dir);
        ctrl.update_state(Some(35.0), 400.0);
        assert_eq!(ctrl.state(), ControllerState::Reducing);
        ctrl.update_state(Some(25.0), 1_000.0);
        assert_eq!(ctrl.state(), ControllerState::Maintaining);
    }

    #[test]
    fn building_intensity_exceeds_high() {
        let dir = tempfile::tempdir().unwrap();
        let ctrl = controller(&dir);
        let normal = ctrl.target_intensity(Some(20.0));
        assert!((normal - 40.0).abs() < 1e-9, "high + build boost, got {normal}");
        let aggressive = ctrl.target_intensity(Some(10.0));
        assert!((aggressive - 43.0).abs() < 1e-9, "got {aggressive}");
    }

    #[test]
    fn maintaining_intensity_tracks_setpoint() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctrl = controller(&dir);
        ctrl.update_state(Some(25.0), 400.0);
        // At the setpoint: no adjustment.
        let at = ctrl.target_intensity(Some(25.0));
        assert!((at - 25.0).abs() < 1e-9);
        // Below the setpoint: intensity nudges up; above: down.
        assert!(ctrl.target_intensity(Some(23.0)) > at);
        assert!(ctrl.target_intensity(Some(27.0)) < at);
        // Clamped inside the band with margin.
        let clamped = ctrl.target_intensity(Some(5.0));
        assert!(clamped <= 27.0 + 1e-9);
    }

    #[test]
    fn exceedance_target_per_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctrl = controller(&dir);
        // Building, far below: capped aggressive boost.
        assert!((ctrl.exceedance_target(Some(10.0)) - 0.105).abs() < 1e-9);
        // Building, near: normal boost.
        assert!((ctrl.exceedance_target(Some(21.0)) - 0.075).abs() < 1e-9);
        ctrl.update_state(Some(25.0), 400.0);
        assert!((ctrl.exceedance_target(Some(25.0)) - 0.065).abs() < 1e-9);
        ctrl.update_state(Some(45.0), 1_000.0);
        assert!((ctrl.exceedance_target(Some(45.0)) - 0.01).abs() < 1e-9);
    }

    #[test]
    fn first_tick_opens_a_slot() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctrl = controller(&dir);
        let d = ctrl.on_tick(None, Some(0.1), true, 0.6, 30.0);
        // Empty ring: ratio 0 < target, so the very first slot is high.
        assert!(d.is_high);
        assert!(d.intensity_pct > ctrl.cfg.baseline_intensity_pct);
    }

    #[test]
    fn decision_is_stable_within_a_slot() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctrl = controller(&dir);
        let first = ctrl.on_tick(None, Some(0.1), true, 0.6, 5.0);
        let again = ctrl.on_tick(None, Some(0.1), true, 0.6, 30.0);
        assert_eq!(first, again, "same slot, same decision");
    }

    #[test]
    fn repeating_a_tick_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctrl = controller(&dir);
        let a = ctrl.on_tick(Some(25.0), Some(0.1), true, 0.6, 65.0);
        let before = ctrl.ring.known_count();
        let b = ctrl.on_tick(Some(25.0), Some(0.1), true, 0.6, 65.0);
        assert_eq!(a, b);
        assert_eq!(ctrl.ring.known_count(), before, "no double-append");
    }

    #[test]
    fn boundary_crossing_records_previous_slot() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctrl = controller(&dir);
        let first = ctrl.on_tick(None, Some(0.1), true, 0.6, 10.0);
        assert!(first.is_high);
        // Next slot starts at t=60; the finished slot lands in the ring.
        ctrl.on_tick(None, Some(0.1), true, 0.6, 61.0);
        assert_eq!(ctrl.ring.known_count(), 1);
        assert_eq!(ctrl.ring.high_count(), 1);
    }

    #[test]
    fn hot_load_forces_baseline_slot() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctrl = controller(&dir);
        let d = ctrl.on_tick(None, Some(1.5), true, 0.6, 10.0);
        assert!(!d.is_high, "gate must win over the budget");
        // The recorded bit is the gated one.
        ctrl.on_tick(None, Some(1.5), true, 0.6, 61.0);
        assert_eq!(ctrl.ring.high_count(), 0);
        assert_eq!(ctrl.status().slots_skipped_safety, 2);
    }

    #[test]
    fn gate_disabled_ignores_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctrl = controller(&dir);
        let d = ctrl.on_tick(None, Some(5.0), false, 0.6, 10.0);
        assert!(d.is_high);
    }

    #[test]
    fn mark_current_slot_low_rewrites_pending_bit() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctrl = controller(&dir);
        let d = ctrl.on_tick(None, Some(0.1), true, 0.6, 10.0);
        assert!(d.is_high);
        // An external gate fired after the decision.
        ctrl.mark_current_slot_low();
        ctrl.on_tick(None, Some(0.1), true, 0.6, 61.0);
        // Post-gate accounting: the ring holds a baseline bit, not a high one.
        assert_eq!(ctrl.ring.high_count(), 0);
        assert_eq!(ctrl.ring.known_count(), 1);
    }

    #[test]
    fn forced_high_after_sustained_skips() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_cfg();
        cfg.max_consecutive_skipped_slots = 3;
        let mut ctrl = P95Controller::new(cfg, dir.path().join("ring.json"), 0.0);

        let mut t = 10.0;
        for _ in 0..3 {
            let d = ctrl.on_tick(Some(18.0), Some(1.2), true, 0.6, t);
            assert!(!d.is_high);
            t += 60.0;
        }
        // Fourth slot breaches the skip limit and forces a high slot even
        // though the load is still hot.
        let d = ctrl.on_tick(Some(18.0), Some(1.2), true, 0.6, t);
        assert!(d.is_high, "anti-collapse fallback must fire");
        assert_eq!(ctrl.status().consecutive_skipped_slots, 0);
    }

    #[test]
    fn exceedance_converges_to_target() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctrl = controller(&dir);
        // Hold the controller in Maintaining at a healthy p95 so the target
        // stays at the configured 6.5%.
        ctrl.update_state(Some(25.0), 400.0);

        let mut t = 500.0;
        for _ in 0..2_000 {
            ctrl.on_tick(Some(25.0), Some(0.1), true, 0.6, t);
            t += 60.0;
        }
        let ratio = ctrl.ring.exceedance_ratio();
        assert!(
            (ratio - 0.065).abs() <= 0.01,
            "ratio should converge within ±1%: {ratio}"
        );
    }

    #[test]
    fn ring_flushes_every_k_slots() {
        let dir = tempfile::tempdir().unwrap();
        let ring_path = dir.path().join("p95_ring_buffer.json");
        let mut cfg = test_cfg();
        cfg.ring_flush_every_slots = 5;
        let mut ctrl = P95Controller::new(cfg, ring_path.clone(), 0.0);

        let mut t = 10.0;
        for _ in 0..4 {
            ctrl.on_tick(None, Some(0.1), true, 0.6, t);
            t += 60.0;
        }
        assert!(!ring_path.exists(), "no flush before the batch fills");
        for _ in 0..3 {
            ctrl.on_tick(None, Some(0.1), true, 0.6, t);
            t += 60.0;
        }
        assert!(ring_path.exists(), "flush after k recorded slots");
    }

    #[test]
    fn final_flush_persists_pending_slots() {
        let dir = tempfile::tempdir().unwrap();
        let ring_path = dir.path().join("p95_ring_buffer.json");
        let mut ctrl = P95Controller::new(test_cfg(), ring_path.clone(), 0.0);
        ctrl.on_tick(None, Some(0.1), true, 0.6, 10.0);
        ctrl.on_tick(None, Some(0.1), true, 0.6, 70.0);
        ctrl.flush_ring().unwrap();
        assert!(ring_path.exists());

        let restored = SlotRing::load_or_new(&ring_path, 60);
        assert_eq!(restored.known_count(), 1);
    }

    #[test]
    fn safety_scaling_is_proportional() {
        let dir = tempfile::tempdir().unwrap();
        let ctrl = controller(&dir);
        let normal = 35.0;
        assert!((ctrl.safety_scaled_intensity(0.3, normal) - normal).abs() < 1e-9);
        assert!(
            (ctrl.safety_scaled_intensity(0.9, normal) - 20.0).abs() < 1e-9,
            "full scale hits baseline"
        );
        let mid = ctrl.safety_scaled_intensity(0.65, normal);
        assert!(mid < normal && mid > 20.0, "midpoint scales between: {mid}");
    }

    #[test]
    fn status_reflects_ring_and_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctrl = controller(&dir);
        ctrl.on_tick(Some(25.0), Some(0.1), true, 0.6, 10.0);
        let status = ctrl.status();
        assert_eq!(status.state, ControllerState::Building);
        assert!(status.current_slot_is_high);
        assert_eq!(status.slots_recorded, 0);
    }
}
