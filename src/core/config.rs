//! Configuration system: TOML file + env var overrides + defaults.
//!
//! Resolution order is explicit override (`LK_*` env vars) > file > built-in
//! defaults. Shape templates are an external concern: whatever produced the
//! file (template expansion, operator edits) is invisible here.

#![allow(missing_docs)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::errors::{LkError, Result};

/// Full loadkeeper configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub control: ControlConfig,
    pub cpu: CpuP95Config,
    pub mem: MemConfig,
    pub net: NetConfig,
    pub fallback: FallbackConfig,
    pub safety: SafetyConfig,
    pub storage: StorageConfig,
    pub telemetry: TelemetryConfig,
    pub shape: ShapePolicy,
}

/// Coordinator tick cadence and smoothing windows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControlConfig {
    /// Seconds between coordinator ticks.
    pub tick_interval_sec: f64,
    /// EMA smoothing window for current-value averages.
    pub avg_window_sec: f64,
    /// Random jitter applied to mem/net targets, in percent of the target.
    pub jitter_pct: f64,
    /// Seconds between jitter refreshes.
    pub jitter_period_sec: f64,
}

/// P95 exceedance-budget controller knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CpuP95Config {
    /// Lower edge of the 7-day p95 target band.
    pub target_min_pct: f64,
    /// Upper edge of the 7-day p95 target band.
    pub target_max_pct: f64,
    /// Preferred operating point inside the band.
    pub setpoint_pct: f64,
    /// Long-run fraction of slots run at high intensity, in percent.
    pub exceedance_target_pct: f64,
    /// Length of one control slot in seconds.
    pub slot_duration_sec: f64,
    /// Worker intensity during exceedance slots.
    pub high_intensity_pct: f64,
    /// Worker intensity during baseline slots. Must stay at or above the
    /// provider's 20% floor so even "off" slots protect the instance.
    pub baseline_intensity_pct: f64,
    /// Persist the ring buffer to disk every this many completed slots.
    pub ring_flush_every_slots: u32,
    /// Force a high slot after this many consecutive safety-skipped slots.
    pub max_consecutive_skipped_slots: u32,
    /// Force a high slot when none ran for this many seconds.
    pub min_high_slot_interval_sec: f64,
    /// Hard cap on worker duty cycle.
    pub max_duty: f64,
    /// ±1% dither on high-slot intensity. Disabled in tests for determinism.
    pub dither_enabled: bool,
}

/// Memory occupier knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MemConfig {
    /// Target memory utilization (excluding reclaimable cache). 0 disables
    /// the occupier entirely (shapes without a memory reclamation rule).
    pub target_pct: f64,
    /// Never shrink system free memory below this many MB.
    pub min_free_mb: u64,
    /// Allocation/release granularity per tick.
    pub step_mb: u64,
    /// Seconds between page-touch passes.
    pub touch_interval_sec: f64,
}

/// Network generator knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetConfig {
    /// Baseline NIC utilization target in percent of link bandwidth.
    pub target_pct: f64,
    /// Link bandwidth in Mbit/s when the interface does not report a speed.
    pub link_mbit: f64,
    /// Interface whose counters are used for sensing and validation.
    pub iface: String,
    /// Destination port on peers.
    pub port: u16,
    /// Preferred protocol: "udp" or "tcp".
    pub protocol: String,
    /// IP TTL / hop limit on emitted packets. 1 keeps traffic at the first hop.
    pub ttl: u32,
    /// Payload size per packet in bytes.
    pub packet_size: usize,
    /// Rate steering bounds in Mbit/s.
    pub min_rate_mbit: f64,
    pub max_rate_mbit: f64,
    /// Proportional gain for rate steering (Mbit/s per percent of error).
    pub rate_gain: f64,
    /// Configured peers, "host" or "host:port".
    pub peers: Vec<String>,
    /// Per-call socket timeout in milliseconds.
    pub timeout_ms: u64,
    /// Seconds between NIC tx-byte validation checks.
    pub validation_interval_sec: f64,
    /// Bound on the startup UDP probe's validation wait.
    pub validation_timeout_ms: u64,
    /// Minimum observed tx-byte delta per validation period before the check
    /// counts as a miss.
    pub min_tx_delta_bytes: u64,
    /// Consecutive validation misses before the fallback chain advances.
    pub validation_miss_limit: u32,
    /// Consecutive send errors before protocol fallback.
    pub error_limit: u32,
    /// Seconds to sit in ERROR before re-initializing.
    pub error_cooldown_sec: f64,
}

/// Shape-aware network fallback activation knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FallbackConfig {
    /// "adaptive", "always", or "off".
    pub mode: String,
    /// A metric is "at risk" below this percentage.
    pub risk_threshold_pct: f64,
    /// Network utilization floor that arms activation.
    pub start_pct: f64,
    /// Network utilization that disarms activation (hysteresis).
    pub stop_pct: f64,
    /// No flip within this many seconds of the previous flip.
    pub debounce_sec: f64,
    /// Once on, stay on at least this long.
    pub min_on_sec: f64,
    /// Once off, stay off at least this long.
    pub min_off_sec: f64,
    /// Ramp the effective target to the fallback target over this many seconds.
    pub ramp_sec: f64,
}

/// Safety gates that override every controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SafetyConfig {
    pub cpu_stop_pct: f64,
    pub mem_stop_pct: f64,
    pub net_stop_pct: f64,
    /// Per-core 1-minute load average that pauses all shaping.
    pub load_threshold: f64,
    /// Per-core load below which shaping resumes.
    pub load_resume_threshold: f64,
    pub load_check_enabled: bool,
    /// Band around mem/net targets that suppresses add/remove churn.
    pub hysteresis_pct: f64,
}

/// Persistence layout and store tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding metrics.db, p95_ring_buffer.json and instance.lock.
    pub dir: PathBuf,
    /// p95 cache TTL in seconds.
    pub p95_cache_ttl_sec: u64,
    /// Sample retention window in days.
    pub retention_days: u32,
    /// Consecutive write failures before the store reports degraded.
    pub max_consecutive_failures: u32,
    /// Run the consistency probe every this many ticks.
    pub probe_every_ticks: u32,
}

/// Telemetry output tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Machine-readable JSONL stream; None disables it.
    pub jsonl_path: Option<PathBuf>,
    pub channel_capacity: usize,
    /// Minimum seconds between repeats of the same warning code.
    pub warn_rate_limit_sec: u64,
    /// Seconds between snapshot.json rewrites.
    pub snapshot_interval_sec: u64,
}

/// What the instance's shape counts toward reclamation.
///
/// Detection and template expansion happen outside the daemon; the resolved
/// policy arrives here as two flags.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ShapePolicy {
    /// Whether the provider's idle rule includes memory utilization.
    pub counts_memory: bool,
    /// Whether only egress to the public internet counts as network activity.
    pub requires_external_egress: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            tick_interval_sec: 5.0,
            avg_window_sec: 300.0,
            jitter_pct: 10.0,
            jitter_period_sec: 5.0,
        }
    }
}

impl Default for CpuP95Config {
    fn default() -> Self {
        Self {
            target_min_pct: 22.0,
            target_max_pct: 28.0,
            setpoint_pct: 25.0,
            exceedance_target_pct: 6.5,
            slot_duration_sec: 60.0,
            high_intensity_pct: 35.0,
            baseline_intensity_pct: 20.0,
            ring_flush_every_slots: 10,
            max_consecutive_skipped_slots: 120,
            min_high_slot_interval_sec: 3600.0,
            max_duty: 0.95,
            dither_enabled: true,
        }
    }
}

impl Default for MemConfig {
    fn default() -> Self {
        Self {
            target_pct: 60.0,
            min_free_mb: 512,
            step_mb: 64,
            touch_interval_sec: 1.0,
        }
    }
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            target_pct: 10.0,
            link_mbit: 1000.0,
            iface: "eth0".to_string(),
            port: 15201,
            protocol: "udp".to_string(),
            ttl: 1,
            packet_size: 1100,
            min_rate_mbit: 1.0,
            max_rate_mbit: 800.0,
            rate_gain: 0.60,
            peers: Vec::new(),
            timeout_ms: 500,
            validation_interval_sec: 60.0,
            validation_timeout_ms: 2_000,
            min_tx_delta_bytes: 16 * 1024,
            validation_miss_limit: 3,
            error_limit: 5,
            error_cooldown_sec: 30.0,
        }
    }
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            mode: "adaptive".to_string(),
            risk_threshold_pct: 22.0,
            start_pct: 19.0,
            stop_pct: 23.0,
            debounce_sec: 30.0,
            min_on_sec: 60.0,
            min_off_sec: 30.0,
            ramp_sec: 10.0,
        }
    }
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            cpu_stop_pct: 85.0,
            mem_stop_pct: 90.0,
            net_stop_pct: 60.0,
            load_threshold: 0.6,
            load_resume_threshold: 0.4,
            load_check_enabled: true,
            hysteresis_pct: 5.0,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/lib/loadkeeper"),
            p95_cache_ttl_sec: 300,
            retention_days: 7,
            max_consecutive_failures: 5,
            probe_every_ticks: 1_000,
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            jsonl_path: None,
            channel_capacity: 1024,
            warn_rate_limit_sec: 60,
            snapshot_interval_sec: 10,
        }
    }
}

impl Default for ShapePolicy {
    fn default() -> Self {
        Self {
            counts_memory: true,
            requires_external_egress: false,
        }
    }
}

impl Config {
    /// Load config from an optional explicit path, then apply env overrides.
    ///
    /// A missing file is only an error when the path was explicit; otherwise
    /// defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) if p.exists() => {
                let raw = fs::read_to_string(p).map_err(|source| LkError::Io {
                    path: p.to_path_buf(),
                    source,
                })?;
                let parsed: Self = toml::from_str(&raw)?;
                parsed
            }
            Some(p) => {
                return Err(LkError::MissingConfig {
                    path: p.to_path_buf(),
                });
            }
            None => Self::default(),
        };

        cfg.apply_env_overrides_from(env_var)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Deterministic FNV-1a hash of the effective config for telemetry.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    #[allow(clippy::too_many_lines)]
    pub(crate) fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        // control
        set_f64(&mut lookup, "LK_TICK_INTERVAL_SEC", &mut self.control.tick_interval_sec)?;
        set_f64(&mut lookup, "LK_AVG_WINDOW_SEC", &mut self.control.avg_window_sec)?;
        set_f64(&mut lookup, "LK_JITTER_PCT", &mut self.control.jitter_pct)?;
        set_f64(&mut lookup, "LK_JITTER_PERIOD_SEC", &mut self.control.jitter_period_sec)?;

        // cpu / p95
        set_f64(&mut lookup, "LK_CPU_P95_TARGET_MIN", &mut self.cpu.target_min_pct)?;
        set_f64(&mut lookup, "LK_CPU_P95_TARGET_MAX", &mut self.cpu.target_max_pct)?;
        set_f64(&mut lookup, "LK_CPU_P95_SETPOINT", &mut self.cpu.setpoint_pct)?;
        set_f64(
            &mut lookup,
            "LK_CPU_P95_EXCEEDANCE_TARGET",
            &mut self.cpu.exceedance_target_pct,
        )?;
        set_f64(&mut lookup, "LK_CPU_P95_SLOT_DURATION_SEC", &mut self.cpu.slot_duration_sec)?;
        set_f64(&mut lookup, "LK_CPU_P95_HIGH_INTENSITY", &mut self.cpu.high_intensity_pct)?;
        set_f64(
            &mut lookup,
            "LK_CPU_P95_BASELINE_INTENSITY",
            &mut self.cpu.baseline_intensity_pct,
        )?;
        set_u32(&mut lookup, "LK_RING_FLUSH_EVERY_SLOTS", &mut self.cpu.ring_flush_every_slots)?;
        set_u32(
            &mut lookup,
            "LK_MAX_CONSECUTIVE_SKIPPED_SLOTS",
            &mut self.cpu.max_consecutive_skipped_slots,
        )?;

        // mem
        set_f64(&mut lookup, "LK_MEM_TARGET_PCT", &mut self.mem.target_pct)?;
        set_u64(&mut lookup, "LK_MEM_MIN_FREE_MB", &mut self.mem.min_free_mb)?;
        set_u64(&mut lookup, "LK_MEM_STEP_MB", &mut self.mem.step_mb)?;
        set_f64(&mut lookup, "LK_MEM_TOUCH_INTERVAL_SEC", &mut self.mem.touch_interval_sec)?;

        // net
        set_f64(&mut lookup, "LK_NET_TARGET_PCT", &mut self.net.target_pct)?;
        set_f64(&mut lookup, "LK_NET_LINK_MBIT", &mut self.net.link_mbit)?;
        set_string(&mut lookup, "LK_NET_IFACE", &mut self.net.iface);
        set_u16(&mut lookup, "LK_NET_PORT", &mut self.net.port)?;
        set_string(&mut lookup, "LK_NET_PROTOCOL", &mut self.net.protocol);
        set_u32(&mut lookup, "LK_NET_TTL", &mut self.net.ttl)?;
        set_usize(&mut lookup, "LK_NET_PACKET_SIZE", &mut self.net.packet_size)?;
        set_f64(&mut lookup, "LK_NET_MIN_RATE_MBIT", &mut self.net.min_rate_mbit)?;
        set_f64(&mut lookup, "LK_NET_MAX_RATE_MBIT", &mut self.net.max_rate_mbit)?;
        if let Some(raw) = lookup("LK_NET_PEERS") {
            self.net.peers = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect();
        }

        // fallback
        set_string(&mut lookup, "LK_NET_ACTIVATION", &mut self.fallback.mode);
        set_f64(
            &mut lookup,
            "LK_NET_FALLBACK_RISK_THRESHOLD_PCT",
            &mut self.fallback.risk_threshold_pct,
        )?;
        set_f64(&mut lookup, "LK_NET_FALLBACK_START_PCT", &mut self.fallback.start_pct)?;
        set_f64(&mut lookup, "LK_NET_FALLBACK_STOP_PCT", &mut self.fallback.stop_pct)?;
        set_f64(&mut lookup, "LK_NET_FALLBACK_DEBOUNCE_SEC", &mut self.fallback.debounce_sec)?;
        set_f64(&mut lookup, "LK_NET_FALLBACK_MIN_ON_SEC", &mut self.fallback.min_on_sec)?;
        set_f64(&mut lookup, "LK_NET_FALLBACK_MIN_OFF_SEC", &mut self.fallback.min_off_sec)?;
        set_f64(&mut lookup, "LK_NET_FALLBACK_RAMP_SEC", &mut self.fallback.ramp_sec)?;

        // safety
        set_f64(&mut lookup, "LK_CPU_STOP_PCT", &mut self.safety.cpu_stop_pct)?;
        set_f64(&mut lookup, "LK_MEM_STOP_PCT", &mut self.safety.mem_stop_pct)?;
        set_f64(&mut lookup, "LK_NET_STOP_PCT", &mut self.safety.net_stop_pct)?;
        set_f64(&mut lookup, "LK_LOAD_THRESHOLD", &mut self.safety.load_threshold)?;
        set_f64(
            &mut lookup,
            "LK_LOAD_RESUME_THRESHOLD",
            &mut self.safety.load_resume_threshold,
        )?;
        set_bool(&mut lookup, "LK_LOAD_CHECK_ENABLED", &mut self.safety.load_check_enabled)?;
        set_f64(&mut lookup, "LK_HYSTERESIS_PCT", &mut self.safety.hysteresis_pct)?;

        // storage
        if let Some(raw) = lookup("LK_STORAGE_DIR") {
            self.storage.dir = PathBuf::from(raw);
        }
        set_u64(&mut lookup, "LK_P95_CACHE_TTL_SEC", &mut self.storage.p95_cache_ttl_sec)?;

        // shape
        set_bool(&mut lookup, "LK_SHAPE_COUNTS_MEMORY", &mut self.shape.counts_memory)?;
        set_bool(
            &mut lookup,
            "LK_SHAPE_REQUIRES_EXTERNAL_EGRESS",
            &mut self.shape.requires_external_egress,
        )?;

        Ok(())
    }

    /// Cross-parameter validation. Every rejection names the offending options.
    #[allow(clippy::too_many_lines)]
    pub fn validate(&self) -> Result<()> {
        fn invalid(details: String) -> LkError {
            LkError::InvalidConfig { details }
        }

        for (name, val) in [
            ("cpu.target_min_pct", self.cpu.target_min_pct),
            ("cpu.target_max_pct", self.cpu.target_max_pct),
            ("cpu.setpoint_pct", self.cpu.setpoint_pct),
            ("cpu.high_intensity_pct", self.cpu.high_intensity_pct),
            ("cpu.baseline_intensity_pct", self.cpu.baseline_intensity_pct),
            ("mem.target_pct", self.mem.target_pct),
            ("net.target_pct", self.net.target_pct),
            ("safety.cpu_stop_pct", self.safety.cpu_stop_pct),
            ("safety.mem_stop_pct", self.safety.mem_stop_pct),
            ("safety.net_stop_pct", self.safety.net_stop_pct),
            ("fallback.risk_threshold_pct", self.fallback.risk_threshold_pct),
            ("fallback.start_pct", self.fallback.start_pct),
            ("fallback.stop_pct", self.fallback.stop_pct),
        ] {
            if !(0.0..=100.0).contains(&val) {
                return Err(invalid(format!("{name} must be in [0, 100], got {val}")));
            }
        }

        if self.cpu.target_min_pct >= self.cpu.target_max_pct {
            return Err(invalid(format!(
                "cpu.target_min_pct ({}) must be < cpu.target_max_pct ({})",
                self.cpu.target_min_pct, self.cpu.target_max_pct
            )));
        }
        if self.cpu.setpoint_pct < self.cpu.target_min_pct
            || self.cpu.setpoint_pct > self.cpu.target_max_pct
        {
            return Err(invalid(format!(
                "cpu.setpoint_pct ({}) must lie inside [cpu.target_min_pct, cpu.target_max_pct]",
                self.cpu.setpoint_pct
            )));
        }
        if self.cpu.baseline_intensity_pct >= self.cpu.high_intensity_pct {
            return Err(invalid(format!(
                "cpu.baseline_intensity_pct ({}) must be < cpu.high_intensity_pct ({})",
                self.cpu.baseline_intensity_pct, self.cpu.high_intensity_pct
            )));
        }
        if self.cpu.slot_duration_sec < 1.0 {
            return Err(invalid(format!(
                "cpu.slot_duration_sec must be >= 1, got {}",
                self.cpu.slot_duration_sec
            )));
        }
        if !(0.0..=100.0).contains(&self.cpu.exceedance_target_pct) {
            return Err(invalid(format!(
                "cpu.exceedance_target_pct must be in [0, 100], got {}",
                self.cpu.exceedance_target_pct
            )));
        }
        if self.cpu.ring_flush_every_slots == 0 {
            return Err(invalid("cpu.ring_flush_every_slots must be >= 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.cpu.max_duty) {
            return Err(invalid(format!(
                "cpu.max_duty must be in [0, 1], got {}",
                self.cpu.max_duty
            )));
        }

        if self.control.tick_interval_sec <= 0.0 {
            return Err(invalid("control.tick_interval_sec must be > 0".to_string()));
        }

        if self.mem.step_mb == 0 {
            return Err(invalid("mem.step_mb must be >= 1".to_string()));
        }
        if self.mem.touch_interval_sec <= 0.0 {
            return Err(invalid("mem.touch_interval_sec must be > 0".to_string()));
        }

        match self.net.protocol.as_str() {
            "udp" | "tcp" => {}
            other => {
                return Err(invalid(format!(
                    "net.protocol must be \"udp\" or \"tcp\", got {other:?}"
                )));
            }
        }
        if self.net.port < 1024 {
            return Err(invalid(format!(
                "net.port must be in [1024, 65535], got {}",
                self.net.port
            )));
        }
        if !(64..=65_507).contains(&self.net.packet_size) {
            return Err(invalid(format!(
                "net.packet_size must be in [64, 65507], got {}",
                self.net.packet_size
            )));
        }
        if self.net.min_rate_mbit <= 0.0 || self.net.min_rate_mbit >= self.net.max_rate_mbit {
            return Err(invalid(format!(
                "net rate bounds must satisfy 0 < min_rate_mbit ({}) < max_rate_mbit ({})",
                self.net.min_rate_mbit, self.net.max_rate_mbit
            )));
        }
        if self.net.link_mbit <= 0.0 {
            return Err(invalid("net.link_mbit must be > 0".to_string()));
        }
        if self.net.ttl == 0 {
            return Err(invalid("net.ttl must be >= 1".to_string()));
        }

        match self.fallback.mode.as_str() {
            "adaptive" | "always" | "off" => {}
            other => {
                return Err(invalid(format!(
                    "fallback.mode must be \"adaptive\", \"always\" or \"off\", got {other:?}"
                )));
            }
        }
        if self.fallback.start_pct >= self.fallback.stop_pct {
            return Err(invalid(format!(
                "fallback.start_pct ({}) must be < fallback.stop_pct ({})",
                self.fallback.start_pct, self.fallback.stop_pct
            )));
        }
        for (name, val) in [
            ("fallback.debounce_sec", self.fallback.debounce_sec),
            ("fallback.min_on_sec", self.fallback.min_on_sec),
            ("fallback.min_off_sec", self.fallback.min_off_sec),
            ("fallback.ramp_sec", self.fallback.ramp_sec),
        ] {
            if val < 0.0 {
                return Err(invalid(format!("{name} must be >= 0, got {val}")));
            }
        }
        if self.fallback.debounce_sec > self.fallback.min_on_sec
            || self.fallback.debounce_sec > self.fallback.min_off_sec
        {
            return Err(invalid(format!(
                "fallback.debounce_sec ({}) must not exceed min_on_sec ({}) or min_off_sec ({})",
                self.fallback.debounce_sec, self.fallback.min_on_sec, self.fallback.min_off_sec
            )));
        }

        if self.safety.load_resume_threshold >= self.safety.load_threshold {
            return Err(invalid(format!(
                "safety.load_resume_threshold ({}) must be < safety.load_threshold ({})",
                self.safety.load_resume_threshold, self.safety.load_threshold
            )));
        }
        if self.safety.cpu_stop_pct <= self.cpu.high_intensity_pct {
            return Err(invalid(format!(
                "safety.cpu_stop_pct ({}) must be > cpu.high_intensity_pct ({})",
                self.safety.cpu_stop_pct, self.cpu.high_intensity_pct
            )));
        }
        if self.mem.target_pct > 0.0 && self.safety.mem_stop_pct <= self.mem.target_pct {
            return Err(invalid(format!(
                "safety.mem_stop_pct ({}) must be > mem.target_pct ({})",
                self.safety.mem_stop_pct, self.mem.target_pct
            )));
        }

        if self.storage.retention_days == 0 {
            return Err(invalid("storage.retention_days must be >= 1".to_string()));
        }
        if self.storage.max_consecutive_failures == 0 {
            return Err(invalid("storage.max_consecutive_failures must be >= 1".to_string()));
        }

        Ok(())
    }
}

// ──────────────────── env helpers ────────────────────

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn parse_err(name: &str, raw: &str, error: impl std::fmt::Display) -> LkError {
    LkError::ConfigParse {
        context: "env",
        details: format!("{name}={raw:?}: {error}"),
    }
}

fn set_f64<F: FnMut(&str) -> Option<String>>(
    lookup: &mut F,
    name: &str,
    slot: &mut f64,
) -> Result<()> {
    if let Some(raw) = lookup(name) {
        *slot = raw.parse::<f64>().map_err(|e| parse_err(name, &raw, e))?;
    }
    Ok(())
}

fn set_u64<F: FnMut(&str) -> Option<String>>(
    lookup: &mut F,
    name: &str,
    slot: &mut u64,
) -> Result<()> {
    if let Some(raw) = lookup(name) {
        *slot = raw.parse::<u64>().map_err(|e| parse_err(name, &raw, e))?;
    }
    Ok(())
}

fn set_u32<F: FnMut(&str) -> Option<String>>(
    lookup: &mut F,
    name: &str,
    slot: &mut u32,
) -> Result<()> {
    if let Some(raw) = lookup(name) {
        *slot = raw.parse::<u32>().map_err(|e| parse_err(name, &raw, e))?;
    }
    Ok(())
}

fn set_u16<F: FnMut(&str) -> Option<String>>(
    lookup: &mut F,
    name: &str,
    slot: &mut u16,
) -> Result<()> {
    if let Some(raw) = lookup(name) {
        *slot = raw.parse::<u16>().map_err(|e| parse_err(name, &raw, e))?;
    }
    Ok(())
}

fn set_usize<F: FnMut(&str) -> Option<String>>(
    lookup: &mut F,
    name: &str,
    slot: &mut usize,
) -> Result<()> {
    if let Some(raw) = lookup(name) {
        *slot = raw.parse::<usize>().map_err(|e| parse_err(name, &raw, e))?;
    }
    Ok(())
}

fn set_bool<F: FnMut(&str) -> Option<String>>(
    lookup: &mut F,
    name: &str,
    slot: &mut bool,
) -> Result<()> {
    if let Some(raw) = lookup(name) {
        *slot = raw.parse::<bool>().map_err(|e| parse_err(name, &raw, e))?;
    }
    Ok(())
}

fn set_string<F: FnMut(&str) -> Option<String>>(lookup: &mut F, name: &str, slot: &mut String) {
    if let Some(raw) = lookup(name) {
        *slot = raw;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(name, value)| ((*name).to_string(), (*value).to_string()))
            .collect()
    }

    #[test]
    fn default_config_is_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn p95_band_must_be_ordered() {
        let mut cfg = Config::default();
        cfg.cpu.target_min_pct = 30.0;
        cfg.cpu.target_max_pct = 28.0;
        let err = cfg.validate().expect_err("inverted band must be rejected");
        assert!(err.to_string().contains("cpu.target_min_pct"));
    }

    #[test]
    fn baseline_must_be_below_high() {
        let mut cfg = Config::default();
        cfg.cpu.baseline_intensity_pct = 40.0;
        let err = cfg.validate().expect_err("baseline >= high must be rejected");
        assert!(err.to_string().contains("baseline_intensity_pct"));
    }

    #[test]
    fn setpoint_outside_band_rejected() {
        let mut cfg = Config::default();
        cfg.cpu.setpoint_pct = 30.0;
        let err = cfg.validate().expect_err("setpoint outside band");
        assert!(err.to_string().contains("setpoint"));
    }

    #[test]
    fn fallback_debounce_cannot_exceed_min_times() {
        let mut cfg = Config::default();
        cfg.fallback.debounce_sec = 120.0;
        let err = cfg.validate().expect_err("contradictory timing");
        assert!(err.to_string().contains("debounce_sec"));
    }

    #[test]
    fn fallback_start_must_be_below_stop() {
        let mut cfg = Config::default();
        cfg.fallback.start_pct = 25.0;
        cfg.fallback.stop_pct = 23.0;
        let err = cfg.validate().expect_err("start >= stop");
        assert!(err.to_string().contains("start_pct"));
    }

    #[test]
    fn load_resume_must_be_below_threshold() {
        let mut cfg = Config::default();
        cfg.safety.load_resume_threshold = 0.7;
        let err = cfg.validate().expect_err("resume >= threshold");
        assert!(err.to_string().contains("load_resume_threshold"));
    }

    #[test]
    fn invalid_protocol_rejected() {
        let mut cfg = Config::default();
        cfg.net.protocol = "sctp".to_string();
        let err = cfg.validate().expect_err("unknown protocol");
        assert!(err.to_string().contains("net.protocol"));
    }

    #[test]
    fn privileged_port_rejected() {
        let mut cfg = Config::default();
        cfg.net.port = 80;
        let err = cfg.validate().expect_err("privileged port");
        assert!(err.to_string().contains("net.port"));
    }

    #[test]
    fn rate_bounds_must_be_ordered() {
        let mut cfg = Config::default();
        cfg.net.min_rate_mbit = 900.0;
        let err = cfg.validate().expect_err("min >= max rate");
        assert!(err.to_string().contains("min_rate_mbit"));
    }

    #[test]
    fn invalid_fallback_mode_rejected() {
        let mut cfg = Config::default();
        cfg.fallback.mode = "sometimes".to_string();
        let err = cfg.validate().expect_err("unknown mode");
        assert!(err.to_string().contains("fallback.mode"));
    }

    #[test]
    fn env_overrides_take_effect() {
        let mut cfg = Config::default();
        let overrides = vars(&[
            ("LK_MEM_TARGET_PCT", "0"),
            ("LK_NET_PEERS", "203.0.114.7, 9.9.9.9:443"),
            ("LK_SHAPE_COUNTS_MEMORY", "false"),
            ("LK_CPU_P95_SETPOINT", "24.5"),
        ]);
        cfg.apply_env_overrides_from(|name| overrides.get(name).cloned())
            .expect("overrides should parse");

        assert_eq!(cfg.mem.target_pct.to_bits(), 0.0_f64.to_bits());
        assert_eq!(cfg.net.peers, vec!["203.0.114.7", "9.9.9.9:443"]);
        assert!(!cfg.shape.counts_memory);
        assert_eq!(cfg.cpu.setpoint_pct.to_bits(), 24.5_f64.to_bits());
    }

    #[test]
    fn env_invalid_number_rejected() {
        let mut cfg = Config::default();
        let overrides = vars(&[("LK_CPU_P95_TARGET_MIN", "twenty")]);
        let err = cfg
            .apply_env_overrides_from(|name| overrides.get(name).cloned())
            .expect_err("invalid float must fail");
        match err {
            LkError::ConfigParse { context, details } => {
                assert_eq!(context, "env");
                assert!(details.contains("LK_CPU_P95_TARGET_MIN"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn load_returns_error_for_explicit_missing_path() {
        let result = Config::load(Some(Path::new("/nonexistent/loadkeeper.toml")));
        assert!(matches!(result, Err(LkError::MissingConfig { .. })));
    }

    #[test]
    fn load_parses_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loadkeeper.toml");
        std::fs::write(
            &path,
            "[cpu]\ntarget_min_pct = 23.0\n[shape]\ncounts_memory = false\n",
        )
        .unwrap();
        let cfg = Config::load(Some(&path)).unwrap();
        assert_eq!(cfg.cpu.target_min_pct.to_bits(), 23.0_f64.to_bits());
        assert!(!cfg.shape.counts_memory);
        // Untouched sections keep defaults.
        assert_eq!(cfg.net.port, 15201);
    }

    #[test]
    fn stable_hash_deterministic_and_sensitive() {
        let cfg = Config::default();
        let h1 = cfg.stable_hash().expect("hash");
        let h2 = cfg.stable_hash().expect("hash");
        assert_eq!(h1, h2);

        let mut modified = Config::default();
        modified.cpu.slot_duration_sec = 30.0;
        assert_ne!(h1, modified.stable_hash().expect("hash"));
    }

    #[test]
    fn zero_mem_target_disables_occupier_and_validates() {
        let mut cfg = Config::default();
        cfg.mem.target_pct = 0.0;
        // mem_stop_pct > target check is skipped for a dormant occupier.
        cfg.safety.mem_stop_pct = 0.0;
        assert!(cfg.validate().is_ok());
    }
}
