//! Telemetry: a dedicated logger thread fed over a bounded channel.
//!
//! The control loop must never block on I/O, so events are handed to a
//! logger thread through `crossbeam-channel`; when the channel is full the
//! event is dropped rather than queued. The
//! thread renders one human line per tick on stderr, appends every event to
//! an optional JSONL stream, and rate-limits repeated warnings by code.
//! A machine-readable `snapshot.json` is rewritten atomically on a timer.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use serde::Serialize;

use crate::core::config::TelemetryConfig;
use crate::core::errors::{LkError, Result};
use crate::control::p95::ControllerStatus;
use crate::netgen::fallback::FallbackStatus;

// ──────────────────── events ────────────────────

/// Per-tick summary rendered as the telemetry line.
#[derive(Debug, Clone, Serialize)]
pub struct TickSummary {
    pub ts: i64,
    pub cpu_now: Option<f64>,
    pub cpu_avg: Option<f64>,
    pub cpu_p95: Option<f64>,
    pub mem_now: Option<f64>,
    pub mem_avg: Option<f64>,
    pub net_now: Option<f64>,
    pub net_avg: Option<f64>,
    pub load_per_core: Option<f64>,
    pub controller_state: &'static str,
    pub exceedance_pct: f64,
    pub exceedance_target_pct: f64,
    pub duty: f64,
    pub paused: bool,
    pub net_rate_mbit: f64,
    pub fallback_active: bool,
    pub samples_7d: u64,
    pub store_health: &'static str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    DaemonStarted {
        version: String,
        config_hash: String,
    },
    DaemonStopped {
        reason: String,
        uptime_secs: u64,
    },
    Tick(TickSummary),
    Warning {
        code: String,
        message: String,
    },
}

// ──────────────────── handle ────────────────────

/// Cloneable sender half handed to the coordinator.
#[derive(Clone)]
#[derive(Debug)]
pub struct TelemetryHandle {
    tx: Sender<TelemetryEvent>,
}

impl TelemetryHandle {
    /// Fire-and-forget; a full channel drops the event.
    pub fn send(&self, event: TelemetryEvent) {
        if let Err(TrySendError::Full(_)) = self.tx.try_send(event) {
            // Dropped; the next tick carries fresh state anyway.
        }
    }

    /// Close the channel so the logger thread drains and exits.
    pub fn shutdown(self) {
        drop(self.tx);
    }
}

/// Spawn the logger thread. Returns the handle and the join handle; drop all
/// handles (or call `shutdown`) to stop the thread.
pub fn spawn_telemetry(
    cfg: &TelemetryConfig,
) -> Result<(TelemetryHandle, thread::JoinHandle<()>)> {
    let (tx, rx) = bounded::<TelemetryEvent>(cfg.channel_capacity.max(16));
    let jsonl_path = cfg.jsonl_path.clone();
    let rate_limit = Duration::from_secs(cfg.warn_rate_limit_sec);

    let join = thread::Builder::new()
        .name("lk-telemetry".to_string())
        .spawn(move || logger_main(&rx, jsonl_path.as_deref(), rate_limit))
        .map_err(|e| LkError::Runtime {
            details: format!("failed to spawn telemetry thread: {e}"),
        })?;

    Ok((TelemetryHandle { tx }, join))
}

fn logger_main(rx: &Receiver<TelemetryEvent>, jsonl: Option<&Path>, rate_limit: Duration) {
    let mut jsonl_file = jsonl.and_then(|path| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| eprintln!("[LK-TELEMETRY] cannot open {}: {e}", path.display()))
            .ok()
    });
    let mut last_warn: HashMap<String, Instant> = HashMap::new();

    while let Ok(event) = rx.recv() {
        match &event {
            TelemetryEvent::Tick(tick) => eprintln!("{}", render_tick(tick)),
            TelemetryEvent::Warning { code, message } => {
                let due = last_warn
                    .get(code)
                    .is_none_or(|at| at.elapsed() >= rate_limit);
                if due {
                    last_warn.insert(code.clone(), Instant::now());
                    eprintln!("[{code}] WARNING: {message}");
                }
            }
            TelemetryEvent::DaemonStarted { version, config_hash } => {
                eprintln!("[LK-DAEMON] loadkeeper v{version} started (config {config_hash})");
            }
            TelemetryEvent::DaemonStopped { reason, uptime_secs } => {
                eprintln!("[LK-DAEMON] stopped: {reason} (uptime {uptime_secs}s)");
            }
        }

        if let Some(file) = jsonl_file.as_mut()
            && let Ok(line) = serde_json::to_string(&event)
            && writeln!(file, "{line}").is_err()
        {
            // Stop writing after the first failure; stderr still works.
            jsonl_file = None;
        }
    }
}

fn fmt_opt(value: Option<f64>) -> String {
    value.map_or_else(|| "  n/a".to_string(), |v| format!("{v:5.1}"))
}

fn render_tick(t: &TickSummary) -> String {
    format!(
        "cpu now={}% avg={}% p95={}% {} exceed={:.1}%/{:.1}% | mem(excl-cache) now={}% avg={}% | \
         net now={}% avg={}% rate={:.1}Mbit fallback={} | load={} duty={:.2} paused={} | \
         samples_7d={} store={}",
        fmt_opt(t.cpu_now),
        fmt_opt(t.cpu_avg),
        fmt_opt(t.cpu_p95),
        t.controller_state,
        t.exceedance_pct,
        t.exceedance_target_pct,
        fmt_opt(t.mem_now),
        fmt_opt(t.mem_avg),
        fmt_opt(t.net_now),
        fmt_opt(t.net_avg),
        t.net_rate_mbit,
        u8::from(t.fallback_active),
        fmt_opt(t.load_per_core),
        t.duty,
        u8::from(t.paused),
        t.samples_7d,
        t.store_health,
    )
}

// ──────────────────── snapshot ────────────────────

/// On-demand machine-readable state, rewritten atomically.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub ts: i64,
    pub tick: TickSummary,
    pub controller: ControllerStatus,
    pub fallback: FallbackStatus,
    pub occupied_mem_bytes: u64,
}

/// Write `snapshot.json` via temp file + rename so readers never see a
/// half-written document.
pub fn write_snapshot(dir: &Path, snapshot: &Snapshot) -> Result<()> {
    let path = dir.join("snapshot.json");
    let tmp: PathBuf = dir.join(format!("snapshot.json.{}.tmp", std::process::id()));
    let payload = serde_json::to_vec_pretty(snapshot)?;
    std::fs::write(&tmp, &payload).map_err(|e| LkError::io(&tmp, e))?;
    std::fs::rename(&tmp, &path).map_err(|e| LkError::io(&path, e))?;
    Ok(())
}

// ──────────────────── tests ────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tick() -> TickSummary {
        TickSummary {
            ts: 1_700_000_000,
            cpu_now: Some(24.3),
            cpu_avg: Some(23.8),
            cpu_p95: Some(25.1),
            mem_now: Some(41.0),
            mem_avg: Some(40.2),
            net_now: Some(2.1),
            net_avg: Some(1.9),
            load_per_core: Some(0.18),
            controller_state: "MAINTAINING",
            exceedance_pct: 6.4,
            exceedance_target_pct: 6.5,
            duty: 0.2,
            paused: false,
            net_rate_mbit: 1.0,
            fallback_active: false,
            samples_7d: 12_000,
            store_health: "available",
        }
    }

    #[test]
    fn tick_line_contains_key_fields() {
        let line = render_tick(&sample_tick());
        assert!(line.contains("MAINTAINING"));
        assert!(line.contains("p95= 25.1%"));
        assert!(line.contains("samples_7d=12000"));
    }

    #[test]
    fn unknown_values_render_as_na() {
        let mut tick = sample_tick();
        tick.cpu_now = None;
        let line = render_tick(&tick);
        assert!(line.contains("now=  n/a%"));
    }

    #[test]
    fn events_serialize_with_tag() {
        let json = serde_json::to_string(&TelemetryEvent::Warning {
            code: "LK-2202".to_string(),
            message: "disk full".to_string(),
        })
        .unwrap();
        assert!(json.contains("\"event\":\"warning\""));
        assert!(json.contains("LK-2202"));
    }

    #[test]
    fn logger_writes_jsonl_and_exits_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let jsonl = dir.path().join("telemetry.jsonl");
        let cfg = TelemetryConfig {
            jsonl_path: Some(jsonl.clone()),
            channel_capacity: 64,
            warn_rate_limit_sec: 60,
            snapshot_interval_sec: 10,
        };
        let (handle, join) = spawn_telemetry(&cfg).unwrap();
        handle.send(TelemetryEvent::Tick(sample_tick()));
        handle.send(TelemetryEvent::Warning {
            code: "LK-3101".to_string(),
            message: "peer unreachable".to_string(),
        });
        handle.shutdown();
        join.join().unwrap();

        let contents = std::fs::read_to_string(&jsonl).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"event\":\"tick\""));
        // Every line is standalone JSON.
        for line in lines {
            serde_json::from_str::<serde_json::Value>(line).unwrap();
        }
    }

    #[test]
    fn full_channel_drops_instead_of_blocking() {
        let (tx, _rx) = bounded::<TelemetryEvent>(1);
        let handle = TelemetryHandle { tx };
        // Second send hits a full channel; must return immediately.
        handle.send(TelemetryEvent::Tick(sample_tick()));
        handle.send(TelemetryEvent::Tick(sample_tick()));
    }

    #[test]
    fn snapshot_write_is_atomic_and_parseable() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = Snapshot {
            ts: 1_700_000_000,
            tick: sample_tick(),
            controller: crate::control::p95::ControllerStatus {
                state: crate::control::p95::ControllerState::Maintaining,
                cpu_p95: Some(25.0),
                exceedance_pct: 6.5,
                exceedance_target_pct: 6.5,
                current_slot_is_high: false,
                intensity_pct: 20.0,
                slots_recorded: 100,
                slots_skipped_safety: 0,
                consecutive_skipped_slots: 0,
            },
            fallback: crate::netgen::fallback::FallbackStatus {
                active: false,
                activation_count: 0,
                seconds_since_change: 10.0,
                ramp_complete: false,
            },
            occupied_mem_bytes: 0,
        };
        write_snapshot(dir.path(), &snapshot).unwrap();
        let raw = std::fs::read_to_string(dir.path().join("snapshot.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["tick"]["controller_state"], "MAINTAINING");
        // No temp files linger.
        let tmp_count = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp"))
            .count();
        assert_eq!(tmp_count, 0);
    }
}
