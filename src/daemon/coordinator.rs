//! The coordinator: one tick every `tick_interval_sec` that samples sensors,
//! persists metrics, drives the controllers, applies the safety gates, and
//! emits telemetry.
//!
//! Ordering inside a tick is load-bearing: samples are persisted before the
//! controller decides (the decision must be reproducible from stored data),
//! and the safety gate runs *after* the slot decision so the forced outcome
//! can be written back into the ring via `mark_current_slot_low`.

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::config::Config;
use crate::core::errors::Result;
use crate::control::p95::P95Controller;
use crate::control::workers::{CpuWorkerPool, WorkerControls};
use crate::daemon::lock::InstanceLock;
use crate::daemon::signals::ShutdownToken;
use crate::daemon::telemetry::{
    Snapshot, TelemetryEvent, TelemetryHandle, TickSummary, spawn_telemetry, write_snapshot,
};
use crate::metrics::ema::EmaSet;
use crate::metrics::sensors::{ProcSensorSource, SensorSample, Sensors};
use crate::metrics::store::{MetricKind, MetricsStore, StoreHealth};
use crate::netgen::fallback::{FallbackInputs, NetFallbackState};
use crate::netgen::generator::{
    EmitterControls, NetGenerator, SocketSink, SysfsTxCounter, run_emitter,
};
use crate::occupier::memory::MemoryOccupier;

const RETENTION_SECS: i64 = 7 * 24 * 3600;

// ──────────────────── coordinator ────────────────────

#[derive(Debug)]
pub struct Coordinator {
    config: Config,
    token: ShutdownToken,
    _lock: InstanceLock,

    store: MetricsStore,
    controller: P95Controller,
    occupier: MemoryOccupier,
    fallback: NetFallbackState,
    worker_controls: Arc<WorkerControls>,
    emitter_controls: Arc<EmitterControls>,
    telemetry: TelemetryHandle,
    telemetry_join: Option<std::thread::JoinHandle<()>>,
    emas: EmaSet,

    paused: bool,
    tick_count: u64,
    jitter: f64,
    next_jitter_ts: f64,
    last_snapshot_ts: f64,
    start: Instant,
}

impl Coordinator {
    /// Build and wire every component. Fails fast on persistence problems —
    /// a daemon that cannot remember seven days of history cannot do its job.
    pub fn init(config: Config, token: ShutdownToken, now: f64) -> Result<Self> {
        let lock = InstanceLock::acquire(&config.storage.dir)?;
        let store = MetricsStore::open(
            &config.storage.dir,
            config.storage.p95_cache_ttl_sec,
            config.storage.max_consecutive_failures,
        )?;
        let controller = P95Controller::new(
            config.cpu.clone(),
            config.storage.dir.join("p95_ring_buffer.json"),
            now,
        );
        let occupier = MemoryOccupier::new(config.mem.clone());
        let fallback = NetFallbackState::new(config.fallback.clone(), now);
        let (telemetry, telemetry_join) = spawn_telemetry(&config.telemetry)?;
        let emas = EmaSet::new(config.control.avg_window_sec, config.control.tick_interval_sec);
        let emitter_controls = Arc::new(EmitterControls::new(config.net.min_rate_mbit));

        Ok(Self {
            config,
            token,
            _lock: lock,
            store,
            controller,
            occupier,
            fallback,
            worker_controls: Arc::new(WorkerControls::new()),
            emitter_controls,
            telemetry,
            telemetry_join: Some(telemetry_join),
            emas,
            paused: false,
            tick_count: 0,
            jitter: 0.0,
            next_jitter_ts: now,
            last_snapshot_ts: 0.0,
            start: Instant::now(),
        })
    }

    #[must_use]
    pub fn worker_controls(&self) -> &Arc<WorkerControls> {
        &self.worker_controls
    }

    #[must_use]
    pub fn emitter_controls(&self) -> &Arc<EmitterControls> {
        &self.emitter_controls
    }

    #[must_use]
    pub fn controller(&self) -> &P95Controller {
        &self.controller
    }

    #[must_use]
    pub fn store(&self) -> &MetricsStore {
        &self.store
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Run until the shutdown token fires. Spawns the worker pool, the page
    /// toucher, and the packet emitter; the calling thread becomes the tick
    /// loop.
    pub fn run(mut self) -> Result<()> {
        let config_hash = self.config.stable_hash().unwrap_or_default();
        self.telemetry.send(TelemetryEvent::DaemonStarted {
            version: env!("CARGO_PKG_VERSION").to_string(),
            config_hash,
        });

        let source = ProcSensorSource;
        let mut sensors = Sensors::new(source, &self.config.net.iface, self.config.net.link_mbit);
        let worker_count = sensors.cpu_count();

        let pool = CpuWorkerPool::spawn(
            worker_count,
            Arc::clone(&self.worker_controls),
            self.token.clone(),
        );
        let toucher = self.occupier.spawn_toucher(self.token.clone());

        let emitter_epoch = Instant::now();
        let generator = NetGenerator::new(
            self.config.net.clone(),
            self.config.shape,
            SocketSink::new(),
            SysfsTxCounter::new(&self.config.net.iface),
            emitter_epoch,
        );
        let emitter = {
            let controls = Arc::clone(&self.emitter_controls);
            let token = self.token.clone();
            std::thread::Builder::new()
                .name("lk-net-emit".to_string())
                .spawn(move || run_emitter(generator, &controls, &token, emitter_epoch))
                .map_err(|e| crate::core::errors::LkError::Runtime {
                    details: format!("failed to spawn net emitter: {e}"),
                })?
        };

        let tick_interval = Duration::from_secs_f64(self.config.control.tick_interval_sec);
        while !self.token.is_triggered() {
            let now = wall_now();
            match sensors.sample(now) {
                Ok(sample) => self.tick(now, sample),
                Err(e) => {
                    // Fatal sensor contract violation (e.g. no MemAvailable).
                    self.telemetry.send(TelemetryEvent::Warning {
                        code: e.code().to_string(),
                        message: e.to_string(),
                    });
                    if matches!(e, crate::core::errors::LkError::UnsupportedPlatform { .. }) {
                        self.token.trigger();
                        self.shutdown(pool, toucher, emitter, "unsupported platform");
                        return Err(e);
                    }
                }
            }
            self.token.sleep_unless_triggered(tick_interval);
        }

        self.shutdown(pool, toucher, emitter, "signal");
        Ok(())
    }

    // ──────────────────── one tick ────────────────────

    /// The complete per-tick control sequence. Pure with respect to time:
    /// everything is derived from `now` and `sample`, which is what the
    /// scenario tests exploit.
    pub fn tick(&mut self, now: f64, sample: SensorSample) {
        self.tick_count += 1;
        #[allow(clippy::cast_possible_truncation)]
        let now_i = now as i64;

        // 1. Persist what we saw. Unknown metrics are skipped, never faked.
        if let Some(cpu) = sample.cpu_pct {
            self.store.record(MetricKind::Cpu, cpu, now_i);
        }
        if let Some(mem) = sample.mem_pct {
            self.store.record(MetricKind::Mem, mem, now_i);
        }
        if let Some(net) = sample.net_pct {
            self.store.record(MetricKind::Net, net, now_i);
        }
        if let Some(load) = sample.load_per_core {
            self.store.record(MetricKind::Load, load, now_i);
        }

        // 2. Periodic maintenance: retention purge + consistency probe.
        if self.tick_count % u64::from(self.config.storage.probe_every_ticks) == 0 {
            let deleted = self.store.purge_older_than(now_i - RETENTION_SECS);
            if deleted > 0 {
                eprintln!("[LK-STORE] purged {deleted} expired samples");
            }
            if self.store.consistency_probe() == StoreHealth::Degraded {
                self.telemetry.send(TelemetryEvent::Warning {
                    code: "LK-2202".to_string(),
                    message: "metrics store degraded; controller running on cached p95"
                        .to_string(),
                });
            }
        }

        // 3. Smooth the current values.
        let cpu_avg = sample.cpu_pct.and_then(|v| self.emas.cpu.update(v));
        let mem_avg = sample.mem_pct.and_then(|v| self.emas.mem.update(v));
        let net_avg = sample.net_pct.and_then(|v| self.emas.net.update(v));
        let load_avg = sample.load_per_core.and_then(|v| self.emas.load.update(v));

        // 4. Refresh target jitter.
        if now >= self.next_jitter_ts {
            self.refresh_jitter(now);
        }
        let mem_target_now = apply_jitter(self.config.mem.target_pct, self.jitter);
        let net_target_now = apply_jitter(self.config.net.target_pct, self.jitter);

        // 5. Controller state + slot decision (load gate applied inside).
        let cpu_p95 = self.controller.cpu_p95(&self.store, now);
        self.controller.update_state(cpu_p95, now);
        let decision = self.controller.on_tick(
            cpu_p95,
            sample.load_per_core,
            self.config.safety.load_check_enabled,
            self.config.safety.load_threshold,
            now,
        );

        // 6. Global safety stops override everything.
        let safety = &self.config.safety;
        // The load gate reacts to the instantaneous per-core load so a storm
        // pauses the workers within one tick; the smoothed value is for
        // telemetry and the stop percentages only.
        let load_contention = safety.load_check_enabled
            && sample.load_per_core.is_some_and(|v| v > safety.load_threshold);
        let stop = cpu_avg.is_some_and(|v| v > safety.cpu_stop_pct)
            || mem_avg.is_some_and(|v| v > safety.mem_stop_pct)
            || net_avg.is_some_and(|v| v > safety.net_stop_pct)
            || load_contention;

        if stop {
            if !self.paused {
                self.telemetry.send(TelemetryEvent::Warning {
                    code: "LK-SAFETY".to_string(),
                    message: format!(
                        "safety stop (cpu_avg={cpu_avg:?} mem_avg={mem_avg:?} \
                         net_avg={net_avg:?} load_avg={load_avg:?})"
                    ),
                });
            }
            self.paused = true;
            self.worker_controls.set_paused(true);
            self.worker_controls.set_intensity_pct(0.0, self.config.cpu.max_duty);
            // The budget must account the slot as what actually ran.
            self.controller.mark_current_slot_low();
            self.occupier.set_paused(true);
            if let Some(figures) = sample.mem {
                self.occupier.step(figures, 0.0, safety);
            }
            self.emitter_controls.set_active(false);
            self.emitter_controls.set_rate_mbps(self.config.net.min_rate_mbit);
        } else {
            let load_ok = !safety.load_check_enabled
                || sample
                    .load_per_core
                    .is_none_or(|v| v < safety.load_resume_threshold);
            if self.paused && load_ok {
                eprintln!("[LK-DAEMON] resuming after safety stop");
                self.paused = false;
            }

            if self.paused {
                // Still draining the stop condition: keep everything idle and
                // keep the accounting honest.
                self.worker_controls.set_intensity_pct(0.0, self.config.cpu.max_duty);
                self.controller.mark_current_slot_low();
            } else {
                self.worker_controls.set_paused(false);
                self.occupier.set_paused(false);
                self.worker_controls
                    .set_intensity_pct(decision.intensity_pct, self.config.cpu.max_duty);

                if let Some(figures) = sample.mem {
                    self.occupier.step(figures, mem_target_now, safety);
                }

                // 7. Network fallback decision + rate steering.
                let fallback_active = self.fallback.evaluate(
                    self.config.shape,
                    FallbackInputs {
                        cpu_p95,
                        net_avg,
                        mem_avg,
                    },
                    now,
                );
                let effective_net_target = if fallback_active {
                    self.fallback
                        .ramped_target(net_target_now, self.config.fallback.start_pct, now)
                        .max(net_target_now)
                } else {
                    net_target_now
                };
                if let Some(net_avg) = net_avg {
                    let err = effective_net_target - net_avg;
                    let new_rate = self
                        .config
                        .net
                        .rate_gain
                        .mul_add(err, self.emitter_controls.rate_mbps())
                        .clamp(self.config.net.min_rate_mbit, self.config.net.max_rate_mbit);
                    self.emitter_controls.set_rate_mbps(new_rate);
                }
                self.emitter_controls.set_active(fallback_active);
            }
        }

        // 8. Telemetry.
        let summary = self.tick_summary(now_i, &sample, cpu_avg, mem_avg, net_avg, load_avg, cpu_p95);
        self.telemetry.send(TelemetryEvent::Tick(summary.clone()));

        #[allow(clippy::cast_precision_loss)]
        let snapshot_interval = self.config.telemetry.snapshot_interval_sec as f64;
        if now - self.last_snapshot_ts >= snapshot_interval {
            self.last_snapshot_ts = now;
            let snapshot = Snapshot {
                ts: now_i,
                tick: summary,
                controller: self.controller.status(),
                fallback: self.fallback.status(now),
                occupied_mem_bytes: self.occupier.occupied_bytes(),
            };
            if let Err(e) = write_snapshot(&self.config.storage.dir, &snapshot) {
                eprintln!("[LK-DAEMON] snapshot write failed: {e}");
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn tick_summary(
        &self,
        ts: i64,
        sample: &SensorSample,
        cpu_avg: Option<f64>,
        mem_avg: Option<f64>,
        net_avg: Option<f64>,
        load_avg: Option<f64>,
        cpu_p95: Option<f64>,
    ) -> TickSummary {
        let status = self.controller.status();
        TickSummary {
            ts,
            cpu_now: sample.cpu_pct,
            cpu_avg,
            cpu_p95,
            mem_now: sample.mem_pct,
            mem_avg,
            net_now: sample.net_pct,
            net_avg,
            load_per_core: load_avg,
            controller_state: status.state.as_str(),
            exceedance_pct: status.exceedance_pct,
            exceedance_target_pct: status.exceedance_target_pct,
            duty: self.worker_controls.duty(),
            paused: self.paused,
            net_rate_mbit: self.emitter_controls.rate_mbps(),
            fallback_active: self.fallback.is_active(),
            samples_7d: self.store.count_7d(ts),
            store_health: match self.store.health() {
                StoreHealth::Available => "available",
                StoreHealth::Degraded => "degraded",
                StoreHealth::Unavailable => "unavailable",
            },
        }
    }

    fn refresh_jitter(&mut self, now: f64) {
        use rand::Rng;
        let pct = self.config.control.jitter_pct;
        self.jitter = if pct <= 0.0 {
            0.0
        } else {
            rand::thread_rng().gen_range(-pct / 100.0..=pct / 100.0)
        };
        self.next_jitter_ts = now + self.config.control.jitter_period_sec;
    }

    // ──────────────────── shutdown ────────────────────

    fn shutdown(
        mut self,
        pool: CpuWorkerPool,
        toucher: std::thread::JoinHandle<()>,
        emitter: std::thread::JoinHandle<()>,
        reason: &str,
    ) {
        let uptime_secs = self.start.elapsed().as_secs();

        pool.join();
        let toucher_ok = toucher.join().is_ok();
        let emitter_ok = emitter.join().is_ok();
        let toucher_closure = || toucher_ok;
        let emitter_closure = || emitter_ok;
        let tasks: Vec<(&str, &dyn Fn() -> bool)> = vec![
            ("page toucher", &toucher_closure),
            ("net emitter", &emitter_closure),
        ];
        if !crate::daemon::signals::DrainCoordinator::default().execute(&tasks) {
            eprintln!("[LK-DAEMON] shutdown drain incomplete");
        }

        self.occupier.release_all();
        if let Err(e) = self.controller.flush_ring() {
            eprintln!("[LK-DAEMON] final ring flush failed: {e}");
        }

        self.telemetry.send(TelemetryEvent::DaemonStopped {
            reason: reason.to_string(),
            uptime_secs,
        });
        self.telemetry.shutdown();
        if let Some(join) = self.telemetry_join.take() {
            let _ = join.join();
        }
        eprintln!("[LK-DAEMON] shutdown complete (uptime={uptime_secs}s)");
        // The instance lock releases when `self` drops here.
    }
}

fn apply_jitter(base: f64, jitter: f64) -> f64 {
    (base * (1.0 + jitter)).max(0.0)
}

fn wall_now() -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let micros = chrono::Utc::now().timestamp_micros() as f64;
    micros / 1_000_000.0
}

// ──────────────────── tests ────────────────────
