//! Per-core duty-cycled CPU workers.
//!
//! Each worker runs at the lowest scheduler priority and alternates a short
//! busy slice with a sleep slice so the requested intensity is approximated
//! without ever holding the CPU long enough to hurt a co-tenant's tail
//! latency. Demand arrives via shared atomics; the pause flag and the
//! shutdown token are observed once per 100 ms tick.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::daemon::signals::ShutdownToken;
use crate::platform::sys;

/// Full busy/sleep cycle length.
const TICK: Duration = Duration::from_millis(100);
/// Minimum yield so the scheduler can always run someone else.
const SLEEP_SLICE: Duration = Duration::from_millis(5);

// ──────────────────── shared state ────────────────────

/// Coordinator-owned knobs read by every worker each tick.
///
/// Duty is stored as permille so a single `AtomicU32` carries it; workers are
/// the only readers, the coordinator the only writer.
#[derive(Debug)]
pub struct WorkerControls {
    duty_permille: AtomicU32,
    paused: AtomicBool,
}

impl WorkerControls {
    #[must_use]
    pub fn new() -> Self {
        Self {
            duty_permille: AtomicU32::new(0),
            paused: AtomicBool::new(false),
        }
    }

    /// Program the target duty cycle from an intensity percentage.
    pub fn set_intensity_pct(&self, pct: f64, max_duty: f64) {
        let duty = (pct / 100.0).clamp(0.0, max_duty);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let permille = (duty * 1000.0).round() as u32;
        self.duty_permille.store(permille, Ordering::Relaxed);
    }

    #[must_use]
    pub fn duty(&self) -> f64 {
        f64::from(self.duty_permille.load(Ordering::Relaxed)) / 1000.0
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }
}

impl Default for WorkerControls {
    fn default() -> Self {
        Self::new()
    }
}

// ──────────────────── pool ────────────────────

/// One low-priority arithmetic worker per logical core.
pub struct CpuWorkerPool {
    controls: Arc<WorkerControls>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl CpuWorkerPool {
    /// Spawn `count` workers that run until the token fires.
    #[must_use]
    pub fn spawn(count: usize, controls: Arc<WorkerControls>, token: ShutdownToken) -> Self {
        let handles = (0..count)
            .map(|i| {
                let controls = Arc::clone(&controls);
                let token = token.clone();
                thread::Builder::new()
                    .name(format!("lk-cpu-{i}"))
                    .spawn(move || worker_main(&controls, &token))
                    .unwrap_or_else(|e| panic!("failed to spawn CPU worker {i}: {e}"))
            })
            .collect();
        Self { controls, handles }
    }

    #[must_use]
    pub fn controls(&self) -> &Arc<WorkerControls> {
        &self.controls
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Wait for every worker to observe the shutdown token and exit.
    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

fn worker_main(controls: &WorkerControls, token: &ShutdownToken) {
    sys::lower_thread_priority();
    let mut sink = 1.0_f64;

    while !token.is_triggered() {
        if controls.is_paused() {
            thread::sleep(SLEEP_SLICE);
            continue;
        }

        let duty = controls.duty();
        let busy = TICK.mul_f64(duty);

        let start = Instant::now();
        while start.elapsed() < busy {
            // Cheap arithmetic: no allocation, no cache pressure.
            sink = sink.mul_add(1.000_000_1, 1.0);
            if sink > 1.0e12 {
                sink = 1.0;
            }
        }

        let rest = TICK.saturating_sub(start.elapsed());
        thread::sleep(rest.max(SLEEP_SLICE));
    }
    // Keep the arithmetic observable so the busy loop cannot be elided.
    std::hint::black_box(sink);
}

// ──────────────────── tests ────────────────────
