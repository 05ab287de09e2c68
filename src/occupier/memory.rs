//! Memory occupier: hold a target fraction of RAM resident without stressing
//! the memory subsystem.
//!
//! An append-only list of `step_mb` buffers grows or shrinks one step per tick
//! toward the target, and a separate nurse thread writes one byte per page per
//! pass so the kernel keeps the pages resident. Occupation, not stress: no
//! churn, no pattern fills, no page-table games.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::core::config::{MemConfig, SafetyConfig};
use crate::daemon::signals::ShutdownToken;
use crate::metrics::sensors::MemFigures;
use crate::platform::sys;

// ──────────────────── shared block list ────────────────────

#[derive(Debug, Default)]
struct BlockList {
    blocks: Vec<Vec<u8>>,
}

/// State shared between the control loop and the page-toucher thread.
#[derive(Debug)]
pub struct OccupierShared {
    blocks: Mutex<BlockList>,
    occupied_bytes: AtomicU64,
    paused: AtomicBool,
}

impl OccupierShared {
    fn new() -> Self {
        Self {
            blocks: Mutex::new(BlockList::default()),
            occupied_bytes: AtomicU64::new(0),
            paused: AtomicBool::new(false),
        }
    }
}

// ──────────────────── occupier ────────────────────

/// Grow/shrink control for the resident block list.
#[derive(Debug)]
pub struct MemoryOccupier {
    cfg: MemConfig,
    shared: Arc<OccupierShared>,
}

impl MemoryOccupier {
    #[must_use]
    pub fn new(cfg: MemConfig) -> Self {
        Self {
            cfg,
            shared: Arc::new(OccupierShared::new()),
        }
    }

    /// Whether this shape wants any memory occupation at all.
    #[must_use]
    pub fn is_dormant(&self) -> bool {
        self.cfg.target_pct <= 0.0
    }

    #[must_use]
    pub fn occupied_bytes(&self) -> u64 {
        self.shared.occupied_bytes.load(Ordering::Relaxed)
    }

    /// Pause/resume page touching (the load gate pulls this).
    pub fn set_paused(&self, paused: bool) {
        self.shared.paused.store(paused, Ordering::Relaxed);
    }

    /// One control step toward `target_pct` (already jittered by the caller).
    ///
    /// Guards, in order: dormancy, hysteresis band around the target, the
    /// stop percentage, and the free-memory floor. At most one `step_mb`
    /// block moves per call.
    pub fn step(&self, figures: MemFigures, target_pct: f64, safety: &SafetyConfig) {
        if self.is_dormant() {
            self.release_all();
            return;
        }

        let current_pct = figures.used_pct_excl_cache();
        let step_bytes = self.cfg.step_mb * 1024 * 1024;
        let min_free_bytes = self.cfg.min_free_mb * 1024 * 1024;

        // Hard ceiling wins over everything else.
        if current_pct >= safety.mem_stop_pct {
            self.shrink_one(step_bytes);
            return;
        }

        if current_pct < target_pct - safety.hysteresis_pct {
            // Growing must leave the configured floor untouched.
            if figures.free.saturating_sub(step_bytes) < min_free_bytes
                || figures.available.saturating_sub(step_bytes) < min_free_bytes
            {
                return;
            }
            self.grow_one(step_bytes);
        } else if current_pct > target_pct + safety.hysteresis_pct {
            self.shrink_one(step_bytes);
        }
    }

    /// Drop every block immediately (safety stop / shutdown).
    pub fn release_all(&self) {
        let mut list = self.shared.blocks.lock();
        if !list.blocks.is_empty() {
            list.blocks.clear();
            list.blocks.shrink_to_fit();
        }
        drop(list);
        self.shared.occupied_bytes.store(0, Ordering::Relaxed);
    }

    fn grow_one(&self, step_bytes: u64) {
        let len = usize::try_from(step_bytes).unwrap_or(usize::MAX);
        // Touch at allocation so the pages are faulted in immediately.
        let block = vec![1_u8; len];
        let mut list = self.shared.blocks.lock();
        list.blocks.push(block);
        drop(list);
        self.shared.occupied_bytes.fetch_add(step_bytes, Ordering::Relaxed);
    }

    fn shrink_one(&self, step_bytes: u64) {
        let mut list = self.shared.blocks.lock();
        if list.blocks.pop().is_some() {
            drop(list);
            self.shared.occupied_bytes.fetch_sub(step_bytes, Ordering::Relaxed);
        }
    }

    /// Spawn the nurse thread keeping occupied pages resident.
    #[must_use]
    pub fn spawn_toucher(&self, token: ShutdownToken) -> thread::JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let interval = Duration::from_secs_f64(self.cfg.touch_interval_sec.max(0.1));
        thread::Builder::new()
            .name("lk-mem-touch".to_string())
            .spawn(move || toucher_main(&shared, interval, &token))
            .unwrap_or_else(|e| panic!("failed to spawn page toucher: {e}"))
    }
}

fn toucher_main(shared: &OccupierShared, interval: Duration, token: &ShutdownToken) {
    sys::lower_thread_priority();
    let page = sys::page_size();

    while !token.is_triggered() {
        if !shared.paused.load(Ordering::Relaxed) {
            let mut list = shared.blocks.lock();
            for block in &mut list.blocks {
                // One byte per page keeps it resident; wrapping add avoids
                // the compiler proving the writes dead.
                for pos in (0..block.len()).step_by(page) {
                    block[pos] = block[pos].wrapping_add(1);
                }
            }
        }
        // Sleep in small slices so cancellation lands within ~1 interval.
        let mut remaining = interval;
        while remaining > Duration::ZERO && !token.is_triggered() {
            let nap = remaining.min(Duration::from_millis(100));
            thread::sleep(nap);
            remaining = remaining.saturating_sub(nap);
        }
    }
}

// ──────────────────── tests ────────────────────
