//! Cancellation token and signal wiring.
//!
//! There is exactly one shutdown flag in the process. Every execution context
//! (workers, page toucher, net emitter, coordinator) holds a clone of the
//! token and polls it at its natural suspension point; SIGTERM/SIGINT set it
//! via `signal-hook`'s flag registration.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use signal_hook::consts::{SIGINT, SIGTERM};

// ──────────────────── shutdown token ────────────────────

/// Shared cancellation flag. Cheap to clone, safe to poll from any thread.
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken {
    flag: Arc<AtomicBool>,
}

impl ShutdownToken {
    #[must_use]
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request shutdown. Idempotent.
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Sleep for `total`, waking early if the token fires. Returns `true`
    /// when the sleep completed untriggered.
    pub fn sleep_unless_triggered(&self, total: Duration) -> bool {
        let mut remaining = total;
        while remaining > Duration::ZERO {
            if self.is_triggered() {
                return false;
            }
            let nap = remaining.min(Duration::from_millis(250));
            std::thread::sleep(nap);
            remaining = remaining.saturating_sub(nap);
        }
        !self.is_triggered()
    }

    /// Register OS signal hooks that raise this token.
    ///
    /// Registration is best-effort: a failure is logged, not fatal, because
    /// the daemon is still operable (it just needs SIGKILL to die).
    pub fn register_signals(&self) {
        if let Err(e) = signal_hook::flag::register(SIGTERM, Arc::clone(&self.flag)) {
            eprintln!("[LK-SIGNAL] failed to register SIGTERM: {e}");
        }
        if let Err(e) = signal_hook::flag::register(SIGINT, Arc::clone(&self.flag)) {
            eprintln!("[LK-SIGNAL] failed to register SIGINT: {e}");
        }
    }
}

// ──────────────────── drain coordinator ────────────────────

/// Runs named shutdown tasks under a global deadline.
pub struct DrainCoordinator {
    pub timeout: Duration,
}

impl DrainCoordinator {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Execute the tasks in order; returns `true` when all ran and succeeded
    /// within the deadline.
    pub fn execute(&self, tasks: &[(&str, &dyn Fn() -> bool)]) -> bool {
        let start = Instant::now();
        let mut all_ok = true;

        for (name, task) in tasks {
            if start.elapsed() > self.timeout {
                eprintln!("[LK-SHUTDOWN] timeout reached, abandoning remaining tasks");
                return false;
            }
            if task() {
                eprintln!("[LK-SHUTDOWN] {name}: ok");
            } else {
                eprintln!("[LK-SHUTDOWN] {name}: failed");
                all_ok = false;
            }
        }
        all_ok
    }
}

impl Default for DrainCoordinator {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

// ──────────────────── tests ────────────────────
