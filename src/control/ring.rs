//! Slot ring buffer: one intensity bit per control slot over the trailing
//! 7 days, persisted as `p95_ring_buffer.json`.
//!
//! Slots carry what actually ran, post safety gating. Entries are
//! `Some(true)` (high), `Some(false)` (baseline) or `None` (unknown — the
//! daemon was not running). Unknown slots are excluded from the exceedance
//! ratio entirely so a restart gap cannot bias the budget.
//!
//! Persistence is crash-safe: the snapshot is written to a uniquely named
//! temp file (process id + thread id) and renamed into place; the live file
//! is never truncated.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::errors::{LkError, Result};

const RING_VERSION: u32 = 1;
const WINDOW_SECS: u64 = 7 * 24 * 3600;

// ──────────────────── snapshot ────────────────────

/// On-disk representation. `slots` uses `null` for unknown entries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RingSnapshot {
    pub version: u32,
    pub slot_len_sec: u64,
    pub slots: Vec<Option<u8>>,
    pub last_slot_index: Option<u64>,
    pub last_slot_start_ts: Option<i64>,
}

// ──────────────────── ring ────────────────────

/// Fixed-capacity ring of slot intensity bits, keyed by absolute slot index
/// (`floor(unix_time / slot_len)`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRing {
    slot_len_sec: u64,
    slots: Vec<Option<bool>>,
    last_slot_index: Option<u64>,
    last_slot_start_ts: Option<i64>,
    /// Highest slot index known to be on disk.
    last_flushed_slot: Option<u64>,
}

impl SlotRing {
    #[must_use]
    pub fn new(slot_len_sec: u64) -> Self {
        let capacity = usize::try_from(WINDOW_SECS / slot_len_sec.max(1)).unwrap_or(1).max(1);
        Self {
            slot_len_sec: slot_len_sec.max(1),
            slots: vec![None; capacity],
            last_slot_index: None,
            last_slot_start_ts: None,
            last_flushed_slot: None,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn slot_len_sec(&self) -> u64 {
        self.slot_len_sec
    }

    #[must_use]
    pub fn last_slot_index(&self) -> Option<u64> {
        self.last_slot_index
    }

    /// Absolute slot index for a wall-clock time.
    #[must_use]
    pub fn slot_index_for(&self, now: f64) -> u64 {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let idx = (now.max(0.0) / self.slot_len_sec as f64) as u64;
        idx
    }

    /// Record the final (post-gate) intensity bit for `slot_index`.
    ///
    /// Indices must advance monotonically; at most one write per slot. Any
    /// skipped indices between the previous write and this one are cleared to
    /// unknown, which also evicts the entries they alias in the ring.
    pub fn record(&mut self, slot_index: u64, high: bool) -> bool {
        if let Some(last) = self.last_slot_index
            && slot_index <= last
        {
            return false;
        }

        if let Some(last) = self.last_slot_index {
            let gap_start = last + 1;
            // Clear everything we skipped, capped at one full revolution.
            let capacity = self.capacity() as u64;
            let clear_from = gap_start.max(slot_index.saturating_sub(capacity));
            for missed in clear_from..slot_index {
                let pos = self.position(missed);
                self.slots[pos] = None;
            }
        }

        let pos = self.position(slot_index);
        self.slots[pos] = Some(high);
        self.last_slot_index = Some(slot_index);
        #[allow(clippy::cast_possible_wrap)]
        let start_ts = (slot_index * self.slot_len_sec) as i64;
        self.last_slot_start_ts = Some(start_ts);
        true
    }

    /// Exceedance ratio in `[0, 1]`: high slots over known slots.
    #[must_use]
    pub fn exceedance_ratio(&self) -> f64 {
        let mut high = 0_u64;
        let mut known = 0_u64;
        for slot in &self.slots {
            if let Some(bit) = slot {
                known += 1;
                if *bit {
                    high += 1;
                }
            }
        }
        if known == 0 {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            let ratio = high as f64 / known as f64;
            ratio
        }
    }

    #[must_use]
    pub fn known_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    #[must_use]
    pub fn high_count(&self) -> usize {
        self.slots.iter().filter(|s| **s == Some(true)).count()
    }

    /// Whether the most recent record still needs flushing.
    #[must_use]
    pub fn dirty(&self) -> bool {
        self.last_slot_index != self.last_flushed_slot
    }

    fn position(&self, slot_index: u64) -> usize {
        usize::try_from(slot_index % self.capacity() as u64).unwrap_or(0)
    }

    // ──────────────────── persistence ────────────────────

    #[must_use]
    pub fn snapshot(&self) -> RingSnapshot {
        RingSnapshot {
            version: RING_VERSION,
            slot_len_sec: self.slot_len_sec,
            slots: self.slots.iter().map(|s| s.map(u8::from)).collect(),
            last_slot_index: self.last_slot_index,
            last_slot_start_ts: self.last_slot_start_ts,
        }
    }

    /// Atomically write the ring to `path`. `last_flushed_slot` only advances
    /// after the rename lands.
    pub fn save(&mut self, path: &Path) -> Result<()> {
        let snapshot = self.snapshot();
        let payload = serde_json::to_vec(&snapshot)?;

        let tmp = unique_temp_path(path);
        std::fs::write(&tmp, &payload).map_err(|e| LkError::io(&tmp, e))?;
        if let Err(e) = std::fs::rename(&tmp, path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(LkError::io(path, e));
        }
        self.last_flushed_slot = self.last_slot_index;
        Ok(())
    }

    /// Load a previously saved ring. Missing file, version skew, or a slot
    /// length mismatch all yield a fresh ring rather than an error — stale
    /// state is never worth refusing to start over.
    #[must_use]
    pub fn load_or_new(path: &Path, slot_len_sec: u64) -> Self {
        match Self::try_load(path, slot_len_sec) {
            Ok(Some(ring)) => ring,
            Ok(None) => Self::new(slot_len_sec),
            Err(e) => {
                eprintln!("[LK-RING] ignoring unreadable ring state: {e}");
                Self::new(slot_len_sec)
            }
        }
    }

    fn try_load(path: &Path, slot_len_sec: u64) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read(path).map_err(|e| LkError::io(path, e))?;
        let snapshot: RingSnapshot = serde_json::from_slice(&raw)?;

        let expected = Self::new(slot_len_sec);
        if snapshot.version != RING_VERSION
            || snapshot.slot_len_sec != slot_len_sec
            || snapshot.slots.len() != expected.capacity()
        {
            eprintln!("[LK-RING] ring state shape mismatch, starting fresh");
            return Ok(None);
        }

        let last = snapshot.last_slot_index;
        Ok(Some(Self {
            slot_len_sec,
            slots: snapshot.slots.iter().map(|s| s.map(|b| b != 0)).collect(),
            last_slot_index: last,
            last_slot_start_ts: snapshot.last_slot_start_ts,
            last_flushed_slot: last,
        }))
    }
}

/// Temp file sibling whose name embeds process and thread identity so two
/// writers can never collide on the same temp path.
fn unique_temp_path(path: &Path) -> PathBuf {
    let pid = std::process::id();
    let tid = format!("{:?}", std::thread::current().id());
    let tid: String = tid.chars().filter(char::is_ascii_digit).collect();
    let name = path
        .file_name()
        .map_or_else(|| "ring".to_string(), |n| n.to_string_lossy().into_owned());
    path.with_file_name(format!("{name}.{pid}.{tid}.tmp"))
}

// ──────────────────── tests ────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_capacity_is_seven_days_of_minutes() {
        let ring = SlotRing::new(60);
        assert_eq!(ring.capacity(), 10_080);
    }

    #[test]
    fn record_advances_monotonically() {
        let mut ring = SlotRing::new(60);
        assert!(ring.record(100, true));
        assert!(!ring.record(100, false), "double write must be refused");
        assert!(!ring.record(99, false), "regression must be refused");
        assert!(ring.record(101, false));
        assert_eq!(ring.last_slot_index(), Some(101));
    }

    #[test]
    fn exceedance_counts_only_known_slots() {
        let mut ring = SlotRing::new(60);
        ring.record(10, true);
        ring.record(11, false);
        ring.record(12, false);
        ring.record(13, false);
        let ratio = ring.exceedance_ratio();
        assert!((ratio - 0.25).abs() < 1e-12, "got {ratio}");
        assert_eq!(ring.known_count(), 4);
    }

    #[test]
    fn empty_ring_has_zero_ratio() {
        let ring = SlotRing::new(60);
        assert!(ring.exceedance_ratio().abs() < f64::EPSILON);
    }

    #[test]
    fn restart_gap_leaves_unknown_slots() {
        let mut ring = SlotRing::new(60);
        ring.record(10, true);
        // Daemon was down for slots 11..=19.
        ring.record(20, false);
        assert_eq!(ring.known_count(), 2);
        // The gap does not dilute the ratio: 1 high / 2 known.
        assert!((ring.exceedance_ratio() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn slot_index_from_wall_clock() {
        let ring = SlotRing::new(60);
        assert_eq!(ring.slot_index_for(0.0), 0);
        assert_eq!(ring.slot_index_for(59.9), 0);
        assert_eq!(ring.slot_index_for(60.0), 1);
        assert_eq!(ring.slot_index_for(3_601.0), 60);
    }

    #[test]
    fn save_and_load_roundtrip_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p95_ring_buffer.json");

        let mut ring = SlotRing::new(60);
        ring.record(500, true);
        ring.record(501, false);
        ring.record(510, true);
        ring.save(&path).unwrap();

        let restored = SlotRing::load_or_new(&path, 60);
        assert_eq!(restored.snapshot(), ring.snapshot());
        assert_eq!(restored.last_slot_index(), Some(510));
        // Monotonicity survives the restart: replays are refused.
        let mut restored = restored;
        assert!(!restored.record(510, false));
        assert!(restored.record(511, false));
    }

    #[test]
    fn load_rejects_slot_length_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p95_ring_buffer.json");
        let mut ring = SlotRing::new(60);
        ring.record(5, true);
        ring.save(&path).unwrap();

        let fresh = SlotRing::load_or_new(&path, 30);
        assert_eq!(fresh.last_slot_index(), None, "mismatched ring must not load");
    }

    #[test]
    fn load_survives_garbage_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p95_ring_buffer.json");
        std::fs::write(&path, b"{ not json").unwrap();
        let ring = SlotRing::load_or_new(&path, 60);
        assert_eq!(ring.last_slot_index(), None);
    }

    #[test]
    fn save_never_leaves_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p95_ring_buffer.json");
        let mut ring = SlotRing::new(60);
        ring.record(1, true);
        ring.save(&path).unwrap();
        ring.record(2, false);
        ring.save(&path).unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind: {leftovers:?}");
    }

    #[test]
    fn dirty_tracks_flush_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ring.json");
        let mut ring = SlotRing::new(60);
        assert!(!ring.dirty());
        ring.record(7, true);
        assert!(ring.dirty());
        ring.save(&path).unwrap();
        assert!(!ring.dirty());
    }

    #[test]
    fn wraparound_overwrites_oldest_slot() {
        let mut ring = SlotRing::new(60);
        let cap = ring.capacity() as u64;
        ring.record(0, true);
        // One full revolution later the same position is reused.
        ring.record(cap, false);
        assert_eq!(ring.known_count(), 1);
        assert!(ring.exceedance_ratio().abs() < f64::EPSILON);
    }

    proptest! {
        #[test]
        fn roundtrip_is_identity(
            bits in proptest::collection::vec(proptest::option::of(any::<bool>()), 1..200),
        ) {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("ring.json");
            let mut ring = SlotRing::new(3600);
            let mut index = 0_u64;
            for bit in bits {
                index += 1;
                if let Some(high) = bit {
                    ring.record(index, high);
                }
            }
            ring.save(&path).unwrap();
            let restored = SlotRing::load_or_new(&path, 3600);
            prop_assert_eq!(restored.snapshot(), ring.snapshot());
        }

        #[test]
        fn ratio_is_always_a_probability(
            writes in proptest::collection::vec(any::<bool>(), 0..500),
        ) {
            let mut ring = SlotRing::new(60);
            for (i, high) in writes.iter().enumerate() {
                ring.record(i as u64 + 1, *high);
            }
            let ratio = ring.exceedance_ratio();
            prop_assert!((0.0..=1.0).contains(&ratio));
        }
    }
}
