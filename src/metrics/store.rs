//! 7-day sample store: WAL-mode SQLite, cached p95 queries, corruption
//! recovery, and an ENOSPC degraded mode.
//!
//! One process owns the database (enforced by the daemon's instance lock) and
//! inside the process a single connection behind a mutex serializes writers;
//! WAL keeps concurrent readers cheap. On a failed integrity probe the file is
//! moved aside as `metrics.db.corrupt.<ts>` and a fresh store is initialized —
//! losing history is survivable, wedging the control loop is not.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, params};

use crate::core::errors::{LkError, Result};

// ──────────────────── metric kinds ────────────────────

/// The four series tracked against the reclamation rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    Cpu,
    Mem,
    Net,
    Load,
}

impl MetricKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Mem => "mem",
            Self::Net => "net",
            Self::Load => "load",
        }
    }
}

/// Store availability as seen by callers and telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreHealth {
    Available,
    Degraded,
    Unavailable,
}

// ──────────────────── store ────────────────────

const RETENTION_SECS: i64 = 7 * 24 * 3600;

#[derive(Debug)]
struct StoreInner {
    conn: Option<Connection>,
    p95_cache: HashMap<MetricKind, (f64, Instant)>,
    consecutive_failures: u32,
    degraded: bool,
}

/// Append-only rolling sample store with percentile queries.
#[derive(Debug)]
pub struct MetricsStore {
    path: PathBuf,
    cache_ttl: Duration,
    max_consecutive_failures: u32,
    inner: Mutex<StoreInner>,
}

impl MetricsStore {
    /// Open (or create) `metrics.db` inside `dir`.
    ///
    /// The directory must already exist and be writable; anything else is a
    /// startup-fatal persistence failure. A structural probe runs on open and
    /// recovers from corruption before the first query.
    pub fn open(dir: &Path, cache_ttl_sec: u64, max_consecutive_failures: u32) -> Result<Self> {
        if !dir.is_dir() {
            return Err(LkError::PersistenceUnavailable {
                path: dir.to_path_buf(),
                details: "directory does not exist; a persistent volume must be mounted"
                    .to_string(),
            });
        }
        let probe = dir.join(".lk_write_probe");
        match std::fs::write(&probe, b"probe") {
            Ok(()) => {
                let _ = std::fs::remove_file(&probe);
            }
            Err(e) => {
                return Err(LkError::PersistenceUnavailable {
                    path: dir.to_path_buf(),
                    details: format!("directory is not writable: {e}"),
                });
            }
        }

        let path = dir.join("metrics.db");
        let store = Self {
            path,
            cache_ttl: Duration::from_secs(cache_ttl_sec),
            max_consecutive_failures,
            inner: Mutex::new(StoreInner {
                conn: None,
                p95_cache: HashMap::new(),
                consecutive_failures: 0,
                degraded: false,
            }),
        };

        {
            let mut inner = store.inner.lock();
            store.ensure_open(&mut inner)?;
        }
        Ok(store)
    }

    /// Database file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one sample. While degraded, writes are dropped silently.
    pub fn record(&self, kind: MetricKind, value: f64, t: i64) -> bool {
        let mut inner = self.inner.lock();
        if inner.degraded {
            return false;
        }

        // One retry for transient failures, per the error policy.
        for attempt in 0..2 {
            match self.try_record(&mut inner, kind, value, t) {
                Ok(()) => {
                    inner.consecutive_failures = 0;
                    return true;
                }
                Err(LkError::StorageFull { .. }) => {
                    // Sticky until operator restart.
                    inner.degraded = true;
                    eprintln!(
                        "[LK-STORE] disk full writing {}; entering degraded mode",
                        self.path.display()
                    );
                    return false;
                }
                Err(e) if attempt == 0 => {
                    eprintln!("[LK-STORE] write failed, retrying once: {e}");
                    inner.conn = None;
                }
                Err(e) => {
                    inner.consecutive_failures += 1;
                    if inner.consecutive_failures >= self.max_consecutive_failures {
                        inner.degraded = true;
                        eprintln!(
                            "[LK-STORE] {} consecutive write failures; entering degraded mode: {e}",
                            inner.consecutive_failures
                        );
                    }
                    return false;
                }
            }
        }
        false
    }

    /// 95th percentile of `kind` over the trailing 7 days, TTL-cached.
    ///
    /// Returns the last cached value on read failure and `None` only when no
    /// value has ever been computable.
    pub fn p95(&self, kind: MetricKind, now: i64) -> Option<f64> {
        self.percentile(kind, 95.0, now)
    }

    /// Arbitrary percentile with the same caching and fallback behavior as
    /// [`Self::p95`].
    pub fn percentile(&self, kind: MetricKind, pct: f64, now: i64) -> Option<f64> {
        let mut inner = self.inner.lock();

        if let Some((value, at)) = inner.p95_cache.get(&kind)
            && at.elapsed() < self.cache_ttl
        {
            return Some(*value);
        }

        if inner.degraded {
            // No reads while degraded; reuse whatever we last knew.
            return inner.p95_cache.get(&kind).map(|(v, _)| *v);
        }

        for attempt in 0..2 {
            match self.try_percentile(&mut inner, kind, pct, now) {
                Ok(Some(value)) => {
                    inner.p95_cache.insert(kind, (value, Instant::now()));
                    return Some(value);
                }
                Ok(None) => return inner.p95_cache.get(&kind).map(|(v, _)| *v),
                Err(e) if attempt == 0 => {
                    eprintln!("[LK-STORE] percentile read failed, retrying once: {e}");
                    inner.conn = None;
                }
                Err(e) => {
                    eprintln!("[LK-STORE] percentile read failed: {e}");
                    inner.consecutive_failures += 1;
                    return inner.p95_cache.get(&kind).map(|(v, _)| *v);
                }
            }
        }
        None
    }

    /// Delete samples older than `cutoff` (unix seconds). Idempotent.
    pub fn purge_older_than(&self, cutoff: i64) -> usize {
        let mut inner = self.inner.lock();
        if inner.degraded {
            return 0;
        }
        match self.ensure_open(&mut inner) {
            Ok(()) => {}
            Err(_) => return 0,
        }
        let Some(conn) = inner.conn.as_ref() else {
            return 0;
        };
        conn.execute("DELETE FROM samples WHERE ts < ?1", params![cutoff])
            .unwrap_or(0)
    }

    /// Count of samples inside the 7-day window.
    pub fn count_7d(&self, now: i64) -> u64 {
        let mut inner = self.inner.lock();
        if inner.degraded || self.ensure_open(&mut inner).is_err() {
            return 0;
        }
        let Some(conn) = inner.conn.as_ref() else {
            return 0;
        };
        conn.query_row(
            "SELECT COUNT(*) FROM samples WHERE ts >= ?1",
            params![now - RETENTION_SECS],
            |row| row.get::<_, i64>(0),
        )
        .map(|n| u64::try_from(n).unwrap_or(0))
        .unwrap_or(0)
    }

    /// Store availability for the health surface.
    pub fn health(&self) -> StoreHealth {
        let inner = self.inner.lock();
        if inner.degraded {
            StoreHealth::Degraded
        } else if inner.conn.is_some() {
            StoreHealth::Available
        } else {
            StoreHealth::Unavailable
        }
    }

    /// Lightweight consistency probe for periodic maintenance. On failure the
    /// corrupt file is backed up and the store reinitialized.
    pub fn consistency_probe(&self) -> StoreHealth {
        let mut inner = self.inner.lock();
        if inner.degraded {
            return StoreHealth::Degraded;
        }
        if self.ensure_open(&mut inner).is_err() {
            return StoreHealth::Unavailable;
        }
        let ok = inner
            .conn
            .as_ref()
            .is_some_and(|conn| {
                conn.query_row("PRAGMA quick_check(1)", [], |row| row.get::<_, String>(0))
                    .map(|verdict| verdict.eq_ignore_ascii_case("ok"))
                    .unwrap_or(false)
            });
        if ok {
            StoreHealth::Available
        } else {
            self.recover_from_corruption(&mut inner);
            if inner.conn.is_some() {
                StoreHealth::Available
            } else {
                StoreHealth::Unavailable
            }
        }
    }

    // ──────────────────── internals ────────────────────

    fn ensure_open(&self, inner: &mut StoreInner) -> Result<()> {
        if inner.conn.is_some() {
            return Ok(());
        }
        match self.open_and_probe() {
            Ok(conn) => {
                inner.conn = Some(conn);
                Ok(())
            }
            Err(LkError::StorageCorrupt { .. }) => {
                self.recover_from_corruption(inner);
                if inner.conn.is_some() {
                    Ok(())
                } else {
                    Err(LkError::Runtime {
                        details: "store unavailable after corruption recovery".to_string(),
                    })
                }
            }
            Err(e) => Err(e),
        }
    }

    fn open_and_probe(&self) -> Result<Connection> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        // A trashed header surfaces here as "file is not a database".
        if let Err(e) = apply_pragmas(&conn) {
            return Err(LkError::StorageCorrupt {
                path: self.path.clone(),
                details: e.to_string(),
            });
        }

        // Structural probe on open; deeper damage fails here.
        let verdict: String = conn
            .query_row("PRAGMA quick_check(1)", [], |row| row.get(0))
            .map_err(|e| LkError::StorageCorrupt {
                path: self.path.clone(),
                details: e.to_string(),
            })?;
        if !verdict.eq_ignore_ascii_case("ok") {
            return Err(LkError::StorageCorrupt {
                path: self.path.clone(),
                details: verdict,
            });
        }

        apply_schema(&conn)?;
        Ok(conn)
    }

    fn recover_from_corruption(&self, inner: &mut StoreInner) {
        inner.conn = None;
        let backup = self
            .path
            .with_extension(format!("db.corrupt.{}", chrono::Utc::now().timestamp()));
        match std::fs::rename(&self.path, &backup) {
            Ok(()) => eprintln!(
                "[LK-STORE] WARNING: corrupt database backed up to {}",
                backup.display()
            ),
            Err(e) => eprintln!(
                "[LK-STORE] WARNING: could not back up corrupt database: {e}; reinitializing in place"
            ),
        }
        // WAL sidecars belong to the dead file.
        for suffix in ["-wal", "-shm"] {
            let mut sidecar = self.path.as_os_str().to_owned();
            sidecar.push(suffix);
            let _ = std::fs::remove_file(PathBuf::from(sidecar));
        }
        match self.open_and_probe() {
            Ok(conn) => {
                inner.conn = Some(conn);
                inner.consecutive_failures = 0;
            }
            Err(e) => eprintln!("[LK-STORE] reinitialization failed: {e}"),
        }
    }

    fn try_record(
        &self,
        inner: &mut StoreInner,
        kind: MetricKind,
        value: f64,
        t: i64,
    ) -> Result<()> {
        self.ensure_open(inner)?;
        let Some(conn) = inner.conn.as_ref() else {
            return Err(LkError::Runtime {
                details: "store connection missing after open".to_string(),
            });
        };
        conn.prepare_cached("INSERT INTO samples (ts, kind, value) VALUES (?1, ?2, ?3)")?
            .execute(params![t, kind.as_str(), value])?;
        Ok(())
    }

    fn try_percentile(
        &self,
        inner: &mut StoreInner,
        kind: MetricKind,
        pct: f64,
        now: i64,
    ) -> Result<Option<f64>> {
        self.ensure_open(inner)?;
        let Some(conn) = inner.conn.as_ref() else {
            return Err(LkError::Runtime {
                details: "store connection missing after open".to_string(),
            });
        };
        let mut stmt = conn.prepare_cached(
            "SELECT value FROM samples WHERE kind = ?1 AND ts >= ?2 ORDER BY value ASC",
        )?;
        let values: Vec<f64> = stmt
            .query_map(params![kind.as_str(), now - RETENTION_SECS], |row| {
                row.get(0)
            })?
            .collect::<std::result::Result<_, _>>()?;
        Ok(interpolated_percentile(&values, pct))
    }
}

/// Linear-interpolation percentile over pre-sorted values.
fn interpolated_percentile(sorted: &[f64], pct: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    #[allow(clippy::cast_precision_loss)]
    let index = (pct / 100.0) * (sorted.len() - 1) as f64;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let lo = index.floor() as usize;
    let frac = index - index.floor();
    if frac.abs() < f64::EPSILON || lo + 1 >= sorted.len() {
        return Some(sorted[lo]);
    }
    Some((sorted[lo + 1] - sorted[lo]).mul_add(frac, sorted[lo]))
}

fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA temp_store = MEMORY;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(())
}

fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS samples (
            ts INTEGER NOT NULL,
            kind TEXT NOT NULL,
            value REAL NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_samples_kind_ts ON samples(kind, ts);",
    )?;
    Ok(())
}

// ──────────────────── tests ────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, MetricsStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MetricsStore::open(dir.path(), 300, 5).unwrap();
        (dir, store)
    }

    #[test]
    fn open_fails_for_missing_directory() {
        let err = MetricsStore::open(Path::new("/nonexistent/loadkeeper"), 300, 5)
            .expect_err("missing dir must fail");
        assert_eq!(err.code(), "LK-3001");
        assert!(err.is_startup_fatal());
    }

    #[test]
    fn record_and_percentile_roundtrip() {
        let (_dir, store) = temp_store();
        let now = 1_700_000_000;
        for i in 0..100 {
            assert!(store.record(MetricKind::Cpu, f64::from(i), now + i64::from(i)));
        }
        // p95 of 0..=99 interpolates to 94.05.
        let p95 = store.p95(MetricKind::Cpu, now + 100).unwrap();
        assert!((p95 - 94.05).abs() < 1e-9, "got {p95}");
    }

    #[test]
    fn percentile_is_per_kind() {
        let (_dir, store) = temp_store();
        let now = 1_700_000_000;
        store.record(MetricKind::Cpu, 80.0, now);
        store.record(MetricKind::Mem, 20.0, now);
        assert!((store.p95(MetricKind::Mem, now).unwrap() - 20.0).abs() < 1e-9);
    }

    #[test]
    fn samples_older_than_window_are_invisible() {
        let (_dir, store) = temp_store();
        let now = 1_700_000_000;
        store.record(MetricKind::Cpu, 99.0, now - RETENTION_SECS - 60);
        store.record(MetricKind::Cpu, 10.0, now);
        let p95 = store.p95(MetricKind::Cpu, now).unwrap();
        assert!((p95 - 10.0).abs() < 1e-9, "stale sample leaked: {p95}");
    }

    #[test]
    fn purge_removes_only_old_rows() {
        let (_dir, store) = temp_store();
        let now = 1_700_000_000;
        store.record(MetricKind::Cpu, 1.0, now - RETENTION_SECS - 10);
        store.record(MetricKind::Cpu, 2.0, now);
        let deleted = store.purge_older_than(now - RETENTION_SECS);
        assert_eq!(deleted, 1);
        assert_eq!(store.count_7d(now), 1);
        // Idempotent.
        assert_eq!(store.purge_older_than(now - RETENTION_SECS), 0);
    }

    #[test]
    fn p95_cache_survives_within_ttl() {
        let (_dir, store) = temp_store();
        let now = 1_700_000_000;
        store.record(MetricKind::Cpu, 50.0, now);
        let first = store.p95(MetricKind::Cpu, now).unwrap();
        // New data arrives but the cached value holds until the TTL lapses.
        store.record(MetricKind::Cpu, 90.0, now + 1);
        let second = store.p95(MetricKind::Cpu, now + 2).unwrap();
        assert_eq!(first.to_bits(), second.to_bits());
    }

    #[test]
    fn empty_store_has_no_percentile() {
        let (_dir, store) = temp_store();
        assert!(store.p95(MetricKind::Net, 1_700_000_000).is_none());
        assert_eq!(store.count_7d(1_700_000_000), 0);
    }

    #[test]
    fn health_starts_available() {
        let (_dir, store) = temp_store();
        assert_eq!(store.health(), StoreHealth::Available);
        assert_eq!(store.consistency_probe(), StoreHealth::Available);
    }

    #[test]
    fn corruption_backs_up_and_reinitializes() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = MetricsStore::open(dir.path(), 300, 5).unwrap();
            store.record(MetricKind::Cpu, 42.0, 1_700_000_000);
        }
        // Trash the file head so the structural probe fails.
        let db = dir.path().join("metrics.db");
        std::fs::write(&db, b"definitely not a sqlite database").unwrap();

        let store = MetricsStore::open(dir.path(), 300, 5).unwrap();
        assert_eq!(store.health(), StoreHealth::Available);
        // The corpse was preserved.
        let backups: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("corrupt"))
            .collect();
        assert_eq!(backups.len(), 1, "expected one corrupt backup");
        // And the fresh store works.
        assert!(store.record(MetricKind::Cpu, 1.0, 1_700_000_100));
    }

    #[test]
    fn degraded_store_serves_cached_p95() {
        let (_dir, store) = temp_store();
        let now = 1_700_000_000;
        store.record(MetricKind::Cpu, 33.0, now);
        let cached = store.p95(MetricKind::Cpu, now).unwrap();

        store.inner.lock().degraded = true;
        assert_eq!(store.health(), StoreHealth::Degraded);
        assert!(!store.record(MetricKind::Cpu, 99.0, now + 1));
        assert_eq!(store.p95(MetricKind::Cpu, now + 1).unwrap().to_bits(), cached.to_bits());
        assert_eq!(store.consistency_probe(), StoreHealth::Degraded);
    }

    #[test]
    fn interpolated_percentile_edges() {
        assert_eq!(interpolated_percentile(&[], 95.0), None);
        assert_eq!(interpolated_percentile(&[7.0], 95.0), Some(7.0));
        let vals = [1.0, 2.0, 3.0, 4.0];
        assert!((interpolated_percentile(&vals, 0.0).unwrap() - 1.0).abs() < 1e-12);
        assert!((interpolated_percentile(&vals, 100.0).unwrap() - 4.0).abs() < 1e-12);
        assert!((interpolated_percentile(&vals, 50.0).unwrap() - 2.5).abs() < 1e-12);
    }
}
