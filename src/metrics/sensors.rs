//! Instantaneous sensors: CPU%, memory% (excluding reclaimable cache),
//! NIC tx utilization, and per-core load average.
//!
//! Raw counters come from a `SensorSource` so tests can script readings; the
//! Linux implementation parses `/proc` and `/sys` (the file locations are the
//! contract, the parsing is deliberately dumb). Percentages are derived here:
//! CPU and network are delta-over-delta and therefore unknown on the first
//! tick — callers must skip, never fabricate.

#![allow(missing_docs)]

use std::fs;

use crate::core::errors::{LkError, Result};

// ──────────────────── raw counter types ────────────────────

/// Cumulative CPU time split, in jiffies.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuJiffies {
    pub total: f64,
    pub idle: f64,
}

/// Point-in-time memory figures, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemFigures {
    pub total: u64,
    pub free: u64,
    /// Memory usable without swapping, cache/buffers already excluded.
    pub available: u64,
}

impl MemFigures {
    /// Utilization excluding reclaimable cache. This is the definition the
    /// 20% reclamation rule is judged against.
    #[must_use]
    pub fn used_pct_excl_cache(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let avail = self.available.min(self.total);
        #[allow(clippy::cast_precision_loss)]
        let pct = 100.0 * (1.0 - avail as f64 / self.total as f64);
        pct.clamp(0.0, 100.0)
    }

    #[must_use]
    pub fn used_bytes_excl_cache(&self) -> u64 {
        self.total.saturating_sub(self.available)
    }
}

/// Cumulative interface byte counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NicCounters {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
}

// ──────────────────── source trait ────────────────────

/// Raw counter supplier. One implementation reads the host OS; tests inject
/// scripted values.
pub trait SensorSource: Send {
    fn cpu_jiffies(&self) -> Result<CpuJiffies>;
    fn mem_figures(&self) -> Result<MemFigures>;
    fn nic_counters(&self, iface: &str) -> Result<NicCounters>;
    /// Interface speed in Mbit/s, when the OS exposes one.
    fn nic_speed_mbit(&self, iface: &str) -> Option<f64>;
    /// 1-minute load average.
    fn load_1min(&self) -> Result<f64>;
    fn cpu_count(&self) -> usize;
}

// ──────────────────── linux /proc implementation ────────────────────

/// Reads the kernel's counter files directly.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcSensorSource;

impl ProcSensorSource {
    fn read(path: &str) -> Result<String> {
        fs::read_to_string(path).map_err(|e| LkError::Sensor {
            source_name: "proc",
            details: format!("{path}: {e}"),
        })
    }
}

impl SensorSource for ProcSensorSource {
    fn cpu_jiffies(&self) -> Result<CpuJiffies> {
        let raw = Self::read("/proc/stat")?;
        let line = raw.lines().next().unwrap_or_default();
        if !line.starts_with("cpu ") {
            return Err(LkError::Sensor {
                source_name: "proc",
                details: "unexpected /proc/stat format".to_string(),
            });
        }
        let vals: Vec<f64> = line
            .split_whitespace()
            .skip(1)
            .take(8)
            .filter_map(|v| v.parse().ok())
            .collect();
        if vals.len() < 8 {
            return Err(LkError::Sensor {
                source_name: "proc",
                details: "short cpu line in /proc/stat".to_string(),
            });
        }
        // idle + iowait count as idle; the rest is work.
        let idle = vals[3] + vals[4];
        let total: f64 = vals.iter().sum();
        Ok(CpuJiffies { total, idle })
    }

    fn mem_figures(&self) -> Result<MemFigures> {
        let raw = Self::read("/proc/meminfo")?;
        let mut total = None;
        let mut free = None;
        let mut available = None;
        for line in raw.lines() {
            let Some((key, rest)) = line.split_once(':') else {
                continue;
            };
            let kb: Option<u64> = rest.split_whitespace().next().and_then(|v| v.parse().ok());
            match key {
                "MemTotal" => total = kb,
                "MemFree" => free = kb,
                "MemAvailable" => available = kb,
                _ => {}
            }
        }
        let total = total.filter(|t| *t > 0).ok_or_else(|| LkError::Sensor {
            source_name: "proc",
            details: "MemTotal missing or zero in /proc/meminfo".to_string(),
        })?;
        // The 20% policy is defined against available memory (cache excluded).
        // Guessing from Free+Buffers would silently change the policy, so a
        // kernel without MemAvailable (pre-3.14) is refused outright.
        let available = available.ok_or_else(|| LkError::UnsupportedPlatform {
            details: "MemAvailable not present in /proc/meminfo (kernel 3.14+ required)"
                .to_string(),
        })?;
        Ok(MemFigures {
            total: total * 1024,
            free: free.unwrap_or(0) * 1024,
            available: available * 1024,
        })
    }

    fn nic_counters(&self, iface: &str) -> Result<NicCounters> {
        let tx = Self::read(&format!("/sys/class/net/{iface}/statistics/tx_bytes"))?;
        let rx = Self::read(&format!("/sys/class/net/{iface}/statistics/rx_bytes"))?;
        let parse = |raw: &str| -> Result<u64> {
            raw.trim().parse().map_err(|e| LkError::Sensor {
                source_name: "sysfs",
                details: format!("{iface} byte counter: {e}"),
            })
        };
        Ok(NicCounters {
            tx_bytes: parse(&tx)?,
            rx_bytes: parse(&rx)?,
        })
    }

    fn nic_speed_mbit(&self, iface: &str) -> Option<f64> {
        let raw = fs::read_to_string(format!("/sys/class/net/{iface}/speed")).ok()?;
        let speed: f64 = raw.trim().parse().ok()?;
        (speed > 0.0).then_some(speed)
    }

    fn load_1min(&self) -> Result<f64> {
        let raw = Self::read("/proc/loadavg")?;
        raw.split_whitespace()
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| LkError::Sensor {
                source_name: "proc",
                details: "malformed /proc/loadavg".to_string(),
            })
    }

    fn cpu_count(&self) -> usize {
        std::thread::available_parallelism().map_or(1, |n| n.get())
    }
}

// ──────────────────── per-tick sampling ────────────────────

/// One tick's worth of readings. Delta-based metrics are `None` until a
/// previous counter exists, and whenever the underlying source fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct SensorSample {
    pub cpu_pct: Option<f64>,
    pub mem_pct: Option<f64>,
    pub mem: Option<MemFigures>,
    pub net_pct: Option<f64>,
    pub load_1min: Option<f64>,
    pub load_per_core: Option<f64>,
}

/// Stateful sampler turning cumulative counters into per-tick percentages.
pub struct Sensors<S: SensorSource> {
    source: S,
    iface: String,
    link_mbit: f64,
    prev_cpu: Option<CpuJiffies>,
    prev_nic: Option<(NicCounters, f64)>,
}

impl<S: SensorSource> Sensors<S> {
    /// `configured_link_mbit` is used when the interface reports no speed.
    pub fn new(source: S, iface: &str, configured_link_mbit: f64) -> Self {
        let link_mbit = source.nic_speed_mbit(iface).unwrap_or(configured_link_mbit);
        Self {
            source,
            iface: iface.to_string(),
            link_mbit,
            prev_cpu: None,
            prev_nic: None,
        }
    }

    /// Link bandwidth used for network utilization math.
    #[must_use]
    pub fn link_mbit(&self) -> f64 {
        self.link_mbit
    }

    #[must_use]
    pub fn cpu_count(&self) -> usize {
        self.source.cpu_count()
    }

    /// Collect one tick of readings at wall-clock time `now` (unix seconds).
    ///
    /// Transient per-metric failures yield `None` for that metric only;
    /// the only hard error surfaced is a missing `MemAvailable`.
    pub fn sample(&mut self, now: f64) -> Result<SensorSample> {
        let mut out = SensorSample::default();

        match self.source.cpu_jiffies() {
            Ok(cur) => {
                if let Some(prev) = self.prev_cpu {
                    let totald = cur.total - prev.total;
                    let idled = cur.idle - prev.idle;
                    if totald > 0.0 {
                        out.cpu_pct = Some((100.0 * (totald - idled) / totald).clamp(0.0, 100.0));
                    }
                }
                self.prev_cpu = Some(cur);
            }
            Err(_) => self.prev_cpu = None,
        }

        match self.source.mem_figures() {
            Ok(figures) => {
                out.mem = Some(figures);
                out.mem_pct = Some(figures.used_pct_excl_cache());
            }
            Err(e @ LkError::UnsupportedPlatform { .. }) => return Err(e),
            Err(_) => {}
        }

        if let Ok(cur) = self.source.nic_counters(&self.iface) {
            if let Some((prev, prev_t)) = self.prev_nic {
                let dt = now - prev_t;
                if dt > 0.0 && self.link_mbit > 0.0 {
                    #[allow(clippy::cast_precision_loss)]
                    let tx_bits = cur.tx_bytes.saturating_sub(prev.tx_bytes) as f64 * 8.0;
                    let cap_bps = self.link_mbit * 1_000_000.0;
                    out.net_pct = Some((100.0 * tx_bits / dt / cap_bps).clamp(0.0, 100.0));
                }
            }
            self.prev_nic = Some((cur, now));
        } else {
            self.prev_nic = None;
        }

        if let Ok(load) = self.source.load_1min() {
            out.load_1min = Some(load);
            #[allow(clippy::cast_precision_loss)]
            let cores = self.source.cpu_count().max(1) as f64;
            out.load_per_core = Some(load / cores);
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct ScriptedSource {
        jiffies: Cell<CpuJiffies>,
        mem: MemFigures,
        nic: Cell<NicCounters>,
        load: f64,
        cores: usize,
        mem_available_missing: bool,
    }

    impl ScriptedSource {
        fn new() -> Self {
            Self {
                jiffies: Cell::new(CpuJiffies {
                    total: 1000.0,
                    idle: 800.0,
                }),
                mem: MemFigures {
                    total: 1024 * 1024 * 1024,
                    free: 512 * 1024 * 1024,
                    available: 768 * 1024 * 1024,
                },
                nic: Cell::new(NicCounters {
                    tx_bytes: 0,
                    rx_bytes: 0,
                }),
                load: 0.8,
                cores: 4,
                mem_available_missing: false,
            }
        }
    }

    impl SensorSource for ScriptedSource {
        fn cpu_jiffies(&self) -> Result<CpuJiffies> {
            Ok(self.jiffies.get())
        }
        fn mem_figures(&self) -> Result<MemFigures> {
            if self.mem_available_missing {
                return Err(LkError::UnsupportedPlatform {
                    details: "MemAvailable not present".to_string(),
                });
            }
            Ok(self.mem)
        }
        fn nic_counters(&self, _iface: &str) -> Result<NicCounters> {
            Ok(self.nic.get())
        }
        fn nic_speed_mbit(&self, _iface: &str) -> Option<f64> {
            None
        }
        fn load_1min(&self) -> Result<f64> {
            Ok(self.load)
        }
        fn cpu_count(&self) -> usize {
            self.cores
        }
    }

    #[test]
    fn first_tick_has_unknown_cpu_and_net() {
        let mut sensors = Sensors::new(ScriptedSource::new(), "eth0", 1000.0);
        let s = sensors.sample(0.0).unwrap();
        assert!(s.cpu_pct.is_none(), "no delta on first tick");
        assert!(s.net_pct.is_none(), "no delta on first tick");
        assert!(s.mem_pct.is_some(), "memory is instantaneous");
        assert!(s.load_per_core.is_some());
    }

    #[test]
    fn cpu_delta_over_delta() {
        let source = ScriptedSource::new();
        let mut sensors = Sensors::new(source, "eth0", 1000.0);
        sensors.sample(0.0).unwrap();
        // 100 more jiffies, 50 of them idle -> 50% busy.
        sensors.source.jiffies.set(CpuJiffies {
            total: 1100.0,
            idle: 850.0,
        });
        let s = sensors.sample(5.0).unwrap();
        let cpu = s.cpu_pct.expect("second tick has a delta");
        assert!((cpu - 50.0).abs() < 1e-9, "got {cpu}");
    }

    #[test]
    fn net_pct_uses_tx_delta_against_link_cap() {
        let source = ScriptedSource::new();
        let mut sensors = Sensors::new(source, "eth0", 1000.0);
        sensors.sample(0.0).unwrap();
        // 62.5 MB over 5 s = 100 Mbit/s = 10% of a 1000 Mbit link.
        sensors.source.nic.set(NicCounters {
            tx_bytes: 62_500_000,
            rx_bytes: 999_999_999,
        });
        let s = sensors.sample(5.0).unwrap();
        let net = s.net_pct.expect("second tick has a delta");
        assert!((net - 10.0).abs() < 1e-6, "rx must not count, got {net}");
    }

    #[test]
    fn mem_pct_excludes_reclaimable_cache() {
        let figures = MemFigures {
            total: 1000,
            free: 100,
            available: 750,
        };
        // 25% used even though only 10% is literally free.
        assert!((figures.used_pct_excl_cache() - 25.0).abs() < 1e-9);
    }

    #[test]
    fn corrupt_available_above_total_clamps_to_zero() {
        let figures = MemFigures {
            total: 1000,
            free: 0,
            available: 2000,
        };
        assert!(figures.used_pct_excl_cache().abs() < 1e-9);
    }

    #[test]
    fn missing_mem_available_is_fatal() {
        let mut source = ScriptedSource::new();
        source.mem_available_missing = true;
        let mut sensors = Sensors::new(source, "eth0", 1000.0);
        let err = sensors.sample(0.0).expect_err("must fail loudly");
        assert_eq!(err.code(), "LK-1101");
    }

    #[test]
    fn load_per_core_divides_by_cpu_count() {
        let mut sensors = Sensors::new(ScriptedSource::new(), "eth0", 1000.0);
        let s = sensors.sample(0.0).unwrap();
        assert!((s.load_per_core.unwrap() - 0.2).abs() < 1e-9);
    }
}
