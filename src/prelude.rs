//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use loadkeeper::prelude::*;
//! ```

// Core
pub use crate::core::config::{Config, ShapePolicy};
pub use crate::core::errors::{LkError, Result};

// Metrics
pub use crate::metrics::ema::{Ema, EmaSet};
pub use crate::metrics::sensors::{ProcSensorSource, SensorSample, SensorSource, Sensors};
pub use crate::metrics::store::{MetricKind, MetricsStore, StoreHealth};

// Control
pub use crate::control::p95::{ControllerState, P95Controller, SlotDecision};
pub use crate::control::ring::SlotRing;
pub use crate::control::workers::{CpuWorkerPool, WorkerControls};

// Occupier
pub use crate::occupier::memory::MemoryOccupier;

// Netgen
pub use crate::netgen::fallback::{FallbackInputs, NetFallbackState};
pub use crate::netgen::generator::{GenState, NetGenerator, SocketSink};
pub use crate::netgen::peers::{PeerTable, Protocol};

// Daemon
pub use crate::daemon::coordinator::Coordinator;
pub use crate::daemon::signals::ShutdownToken;
