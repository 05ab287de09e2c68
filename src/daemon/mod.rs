//! Daemon plumbing: coordinator loop, signals, instance lock, telemetry.

pub mod coordinator;
pub mod lock;
pub mod signals;
pub mod telemetry;
