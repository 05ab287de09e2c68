//! The p95-targeting CPU control plane: slot ring, state machine, workers.

pub mod p95;
pub mod ring;
pub mod workers;
