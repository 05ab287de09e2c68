//! Network fallback generation: activation state, peers, rate limiting,
//! and the packet emitter.

pub mod addr;
pub mod bucket;
pub mod fallback;
pub mod generator;
pub mod peers;
