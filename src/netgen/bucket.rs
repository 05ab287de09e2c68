//! Token bucket rate limiter for the packet emitter.
//!
//! Elapsed-time accumulation (rather than fixed increments per tick) keeps
//! the long-run rate drift-free even when the emitter oversleeps, and the
//! capacity floor of one packet guarantees progress at arbitrarily low rates.

#![allow(missing_docs)]

use std::time::{Duration, Instant};

/// Refill bookkeeping below this elapsed time is skipped to bound overhead.
const TICK: Duration = Duration::from_millis(5);

/// Burst window expressed as a fraction of a second of traffic.
const BURST_WINDOW: f64 = 0.1;

#[derive(Debug)]
pub struct TokenBucket {
    rate_mbps: f64,
    packet_bits: f64,
    capacity_bits: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A bucket refilling at `rate_mbps`, sized so at least one
    /// `packet_size_bytes` packet always fits.
    #[must_use]
    pub fn new(rate_mbps: f64, packet_size_bytes: usize, now: Instant) -> Self {
        let rate = rate_mbps.max(0.001);
        #[allow(clippy::cast_precision_loss)]
        let packet_bits = (packet_size_bytes * 8) as f64;
        let capacity = (rate * 1_000_000.0 * BURST_WINDOW).max(packet_bits);
        Self {
            rate_mbps: rate,
            packet_bits,
            capacity_bits: capacity,
            tokens: capacity,
            last_refill: now,
        }
    }

    #[must_use]
    pub fn rate_mbps(&self) -> f64 {
        self.rate_mbps
    }

    /// Change the refill rate; tokens are clamped to the new capacity.
    pub fn set_rate(&mut self, rate_mbps: f64) {
        self.rate_mbps = rate_mbps.max(0.001);
        self.capacity_bits = (self.rate_mbps * 1_000_000.0 * BURST_WINDOW).max(self.packet_bits);
        self.tokens = self.tokens.min(self.capacity_bits);
    }

    /// Take tokens for `bytes` if available.
    pub fn consume(&mut self, bytes: usize, now: Instant) -> bool {
        self.refill(now);
        #[allow(clippy::cast_precision_loss)]
        let bits = (bytes * 8) as f64;
        if self.tokens >= bits {
            self.tokens -= bits;
            true
        } else {
            false
        }
    }

    /// How long until `bytes` could be sent. Zero when sendable now.
    pub fn wait_time(&mut self, bytes: usize, now: Instant) -> Duration {
        self.refill(now);
        #[allow(clippy::cast_precision_loss)]
        let bits = (bytes * 8) as f64;
        if self.tokens >= bits {
            return Duration::ZERO;
        }
        let deficit = bits - self.tokens;
        Duration::from_secs_f64(deficit / (self.rate_mbps * 1_000_000.0))
    }

    /// Drop all accumulated tokens (deactivation stops admission instantly).
    pub fn drain(&mut self) {
        self.tokens = 0.0;
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed < TICK {
            return;
        }
        self.tokens =
            (self.tokens + elapsed.as_secs_f64() * self.rate_mbps * 1_000_000.0)
                .min(self.capacity_bits);
        self.last_refill = now;
    }
}
