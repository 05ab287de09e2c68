//! Peer table with EMA reputation, blacklisting, and recovery backoff.
//!
//! Every peer carries a reputation in [0, 100] driven by validated send
//! outcomes. Selection always picks the highest-reputation live peer; a peer
//! sinking under the blacklist floor is benched with exponential backoff and
//! re-admitted at a probationary score once the bench expires.

#![allow(missing_docs)]

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use serde::Serialize;

use crate::core::errors::{LkError, Result};
use crate::netgen::addr;

// ──────────────────── reputation constants ────────────────────

pub const REPUTATION_NEUTRAL: f64 = 50.0;
pub const REPUTATION_MAX: f64 = 100.0;
/// Below this a peer is benched.
pub const REPUTATION_FLOOR: f64 = 20.0;
/// Probationary score on recovery.
pub const REPUTATION_RECOVERED: f64 = 25.0;

/// EMA pull toward 100 on a validated success.
const SUCCESS_ALPHA: f64 = 0.05;
/// EMA pull toward 0 on a failure. Failures weigh more than successes.
const FAILURE_ALPHA: f64 = 0.15;
/// Extra pull when the NIC counters say nothing left the box.
const VALIDATION_FAILURE_ALPHA: f64 = 0.30;

const BLACKLIST_BASE_SEC: f64 = 120.0;
const BLACKLIST_MAX_SEC: f64 = 600.0;

// ──────────────────── peer record ────────────────────

/// Preferred transport for a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Protocol {
    Udp,
    Tcp,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerRecord {
    pub endpoint: SocketAddr,
    pub protocol_preference: Protocol,
    pub reputation: f64,
    pub last_ok_ts: Option<f64>,
    pub last_err_ts: Option<f64>,
    pub consecutive_errors: u32,
    pub validated_external: bool,
    blacklisted_until: Option<f64>,
    recovery_failures: u32,
}

impl PeerRecord {
    #[must_use]
    pub fn is_blacklisted(&self, now: f64) -> bool {
        self.blacklisted_until.is_some_and(|until| now < until)
    }
}

// ──────────────────── peer table ────────────────────

#[derive(Debug)]
pub struct PeerTable {
    peers: Vec<PeerRecord>,
}

impl PeerTable {
    /// Resolve and admit the configured peers.
    ///
    /// `"host"` strings get `default_port` appended; `"host:port"` is used as
    /// written. When `require_external` is set, any endpoint resolving to a
    /// refused range is rejected outright — a silently dropped peer would
    /// leave the operator believing they are protected.
    pub fn from_config(
        entries: &[String],
        default_port: u16,
        protocol: Protocol,
        require_external: bool,
    ) -> Result<Self> {
        let mut peers = Vec::with_capacity(entries.len());
        for entry in entries {
            let endpoint = resolve_endpoint(entry, default_port)?;
            let external = addr::is_external(endpoint.ip());
            if require_external && !external {
                return Err(LkError::PeerRejected {
                    addr: entry.clone(),
                    reason: format!(
                        "{} is not an external address and this shape only counts public egress",
                        endpoint.ip()
                    ),
                });
            }
            peers.push(PeerRecord {
                endpoint,
                protocol_preference: protocol,
                reputation: REPUTATION_NEUTRAL,
                last_ok_ts: None,
                last_err_ts: None,
                consecutive_errors: 0,
                validated_external: external,
                blacklisted_until: None,
                recovery_failures: 0,
            });
        }
        Ok(Self { peers })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    #[must_use]
    pub fn records(&self) -> &[PeerRecord] {
        &self.peers
    }

    /// Highest-reputation peer that is not benched. Expired benches are
    /// lifted (with a probationary reputation) before selection.
    pub fn best_peer(&mut self, now: f64) -> Option<SocketAddr> {
        self.lift_expired_blacklists(now);
        self.peers
            .iter()
            .filter(|p| !p.is_blacklisted(now))
            .max_by(|a, b| {
                a.reputation
                    .partial_cmp(&b.reputation)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|p| p.endpoint)
    }

    /// All peers benched or sunk under the floor: time to switch protocols.
    #[must_use]
    pub fn all_below_floor(&self, now: f64) -> bool {
        !self.peers.is_empty()
            && self
                .peers
                .iter()
                .all(|p| p.is_blacklisted(now) || p.reputation < REPUTATION_FLOOR)
    }

    pub fn record_success(&mut self, endpoint: SocketAddr, now: f64) {
        if let Some(peer) = self.find_mut(endpoint) {
            peer.reputation = ema_toward(peer.reputation, REPUTATION_MAX, SUCCESS_ALPHA);
            peer.last_ok_ts = Some(now);
            peer.consecutive_errors = 0;
            peer.recovery_failures = 0;
        }
    }

    pub fn record_failure(&mut self, endpoint: SocketAddr, now: f64) {
        Self::apply_failure(self.find_mut(endpoint), FAILURE_ALPHA, now);
    }

    /// Harsher penalty used when tx-byte validation says the traffic never
    /// actually left.
    pub fn record_validation_failure(&mut self, endpoint: SocketAddr, now: f64) {
        Self::apply_failure(self.find_mut(endpoint), VALIDATION_FAILURE_ALPHA, now);
    }

    /// Decrement everyone; used when validation fails without a specific
    /// culprit (the NIC counter did not move at all).
    pub fn penalize_all(&mut self, now: f64) {
        for i in 0..self.peers.len() {
            let peer = &mut self.peers[i];
            Self::apply_failure(Some(peer), VALIDATION_FAILURE_ALPHA, now);
        }
    }

    fn apply_failure(peer: Option<&mut PeerRecord>, alpha: f64, now: f64) {
        let Some(peer) = peer else { return };
        peer.reputation = ema_toward(peer.reputation, 0.0, alpha);
        peer.last_err_ts = Some(now);
        peer.consecutive_errors += 1;

        if peer.reputation < REPUTATION_FLOOR && !peer.is_blacklisted(now) {
            let backoff = (BLACKLIST_BASE_SEC
                * f64::from(2_u32.saturating_pow(peer.recovery_failures.min(5))))
            .min(BLACKLIST_MAX_SEC);
            peer.blacklisted_until = Some(now + backoff);
            peer.recovery_failures += 1;
            eprintln!(
                "[LK-NET] peer {} benched for {backoff:.0}s (reputation {:.1})",
                peer.endpoint, peer.reputation
            );
        }
    }

    fn lift_expired_blacklists(&mut self, now: f64) {
        for peer in &mut self.peers {
            if let Some(until) = peer.blacklisted_until
                && now >= until
            {
                peer.blacklisted_until = None;
                peer.reputation = peer.reputation.max(REPUTATION_RECOVERED);
                peer.consecutive_errors = 0;
            }
        }
    }

    fn find_mut(&mut self, endpoint: SocketAddr) -> Option<&mut PeerRecord> {
        self.peers.iter_mut().find(|p| p.endpoint == endpoint)
    }
}

fn ema_toward(current: f64, target: f64, alpha: f64) -> f64 {
    alpha.mul_add(target - current, current).clamp(0.0, REPUTATION_MAX)
}

/// Turn a config entry into a socket address without touching DNS for
/// numeric forms.
fn resolve_endpoint(entry: &str, default_port: u16) -> Result<SocketAddr> {
    // Bare IP first.
    if let Ok(ip) = entry.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }
    // IP:port or host:port.
    if let Ok(sa) = entry.parse::<SocketAddr>() {
        return Ok(sa);
    }
    let candidates: Vec<SocketAddr> = if entry.contains(':') {
        entry.to_socket_addrs()
    } else {
        (entry, default_port).to_socket_addrs()
    }
    .map_err(|e| LkError::Net {
        details: format!("cannot resolve peer {entry:?}: {e}"),
    })?
    .collect();
    candidates.into_iter().next().ok_or_else(|| LkError::Net {
        details: format!("peer {entry:?} resolved to no addresses"),
    })
}

// ──────────────────── tests ────────────────────
