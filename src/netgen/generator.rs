//! The packet emitter: a token-bucket-paced generator with peer reputation,
//! egress validation against NIC counters, and a UDP → TCP → peer-rotation
//! fallback chain.
//!
//! Peers never answer; the only proof the traffic counts is the host NIC's
//! own tx-byte counter. Every validation window the generator compares what
//! the counter says left the box against what it believes it sent, and when
//! the two disagree persistently it assumes the current path is a black hole
//! and advances the fallback chain.
//!
//! Sockets live behind [`PacketSink`] and counters behind [`TxCounterSource`]
//! so the whole chain runs under test without touching the network.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::io::Write;
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::core::config::{NetConfig, ShapePolicy};
use crate::core::errors::Result;
use crate::daemon::signals::ShutdownToken;
use crate::netgen::bucket::TokenBucket;
use crate::netgen::peers::{PeerTable, Protocol};

/// Return to UDP after this many consecutive TCP successes.
const UDP_RETURN_STREAK: u32 = 100;
/// Probe packets emitted while validating.
const VALIDATION_PROBE_PACKETS: u32 = 4;
/// Emitter sleep cap so cancellation and rate changes land quickly.
const MAX_EMITTER_NAP: Duration = Duration::from_millis(10);

// ──────────────────── traits ────────────────────

/// Where packets go. The production impl owns real sockets.
pub trait PacketSink: Send {
    /// Send `payload` as one datagram; returns bytes handed to the kernel.
    fn send_udp(&mut self, peer: SocketAddr, payload: &[u8], ttl: u32) -> std::io::Result<usize>;
    /// Write `payload` on a pooled connection; may be a partial write.
    fn send_tcp(
        &mut self,
        peer: SocketAddr,
        payload: &[u8],
        ttl: u32,
        timeout: Duration,
    ) -> std::io::Result<usize>;
    /// Close every socket / return pooled connections.
    fn close(&mut self);
}

/// Host NIC tx-byte counter; `None` when the interface cannot be read.
pub trait TxCounterSource: Send {
    fn tx_bytes(&self) -> Option<u64>;
}

/// Reads `/sys/class/net/<iface>/statistics/tx_bytes`.
pub struct SysfsTxCounter {
    path: String,
}

impl SysfsTxCounter {
    #[must_use]
    pub fn new(iface: &str) -> Self {
        Self {
            path: format!("/sys/class/net/{iface}/statistics/tx_bytes"),
        }
    }
}

impl TxCounterSource for SysfsTxCounter {
    fn tx_bytes(&self) -> Option<u64> {
        std::fs::read_to_string(&self.path)
            .ok()?
            .trim()
            .parse()
            .ok()
    }
}

// ──────────────────── socket sink ────────────────────

/// Production sink: one lazy UDP socket per address family plus a pool of
/// persistent TCP connections with `TCP_NODELAY`.
#[derive(Default)]
pub struct SocketSink {
    udp_v4: Option<UdpSocket>,
    udp_v6: Option<UdpSocket>,
    tcp_pool: HashMap<SocketAddr, TcpStream>,
}

impl SocketSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn udp_socket(&mut self, peer: SocketAddr, ttl: u32) -> std::io::Result<&UdpSocket> {
        let slot = if peer.is_ipv4() {
            &mut self.udp_v4
        } else {
            &mut self.udp_v6
        };
        if slot.is_none() {
            let bind_addr = if peer.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
            let socket = UdpSocket::bind(bind_addr)?;
            socket.set_ttl(ttl)?;
            *slot = Some(socket);
        }
        slot.as_ref()
            .ok_or_else(|| std::io::Error::other("udp socket missing after bind"))
    }
}

impl PacketSink for SocketSink {
    fn send_udp(&mut self, peer: SocketAddr, payload: &[u8], ttl: u32) -> std::io::Result<usize> {
        self.udp_socket(peer, ttl)?.send_to(payload, peer)
    }

    fn send_tcp(
        &mut self,
        peer: SocketAddr,
        payload: &[u8],
        ttl: u32,
        timeout: Duration,
    ) -> std::io::Result<usize> {
        if !self.tcp_pool.contains_key(&peer) {
            let stream = TcpStream::connect_timeout(&peer, timeout)?;
            stream.set_nodelay(true)?;
            stream.set_ttl(ttl)?;
            stream.set_write_timeout(Some(timeout))?;
            self.tcp_pool.insert(peer, stream);
        }
        let Some(stream) = self.tcp_pool.get_mut(&peer) else {
            return Err(std::io::Error::other("tcp connection missing after connect"));
        };
        match stream.write(payload) {
            Ok(n) => Ok(n),
            Err(e) => {
                // A broken pooled connection is discarded, not retried.
                self.tcp_pool.remove(&peer);
                Err(e)
            }
        }
    }

    fn close(&mut self) {
        self.udp_v4 = None;
        self.udp_v6 = None;
        self.tcp_pool.clear();
    }
}

// ──────────────────── state machine ────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GenState {
    Off,
    Initializing,
    Validating,
    ActiveUdp,
    ActiveTcp,
    Error,
}

impl GenState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::Initializing => "INITIALIZING",
            Self::Validating => "VALIDATING",
            Self::ActiveUdp => "ACTIVE_UDP",
            Self::ActiveTcp => "ACTIVE_TCP",
            Self::Error => "ERROR",
        }
    }
}

/// Telemetry view of the generator.
#[derive(Debug, Clone, Serialize)]
pub struct GeneratorStatus {
    pub state: GenState,
    pub rate_mbps: f64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub validation_misses: u32,
    pub peer_reputations: Vec<(String, f64)>,
}

pub struct NetGenerator<S: PacketSink, T: TxCounterSource> {
    cfg: NetConfig,
    shape: ShapePolicy,
    sink: S,
    tx_source: T,

    state: GenState,
    state_since: f64,
    peers: Option<PeerTable>,
    bucket: TokenBucket,
    payload: Vec<u8>,

    packets_sent: u64,
    bytes_sent: u64,
    consecutive_send_errors: u32,
    tcp_success_streak: u32,

    // tx-byte validation window
    last_validation_ts: f64,
    tx_at_window_start: Option<u64>,
    sent_in_window: u64,
    validation_misses: u32,

    probe_packets_left: u32,
    probe_deadline: f64,
    probe_tx_start: Option<u64>,
}

impl<S: PacketSink, T: TxCounterSource> NetGenerator<S, T> {
    #[must_use]
    pub fn new(cfg: NetConfig, shape: ShapePolicy, sink: S, tx_source: T, now_i: Instant) -> Self {
        let bucket = TokenBucket::new(cfg.min_rate_mbit, cfg.packet_size, now_i);
        // Reusable filler payload; only ever borrowed, never reallocated.
        let payload = vec![0x5a_u8; cfg.packet_size];
        Self {
            cfg,
            shape,
            sink,
            tx_source,
            state: GenState::Off,
            state_since: 0.0,
            peers: None,
            bucket,
            payload,
            packets_sent: 0,
            bytes_sent: 0,
            consecutive_send_errors: 0,
            tcp_success_streak: 0,
            last_validation_ts: 0.0,
            tx_at_window_start: None,
            sent_in_window: 0,
            validation_misses: 0,
            probe_packets_left: 0,
            probe_deadline: 0.0,
            probe_tx_start: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> GenState {
        self.state
    }

    pub fn set_rate(&mut self, rate_mbps: f64) {
        let clamped = rate_mbps.clamp(self.cfg.min_rate_mbit, self.cfg.max_rate_mbit);
        self.bucket.set_rate(clamped);
    }

    /// Begin activation. Peer loading happens here so a bad peer list is
    /// reported on the first activation, not at config parse time.
    pub fn activate(&mut self, now: f64) -> Result<()> {
        if !matches!(self.state, GenState::Off | GenState::Error) {
            return Ok(());
        }
        self.transition(GenState::Initializing, now);

        let table = match PeerTable::from_config(
            &self.cfg.peers,
            self.cfg.port,
            if self.cfg.protocol == "tcp" {
                Protocol::Tcp
            } else {
                Protocol::Udp
            },
            self.shape.requires_external_egress,
        ) {
            Ok(table) => table,
            Err(e) => {
                self.transition(GenState::Error, now);
                return Err(e);
            }
        };
        if table.is_empty() {
            self.transition(GenState::Error, now);
            return Err(crate::core::errors::LkError::Net {
                details: "no peers configured for network fallback".to_string(),
            });
        }
        self.peers = Some(table);

        // Arm the validation probe: a handful of packets whose effect must
        // show up in the NIC counter before the generator goes active.
        self.probe_packets_left = VALIDATION_PROBE_PACKETS;
        #[allow(clippy::cast_precision_loss)]
        let timeout = self.cfg.validation_timeout_ms as f64 / 1000.0;
        self.probe_deadline = now + timeout;
        self.probe_tx_start = self.tx_source.tx_bytes();
        self.transition(GenState::Validating, now);
        Ok(())
    }

    /// Stop emitting: no new tokens, sockets closed, peers kept for next time.
    pub fn deactivate(&mut self, now: f64) {
        if self.state == GenState::Off {
            return;
        }
        self.bucket.drain();
        self.sink.close();
        self.transition(GenState::Off, now);
    }

    /// Drive the machine. Returns how long the emitter may nap before the
    /// next call matters.
    pub fn step(&mut self, now: f64, now_i: Instant) -> Duration {
        match self.state {
            GenState::Off => MAX_EMITTER_NAP,
            GenState::Initializing => Duration::ZERO,
            GenState::Validating => self.step_validating(now),
            GenState::ActiveUdp | GenState::ActiveTcp => self.step_active(now, now_i),
            GenState::Error => {
                if now - self.state_since >= self.cfg.error_cooldown_sec {
                    // Cool-down over; try the whole chain again.
                    self.peers = None;
                    if self.activate(now).is_err() {
                        self.state_since = now;
                    }
                }
                MAX_EMITTER_NAP
            }
        }
    }

    fn step_validating(&mut self, now: f64) -> Duration {
        if self.probe_packets_left > 0 {
            if let Some(peer) = self.best_peer(now) {
                match self.sink.send_udp(peer, &self.payload, self.cfg.ttl) {
                    Ok(sent) if sent > 0 => {
                        self.probe_packets_left -= 1;
                        if let Some(peers) = self.peers.as_mut() {
                            peers.record_success(peer, now);
                        }
                    }
                    // A failing probe peer must not be re-picked forever.
                    _ => {
                        if let Some(peers) = self.peers.as_mut() {
                            peers.record_failure(peer, now);
                        }
                    }
                }
            }
            return Duration::from_millis(5);
        }

        // All probes out; wait for the NIC counter to confirm.
        // Half the probe bytes must show up in the counter; background
        // traffic only ever pushes the delta higher.
        let expected = u64::from(VALIDATION_PROBE_PACKETS) * self.payload.len() as u64 / 2;
        let confirmed = match (self.probe_tx_start, self.tx_source.tx_bytes()) {
            (Some(start), Some(cur)) => cur.saturating_sub(start) >= expected,
            // Counter unreadable: nothing to validate against; trust sends.
            (None, _) | (_, None) => true,
        };

        if confirmed {
            self.begin_validation_window(now);
            self.transition(GenState::ActiveUdp, now);
            Duration::ZERO
        } else if now >= self.probe_deadline {
            eprintln!("[LK-NET] startup probe produced no tx-byte movement");
            self.transition(GenState::Error, now);
            MAX_EMITTER_NAP
        } else {
            Duration::from_millis(5)
        }
    }

    fn step_active(&mut self, now: f64, now_i: Instant) -> Duration {
        self.maybe_validate(now);

        let wait = self.bucket.wait_time(self.cfg.packet_size, now_i);
        if wait > Duration::ZERO {
            return wait.min(MAX_EMITTER_NAP);
        }

        let Some(peer) = self.best_peer(now) else {
            self.advance_fallback(now);
            return MAX_EMITTER_NAP;
        };

        let result = if self.state == GenState::ActiveUdp {
            self.sink.send_udp(peer, &self.payload, self.cfg.ttl)
        } else {
            self.sink.send_tcp(
                peer,
                &self.payload,
                self.cfg.ttl,
                Duration::from_millis(self.cfg.timeout_ms),
            )
        };

        match result {
            Ok(sent_bytes) if sent_bytes > 0 => {
                // Drain the bucket by what actually went out; a partial TCP
                // write must not be billed as a full packet.
                self.bucket.consume(sent_bytes, now_i);
                self.packets_sent += 1;
                self.bytes_sent += sent_bytes as u64;
                self.sent_in_window += sent_bytes as u64;
                self.consecutive_send_errors = 0;
                if let Some(peers) = self.peers.as_mut() {
                    peers.record_success(peer, now);
                }
                if self.state == GenState::ActiveTcp {
                    self.tcp_success_streak += 1;
                    if self.tcp_success_streak >= UDP_RETURN_STREAK {
                        self.tcp_success_streak = 0;
                        self.transition(GenState::ActiveUdp, now);
                    }
                }
                Duration::ZERO
            }
            Ok(_) | Err(_) => {
                self.consecutive_send_errors += 1;
                self.tcp_success_streak = 0;
                if let Some(peers) = self.peers.as_mut() {
                    peers.record_failure(peer, now);
                }
                if self.consecutive_send_errors >= self.cfg.error_limit
                    || self
                        .peers
                        .as_ref()
                        .is_some_and(|p| p.all_below_floor(now))
                {
                    self.consecutive_send_errors = 0;
                    self.advance_fallback(now);
                }
                Duration::from_millis(5)
            }
        }
    }

    /// Compare the NIC's word against our own accounting once per window.
    fn maybe_validate(&mut self, now: f64) {
        if now - self.last_validation_ts < self.cfg.validation_interval_sec {
            return;
        }

        let observed = match (self.tx_at_window_start, self.tx_source.tx_bytes()) {
            (Some(start), Some(cur)) => Some(cur.saturating_sub(start)),
            _ => None,
        };

        if let Some(delta) = observed {
            let sent_enough = self.sent_in_window >= self.cfg.min_tx_delta_bytes;
            if sent_enough && delta < self.cfg.min_tx_delta_bytes {
                self.validation_misses += 1;
                eprintln!(
                    "[LK-NET] egress validation miss {}/{}: NIC moved {delta}B, generator sent {}B",
                    self.validation_misses, self.cfg.validation_miss_limit, self.sent_in_window
                );
                if self.validation_misses >= self.cfg.validation_miss_limit {
                    self.validation_misses = 0;
                    if let Some(peers) = self.peers.as_mut() {
                        peers.penalize_all(now);
                    }
                    self.advance_fallback(now);
                }
            } else if sent_enough {
                self.validation_misses = 0;
            }
        }

        self.begin_validation_window(now);
    }

    fn begin_validation_window(&mut self, now: f64) {
        self.last_validation_ts = now;
        self.tx_at_window_start = self.tx_source.tx_bytes();
        self.sent_in_window = 0;
    }

    /// UDP → TCP → rotate peers → ERROR.
    fn advance_fallback(&mut self, now: f64) {
        match self.state {
            GenState::ActiveUdp => {
                eprintln!("[LK-NET] UDP path failing, falling back to TCP");
                self.tcp_success_streak = 0;
                self.transition(GenState::ActiveTcp, now);
            }
            GenState::ActiveTcp => {
                let has_candidate = self
                    .peers
                    .as_mut()
                    .and_then(|p| p.best_peer(now))
                    .is_some();
                if has_candidate {
                    eprintln!("[LK-NET] rotating to next TCP peer");
                } else {
                    eprintln!("[LK-NET] no viable peers left, entering error cool-down");
                    self.sink.close();
                    self.transition(GenState::Error, now);
                }
            }
            _ => {}
        }
    }

    fn best_peer(&mut self, now: f64) -> Option<SocketAddr> {
        self.peers.as_mut().and_then(|p| p.best_peer(now))
    }

    fn transition(&mut self, next: GenState, now: f64) {
        if next == self.state {
            return;
        }
        eprintln!(
            "[LK-NET] generator {} -> {}",
            self.state.as_str(),
            next.as_str()
        );
        self.state = next;
        self.state_since = now;
    }

    #[must_use]
    pub fn status(&self) -> GeneratorStatus {
        GeneratorStatus {
            state: self.state,
            rate_mbps: self.bucket.rate_mbps(),
            packets_sent: self.packets_sent,
            bytes_sent: self.bytes_sent,
            validation_misses: self.validation_misses,
            peer_reputations: self
                .peers
                .as_ref()
                .map(|t| {
                    t.records()
                        .iter()
                        .map(|p| (p.endpoint.to_string(), p.reputation))
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

// ──────────────────── emitter thread ────────────────────

/// Knobs the coordinator writes and the emitter reads.
#[derive(Debug)]
pub struct EmitterControls {
    active: AtomicBool,
    rate_mbps_bits: AtomicU64,
}

impl EmitterControls {
    #[must_use]
    pub fn new(initial_rate_mbps: f64) -> Self {
        Self {
            active: AtomicBool::new(false),
            rate_mbps_bits: AtomicU64::new(initial_rate_mbps.to_bits()),
        }
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn set_rate_mbps(&self, rate: f64) {
        self.rate_mbps_bits.store(rate.to_bits(), Ordering::Relaxed);
    }

    #[must_use]
    pub fn rate_mbps(&self) -> f64 {
        f64::from_bits(self.rate_mbps_bits.load(Ordering::Relaxed))
    }
}

/// Emitter main loop: owns the generator, follows the controls, observes the
/// token at every bucket tick.
pub fn run_emitter<S: PacketSink, T: TxCounterSource>(
    mut generator: NetGenerator<S, T>,
    controls: &Arc<EmitterControls>,
    token: &ShutdownToken,
    epoch: Instant,
) {
    while !token.is_triggered() {
        let now = epoch.elapsed().as_secs_f64();

        if controls.is_active() {
            if generator.state() == GenState::Off
                && let Err(e) = generator.activate(now)
            {
                eprintln!("[LK-NET] activation failed: {e}");
            }
            generator.set_rate(controls.rate_mbps());
        } else if generator.state() != GenState::Off {
            generator.deactivate(now);
        }

        let nap = generator.step(now, Instant::now());
        if nap > Duration::ZERO {
            std::thread::sleep(nap.min(MAX_EMITTER_NAP));
        }
    }
    generator.deactivate(epoch.elapsed().as_secs_f64());
}

// ──────────────────── tests ────────────────────
