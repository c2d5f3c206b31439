//! # Packet-Pair Classifier
//!
//! Estimates the bottleneck link from the spacing of consecutive packets in
//! one direction of a test flow. Each packet is paired with the previous
//! packet of the same direction:
//!
//! ```text
//!   prev ─────Δt µs─────► cur        spd = Δbits / Δt   (bits/µs = Mbps)
//!
//!   data direction:  Δbits = (cur.seq - prev.seq) * 8   when seq advanced, else 0
//!   ack direction:   Δbits = (cur.ack - prev.ack) * 8   when ack advanced, else 0
//! ```
//!
//! The data direction also counts gaps above 200 ms as timeouts. The ack
//! direction counts duplicate acks and the trend of the advertised window.
//!
//! Sequence and ack comparisons use serial-number arithmetic so a wrap of the
//! 32-bit space still counts as progress.

use serde::Serialize;
use std::net::{IpAddr, SocketAddr};

use crate::report::{FlowPair, FlowReport};
use crate::speed::{SpeedBin, BIN_COUNT};
use crate::stats::{Ewma, Mean};

/// Inter-packet gap above which a data-direction pair counts as a timeout.
pub const TIMEOUT_GAP_MICROS: u64 = 200_000;

/// Pairs closer than this are classified but excluded from the averages.
pub const MIN_AVERAGING_GAP_MICROS: u64 = 10;

// ─── Input ───────────────────────────────────────────────────────────────────

/// TCP header fields of one captured packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketRecord {
    /// Capture timestamp in microseconds from an arbitrary epoch.
    pub ts_micros: u64,
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub seq: u32,
    pub ack: u32,
    pub window: u32,
}

/// Which way test data flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FlowDirection {
    ClientToServer,
    ServerToClient,
}

/// Selects the packets of one test flow out of a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceFilter {
    pub server: IpAddr,
    pub client: IpAddr,
    /// Server-side port of the test connection.
    pub port: u16,
    pub direction: FlowDirection,
}

impl TraceFilter {
    /// Side of the flow `pkt` travels on, `None` for foreign traffic.
    pub fn side(&self, pkt: &PacketRecord) -> Option<FlowDirection> {
        if pkt.src.ip() == self.client && pkt.dst.ip() == self.server && pkt.dst.port() == self.port {
            Some(FlowDirection::ClientToServer)
        } else if pkt.src.ip() == self.server
            && pkt.dst.ip() == self.client
            && pkt.src.port() == self.port
        {
            Some(FlowDirection::ServerToClient)
        } else {
            None
        }
    }
}

// ─── Per-direction state ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct DirectionState {
    prev: Option<PacketRecord>,
    bins: [i64; BIN_COUNT],
    mean: Mean,
    running: Ewma,
    window_inc: i64,
    window_dec: i64,
    window_same: i64,
    timeouts: i64,
    dup_acks: i64,
}

impl DirectionState {
    fn new() -> Self {
        DirectionState {
            prev: None,
            bins: [0; BIN_COUNT],
            mean: Mean::default(),
            running: Ewma::seeded(0.5, 0.0),
            window_inc: 0,
            window_dec: 0,
            window_same: 0,
            timeouts: 0,
            dup_acks: 0,
        }
    }

    fn observe(&mut self, pkt: &PacketRecord, is_data: bool) -> Option<SpeedBin> {
        let Some(prev) = self.prev.replace(*pkt) else {
            return None;
        };
        let gap = pkt.ts_micros.saturating_sub(prev.ts_micros);

        let bits = if is_data {
            if gap > TIMEOUT_GAP_MICROS {
                self.timeouts += 1;
            }
            advanced_by(prev.seq, pkt.seq).map_or(0.0, |d| d as f64 * 8.0)
        } else {
            let progressed = advanced_by(prev.ack, pkt.ack);
            if pkt.ack == prev.ack {
                self.dup_acks += 1;
            }
            match pkt.window.cmp(&prev.window) {
                std::cmp::Ordering::Greater => self.window_inc += 1,
                std::cmp::Ordering::Less => self.window_dec += 1,
                std::cmp::Ordering::Equal => self.window_same += 1,
            }
            progressed.filter(|&d| d > 0).map_or(0.0, |d| d as f64 * 8.0)
        };

        let spd = bits / gap as f64;
        let bin = SpeedBin::classify(spd);
        self.bins[bin.index()] += 1;

        if gap > MIN_AVERAGING_GAP_MICROS && spd > 0.0 && spd.is_finite() {
            self.mean.add(spd);
            self.running.update(spd);
        }
        Some(bin)
    }

    fn report(&self, ifspeed: i32) -> FlowReport {
        FlowReport {
            bins: self.bins,
            running_avg: self.running.value(),
            window_inc: self.window_inc,
            window_dec: self.window_dec,
            window_same: self.window_same,
            timeouts: self.timeouts,
            dup_acks: self.dup_acks,
            ifspeed,
        }
        .normalized()
    }
}

/// Forward distance from `prev` to `cur` in 32-bit serial arithmetic,
/// `None` when `cur` is behind.
fn advanced_by(prev: u32, cur: u32) -> Option<u32> {
    let d = cur.wrapping_sub(prev);
    (d < 1 << 31).then_some(d)
}

// ─── Classifier ──────────────────────────────────────────────────────────────

/// Accumulates both directions of one test flow.
#[derive(Debug, Clone)]
pub struct PairClassifier {
    filter: TraceFilter,
    ifspeed: i32,
    data: DirectionState,
    ack: DirectionState,
    foreign: u64,
}

impl PairClassifier {
    /// `ifspeed` is the speed-bin index of the capture interface, `-1` if
    /// unknown.
    pub fn new(filter: TraceFilter, ifspeed: i32) -> Self {
        PairClassifier {
            filter,
            ifspeed,
            data: DirectionState::new(),
            ack: DirectionState::new(),
            foreign: 0,
        }
    }

    pub fn filter(&self) -> &TraceFilter {
        &self.filter
    }

    /// Feed one packet. Returns the bin it was classified into, or `None`
    /// for the first packet of a direction and for foreign traffic.
    pub fn observe(&mut self, pkt: &PacketRecord) -> Option<SpeedBin> {
        let Some(side) = self.filter.side(pkt) else {
            self.foreign += 1;
            return None;
        };
        if side == self.filter.direction {
            self.data.observe(pkt, true)
        } else {
            self.ack.observe(pkt, false)
        }
    }

    /// Packets that did not belong to the flow.
    pub fn foreign(&self) -> u64 {
        self.foreign
    }

    /// Mean speed over accepted data-direction pairs.
    pub fn data_mean_mbps(&self) -> Option<f64> {
        self.data.mean.value()
    }

    pub fn snapshot(&self) -> FlowPair {
        FlowPair {
            data: self.data.report(self.ifspeed),
            ack: self.ack.report(self.ifspeed),
        }
    }

    pub fn finish(self) -> FlowPair {
        self.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVER: &str = "10.0.0.1:3002";
    const CLIENT: &str = "10.0.0.2:50000";

    fn filter(direction: FlowDirection) -> TraceFilter {
        let s: SocketAddr = SERVER.parse().unwrap();
        let c: SocketAddr = CLIENT.parse().unwrap();
        TraceFilter {
            server: s.ip(),
            client: c.ip(),
            port: s.port(),
            direction,
        }
    }

    fn c2s(ts: u64, seq: u32) -> PacketRecord {
        PacketRecord {
            ts_micros: ts,
            src: CLIENT.parse().unwrap(),
            dst: SERVER.parse().unwrap(),
            seq,
            ack: 0,
            window: 0,
        }
    }

    fn s2c_ack(ts: u64, ack: u32, window: u32) -> PacketRecord {
        PacketRecord {
            ts_micros: ts,
            src: SERVER.parse().unwrap(),
            dst: CLIENT.parse().unwrap(),
            seq: 0,
            ack,
            window,
        }
    }

    #[test]
    fn first_packet_is_baseline() {
        let mut c = PairClassifier::new(filter(FlowDirection::ClientToServer), 7);
        assert_eq!(c.observe(&c2s(0, 1000)), None);
        // 1448 bytes in 1000 µs = 11.584 Mbps
        assert_eq!(c.observe(&c2s(1000, 2448)), Some(SpeedBin::T3));
        let pair = c.finish();
        assert_eq!(pair.data.bins[SpeedBin::T3.index()], 1);
        assert_eq!(pair.data.ifspeed, 7);
        assert!(!pair.ack.is_available());
    }

    #[test]
    fn repeated_sequence_is_retransmission() {
        let mut c = PairClassifier::new(filter(FlowDirection::ClientToServer), -1);
        c.observe(&c2s(0, 5000));
        assert_eq!(c.observe(&c2s(500, 5000)), Some(SpeedBin::Retransmission));
        assert_eq!(c.observe(&c2s(900, 4000)), Some(SpeedBin::Retransmission));
    }

    #[test]
    fn long_gap_counts_timeout() {
        let mut c = PairClassifier::new(filter(FlowDirection::ClientToServer), -1);
        c.observe(&c2s(0, 0));
        c.observe(&c2s(250_000, 1448));
        assert_eq!(c.finish().data.timeouts, 1);
    }

    #[test]
    fn ack_direction_counts_dupacks_and_window_trend() {
        let mut c = PairClassifier::new(filter(FlowDirection::ClientToServer), -1);
        c.observe(&s2c_ack(0, 100, 5000));
        c.observe(&s2c_ack(100, 100, 6000));
        c.observe(&s2c_ack(200, 1548, 6000));
        c.observe(&s2c_ack(300, 2996, 4000));
        let ack = c.finish().ack;
        assert_eq!(ack.dup_acks, 1);
        assert_eq!(ack.window_inc, 1);
        assert_eq!(ack.window_same, 1);
        assert_eq!(ack.window_dec, 1);
        assert_eq!(ack.bins[SpeedBin::Retransmission.index()], 1);
        assert_eq!(ack.bins[SpeedBin::T3.index()], 0);
        // 1448*8 bits / 100 µs = 115.84 Mbps
        assert_eq!(ack.bins[SpeedBin::Oc12.index()], 2);
    }

    #[test]
    fn sequence_wrap_counts_as_progress() {
        let mut c = PairClassifier::new(filter(FlowDirection::ClientToServer), -1);
        c.observe(&c2s(0, u32::MAX - 99));
        assert_eq!(c.observe(&c2s(1000, 1348)), Some(SpeedBin::T3));
    }

    #[test]
    fn foreign_packets_are_ignored() {
        let mut c = PairClassifier::new(filter(FlowDirection::ServerToClient), -1);
        let stray = PacketRecord {
            ts_micros: 0,
            src: "192.168.1.1:80".parse().unwrap(),
            dst: SERVER.parse().unwrap(),
            seq: 0,
            ack: 0,
            window: 0,
        };
        assert_eq!(c.observe(&stray), None);
        assert_eq!(c.foreign(), 1);
    }

    #[test]
    fn server_to_client_data_uses_sequence() {
        let mut c = PairClassifier::new(filter(FlowDirection::ServerToClient), -1);
        let mut pkt = s2c_ack(0, 0, 0);
        pkt.seq = 1;
        c.observe(&pkt);
        pkt.ts_micros = 1000;
        pkt.seq = 1449;
        assert_eq!(c.observe(&pkt), Some(SpeedBin::T3));
    }

    #[test]
    fn running_average_halves_toward_samples() {
        let mut c = PairClassifier::new(filter(FlowDirection::ClientToServer), -1);
        c.observe(&c2s(0, 0));
        c.observe(&c2s(1000, 1000)); // 8 Mbps
        c.observe(&c2s(2000, 2000)); // 8 Mbps
        let report = c.snapshot().data;
        assert!((report.running_avg - 6.0).abs() < 1e-9);
        assert_eq!(c.data_mean_mbps(), Some(8.0));
    }

    #[test]
    fn zero_gap_lands_in_unknown() {
        let mut c = PairClassifier::new(filter(FlowDirection::ClientToServer), -1);
        c.observe(&c2s(10, 0));
        assert_eq!(c.observe(&c2s(10, 1448)), Some(SpeedBin::Unknown));
    }
}
