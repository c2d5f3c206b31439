//! # Heuristics Engine
//!
//! Turns the S2C counter snapshot, the measured speeds and the resolved link
//! indices into diagnostic verdicts. Every function is pure and reproduces
//! the historical arithmetic exactly, including its integer truncations:
//!
//! - `timesec` is the total send-limited time in whole seconds
//! - the wireless detector compares an integer quotient of transitions
//! - throughput comparisons between kbps values truncate to integers
//!
//! Detection order matters because later detectors read the link verdict
//! written by earlier ones:
//!
//! ```text
//!  link = 100 ──► duplex mismatch ──► internal mismatch ──► bw < real?
//!        ──► faulty hardware ──► ethernet ──► wireless ──► dsl/cable
//!        ──► half duplex ──► congestion
//! ```

use serde::{Deserialize, Serialize};

use crate::counters::TcpCounters;
use crate::link::LinkSpeeds;

// ─── Constants ───────────────────────────────────────────────────────────────

pub const LINK_CANNOT_DETERMINE: i32 = 100;
pub const LINK_ALGO_FAILED: i32 = 0;
pub const LINK_ETHERNET: i32 = 10;
pub const LINK_WIRELESS: i32 = 3;
pub const LINK_DSL_OR_CABLE: i32 = 2;

pub const MISMATCH_NONE: i32 = 0;
pub const MISMATCH_OLD_ALGO: i32 = 1;
pub const MISMATCH_SWITCH_FULL_HOST_HALF: i32 = 2;

/// Window scale options above this are treated as bogus.
pub const WINDOW_SCALE_THRESH: i64 = 15;
/// Buffers below this cannot need a window scale.
pub const MAX_TCP_PORT: i64 = 65535;

/// Link index above which a loss-free path is assumed faster than Fast
/// Ethernet.
const FAST_LINK_INDEX: i32 = 5;
const LOSS_FLOOR_FAST: f64 = 1e-10;
const LOSS_FLOOR_SLOW: f64 = 1e-6;

// ─── Heuristic Version ───────────────────────────────────────────────────────

/// Variant of the duplex-mismatch detector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HeuristicVersion {
    /// The "better throughput when CWND limited" clause only counts outside
    /// multi-client mode.
    #[default]
    SuppressInMultiClient,
    /// Evaluate the clause regardless of server mode.
    AlwaysEvaluate,
}

impl std::str::FromStr for HeuristicVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "suppress-in-multi-client" => Ok(HeuristicVersion::SuppressInMultiClient),
            "always-evaluate" => Ok(HeuristicVersion::AlwaysEvaluate),
            other => Err(format!("unknown heuristic version: {}", other)),
        }
    }
}

// ─── Derived quantities ──────────────────────────────────────────────────────

/// Average RTT in milliseconds.
pub fn avg_rtt_ms(sum_rtt: i64, count_rtt: i64) -> f64 {
    sum_rtt as f64 / count_rtt as f64
}

/// Loss ratio, floored so the Mathis estimate never divides by zero.
pub fn packet_loss(congestion_signals: i64, pkts_out: i64, link_index: i32) -> f64 {
    let loss = congestion_signals as f64 / pkts_out as f64;
    if loss == 0.0 {
        if link_index > FAST_LINK_INDEX {
            LOSS_FLOOR_FAST
        } else {
            LOSS_FLOOR_SLOW
        }
    } else {
        loss
    }
}

pub fn out_of_order_ratio(dup_acks_in: i64, ack_pkts_in: i64) -> f64 {
    dup_acks_in as f64 / ack_pkts_in as f64
}

/// Mathis estimate in Mbps.
pub fn max_theoretical_throughput(mss: i64, rtt_sec: f64, loss: f64) -> f64 {
    (mss as f64 / (rtt_sec * loss.sqrt())) * 8.0 / 1024.0 / 1024.0
}

/// Window sizes in Mb and the normalized scale options.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WindowSizes {
    pub rwin: f64,
    pub swin: f64,
    pub cwin: f64,
    pub snd_win_scale: i64,
    pub rcv_win_scale: i64,
}

pub fn window_sizes(c: &TcpCounters) -> WindowSizes {
    let snd_win_scale = if c.snd_win_scale > WINDOW_SCALE_THRESH || c.sndbuf < MAX_TCP_PORT {
        0
    } else {
        c.snd_win_scale
    };
    let rcv_win_scale = if c.rcv_win_scale > WINDOW_SCALE_THRESH || c.max_rwin_rcvd < MAX_TCP_PORT
    {
        0
    } else {
        c.rcv_win_scale
    };
    let mb = |v: i64| v as f64 * 8.0 / 1024.0 / 1024.0;
    WindowSizes {
        rwin: mb(c.max_rwin_rcvd),
        swin: mb(c.sndbuf),
        cwin: mb(c.max_cwnd),
        snd_win_scale,
        rcv_win_scale,
    }
}

/// Sum of the three send-limited times (µs).
pub fn total_test_time(c: &TcpCounters) -> i64 {
    c.snd_lim_time_rwin + c.snd_lim_time_cwnd + c.snd_lim_time_sender
}

/// Fraction of `total` spent in one send-limited state.
pub fn limited_ratio(state_time: i64, total: i64) -> f64 {
    state_time as f64 / total as f64
}

/// Whole seconds of `total_us`.
pub fn whole_seconds(total_us: i64) -> f64 {
    (total_us / 1_000_000) as f64
}

/// Fraction of the test spent idle waiting on retransmission timeouts.
pub fn rto_idle(timeouts: i64, current_rto_ms: i64, time_sec: f64) -> f64 {
    (timeouts as f64 * (current_rto_ms as f64 / 1000.0)) / time_sec
}

/// Achieved throughput in Mbps.
pub fn real_throughput(data_bytes_out: i64, total_us: i64) -> f64 {
    (data_bytes_out as f64 / total_us as f64) * 8.0
}

/// Seconds spent in retransmission timeouts.
pub fn total_wait_time(current_rto_ms: i64, timeouts: i64) -> f64 {
    current_rto_ms.wrapping_mul(timeouts) as f64 / 1000.0
}

/// Throughput with a clamped CWND beat the unclamped S2C run.
pub fn is_limited_cwnd_throughput_better(mid_kbps: f64, s2c_kbps: f64) -> bool {
    (mid_kbps as i64) > (s2c_kbps as i64)
}

pub fn is_c2s_throughput_better(c2s_kbps: f64, s2c_kbps: f64) -> bool {
    (c2s_kbps as i64) > (s2c_kbps as i64)
}

// ─── Detectors ───────────────────────────────────────────────────────────────

/// Inputs of the client duplex-mismatch detector.
#[derive(Debug, Clone, Copy)]
pub struct DuplexMismatchInput {
    pub cwnd_time: f64,
    pub bw_theoretical: f64,
    pub pkts_retrans: i64,
    pub time_sec: f64,
    pub max_ssthresh: i64,
    pub rto_idle: f64,
    pub link: i32,
    pub s2c_kbps: f64,
    pub mid_kbps: f64,
    pub multiple: bool,
}

pub fn detect_duplex_mismatch(i: &DuplexMismatchInput, version: HeuristicVersion) -> bool {
    let mode_ok = match version {
        HeuristicVersion::SuppressInMultiClient => !i.multiple,
        HeuristicVersion::AlwaysEvaluate => true,
    };
    i.cwnd_time > 0.9
        && i.bw_theoretical > 2.0
        && i.pkts_retrans as f64 / i.time_sec > 2.0
        && i.max_ssthresh > 0
        && i.rto_idle > 0.01
        && i.link > 2
        && is_limited_cwnd_throughput_better(i.mid_kbps, i.s2c_kbps)
        && mode_ok
}

/// `s2c_mbps` is the client-measured S2C speed in Mbps.
pub fn detect_internal_duplex_mismatch(
    s2c_mbps: f64,
    real_throughput: f64,
    rwin_time: f64,
    loss: f64,
) -> bool {
    s2c_mbps > 50.0 && real_throughput < 5.0 && rwin_time > 0.9 && loss < 0.01
}

/// Flags a possibly bad cable.
///
/// The first clause divides a loss percentage by whole test seconds; it is
/// kept exactly as historical result logs were produced with it.
pub fn detect_faulty_hardware(loss: f64, cwnd_time: f64, time_sec: f64, max_ssthresh: i64) -> bool {
    (loss * 100.0) / time_sec > 15.0
        && cwnd_time / time_sec > 0.6
        && loss < 0.01
        && max_ssthresh > 0
}

pub fn detect_ethernet_link(
    real_throughput: f64,
    s2c_kbps: f64,
    loss: f64,
    out_of_order: f64,
    link: i32,
) -> bool {
    real_throughput < 9.5
        && real_throughput > 3.0
        && s2c_kbps / 1000.0 < 9.5
        && loss < 0.01
        && out_of_order < 0.035
        && link > 0
}

pub fn detect_wireless_link(
    send_time: f64,
    real_throughput: f64,
    bw_theoretical: f64,
    snd_lim_trans_rwin: i64,
    snd_lim_trans_cwnd: i64,
    rwin_time: f64,
    link: i32,
) -> bool {
    let transitions_equal = snd_lim_trans_rwin.checked_div(snd_lim_trans_cwnd) == Some(1);
    send_time == 0.0
        && real_throughput < 5.0
        && bw_theoretical > 50.0
        && transitions_equal
        && rwin_time > 0.90
        && link > 0
}

pub fn detect_dsl_cable_link(
    snd_lim_time_sender: i64,
    snd_lim_trans_sender: i64,
    real_throughput: f64,
    bw_theoretical: f64,
    link: i32,
) -> bool {
    snd_lim_time_sender < 600
        && snd_lim_trans_sender == 0
        && real_throughput < 2.0
        && real_throughput < bw_theoretical
        && link > 0
}

pub fn detect_half_duplex(
    rwin_time: f64,
    snd_lim_trans_rwin: i64,
    snd_lim_trans_sender: i64,
    time_sec: f64,
) -> bool {
    rwin_time > 0.95
        && snd_lim_trans_rwin as f64 / time_sec > 30.0
        && snd_lim_trans_sender as f64 / time_sec > 30.0
}

pub fn detect_congestion(cwnd_time: f64, mismatch: i32, cwin: f64, rwin: f64, rtt_sec: f64) -> bool {
    cwnd_time > 0.02 && mismatch == MISMATCH_NONE && (cwin / rtt_sec) < (rwin / rtt_sec)
}

// ─── Diagnosis ───────────────────────────────────────────────────────────────

/// Everything the engine reads.
#[derive(Debug, Clone)]
pub struct DiagnosticInput {
    /// Snapshot of the S2C test connection.
    pub counters: TcpCounters,
    /// Server-measured C2S throughput (kbps).
    pub c2s_kbps: f64,
    /// Client-measured S2C throughput (kbps).
    pub s2c_kbps: f64,
    /// Client-measured CWND-limited throughput from the middlebox test (kbps).
    pub mid_kbps: f64,
    pub links: LinkSpeeds,
    pub multiple: bool,
    pub version: HeuristicVersion,
}

/// Immutable outcome of [`diagnose`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticResult {
    pub avg_rtt_ms: f64,
    pub rtt_sec: f64,
    pub loss: f64,
    pub out_of_order: f64,
    pub bw_theoretical: f64,
    pub windows: WindowSizes,
    pub total_time_us: i64,
    pub rwin_time: f64,
    pub cwnd_time: f64,
    pub send_time: f64,
    pub time_sec: f64,
    pub rto_idle: f64,
    pub real_throughput: f64,
    pub wait_sec: f64,
    pub cwnd_limited_better: bool,
    pub link: i32,
    pub mismatch: i32,
    pub bad_cable: bool,
    pub half_duplex: bool,
    pub congestion: bool,
    pub links: LinkSpeeds,
}

pub fn diagnose(input: &DiagnosticInput) -> DiagnosticResult {
    let c = &input.counters;

    let avg_rtt = avg_rtt_ms(c.sum_rtt, c.count_rtt);
    let rtt_sec = avg_rtt * 0.001;
    let loss = packet_loss(c.congestion_signals, c.pkts_out, input.links.c2s_data);
    let out_of_order = out_of_order_ratio(c.dup_acks_in, c.ack_pkts_in);
    let bw_theoretical = max_theoretical_throughput(c.current_mss, rtt_sec, loss);
    let windows = window_sizes(c);

    let total_time_us = total_test_time(c);
    let rwin_time = limited_ratio(c.snd_lim_time_rwin, total_time_us);
    let cwnd_time = limited_ratio(c.snd_lim_time_cwnd, total_time_us);
    let send_time = limited_ratio(c.snd_lim_time_sender, total_time_us);
    let time_sec = whole_seconds(total_time_us);
    let rto_idle = rto_idle(c.timeouts, c.current_rto, time_sec);
    let real_throughput = real_throughput(c.data_bytes_out, total_time_us);
    let wait_sec = total_wait_time(c.current_rto, c.timeouts);

    let cwnd_limited_better = is_limited_cwnd_throughput_better(input.mid_kbps, input.s2c_kbps)
        && (input.version == HeuristicVersion::AlwaysEvaluate || !input.multiple);
    if cwnd_limited_better {
        tracing::debug!("better throughput when CWND is limited, may be duplex mismatch");
    }

    let mut link = LINK_CANNOT_DETERMINE;
    let mut mismatch = MISMATCH_NONE;

    let duplex = DuplexMismatchInput {
        cwnd_time,
        bw_theoretical,
        pkts_retrans: c.pkts_retrans,
        time_sec,
        max_ssthresh: c.max_ssthresh,
        rto_idle,
        link,
        s2c_kbps: input.s2c_kbps,
        mid_kbps: input.mid_kbps,
        multiple: input.multiple,
    };
    if detect_duplex_mismatch(&duplex, input.version) {
        mismatch = if is_c2s_throughput_better(input.c2s_kbps, input.s2c_kbps) {
            MISMATCH_OLD_ALGO
        } else {
            MISMATCH_SWITCH_FULL_HOST_HALF
        };
        link = LINK_ALGO_FAILED;
    }

    if detect_internal_duplex_mismatch(input.s2c_kbps / 1000.0, real_throughput, rwin_time, loss) {
        mismatch = MISMATCH_SWITCH_FULL_HOST_HALF;
        link = LINK_ALGO_FAILED;
    }

    if bw_theoretical < real_throughput {
        link = LINK_ALGO_FAILED;
    }

    let bad_cable = detect_faulty_hardware(loss, cwnd_time, time_sec, c.max_ssthresh);

    if detect_ethernet_link(real_throughput, input.s2c_kbps, loss, out_of_order, link) {
        link = LINK_ETHERNET;
    }

    if detect_wireless_link(
        send_time,
        real_throughput,
        bw_theoretical,
        c.snd_lim_trans_rwin,
        c.snd_lim_trans_cwnd,
        rwin_time,
        link,
    ) {
        link = LINK_WIRELESS;
    }

    if detect_dsl_cable_link(
        c.snd_lim_time_sender,
        c.snd_lim_trans_sender,
        real_throughput,
        bw_theoretical,
        link,
    ) {
        link = LINK_DSL_OR_CABLE;
    }

    let half_duplex = detect_half_duplex(
        rwin_time,
        c.snd_lim_trans_rwin,
        c.snd_lim_trans_sender,
        time_sec,
    );

    let congestion = detect_congestion(cwnd_time, mismatch, windows.cwin, windows.rwin, rtt_sec);

    tracing::info!(
        link,
        mismatch,
        bad_cable,
        half_duplex,
        congestion,
        bw_theoretical,
        real_throughput,
        loss,
        "diagnosis complete"
    );

    DiagnosticResult {
        avg_rtt_ms: avg_rtt,
        rtt_sec,
        loss,
        out_of_order,
        bw_theoretical,
        windows,
        total_time_us,
        rwin_time,
        cwnd_time,
        send_time,
        time_sec,
        rto_idle,
        real_throughput,
        wait_sec,
        cwnd_limited_better,
        link,
        mismatch,
        bad_cable,
        half_duplex,
        congestion,
        links: input.links,
    }
}
