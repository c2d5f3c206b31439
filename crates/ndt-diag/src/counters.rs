//! # TCP Counter Snapshot
//!
//! Named per-connection TCP-stack counters, read from whatever
//! instrumentation the host offers. Every field is `-1` when the source could
//! not supply it.
//!
//! Units follow the classic TCP extended-statistics MIB:
//! RTTs and RTO in milliseconds, send-limited times in microseconds, windows
//! and buffers in bytes.

use serde::Serialize;
use std::fmt::Write as _;

macro_rules! tcp_counters {
    ($( $(#[$doc:meta])* $field:ident => $name:literal ),* $(,)?) => {
        /// One snapshot of the counter store for a connection.
        #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
        pub struct TcpCounters {
            $( $(#[$doc])* #[serde(rename = $name)] pub $field: i64, )*
        }

        impl TcpCounters {
            /// Counter names in report order.
            pub const NAMES: &'static [&'static str] = &[$($name),*];

            /// Snapshot in which nothing was collected.
            pub fn unavailable() -> Self {
                TcpCounters { $( $field: -1, )* }
            }

            /// Look a counter up by its MIB name.
            pub fn get(&self, name: &str) -> Option<i64> {
                match name {
                    $( $name => Some(self.$field), )*
                    _ => None,
                }
            }

            /// `(name, value)` pairs in report order.
            pub fn entries(&self) -> Vec<(&'static str, i64)> {
                vec![$( ($name, self.$field), )*]
            }
        }
    };
}

tcp_counters! {
    /// Sum of RTT samples (ms).
    sum_rtt => "SumRTT",
    count_rtt => "CountRTT",
    min_rtt => "MinRTT",
    max_rtt => "MaxRTT",
    smoothed_rtt => "SmoothedRTT",
    current_rto => "CurrentRTO",
    max_rto => "MaxRTO",
    congestion_signals => "CongestionSignals",
    pkts_out => "PktsOut",
    data_pkts_out => "DataPktsOut",
    ack_pkts_out => "AckPktsOut",
    data_bytes_out => "DataBytesOut",
    pkts_retrans => "PktsRetrans",
    fast_retran => "FastRetran",
    timeouts => "Timeouts",
    dup_acks_in => "DupAcksIn",
    ack_pkts_in => "AckPktsIn",
    current_mss => "CurMSS",
    win_scale_sent => "WinScaleSent",
    win_scale_rcvd => "WinScaleRcvd",
    snd_win_scale => "SndWinScale",
    rcv_win_scale => "RcvWinScale",
    sndbuf => "Sndbuf",
    max_rwin_rcvd => "MaxRwinRcvd",
    current_rwin_rcvd => "CurrentRwinRcvd",
    max_cwnd => "MaxCwnd",
    current_cwnd => "CurCwnd",
    max_ssthresh => "MaxSsthresh",
    /// Time spent limited by the receiver window (µs).
    snd_lim_time_rwin => "SndLimTimeRwin",
    /// Time spent limited by the congestion window (µs).
    snd_lim_time_cwnd => "SndLimTimeCwnd",
    /// Time spent limited by the sender itself (µs).
    snd_lim_time_sender => "SndLimTimeSender",
    snd_lim_trans_rwin => "SndLimTransRwin",
    snd_lim_trans_cwnd => "SndLimTransCwnd",
    snd_lim_trans_sender => "SndLimTransSender",
    snd_nxt => "SndNxt",
    snd_una => "SndUna",
}

impl TcpCounters {
    /// Bytes sent but not yet acknowledged.
    pub fn in_flight(&self) -> i64 {
        if self.snd_nxt < 0 || self.snd_una < 0 {
            return 0;
        }
        (self.snd_nxt - self.snd_una).max(0)
    }

    /// `Name: value` lines, one per counter.
    pub fn report_lines(&self) -> String {
        let mut out = String::new();
        for (name, value) in self.entries() {
            let _ = writeln!(out, "{}: {}", name, value);
        }
        out
    }
}

impl Default for TcpCounters {
    fn default() -> Self {
        Self::unavailable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_is_all_minus_one() {
        let c = TcpCounters::unavailable();
        assert!(c.entries().iter().all(|(_, v)| *v == -1));
        assert_eq!(c.entries().len(), TcpCounters::NAMES.len());
    }

    #[test]
    fn lookup_by_name() {
        let mut c = TcpCounters::unavailable();
        c.current_mss = 1448;
        assert_eq!(c.get("CurMSS"), Some(1448));
        assert_eq!(c.get("NoSuchCounter"), None);
    }

    #[test]
    fn report_lines_format() {
        let mut c = TcpCounters::unavailable();
        c.sum_rtt = 400;
        let text = c.report_lines();
        assert!(text.starts_with("SumRTT: 400\nCountRTT: -1\n"));
        assert_eq!(text.lines().count(), TcpCounters::NAMES.len());
    }

    #[test]
    fn serializes_with_counter_names() {
        let mut c = TcpCounters::unavailable();
        c.current_mss = 1448;
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v["CurMSS"], 1448);
        assert_eq!(v["SumRTT"], -1);
    }

    #[test]
    fn in_flight_guards_missing_values() {
        let mut c = TcpCounters::unavailable();
        assert_eq!(c.in_flight(), 0);
        c.snd_nxt = 10_000;
        c.snd_una = 4_000;
        assert_eq!(c.in_flight(), 6_000);
    }
}
