//! `MSG_RESULTS` text blocks sent to the client after all tests ran.
//!
//! Six frames, each a run of `key: value` lines, followed by `MSG_LOGOUT`.

use crate::cwnd::CwndPeaks;
use crate::heuristics::DiagnosticResult;

/// Values reported alongside the diagnosis.
#[derive(Debug, Clone, Copy)]
pub struct ResultContext {
    /// `Sndbuf` counter of the S2C connection.
    pub sndbuf: i64,
    /// CWND-limited throughput from the middlebox test (kbps).
    pub mid_kbps: f64,
    /// Legacy "aspd" field, no longer computed.
    pub aspd: f64,
    pub peaks: CwndPeaks,
}

/// Render the result blocks in send order.
pub fn result_blocks(r: &DiagnosticResult, ctx: &ResultContext) -> Vec<String> {
    vec![
        format!(
            "c2sData: {}\nc2sAck: {}\ns2cData: {}\ns2cAck: {}\n",
            r.links.c2s_data, r.links.c2s_ack, r.links.s2c_data, r.links.s2c_ack
        ),
        format!(
            "half_duplex: {}\nlink: {}\ncongestion: {}\nbad_cable: {}\nmismatch: {}\nspd: {:.2}\n",
            r.half_duplex as i32,
            r.link,
            r.congestion as i32,
            r.bad_cable as i32,
            r.mismatch,
            r.real_throughput
        ),
        format!(
            "bw: {:.2}\nloss: {:.9}\navgrtt: {:.2}\nwaitsec: {:.2}\ntimesec: {:.2}\norder: {:.4}\n",
            r.bw_theoretical, r.loss, r.avg_rtt_ms, r.wait_sec, r.time_sec, r.out_of_order
        ),
        format!(
            "rwintime: {:.4}\nsendtime: {:.4}\ncwndtime: {:.4}\nrwin: {:.4}\nswin: {:.4}\n",
            r.rwin_time, r.send_time, r.cwnd_time, r.windows.rwin, r.windows.swin
        ),
        format!(
            "cwin: {:.4}\nrttsec: {:.6}\nSndbuf: {}\naspd: {:.5}\nCWND-Limited: {:.2}\n",
            r.windows.cwin, r.rtt_sec, ctx.sndbuf, ctx.aspd, ctx.mid_kbps
        ),
        format!(
            "minCWNDpeak: {}\nmaxCWNDpeak: {}\nCWNDpeaks: {}\n",
            ctx.peaks.min, ctx.peaks.max, ctx.peaks.amount
        ),
    ]
}
