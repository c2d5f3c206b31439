//! Per-connection TCP counter stores.
//!
//! The diagnosis needs the extended-statistics counters of a live socket.
//! [`CounterStore`] hides where they come from:
//!
//! ```text
//!   TcpInfoStore      getsockopt(TCP_INFO) + SO_SNDBUF    (Linux)
//!   FixedCounterStore canned snapshot                     (tests)
//! ```
//!
//! `TCP_INFO` does not carry every MIB counter. Missing ones are `-1`, or
//! derived from the closest field the kernel does expose.

use std::os::fd::RawFd;
use std::sync::Mutex;

use ndt_diag::TcpCounters;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CounterError {
    #[error("TCP counters are not available on this platform")]
    Unsupported,
    #[error("counter read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Source of [`TcpCounters`] for an open socket.
pub trait CounterStore: Send + Sync {
    fn snapshot(&self, fd: RawFd) -> Result<TcpCounters, CounterError>;

    /// Cap how much the connection may have in flight. Used by the middlebox
    /// test to hold the sender to a small congestion window.
    fn limit_cwnd(&self, fd: RawFd, bytes: u32) -> Result<(), CounterError>;
}

// ─── TCP_INFO ────────────────────────────────────────────────────────────────

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use std::mem;

    /// `struct tcp_info` up to `tcpi_snd_wnd`.
    #[repr(C)]
    #[derive(Default)]
    pub(super) struct RawTcpInfo {
        pub state: u8,
        pub ca_state: u8,
        pub retransmits: u8,
        pub probes: u8,
        pub backoff: u8,
        pub options: u8,
        /// `snd_wscale:4, rcv_wscale:4`
        pub wscale: u8,
        pub flags: u8,

        pub rto: u32,
        pub ato: u32,
        pub snd_mss: u32,
        pub rcv_mss: u32,

        pub unacked: u32,
        pub sacked: u32,
        pub lost: u32,
        pub retrans: u32,
        pub fackets: u32,

        pub last_data_sent: u32,
        pub last_ack_sent: u32,
        pub last_data_recv: u32,
        pub last_ack_recv: u32,

        pub pmtu: u32,
        pub rcv_ssthresh: u32,
        pub rtt: u32,
        pub rttvar: u32,
        pub snd_ssthresh: u32,
        pub snd_cwnd: u32,
        pub advmss: u32,
        pub reordering: u32,

        pub rcv_rtt: u32,
        pub rcv_space: u32,

        pub total_retrans: u32,

        pub pacing_rate: u64,
        pub max_pacing_rate: u64,
        pub bytes_acked: u64,
        pub bytes_received: u64,
        pub segs_out: u32,
        pub segs_in: u32,

        pub notsent_bytes: u32,
        pub min_rtt: u32,
        pub data_segs_in: u32,
        pub data_segs_out: u32,

        pub delivery_rate: u64,

        pub busy_time: u64,
        pub rwnd_limited: u64,
        pub sndbuf_limited: u64,

        pub delivered: u32,
        pub delivered_ce: u32,

        pub bytes_sent: u64,
        pub bytes_retrans: u64,
        pub dsack_dups: u32,
        pub reord_seen: u32,

        pub rcv_ooopack: u32,
        pub snd_wnd: u32,
    }

    pub(super) const TCPI_OPT_WSCALE: u8 = 4;
    const INFINITE_SSTHRESH: u32 = 0x7fff_ffff;

    // Byte offsets that tell which kernel generation filled the struct.
    pub(super) const LEN_BASIC: usize = 104;
    pub(super) const LEN_SEGS: usize = 144;
    pub(super) const LEN_DATA_SEGS: usize = 160;
    pub(super) const LEN_LIMITED: usize = 192;
    pub(super) const LEN_BYTES_SENT: usize = 208;
    pub(super) const LEN_SND_WND: usize = 232;

    pub(super) fn read_tcp_info(fd: RawFd) -> std::io::Result<(RawTcpInfo, usize)> {
        let mut info = RawTcpInfo::default();
        let mut len = mem::size_of::<RawTcpInfo>() as libc::socklen_t;
        // SAFETY: `info` is a plain repr(C) struct and `len` holds its size;
        // the kernel writes at most `len` bytes.
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_INFO,
                &mut info as *mut RawTcpInfo as *mut libc::c_void,
                &mut len,
            )
        };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok((info, len as usize))
    }

    pub(super) fn sockopt_int(fd: RawFd, level: libc::c_int, name: libc::c_int) -> std::io::Result<i64> {
        let mut value: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        // SAFETY: `value` is a c_int and `len` its size.
        let rc = unsafe {
            libc::getsockopt(
                fd,
                level,
                name,
                &mut value as *mut libc::c_int as *mut libc::c_void,
                &mut len,
            )
        };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(i64::from(value))
    }

    pub(super) fn set_sockopt_int(
        fd: RawFd,
        level: libc::c_int,
        name: libc::c_int,
        value: libc::c_int,
    ) -> std::io::Result<()> {
        // SAFETY: passes a pointer to a live c_int with its exact size.
        let rc = unsafe {
            libc::setsockopt(
                fd,
                level,
                name,
                &value as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    /// Map a `tcp_info` onto the MIB counter names.
    pub(super) fn to_counters(info: &RawTcpInfo, len: usize, sndbuf: i64) -> TcpCounters {
        let mut c = TcpCounters::unavailable();
        if len < LEN_BASIC {
            c.sndbuf = sndbuf;
            return c;
        }
        let mss = i64::from(info.snd_mss);

        // srtt in µs over 1000 samples yields the average in ms.
        c.sum_rtt = i64::from(info.rtt);
        c.count_rtt = 1000;
        c.smoothed_rtt = i64::from(info.rtt) / 1000;
        c.max_rtt = (i64::from(info.rtt) + 4 * i64::from(info.rttvar)) / 1000;
        c.current_rto = i64::from(info.rto) / 1000;
        c.max_rto = c.current_rto;

        c.congestion_signals = i64::from(info.total_retrans);
        c.pkts_retrans = i64::from(info.total_retrans);
        c.fast_retran = i64::from(info.total_retrans);
        c.timeouts = 0;
        c.dup_acks_in = 0;

        c.current_mss = mss;
        if info.options & TCPI_OPT_WSCALE != 0 {
            let snd = i64::from(info.wscale & 0x0f);
            let rcv = i64::from(info.wscale >> 4);
            c.snd_win_scale = snd;
            c.rcv_win_scale = rcv;
            c.win_scale_rcvd = snd;
            c.win_scale_sent = rcv;
        }
        c.sndbuf = sndbuf;

        c.current_cwnd = i64::from(info.snd_cwnd) * mss;
        c.max_cwnd = c.current_cwnd;
        c.max_ssthresh = if info.snd_ssthresh >= INFINITE_SSTHRESH {
            0
        } else {
            i64::from(info.snd_ssthresh) * mss
        };

        if len >= LEN_SEGS {
            c.snd_una = info.bytes_acked as i64;
            c.snd_nxt = c.snd_una + i64::from(info.unacked) * mss;
        }
        if len >= LEN_SEGS + 8 {
            c.min_rtt = i64::from(info.min_rtt) / 1000;
        }
        if len >= LEN_DATA_SEGS {
            c.pkts_out = i64::from(info.segs_out);
            c.data_pkts_out = i64::from(info.data_segs_out);
            c.ack_pkts_out = (c.pkts_out - c.data_pkts_out).max(0);
            c.ack_pkts_in = i64::from(info.segs_in) - i64::from(info.data_segs_in);
        }
        if len >= LEN_LIMITED {
            let busy = info.busy_time as i64;
            let rwin = info.rwnd_limited as i64;
            let sender = info.sndbuf_limited as i64;
            c.snd_lim_time_rwin = rwin;
            c.snd_lim_time_sender = sender;
            c.snd_lim_time_cwnd = (busy - rwin - sender).max(0);
            c.snd_lim_trans_rwin = 0;
            c.snd_lim_trans_cwnd = 0;
            c.snd_lim_trans_sender = 0;
        }
        if len >= LEN_BYTES_SENT {
            c.data_bytes_out = info.bytes_sent as i64;
        }
        if len >= LEN_SND_WND {
            c.max_rwin_rcvd = i64::from(info.snd_wnd);
            c.current_rwin_rcvd = i64::from(info.snd_wnd);
        }
        c
    }
}

/// Bytes still queued in the socket's send buffer, `0` when unknown.
pub fn unsent_bytes(fd: RawFd) -> i64 {
    #[cfg(target_os = "linux")]
    {
        let mut queued: libc::c_int = 0;
        // SAFETY: TIOCOUTQ writes one c_int through the pointer.
        let rc = unsafe { libc::ioctl(fd, libc::TIOCOUTQ, &mut queued as *mut libc::c_int) };
        if rc == 0 {
            return i64::from(queued);
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = fd;
    0
}

/// Counters read from the kernel's `TCP_INFO`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpInfoStore;

#[cfg(target_os = "linux")]
impl CounterStore for TcpInfoStore {
    fn snapshot(&self, fd: RawFd) -> Result<TcpCounters, CounterError> {
        let (info, len) = linux::read_tcp_info(fd)?;
        let sndbuf = linux::sockopt_int(fd, libc::SOL_SOCKET, libc::SO_SNDBUF).unwrap_or(-1);
        Ok(linux::to_counters(&info, len, sndbuf))
    }

    fn limit_cwnd(&self, fd: RawFd, bytes: u32) -> Result<(), CounterError> {
        let value = libc::c_int::try_from(bytes).unwrap_or(libc::c_int::MAX);
        linux::set_sockopt_int(fd, libc::SOL_SOCKET, libc::SO_SNDBUF, value)?;
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
impl CounterStore for TcpInfoStore {
    fn snapshot(&self, _fd: RawFd) -> Result<TcpCounters, CounterError> {
        Err(CounterError::Unsupported)
    }

    fn limit_cwnd(&self, _fd: RawFd, _bytes: u32) -> Result<(), CounterError> {
        Err(CounterError::Unsupported)
    }
}

// ─── Fixed ───────────────────────────────────────────────────────────────────

/// Returns the same snapshot for every socket. Records `limit_cwnd` calls.
#[derive(Debug)]
pub struct FixedCounterStore {
    counters: Option<TcpCounters>,
    limits: Mutex<Vec<u32>>,
}

impl FixedCounterStore {
    pub fn new(counters: TcpCounters) -> Self {
        FixedCounterStore {
            counters: Some(counters),
            limits: Mutex::new(Vec::new()),
        }
    }

    /// A store that fails every read.
    pub fn unsupported() -> Self {
        FixedCounterStore {
            counters: None,
            limits: Mutex::new(Vec::new()),
        }
    }

    pub fn limits(&self) -> Vec<u32> {
        self.limits.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

impl CounterStore for FixedCounterStore {
    fn snapshot(&self, _fd: RawFd) -> Result<TcpCounters, CounterError> {
        self.counters.clone().ok_or(CounterError::Unsupported)
    }

    fn limit_cwnd(&self, _fd: RawFd, bytes: u32) -> Result<(), CounterError> {
        if let Ok(mut limits) = self.limits.lock() {
            limits.push(bytes);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_store_returns_snapshot() {
        let mut c = TcpCounters::unavailable();
        c.current_mss = 1448;
        let store = FixedCounterStore::new(c.clone());
        assert_eq!(store.snapshot(0).unwrap(), c);
        store.limit_cwnd(0, 2896).unwrap();
        assert_eq!(store.limits(), vec![2896]);
        assert!(FixedCounterStore::unsupported().snapshot(0).is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn raw_tcp_info_matches_kernel_layout() {
        assert_eq!(std::mem::size_of::<linux::RawTcpInfo>(), linux::LEN_SND_WND);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn mapping_converts_units() {
        let info = linux::RawTcpInfo {
            options: linux::TCPI_OPT_WSCALE,
            wscale: 0x97,
            rto: 204_000,
            snd_mss: 1448,
            unacked: 10,
            rtt: 12_500,
            rttvar: 1_000,
            snd_cwnd: 20,
            snd_ssthresh: 0x7fff_ffff,
            total_retrans: 3,
            bytes_acked: 1_000_000,
            segs_out: 900,
            data_segs_out: 880,
            busy_time: 10_000_000,
            rwnd_limited: 1_000_000,
            sndbuf_limited: 500_000,
            bytes_sent: 1_200_000,
            snd_wnd: 65_535,
            ..Default::default()
        };
        let c = linux::to_counters(&info, linux::LEN_SND_WND, 87_040);
        assert_eq!(c.sum_rtt / c.count_rtt, 12);
        assert_eq!(c.max_rtt, 16);
        assert_eq!(c.current_rto, 204);
        assert_eq!(c.snd_win_scale, 7);
        assert_eq!(c.rcv_win_scale, 9);
        assert_eq!(c.current_cwnd, 20 * 1448);
        assert_eq!(c.max_ssthresh, 0);
        assert_eq!(c.in_flight(), 14_480);
        assert_eq!(c.snd_lim_time_cwnd, 8_500_000);
        assert_eq!(c.data_bytes_out, 1_200_000);
        assert_eq!(c.ack_pkts_out, 20);
        assert_eq!(c.sndbuf, 87_040);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn short_struct_leaves_newer_fields_unavailable() {
        let info = linux::RawTcpInfo {
            snd_mss: 1448,
            ..Default::default()
        };
        let c = linux::to_counters(&info, linux::LEN_BASIC, -1);
        assert_eq!(c.current_mss, 1448);
        assert_eq!(c.data_bytes_out, -1);
        assert_eq!(c.snd_lim_time_rwin, -1);
        assert_eq!(c.snd_win_scale, -1);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn live_socket_snapshot() {
        use std::os::fd::AsRawFd;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (_server, _) = listener.accept().await.unwrap();
        let c = TcpInfoStore.snapshot(client.as_raw_fd()).unwrap();
        assert!(c.current_mss > 0);
        assert!(c.sndbuf > 0);
    }
}
