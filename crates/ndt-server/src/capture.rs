//! # Flow Capture
//!
//! Feeds the packets of one throughput-test connection into a
//! [`PairClassifier`] on a dedicated OS thread:
//!
//! ```text
//!   PacketSource ──► observer thread ──► PairClassifier
//!        ▲                │                    │
//!   pnet datalink    stop (crossbeam)     FlowPair (oneshot)
//! ```
//!
//! The thread reports ready before the runner sends `TEST_START`, so the
//! first data packets are not missed. It stops on request, on source
//! failure, or when its lifetime limit passes.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use ndt_diag::{FlowPair, PacketRecord, PairClassifier, SpeedBin, TraceFilter};
use pnet::datalink::{self, Channel, DataLinkReceiver, NetworkInterface};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::Packet;
use tokio::sync::oneshot;

const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Produces captured TCP packets. `Ok(None)` means nothing arrived within
/// the source's poll interval.
pub trait PacketSource: Send {
    fn next_packet(&mut self) -> io::Result<Option<PacketRecord>>;
}

/// Opens a packet source for a test flow.
pub trait CaptureOpener: Send + Sync {
    /// Returns the source plus the speed-bin index of the interface it
    /// listens on (`-1` when unknown).
    fn open(&self, server: IpAddr) -> io::Result<(Box<dyn PacketSource>, i32)>;
}

// ─── Live capture ────────────────────────────────────────────────────────────

pub struct LiveCapture {
    rx: Box<dyn DataLinkReceiver>,
    clock: quanta::Clock,
    epoch: quanta::Instant,
}

impl LiveCapture {
    pub fn open(iface: &NetworkInterface) -> io::Result<Self> {
        let config = datalink::Config {
            read_timeout: Some(READ_TIMEOUT),
            ..Default::default()
        };
        match datalink::channel(iface, config)? {
            Channel::Ethernet(_tx, rx) => {
                let clock = quanta::Clock::new();
                let epoch = clock.now();
                Ok(LiveCapture { rx, clock, epoch })
            }
            _ => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("interface {} is not an ethernet channel", iface.name),
            )),
        }
    }
}

impl PacketSource for LiveCapture {
    fn next_packet(&mut self) -> io::Result<Option<PacketRecord>> {
        match self.rx.next() {
            Ok(frame) => {
                let ts = self.clock.now().duration_since(self.epoch).as_micros() as u64;
                Ok(parse_ethernet(frame, ts))
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Extract the TCP fields of an Ethernet frame. Non-TCP frames yield `None`.
pub fn parse_ethernet(frame: &[u8], ts_micros: u64) -> Option<PacketRecord> {
    let eth = EthernetPacket::new(frame)?;
    let (src, dst, segment) = match eth.get_ethertype() {
        EtherTypes::Ipv4 => {
            let ip = Ipv4Packet::new(eth.payload())?;
            if ip.get_next_level_protocol() != IpNextHeaderProtocols::Tcp {
                return None;
            }
            (
                IpAddr::V4(ip.get_source()),
                IpAddr::V4(ip.get_destination()),
                ip.payload().to_vec(),
            )
        }
        EtherTypes::Ipv6 => {
            let ip = Ipv6Packet::new(eth.payload())?;
            if ip.get_next_header() != IpNextHeaderProtocols::Tcp {
                return None;
            }
            (
                IpAddr::V6(ip.get_source()),
                IpAddr::V6(ip.get_destination()),
                ip.payload().to_vec(),
            )
        }
        _ => return None,
    };
    let tcp = TcpPacket::new(&segment)?;
    Some(PacketRecord {
        ts_micros,
        src: SocketAddr::new(src, tcp.get_source()),
        dst: SocketAddr::new(dst, tcp.get_destination()),
        seq: tcp.get_sequence(),
        ack: tcp.get_acknowledgement(),
        window: u32::from(tcp.get_window()),
    })
}

/// Pick the capture interface: the configured device, else the one carrying
/// `server`, else the first active non-loopback interface.
pub fn find_interface(device: Option<&str>, server: IpAddr) -> Option<NetworkInterface> {
    let interfaces = datalink::interfaces();
    if let Some(name) = device {
        return interfaces.into_iter().find(|i| i.name == name);
    }
    let server = server.to_canonical();
    if let Some(iface) = interfaces
        .iter()
        .find(|i| i.ips.iter().any(|net| net.ip() == server))
    {
        return Some(iface.clone());
    }
    interfaces
        .into_iter()
        .find(|i| i.is_up() && !i.is_loopback() && !i.ips.is_empty())
}

/// Speed-bin index from the contents of `/sys/class/net/<if>/speed`.
pub fn speed_index_from_sysfs(text: &str) -> i32 {
    text.trim()
        .parse::<i64>()
        .ok()
        .and_then(SpeedBin::for_interface_mbps)
        .map_or(-1, |bin| bin.index() as i32)
}

pub fn interface_speed_index(name: &str) -> i32 {
    std::fs::read_to_string(format!("/sys/class/net/{}/speed", name))
        .map(|s| speed_index_from_sysfs(&s))
        .unwrap_or(-1)
}

/// Opens pnet channels on the configured or detected interface.
#[derive(Debug, Clone, Default)]
pub struct LiveCaptureOpener {
    pub device: Option<String>,
}

impl CaptureOpener for LiveCaptureOpener {
    fn open(&self, server: IpAddr) -> io::Result<(Box<dyn PacketSource>, i32)> {
        let iface = find_interface(self.device.as_deref(), server).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "no capture interface found")
        })?;
        let ifspeed = interface_speed_index(&iface.name);
        tracing::debug!(iface = %iface.name, ifspeed, "opening capture");
        Ok((Box::new(LiveCapture::open(&iface)?), ifspeed))
    }
}

// ─── Channel source ──────────────────────────────────────────────────────────

/// Packets handed over through a crossbeam channel. Ends when every sender
/// is dropped.
pub struct ChannelSource {
    rx: Receiver<PacketRecord>,
    poll: Duration,
}

impl ChannelSource {
    pub fn new(rx: Receiver<PacketRecord>) -> Self {
        ChannelSource { rx, poll: READ_TIMEOUT }
    }
}

impl PacketSource for ChannelSource {
    fn next_packet(&mut self) -> io::Result<Option<PacketRecord>> {
        match self.rx.recv_timeout(self.poll) {
            Ok(pkt) => Ok(Some(pkt)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(io::Error::new(io::ErrorKind::UnexpectedEof, "packet feed closed"))
            }
        }
    }
}

// ─── Observer ────────────────────────────────────────────────────────────────

/// Background classifier for one test flow.
pub struct FlowObserver {
    stop: Sender<()>,
    result: oneshot::Receiver<FlowPair>,
}

impl FlowObserver {
    /// Start the observer thread. The returned receiver fires once the
    /// thread is pulling packets.
    pub fn spawn(
        mut source: Box<dyn PacketSource>,
        filter: TraceFilter,
        ifspeed: i32,
        limit: Duration,
    ) -> io::Result<(Self, oneshot::Receiver<()>)> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (result_tx, result_rx) = oneshot::channel();

        std::thread::Builder::new()
            .name(format!("ndt-capture-{}", filter.port))
            .spawn(move || {
                let mut classifier = PairClassifier::new(filter, ifspeed);
                let started = std::time::Instant::now();
                let _ = ready_tx.send(());
                loop {
                    match stop_rx.try_recv() {
                        Ok(()) | Err(crossbeam_channel::TryRecvError::Disconnected) => break,
                        Err(crossbeam_channel::TryRecvError::Empty) => {}
                    }
                    if started.elapsed() >= limit {
                        tracing::warn!(port = filter.port, "capture lifetime limit reached");
                        break;
                    }
                    match source.next_packet() {
                        Ok(Some(pkt)) => {
                            classifier.observe(&pkt);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::debug!(error = %e, "capture source ended");
                            break;
                        }
                    }
                }
                tracing::debug!(
                    port = filter.port,
                    foreign = classifier.foreign(),
                    mean_mbps = ?classifier.data_mean_mbps(),
                    "capture finished"
                );
                let _ = result_tx.send(classifier.finish());
            })?;

        Ok((
            FlowObserver {
                stop: stop_tx,
                result: result_rx,
            },
            ready_rx,
        ))
    }

    /// Stop the thread and collect its report, waiting at most `wait`.
    pub async fn finish(self, wait: Duration) -> FlowPair {
        let _ = self.stop.try_send(());
        match tokio::time::timeout(wait, self.result).await {
            Ok(Ok(pair)) => pair,
            _ => {
                tracing::warn!("capture did not report in time");
                FlowPair::unavailable()
            }
        }
    }
}

/// Open a source through `opener` and start observing the flow. Failures
/// are logged and yield `None`; the test then runs without a histogram.
pub async fn start_observer(
    opener: Option<&Arc<dyn CaptureOpener>>,
    filter: TraceFilter,
    limit: Duration,
    ready_wait: Duration,
) -> Option<FlowObserver> {
    let opener = opener?;
    let (source, ifspeed) = match opener.open(filter.server) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "packet capture unavailable");
            return None;
        }
    };
    let (observer, ready) = match FlowObserver::spawn(source, filter, ifspeed, limit) {
        Ok(o) => o,
        Err(e) => {
            tracing::warn!(error = %e, "failed to start capture thread");
            return None;
        }
    };
    if tokio::time::timeout(ready_wait, ready).await.is_err() {
        tracing::warn!("capture thread slow to start");
    }
    Some(observer)
}
