//! Test-connection listeners.
//!
//! Every test phase binds its own listener, announces the port in
//! `TEST_PREPARE`, and waits for the client to connect from the same address
//! as its control connection.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};

use crate::config::{PortRange, ServerConfig};

/// MSS forced on the middlebox listener so segment sizes through a
/// middlebox can be compared with what was sent.
pub const MIDDLEBOX_MSS: u32 = 1456;

const BACKLOG: i32 = 128;

#[derive(Debug, Error)]
pub enum AcceptError {
    #[error("no test connection within {0:?}")]
    Timeout(Duration),
    #[error("gave up after {attempts} failed accepts")]
    RetriesExhausted { attempts: u32 },
}

impl AcceptError {
    /// Failure code reported to the client.
    pub fn code(&self) -> i32 {
        match self {
            AcceptError::Timeout(_) => -100,
            AcceptError::RetriesExhausted { .. } => -101,
        }
    }
}

/// Socket options applied before `listen`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListenOptions {
    pub mss: Option<u32>,
    pub buffer_size: Option<usize>,
}

pub fn bind_listener(addr: SocketAddr, opts: ListenOptions) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    #[cfg(unix)]
    if let Some(mss) = opts.mss {
        socket.set_mss(mss)?;
    }
    if let Some(size) = opts.buffer_size {
        socket.set_send_buffer_size(size)?;
        socket.set_recv_buffer_size(size)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}

/// Picks ports for test listeners.
///
/// A single-client server always uses the fixed per-test port. A
/// multi-client server walks the configured range, or lets the kernel pick.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    bind_ip: IpAddr,
    multiple: bool,
    range: Option<PortRange>,
    cursor: Arc<AtomicUsize>,
}

impl PortAllocator {
    pub fn new(cfg: &ServerConfig) -> Self {
        PortAllocator {
            bind_ip: cfg.bind_addr,
            multiple: cfg.multiple,
            range: cfg.ports.range.clone(),
            cursor: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Bind a listener for a test whose single-client port is `fixed_port`.
    pub fn bind(&self, fixed_port: u16, opts: ListenOptions) -> std::io::Result<TcpListener> {
        if !self.multiple {
            return bind_listener(SocketAddr::new(self.bind_ip, fixed_port), opts);
        }
        let Some(range) = self.range.as_ref() else {
            return bind_listener(SocketAddr::new(self.bind_ip, 0), opts);
        };
        let len = range.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % len;
        let mut last_err = None;
        for port in range.ports().cycle().skip(start).take(len) {
            match bind_listener(SocketAddr::new(self.bind_ip, port), opts) {
                Ok(l) => return Ok(l),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::AddrInUse, "port range exhausted")
        }))
    }
}

/// Accept the client's test connection.
///
/// Connections from any address other than `expected` are dropped and count
/// as a failed attempt. The whole wait is bounded by `wait`.
pub async fn accept_with_retry(
    listener: &TcpListener,
    expected: IpAddr,
    wait: Duration,
    retries: u32,
) -> Result<(TcpStream, SocketAddr), AcceptError> {
    let expected = expected.to_canonical();
    let deadline = tokio::time::Instant::now() + wait;
    let mut attempts = 0;
    while attempts < retries {
        let accepted = tokio::time::timeout_at(deadline, listener.accept())
            .await
            .map_err(|_| AcceptError::Timeout(wait))?;
        attempts += 1;
        match accepted {
            Ok((stream, peer)) if peer.ip().to_canonical() == expected => return Ok((stream, peer)),
            Ok((_, peer)) => {
                tracing::warn!(%peer, %expected, "dropping test connection from foreign address");
            }
            Err(e) => {
                tracing::warn!(error = %e, attempt = attempts, "test accept failed");
            }
        }
    }
    Err(AcceptError::RetriesExhausted { attempts })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> IpAddr {
        IpAddr::from([127, 0, 0, 1])
    }

    #[tokio::test]
    async fn accepts_expected_peer() {
        let l = bind_listener(SocketAddr::new(loopback(), 0), ListenOptions::default()).unwrap();
        let addr = l.local_addr().unwrap();
        let _c = TcpStream::connect(addr).await.unwrap();
        let (_, peer) = accept_with_retry(&l, loopback(), Duration::from_secs(1), 3)
            .await
            .unwrap();
        assert_eq!(peer.ip(), loopback());
    }

    #[tokio::test]
    async fn foreign_peers_exhaust_retries() {
        let l = bind_listener(SocketAddr::new(loopback(), 0), ListenOptions::default()).unwrap();
        let addr = l.local_addr().unwrap();
        let _a = TcpStream::connect(addr).await.unwrap();
        let _b = TcpStream::connect(addr).await.unwrap();
        let err = accept_with_retry(&l, IpAddr::from([10, 9, 9, 9]), Duration::from_secs(1), 2)
            .await
            .unwrap_err();
        assert_eq!(err.code(), -101);
    }

    #[tokio::test]
    async fn silent_client_times_out() {
        let l = bind_listener(SocketAddr::new(loopback(), 0), ListenOptions::default()).unwrap();
        let err = accept_with_retry(&l, loopback(), Duration::from_millis(50), 3)
            .await
            .unwrap_err();
        assert_eq!(err.code(), -100);
    }

    #[tokio::test]
    async fn mss_option_applies() {
        let opts = ListenOptions {
            mss: Some(MIDDLEBOX_MSS),
            buffer_size: Some(256 * 1024),
        };
        assert!(bind_listener(SocketAddr::new(loopback(), 0), opts).is_ok());
    }

    #[tokio::test]
    async fn multi_client_allocator_uses_ephemeral_ports() {
        let cfg = ServerConfig {
            multiple: true,
            bind_addr: loopback(),
            ..ServerConfig::default()
        };
        let alloc = PortAllocator::new(&cfg);
        let a = alloc.bind(3002, ListenOptions::default()).unwrap();
        let b = alloc.bind(3002, ListenOptions::default()).unwrap();
        assert_ne!(a.local_addr().unwrap().port(), b.local_addr().unwrap().port());
    }

    #[tokio::test]
    async fn range_allocator_wraps_past_taken_ports() {
        let held: Vec<std::net::TcpListener> = (0..3)
            .map(|_| std::net::TcpListener::bind((loopback(), 0)).unwrap())
            .collect();
        let ports: Vec<u16> = held.iter().map(|l| l.local_addr().unwrap().port()).collect();
        let spec = ports
            .iter()
            .map(|p| format!("{p}-{p}"))
            .collect::<Vec<_>>()
            .join(",");
        let mut cfg = ServerConfig {
            multiple: true,
            bind_addr: loopback(),
            ..ServerConfig::default()
        };
        cfg.ports.range = Some(PortRange::parse(&spec).unwrap());
        let alloc = PortAllocator::new(&cfg);

        // Free the first two, keep the third taken by someone else.
        let mut held = held;
        let _third = held.pop().unwrap();
        drop(held);

        let first = alloc.bind(3002, ListenOptions::default()).unwrap();
        assert_eq!(first.local_addr().unwrap().port(), ports[0]);
        drop(first);
        let second = alloc.bind(3002, ListenOptions::default()).unwrap();
        assert_eq!(second.local_addr().unwrap().port(), ports[1]);

        // Cursor lands on the taken port and wraps back to the freed one.
        let third = alloc.bind(3002, ListenOptions::default()).unwrap();
        assert_eq!(third.local_addr().unwrap().port(), ports[0]);

        // Every port is now in use.
        assert!(alloc.bind(3002, ListenOptions::default()).is_err());
    }
}
