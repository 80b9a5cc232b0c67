// src/allocator/port.rs
//! Relayed address allocation.
//!
//! The allocator only sees the [`PortAllocator`] capability: "give me a bound
//! relay endpoint or fail". Two implementations ship here:
//! - [`NetPortAllocator`] scans ports upward from a base address and binds the
//!   first free one through a [`Binder`], retrying on `AddrInUse` up to a
//!   fixed attempt budget
//! - [`SequentialPortAllocator`] hands out consecutive ports backed by
//!   in-memory [`MemoryConn`]s, for deterministic tests

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex as ParkingMutex;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace, warn};

use super::addr::{Addr, FiveTuple};
use super::error::{PortError, PortResult};

/// Bound relay socket owned by one allocation
#[async_trait]
pub trait RelayConn: Send + Sync + fmt::Debug {
    /// Relayed transport address of this socket
    fn local_addr(&self) -> Addr;

    async fn send_to(&self, payload: &[u8], peer: SocketAddr) -> io::Result<usize>;

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

/// Source of relayed endpoints for new allocations
#[async_trait]
pub trait PortAllocator: Send + Sync {
    async fn allocate(&self, tuple: &FiveTuple) -> PortResult<Arc<dyn RelayConn>>;
}

/// Binds a single socket address
#[async_trait]
pub trait Binder: Send + Sync {
    async fn bind(&self, addr: SocketAddr) -> io::Result<Arc<dyn RelayConn>>;
}

/// UDP relay socket
#[derive(Debug)]
pub struct UdpRelayConn {
    socket: UdpSocket,
    addr: Addr,
}

#[async_trait]
impl RelayConn for UdpRelayConn {
    fn local_addr(&self) -> Addr {
        self.addr
    }

    async fn send_to(&self, payload: &[u8], peer: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(payload, peer).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }
}

/// Binds real OS UDP sockets
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpBinder;

#[async_trait]
impl Binder for UdpBinder {
    async fn bind(&self, addr: SocketAddr) -> io::Result<Arc<dyn RelayConn>> {
        let socket = UdpSocket::bind(addr).await?;
        let addr = Addr::udp(socket.local_addr()?);
        Ok(Arc::new(UdpRelayConn { socket, addr }))
    }
}

/// Sequential bind-with-retry strategy.
///
/// Candidates are `base_port + 1 ..= max_port`, wrapping around. The cursor
/// advances on every attempt, successful or not, so a port that just failed
/// is not retried immediately.
pub struct NetPortAllocator<B> {
    binder: B,
    ip: IpAddr,
    base_port: u16,
    max_port: u16,
    max_attempts: u32,
    cursor: AtomicU32,
}

impl<B: Binder> NetPortAllocator<B> {
    /// Create a new allocator scanning upward from `base`
    pub fn new(binder: B, base: SocketAddr, max_port: u16, max_attempts: u32) -> PortResult<Self> {
        if base.port() >= max_port {
            return Err(PortError::InvalidRange { base: base.port(), max: max_port });
        }

        Ok(Self {
            binder,
            ip: base.ip(),
            base_port: base.port(),
            max_port,
            max_attempts: max_attempts.max(1),
            cursor: AtomicU32::new(0),
        })
    }

    fn next_candidate(&self) -> SocketAddr {
        let span = u32::from(self.max_port - self.base_port);
        let offset = self.cursor.fetch_add(1, Ordering::Relaxed) % span;
        // offset < span, so the sum never exceeds max_port
        SocketAddr::new(self.ip, self.base_port + 1 + offset as u16)
    }
}

#[async_trait]
impl<B: Binder> PortAllocator for NetPortAllocator<B> {
    async fn allocate(&self, tuple: &FiveTuple) -> PortResult<Arc<dyn RelayConn>> {
        let start = self.next_candidate();
        let mut candidate = start;
        let mut last = None;

        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                candidate = self.next_candidate();
            }

            match self.binder.bind(candidate).await {
                Ok(conn) => {
                    debug!("Bound relay {} for {} (attempt {})", conn.local_addr(), tuple, attempt);
                    return Ok(conn);
                }
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                    trace!("Relay port {} in use, trying next", candidate);
                    last = Some(e);
                }
                Err(e) => {
                    warn!("Relay bind on {} failed for {}: {}", candidate, tuple, e);
                    return Err(PortError::Io(e));
                }
            }
        }

        warn!(
            "No free relay port for {} after {} attempts from {}",
            tuple, self.max_attempts, start
        );
        Err(PortError::Exhausted {
            attempts: self.max_attempts,
            start,
            last: last.unwrap_or_else(|| io::Error::from(io::ErrorKind::AddrInUse)),
        })
    }
}

/// In-memory relay socket.
///
/// Records every payload sent through it; inbound datagrams are fed with
/// [`MemoryConn::inject`].
#[derive(Debug)]
pub struct MemoryConn {
    addr: Addr,
    sent: ParkingMutex<Vec<(SocketAddr, Bytes)>>,
    inbound_tx: mpsc::UnboundedSender<(SocketAddr, Bytes)>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<(SocketAddr, Bytes)>>,
}

impl MemoryConn {
    pub fn new(addr: Addr) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            addr,
            sent: ParkingMutex::new(Vec::new()),
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
        }
    }

    /// Queue a datagram as if `from` had sent it to the relayed address
    pub fn inject(&self, from: SocketAddr, data: impl Into<Bytes>) {
        // Receiver lives as long as self
        let _ = self.inbound_tx.send((from, data.into()));
    }

    /// Payloads written so far, in order
    pub fn sent(&self) -> Vec<(SocketAddr, Bytes)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl RelayConn for MemoryConn {
    fn local_addr(&self) -> Addr {
        self.addr
    }

    async fn send_to(&self, payload: &[u8], peer: SocketAddr) -> io::Result<usize> {
        self.sent.lock().push((peer, Bytes::copy_from_slice(payload)));
        Ok(payload.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut rx = self.inbound_rx.lock().await;
        match rx.recv().await {
            Some((from, data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok((n, from))
            }
            None => Err(io::Error::from(io::ErrorKind::BrokenPipe)),
        }
    }
}

/// Deterministic port allocator: `base + 1`, `base + 2`, ...
///
/// No sockets are opened. Handed-out connections stay reachable through
/// [`SequentialPortAllocator::conn`] for as long as their allocation holds them.
#[derive(Debug)]
pub struct SequentialPortAllocator {
    ip: IpAddr,
    current: AtomicU16,
    conns: ParkingMutex<HashMap<Addr, Weak<MemoryConn>>>,
}

impl SequentialPortAllocator {
    pub fn new(ip: impl Into<IpAddr>, base_port: u16) -> Self {
        Self {
            ip: ip.into(),
            current: AtomicU16::new(base_port),
            conns: ParkingMutex::new(HashMap::new()),
        }
    }

    /// Live connection bound to `addr`, if its allocation still exists
    pub fn conn(&self, addr: &Addr) -> Option<Arc<MemoryConn>> {
        self.conns.lock().get(addr).and_then(Weak::upgrade)
    }
}

#[async_trait]
impl PortAllocator for SequentialPortAllocator {
    async fn allocate(&self, _tuple: &FiveTuple) -> PortResult<Arc<dyn RelayConn>> {
        let port = self.current.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let addr = Addr::udp(SocketAddr::new(self.ip, port));
        let conn = Arc::new(MemoryConn::new(addr));

        let mut conns = self.conns.lock();
        conns.retain(|_, weak| weak.strong_count() > 0);
        conns.insert(addr, Arc::downgrade(&conn));

        Ok(conn)
    }
}
