// src/allocator/mod.rs
//! Relay allocation table and lifecycle management.
//!
//! The [`Allocator`] owns every [`Allocation`] keyed by its [`FiveTuple`] and
//! serializes all mutation behind one lock:
//! - creation binds a relayed endpoint through a [`PortAllocator`]
//! - per-peer permissions gate relaying in both directions
//! - expiry is purely comparative; [`Allocator::collect`] reclaims whatever
//!   expired at or before the instant it is given
//!
//! Lookups never hold the table lock across socket I/O: the relay handle is
//! cloned out and the lock released before writing.

pub mod addr;
pub mod allocation;
pub mod error;
pub mod port;

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex as ParkingMutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

pub use self::addr::{Addr, FiveTuple, Proto};
pub use self::allocation::{Allocation, AllocationInfo, Permission};
pub use self::error::{AllocatorError, AllocatorResult, PortError, PortResult};
pub use self::port::{
    Binder, MemoryConn, NetPortAllocator, PortAllocator, RelayConn, SequentialPortAllocator,
    UdpBinder, UdpRelayConn,
};

use crate::config::RelayConfig;

/// Largest datagram read from a relay socket
const MAX_DATAGRAM: usize = 65536;

/// Receives data peers send to a relayed address
pub trait PeerHandler: Send + Sync {
    fn handle_peer_data(&self, tuple: &FiveTuple, peer: Addr, data: Bytes);
}

/// Per-allocation creation options
#[derive(Clone, Default)]
pub struct AllocationOptions {
    /// When set, datagrams from permitted peers are delivered here
    pub peer_handler: Option<Arc<dyn PeerHandler>>,
}

impl AllocationOptions {
    pub fn with_peer_handler(handler: Arc<dyn PeerHandler>) -> Self {
        Self { peer_handler: Some(handler) }
    }
}

impl fmt::Debug for AllocationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocationOptions")
            .field("peer_handler", &self.peer_handler.is_some())
            .finish()
    }
}

/// Allocator counters
#[derive(Debug, Default)]
struct AllocatorStats {
    allocations_created: AtomicU64,
    allocations_removed: AtomicU64,
    allocations_expired: AtomicU64,
    permissions_expired: AtomicU64,
    mismatches: AtomicU64,
    permission_denials: AtomicU64,
    port_failures: AtomicU64,
    bytes_relayed: AtomicU64,
    bytes_received: AtomicU64,
    packets_dropped: AtomicU64,
    collect_runs: AtomicU64,
}

/// Snapshot of allocator counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AllocatorStatsSnapshot {
    pub active_allocations: u64,
    pub allocations_created: u64,
    pub allocations_removed: u64,
    pub allocations_expired: u64,
    pub permissions_expired: u64,
    pub mismatches: u64,
    pub permission_denials: u64,
    pub port_failures: u64,
    pub bytes_relayed: u64,
    pub bytes_received: u64,
    pub packets_dropped: u64,
    pub collect_runs: u64,
}

struct Shared {
    allocations: ParkingMutex<HashMap<FiveTuple, Allocation>>,
    stats: AllocatorStats,
}

/// Allocation table coordinator.
///
/// Cloning is cheap and every clone operates on the same table.
#[derive(Clone)]
pub struct Allocator {
    ports: Arc<dyn PortAllocator>,
    shared: Arc<Shared>,
}

impl Allocator {
    pub fn new(ports: Arc<dyn PortAllocator>) -> Self {
        Self {
            ports,
            shared: Arc::new(Shared {
                allocations: ParkingMutex::new(HashMap::new()),
                stats: AllocatorStats::default(),
            }),
        }
    }

    /// Allocator binding real UDP relay sockets per `config`
    pub fn from_config(config: &RelayConfig) -> AllocatorResult<Self> {
        config.validate()?;

        let ports = NetPortAllocator::new(
            UdpBinder,
            config.base_addr(),
            config.max_port,
            config.max_bind_attempts,
        )?;

        info!(
            "Relay ports {}..={} on {} ({} bind attempts)",
            config.base_port + 1,
            config.max_port,
            config.relay_ip,
            config.max_bind_attempts
        );

        Ok(Self::new(Arc::new(ports)))
    }

    fn mismatch(&self) -> AllocatorError {
        self.shared.stats.mismatches.fetch_add(1, Ordering::Relaxed);
        AllocatorError::AllocationMismatch
    }

    /// Create the allocation for `tuple` and return its relayed address.
    ///
    /// Fails with `AllocationMismatch` if the tuple is already allocated; the
    /// existing allocation is left as is. Port allocator errors come back
    /// unchanged inside [`AllocatorError::Port`].
    #[instrument(skip(self, options), level = "debug")]
    pub async fn create_allocation(
        &self,
        tuple: FiveTuple,
        expires_at: Instant,
        options: AllocationOptions,
    ) -> AllocatorResult<Addr> {
        if self.shared.allocations.lock().contains_key(&tuple) {
            debug!("Allocation for {} already exists", tuple);
            return Err(self.mismatch());
        }

        let conn = match self.ports.allocate(&tuple).await {
            Ok(conn) => conn,
            Err(e) => {
                self.shared.stats.port_failures.fetch_add(1, Ordering::Relaxed);
                warn!("Failed to allocate relayed address for {}: {}", tuple, e);
                return Err(e.into());
            }
        };
        let relayed = conn.local_addr();

        let mut allocations = self.shared.allocations.lock();
        if allocations.contains_key(&tuple) {
            drop(allocations);
            debug!("Concurrent allocation for {} won, releasing {}", tuple, relayed);
            return Err(self.mismatch());
        }

        let mut allocation = Allocation::new(tuple, conn.clone(), expires_at);
        if let Some(handler) = options.peer_handler {
            let reader = spawn_reader(Arc::downgrade(&self.shared), tuple, conn, handler);
            allocation.attach_reader(reader);
        }
        allocations.insert(tuple, allocation);
        drop(allocations);

        self.shared.stats.allocations_created.fetch_add(1, Ordering::Relaxed);
        info!("Allocation created: {} -> {}", tuple, relayed);

        Ok(relayed)
    }

    fn with_allocation<T>(
        &self,
        tuple: &FiveTuple,
        f: impl FnOnce(&mut Allocation) -> T,
    ) -> AllocatorResult<T> {
        let mut allocations = self.shared.allocations.lock();
        match allocations.get_mut(tuple) {
            Some(allocation) => Ok(f(allocation)),
            None => Err(self.mismatch()),
        }
    }

    /// Install or overwrite the permission for `peer_ip`.
    ///
    /// The allocation is kept alive at least until `expires_at`; its own
    /// expiry only ever moves forward here.
    #[instrument(skip(self), level = "debug")]
    pub fn create_permission(
        &self,
        tuple: &FiveTuple,
        peer_ip: IpAddr,
        expires_at: Instant,
    ) -> AllocatorResult<()> {
        self.with_allocation(tuple, |allocation| {
            allocation.set_permission(peer_ip, expires_at);
            allocation.extend_expiry(expires_at);
        })?;
        debug!("Permission {} on {}", peer_ip, tuple);
        Ok(())
    }

    /// Set the permission for `peer_ip` to expire at exactly `expires_at`.
    ///
    /// Same semantics as [`Allocator::create_permission`]: a missing
    /// permission is created rather than rejected, and the allocation expiry
    /// is advanced to `expires_at` if that is later.
    #[instrument(skip(self), level = "debug")]
    pub fn refresh(
        &self,
        tuple: &FiveTuple,
        peer_ip: IpAddr,
        expires_at: Instant,
    ) -> AllocatorResult<()> {
        self.with_allocation(tuple, |allocation| {
            allocation.set_permission(peer_ip, expires_at);
            allocation.extend_expiry(expires_at);
        })?;
        debug!("Refreshed permission {} on {}", peer_ip, tuple);
        Ok(())
    }

    /// Set the allocation's own expiry
    #[instrument(skip(self), level = "debug")]
    pub fn refresh_allocation(
        &self,
        tuple: &FiveTuple,
        expires_at: Instant,
    ) -> AllocatorResult<()> {
        self.with_allocation(tuple, |allocation| allocation.set_expiry(expires_at))?;
        debug!("Refreshed allocation {}", tuple);
        Ok(())
    }

    /// Relay `payload` from the session owned by `client` to `peer`.
    ///
    /// Returns the number of bytes handed to the relay socket.
    pub async fn send(&self, client: &Addr, peer: &Addr, payload: &[u8]) -> AllocatorResult<usize> {
        let conn = {
            let allocations = self.shared.allocations.lock();
            let allocation = match allocations.values().find(|a| a.tuple().client == *client) {
                Some(allocation) => allocation,
                None => return Err(self.mismatch()),
            };
            if !allocation.has_permission(&peer.ip) {
                self.shared.stats.permission_denials.fetch_add(1, Ordering::Relaxed);
                trace!("No permission for {} on {}", peer.ip, allocation.tuple());
                return Err(AllocatorError::PermissionNotFound);
            }
            allocation.conn()
        };

        let sent = conn
            .send_to(payload, peer.socket_addr())
            .await
            .map_err(AllocatorError::Transport)?;

        self.shared.stats.bytes_relayed.fetch_add(sent as u64, Ordering::Relaxed);
        trace!("Relayed {} bytes {} -> {} via {}", sent, client, peer, conn.local_addr());
        Ok(sent)
    }

    /// Reclaim allocations and permissions expired at or before `now`.
    ///
    /// Best effort, never fails. Expired sockets are released after the
    /// table lock is dropped. A socket shared with an inbound reader is closed
    /// once the runtime next polls the aborted reader task.
    pub fn collect(&self, now: Instant) {
        let mut reclaimed = Vec::new();
        let mut permissions = 0;

        {
            let mut allocations = self.shared.allocations.lock();
            let expired: Vec<FiveTuple> = allocations
                .iter()
                .filter(|(_, a)| a.is_expired(now))
                .map(|(tuple, _)| *tuple)
                .collect();

            for tuple in expired {
                if let Some(allocation) = allocations.remove(&tuple) {
                    reclaimed.push(allocation);
                }
            }

            for allocation in allocations.values_mut() {
                permissions += allocation.collect_permissions(now);
            }
        }

        let stats = &self.shared.stats;
        stats.collect_runs.fetch_add(1, Ordering::Relaxed);
        stats.allocations_expired.fetch_add(reclaimed.len() as u64, Ordering::Relaxed);
        stats.permissions_expired.fetch_add(permissions as u64, Ordering::Relaxed);

        for allocation in &reclaimed {
            debug!("Allocation {} expired, releasing {}", allocation.tuple(), allocation.relayed());
        }
        if !reclaimed.is_empty() || permissions > 0 {
            info!("Collected {} allocations and {} permissions", reclaimed.len(), permissions);
        }
    }

    /// Delete the allocation for `tuple`; returns whether one existed.
    ///
    /// As with [`Allocator::collect`], a relayed socket with an inbound reader
    /// is closed once the aborted reader is next polled, not on return.
    pub fn remove(&self, tuple: &FiveTuple) -> bool {
        let removed = self.shared.allocations.lock().remove(tuple);

        match removed {
            Some(allocation) => {
                self.shared.stats.allocations_removed.fetch_add(1, Ordering::Relaxed);
                info!("Allocation {} removed, releasing {}", tuple, allocation.relayed());
                true
            }
            None => false,
        }
    }

    pub fn allocation(&self, tuple: &FiveTuple) -> Option<AllocationInfo> {
        self.shared.allocations.lock().get(tuple).map(Allocation::info)
    }

    pub fn len(&self) -> usize {
        self.shared.allocations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> AllocatorStatsSnapshot {
        let stats = &self.shared.stats;
        AllocatorStatsSnapshot {
            active_allocations: self.len() as u64,
            allocations_created: stats.allocations_created.load(Ordering::Relaxed),
            allocations_removed: stats.allocations_removed.load(Ordering::Relaxed),
            allocations_expired: stats.allocations_expired.load(Ordering::Relaxed),
            permissions_expired: stats.permissions_expired.load(Ordering::Relaxed),
            mismatches: stats.mismatches.load(Ordering::Relaxed),
            permission_denials: stats.permission_denials.load(Ordering::Relaxed),
            port_failures: stats.port_failures.load(Ordering::Relaxed),
            bytes_relayed: stats.bytes_relayed.load(Ordering::Relaxed),
            bytes_received: stats.bytes_received.load(Ordering::Relaxed),
            packets_dropped: stats.packets_dropped.load(Ordering::Relaxed),
            collect_runs: stats.collect_runs.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for Allocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocator")
            .field("allocations", &self.len())
            .finish()
    }
}

fn spawn_reader(
    shared: Weak<Shared>,
    tuple: FiveTuple,
    conn: Arc<dyn RelayConn>,
    handler: Arc<dyn PeerHandler>,
) -> JoinHandle<()> {
    tokio::spawn(relay_inbound(shared, tuple, conn, handler))
}

/// Deliver datagrams arriving on a relayed address to the handler, dropping
/// those from peers without a permission. Ends once the allocation is gone.
async fn relay_inbound(
    shared: Weak<Shared>,
    tuple: FiveTuple,
    conn: Arc<dyn RelayConn>,
    handler: Arc<dyn PeerHandler>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let (len, from) = match conn.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
            Err(e) => {
                debug!("Relay reader for {} stopped: {}", tuple, e);
                break;
            }
        };

        let shared = match shared.upgrade() {
            Some(shared) => shared,
            None => break,
        };

        let permitted = match shared.allocations.lock().get(&tuple) {
            Some(allocation) => allocation.has_permission(&from.ip()),
            None => break,
        };

        if !permitted {
            shared.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
            trace!("Dropped {} bytes from {} on {}: no permission", len, from, tuple);
            continue;
        }

        shared.stats.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
        handler.handle_peer_data(&tuple, Addr::udp(from), Bytes::copy_from_slice(&buf[..len]));
    }
}

/// Drive [`Allocator::collect`] every `period` until `shutdown` fires
pub async fn run_collector(allocator: Allocator, period: Duration, shutdown: CancellationToken) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!("Allocation collector started (every {:?})", period);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => allocator.collect(Instant::now()),
        }
    }

    info!("Allocation collector stopped");
}
