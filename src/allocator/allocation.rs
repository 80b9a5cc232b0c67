// src/allocator/allocation.rs
//! Per-session relay state: relayed socket, expiry and peer permissions.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;

use super::addr::{Addr, FiveTuple};
use super::port::RelayConn;

/// Authorization window for one peer IP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permission {
    pub peer_ip: IpAddr,
    pub expires_at: Instant,
}

impl Permission {
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

/// Server-side state of one relay session.
///
/// Only the allocator mutates it. The relayed address is fixed at creation.
#[derive(Debug)]
pub struct Allocation {
    tuple: FiveTuple,
    relayed: Addr,
    conn: Arc<dyn RelayConn>,
    expires_at: Instant,
    permissions: HashMap<IpAddr, Permission>,
    reader: Option<JoinHandle<()>>,
}

impl Allocation {
    pub(crate) fn new(tuple: FiveTuple, conn: Arc<dyn RelayConn>, expires_at: Instant) -> Self {
        Self {
            tuple,
            relayed: conn.local_addr(),
            conn,
            expires_at,
            permissions: HashMap::new(),
            reader: None,
        }
    }

    pub fn tuple(&self) -> &FiveTuple {
        &self.tuple
    }

    pub fn relayed(&self) -> Addr {
        self.relayed
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }

    pub(crate) fn conn(&self) -> Arc<dyn RelayConn> {
        self.conn.clone()
    }

    pub(crate) fn set_expiry(&mut self, expires_at: Instant) {
        self.expires_at = expires_at;
    }

    /// Move the expiry forward to `expires_at`; an earlier instant is ignored
    pub(crate) fn extend_expiry(&mut self, expires_at: Instant) {
        self.expires_at = self.expires_at.max(expires_at);
    }

    pub(crate) fn attach_reader(&mut self, reader: JoinHandle<()>) {
        if let Some(old) = self.reader.replace(reader) {
            old.abort();
        }
    }

    /// Insert or overwrite the permission for `peer_ip`
    pub(crate) fn set_permission(&mut self, peer_ip: IpAddr, expires_at: Instant) {
        self.permissions.insert(peer_ip, Permission { peer_ip, expires_at });
    }

    pub fn permission(&self, peer_ip: &IpAddr) -> Option<&Permission> {
        self.permissions.get(peer_ip)
    }

    pub fn has_permission(&self, peer_ip: &IpAddr) -> bool {
        self.permissions.contains_key(peer_ip)
    }

    /// Drop expired permissions, returning how many were removed
    pub(crate) fn collect_permissions(&mut self, now: Instant) -> usize {
        let before = self.permissions.len();
        self.permissions.retain(|_, p| !p.is_expired(now));
        before - self.permissions.len()
    }

    pub fn info(&self) -> AllocationInfo {
        let mut permissions: Vec<Permission> = self.permissions.values().copied().collect();
        permissions.sort_by_key(|p| p.expires_at);

        AllocationInfo {
            tuple: self.tuple,
            relayed: self.relayed,
            expires_at: self.expires_at,
            permissions,
        }
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        // Reader task holds a clone of the socket; it is released once the
        // runtime polls the aborted task
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Point-in-time copy of an allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationInfo {
    pub tuple: FiveTuple,
    pub relayed: Addr,
    pub expires_at: Instant,
    /// Ordered by expiry, soonest first
    pub permissions: Vec<Permission>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::addr::Proto;
    use crate::allocator::port::MemoryConn;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn allocation(expires_at: Instant) -> Allocation {
        let ip = Ipv4Addr::new(127, 0, 0, 1);
        let tuple = FiveTuple::new(
            Addr::new(ip, 200, Proto::Udp),
            Addr::new(ip, 300, Proto::Udp),
            Proto::Udp,
        );
        let conn = Arc::new(MemoryConn::new(Addr::new(ip, 5101, Proto::Udp)));
        Allocation::new(tuple, conn, expires_at)
    }

    #[test]
    fn test_expiry_is_inclusive() {
        let now = Instant::now();
        let alloc = allocation(now + Duration::from_secs(10));

        assert!(!alloc.is_expired(now));
        assert!(alloc.is_expired(now + Duration::from_secs(10)));
        assert_eq!(alloc.relayed().port, 5101);
    }

    #[test]
    fn test_extend_expiry_never_retreats() {
        let now = Instant::now();
        let mut alloc = allocation(now + Duration::from_secs(10));

        alloc.extend_expiry(now + Duration::from_secs(15));
        assert_eq!(alloc.expires_at(), now + Duration::from_secs(15));

        alloc.extend_expiry(now + Duration::from_secs(5));
        assert_eq!(alloc.expires_at(), now + Duration::from_secs(15));
    }

    #[test]
    fn test_permission_overwrite_and_collect() {
        let now = Instant::now();
        let mut alloc = allocation(now + Duration::from_secs(60));
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();

        alloc.set_permission(a, now + Duration::from_secs(10));
        alloc.set_permission(a, now + Duration::from_secs(5));
        alloc.set_permission(b, now + Duration::from_secs(20));

        assert_eq!(alloc.permission(&a).unwrap().expires_at, now + Duration::from_secs(5));

        assert_eq!(alloc.collect_permissions(now + Duration::from_secs(5)), 1);
        assert!(!alloc.has_permission(&a));
        assert!(alloc.has_permission(&b));

        let info = alloc.info();
        assert_eq!(info.permissions.len(), 1);
        assert_eq!(info.permissions[0].peer_ip, b);
    }
}
