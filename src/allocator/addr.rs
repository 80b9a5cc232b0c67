// src/allocator/addr.rs
//! Endpoint identity types for the relay allocation table.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

/// Transport protocol of an endpoint or session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Proto {
    Udp,
    Tcp,
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proto::Udp => write!(f, "udp"),
            Proto::Tcp => write!(f, "tcp"),
        }
    }
}

/// Network endpoint: IP, port and transport.
///
/// Equality is structural over all three fields. Permission checks only look
/// at [`Addr::ip`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Addr {
    pub ip: IpAddr,
    pub port: u16,
    pub proto: Proto,
}

impl Addr {
    pub fn new(ip: impl Into<IpAddr>, port: u16, proto: Proto) -> Self {
        Self { ip: ip.into(), port, proto }
    }

    /// UDP endpoint from a socket address
    pub fn udp(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port(), Proto::Udp)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.socket_addr(), self.proto)
    }
}

/// Client/server/protocol triple identifying one relay session.
///
/// At most one allocation exists per distinct tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FiveTuple {
    pub client: Addr,
    pub server: Addr,
    pub proto: Proto,
}

impl FiveTuple {
    pub fn new(client: Addr, server: Addr, proto: Proto) -> Self {
        Self { client, server, proto }
    }
}

impl fmt::Display for FiveTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}->{}", self.proto, self.client.socket_addr(), self.server.socket_addr())
    }
}
