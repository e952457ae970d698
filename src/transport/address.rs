/// Loopback address factory
///
/// Virtual endpoints still need distinct identities. Addresses are minted on
/// 127.0.0.1 with ports counting up from a configurable start. Once the
/// ports of one host run out, minting moves on to the next host in 127/8.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// Usable hosts in 127/8, 127.0.0.1 through 127.255.255.254
const LOOPBACK_HOSTS: u64 = 0x00ff_fffe;

#[derive(Debug)]
pub struct LoopbackAddresses {
    start_port: u16,
    minted: AtomicU64,
}

impl LoopbackAddresses {
    pub fn new(start_port: u16) -> Self {
        Self {
            start_port,
            minted: AtomicU64::new(0),
        }
    }

    /// Mint the next address
    pub fn next(&self) -> SocketAddr {
        let n = self.minted.fetch_add(1, Ordering::Relaxed);
        let span = u64::from(u16::MAX - self.start_port) + 1;
        let (index, offset) = (n / span, n % span);
        let host = Self::host(index);
        if offset == 0 && index > 0 {
            warn!(
                "🚨 ports {}..=65535 exhausted, minting on {}",
                self.start_port, host
            );
        }
        SocketAddr::new(IpAddr::V4(host), self.start_port + offset as u16)
    }

    fn host(index: u64) -> Ipv4Addr {
        let offset = (index % LOOPBACK_HOSTS) as u32 + 1;
        Ipv4Addr::from(0x7f00_0000 | offset)
    }
}

impl Default for LoopbackAddresses {
    fn default() -> Self {
        Self::new(1)
    }
}
