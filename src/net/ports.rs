//! Host port reservations.
//!
//! The daemon's own tcp listeners reserve their ports here before binding so
//! that nothing else on the host that allocates through the same table (e.g.
//! published container ports) can claim them.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Mutex;

use thiserror::Error;

use crate::net::address::Transport;

/// Errors raised by the port allocator.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("bind for {ip}:{port} failed: port is already allocated")]
    AlreadyAllocated { ip: IpAddr, port: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Reservation {
    proto: Transport,
    ip: IpAddr,
    port: u16,
}

impl Reservation {
    fn overlaps(&self, other: &Reservation) -> bool {
        self.proto == other.proto
            && self.port == other.port
            && (self.ip == other.ip || self.ip.is_unspecified() || other.ip.is_unspecified())
    }
}

/// Process-wide table of reserved `(proto, ip, port)` triples.
#[derive(Debug, Default)]
pub struct PortAllocator {
    reserved: Mutex<HashSet<Reservation>>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a specific port. Port 0 is dynamic and never reserved.
    ///
    /// An unspecified address (`0.0.0.0`, `::`) conflicts with every address
    /// on the same port.
    pub fn request_port(&self, proto: Transport, ip: IpAddr, port: u16) -> Result<(), PortError> {
        if port == 0 {
            return Ok(());
        }
        let wanted = Reservation { proto, ip, port };
        let mut reserved = self.reserved.lock().unwrap_or_else(|e| e.into_inner());
        if reserved.iter().any(|r| r.overlaps(&wanted)) {
            return Err(PortError::AlreadyAllocated { ip, port });
        }
        reserved.insert(wanted);
        tracing::debug!(%proto, %ip, port, "Port reserved");
        Ok(())
    }

    /// Release a previously reserved port. Unknown reservations are ignored.
    pub fn release_port(&self, proto: Transport, ip: IpAddr, port: u16) {
        let mut reserved = self.reserved.lock().unwrap_or_else(|e| e.into_inner());
        reserved.remove(&Reservation { proto, ip, port });
    }

    /// Whether the triple is currently held.
    pub fn is_reserved(&self, proto: Transport, ip: IpAddr, port: u16) -> bool {
        let probe = Reservation { proto, ip, port };
        let reserved = self.reserved.lock().unwrap_or_else(|e| e.into_inner());
        reserved.iter().any(|r| r.overlaps(&probe))
    }
}
