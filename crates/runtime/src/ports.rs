//! Port allocation for tool servers.
//!
//! Availability is checked by binding and immediately dropping a listener.
//! The port is free again by the time the server binds it, so another
//! process can still grab it in between. The supervisor only accepts a port
//! once the server on it completes the handshake as the expected capability.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, TcpListener};

use tracing::debug;

use crate::{Error, Result};

/// How many consecutive ports are tried, starting at the preferred one.
pub const DEFAULT_SCAN_LIMIT: u16 = 100;

/// Check if a port is available by attempting to bind to it.
pub fn is_port_available(host: IpAddr, port: u16) -> bool {
    match TcpListener::bind((host, port)) {
        Ok(listener) => listener.local_addr().is_ok(),
        Err(_) => false,
    }
}

/// Finds bindable ports that no other server of the session has claimed.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    host: IpAddr,
    scan_limit: u16,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }
}

impl PortAllocator {
    pub fn new(host: IpAddr) -> Self {
        Self {
            host,
            scan_limit: DEFAULT_SCAN_LIMIT,
        }
    }

    pub fn with_scan_limit(mut self, scan_limit: u16) -> Self {
        self.scan_limit = scan_limit.max(1);
        self
    }

    /// Return `preferred` if it is unclaimed and bindable, otherwise the next
    /// such port above it. The returned port is added to `claimed`.
    pub fn allocate(&self, preferred: u16, claimed: &mut BTreeSet<u16>) -> Result<u16> {
        let end = preferred.saturating_add(self.scan_limit - 1);

        for port in preferred..=end {
            if port == 0 || claimed.contains(&port) {
                continue;
            }

            if is_port_available(self.host, port) {
                debug!(port, preferred, "allocated port");
                claimed.insert(port);
                return Ok(port);
            }
            debug!(port, "port unavailable on system, skipping");
        }

        Err(Error::NoPortAvailable {
            start: preferred,
            end,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[test]
    fn preferred_port_is_returned_when_free() {
        let port = free_port();
        let mut claimed = BTreeSet::new();
        let allocated = PortAllocator::default().allocate(port, &mut claimed).unwrap();
        assert_eq!(allocated, port);
        assert!(claimed.contains(&port));
    }

    #[test]
    fn claimed_ports_are_skipped() {
        let port = free_port();
        let mut claimed = BTreeSet::from([port]);
        let allocated = PortAllocator::default().allocate(port, &mut claimed).unwrap();
        assert_ne!(allocated, port);
        assert!(allocated > port);
        assert_eq!(claimed.len(), 2);
    }

    #[test]
    fn occupied_ports_are_skipped() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let busy = listener.local_addr().unwrap().port();
        let mut claimed = BTreeSet::new();
        let allocated = PortAllocator::default().allocate(busy, &mut claimed).unwrap();
        assert_ne!(allocated, busy);
        assert!(!claimed.contains(&busy));
    }

    #[test]
    fn exhausted_window_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let busy = listener.local_addr().unwrap().port();
        let mut claimed = BTreeSet::new();
        let err = PortAllocator::default()
            .with_scan_limit(1)
            .allocate(busy, &mut claimed)
            .unwrap_err();
        assert!(matches!(err, Error::NoPortAvailable { start, end } if start == busy && end == busy));
        assert!(claimed.is_empty());
    }

    #[test]
    fn window_stops_at_top_of_range() {
        let mut claimed = BTreeSet::from([u16::MAX]);
        let err = PortAllocator::default()
            .allocate(u16::MAX, &mut claimed)
            .unwrap_err();
        assert!(matches!(err, Error::NoPortAvailable { end: u16::MAX, .. }));
    }
}
