//! Host port allocation.
//!
//! [`PortAllocator`] is the single registry of ports handed out by this
//! process. It is passed explicitly to every component that needs a port;
//! nothing is shared across processes, so two concurrent qvm invocations can
//! still race for the same port.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::QvmError;

pub const DEFAULT_SCAN_LIMIT: u16 = 1000;

pub const SSH_BASE_PORT: u16 = 10022;
pub const SERIAL_BASE_PORT: u16 = 7000;
pub const VNC_BASE_PORT: u16 = 5900;
pub const VNC_SCAN_LIMIT: u16 = 100;
pub const WEB_CONSOLE_BASE_PORT: u16 = 6080;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PortRole {
    Ssh,
    Serial,
    Monitor,
    Vnc,
    WebConsole,
    /// Host side of a `-p` forward
    Forward,
}

impl std::fmt::Display for PortRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PortRole::Ssh => "ssh",
            PortRole::Serial => "serial",
            PortRole::Monitor => "monitor",
            PortRole::Vnc => "vnc",
            PortRole::WebConsole => "web-console",
            PortRole::Forward => "forward",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortRequest {
    /// User-supplied port, taken as-is
    Explicit(u16),
    /// Scan upward from this base
    Preferred(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAllocation {
    pub role: PortRole,
    pub requested: PortRequest,
    pub port: u16,
    pub auto_selected: bool,
}

/// Availability check for a single host port
pub trait PortProbe: Send + Sync {
    fn is_free(&self, port: u16) -> bool;
}

/// Probe by binding: a port is free when it can be bound on both the
/// wildcard and the loopback address.
#[derive(Debug, Default, Clone, Copy)]
pub struct BindProbe;

impl PortProbe for BindProbe {
    fn is_free(&self, port: u16) -> bool {
        [Ipv4Addr::UNSPECIFIED, Ipv4Addr::LOCALHOST]
            .into_iter()
            .all(|ip| TcpListener::bind(SocketAddrV4::new(ip, port)).is_ok())
    }
}

pub struct PortAllocator {
    probe: Box<dyn PortProbe>,
    scan_limit: u16,
    taken: BTreeMap<u16, PortRole>,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::with_probe(Box::new(BindProbe), DEFAULT_SCAN_LIMIT)
    }

    pub fn with_probe(probe: Box<dyn PortProbe>, scan_limit: u16) -> Self {
        Self {
            probe,
            scan_limit: scan_limit.max(1),
            taken: BTreeMap::new(),
        }
    }

    /// Allocate a port for `role` using the allocator's default scan bound.
    pub fn allocate(
        &mut self,
        role: PortRole,
        request: PortRequest,
    ) -> Result<PortAllocation, QvmError> {
        self.allocate_within(role, request, self.scan_limit)
    }

    /// Allocate with an explicit scan bound (e.g. VNC displays 0..100).
    pub fn allocate_within(
        &mut self,
        role: PortRole,
        request: PortRequest,
        limit: u16,
    ) -> Result<PortAllocation, QvmError> {
        let allocation = match request {
            PortRequest::Explicit(port) => self.claim_explicit(role, port)?,
            PortRequest::Preferred(base) => self.scan(role, base, limit.max(1))?,
        };
        debug!(
            role = %role,
            port = allocation.port,
            auto = allocation.auto_selected,
            "port allocated"
        );
        Ok(allocation)
    }

    fn claim_explicit(&mut self, role: PortRole, port: u16) -> Result<PortAllocation, QvmError> {
        if port == 0 {
            return Err(QvmError::config(format!("{} port must be non-zero", role)));
        }
        if let Some(owner) = self.taken.get(&port) {
            // reserved earlier for the same role, e.g. `--web-port`
            if *owner == role {
                return Ok(PortAllocation {
                    role,
                    requested: PortRequest::Explicit(port),
                    port,
                    auto_selected: false,
                });
            }
            return Err(QvmError::resource(format!(
                "port {} requested for {} is already assigned to {}",
                port, role, owner
            )));
        }
        self.taken.insert(port, role);
        Ok(PortAllocation {
            role,
            requested: PortRequest::Explicit(port),
            port,
            auto_selected: false,
        })
    }

    fn scan(&mut self, role: PortRole, base: u16, limit: u16) -> Result<PortAllocation, QvmError> {
        for offset in 0..limit {
            let Some(port) = base.checked_add(offset) else {
                break;
            };
            if port == 0 || self.taken.contains_key(&port) {
                continue;
            }
            if self.probe.is_free(port) {
                self.taken.insert(port, role);
                return Ok(PortAllocation {
                    role,
                    requested: PortRequest::Preferred(base),
                    port,
                    auto_selected: true,
                });
            }
        }
        Err(QvmError::resource(format!(
            "no free {} port in {}..{}",
            role,
            base,
            base.saturating_add(limit - 1)
        )))
    }

    /// Forget a port, e.g. after losing a probe-then-bind race.
    pub fn release(&mut self, port: u16) {
        self.taken.remove(&port);
    }

    /// Port currently assigned to `role`, if any
    pub fn assigned(&self, role: PortRole) -> Option<u16> {
        self.taken
            .iter()
            .find(|(_, r)| **r == role)
            .map(|(port, _)| *port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    struct Occupied(HashSet<u16>);

    impl PortProbe for Occupied {
        fn is_free(&self, port: u16) -> bool {
            !self.0.contains(&port)
        }
    }

    fn allocator(occupied: &[u16], limit: u16) -> PortAllocator {
        PortAllocator::with_probe(Box::new(Occupied(occupied.iter().copied().collect())), limit)
    }

    #[test]
    fn test_free_base_is_used() {
        let mut a = allocator(&[], 10);
        let got = a.allocate(PortRole::Serial, PortRequest::Preferred(7000)).unwrap();
        assert_eq!(got.port, 7000);
        assert!(got.auto_selected);
    }

    #[test]
    fn test_lowest_free_port_above_occupied_base() {
        let mut a = allocator(&[6080, 6081, 6083], 10);
        let got = a.allocate(PortRole::WebConsole, PortRequest::Preferred(6080)).unwrap();
        assert_eq!(got.port, 6082);
    }

    #[test]
    fn test_exhausted_scan_is_resource_error() {
        let mut a = allocator(&[7000, 7001, 7002], 3);
        let err = a.allocate(PortRole::Serial, PortRequest::Preferred(7000)).unwrap_err();
        assert!(matches!(err, QvmError::Resource(_)));
    }

    #[test]
    fn test_roles_never_share_a_port() {
        let mut a = allocator(&[], 10);
        let ssh = a.allocate(PortRole::Ssh, PortRequest::Preferred(7000)).unwrap();
        let serial = a.allocate(PortRole::Serial, PortRequest::Preferred(7000)).unwrap();
        assert_eq!(ssh.port, 7000);
        assert_eq!(serial.port, 7001);
        assert_eq!(a.assigned(PortRole::Serial), Some(7001));
    }

    #[test]
    fn test_explicit_port_taken_without_bind_check() {
        // Occupied on the host, but explicit requests skip the bind check
        let mut a = allocator(&[2222], 10);
        let got = a.allocate(PortRole::Ssh, PortRequest::Explicit(2222)).unwrap();
        assert_eq!(got.port, 2222);
        assert!(!got.auto_selected);
    }

    #[test]
    fn test_explicit_port_conflict_between_roles() {
        let mut a = allocator(&[], 10);
        a.allocate(PortRole::Ssh, PortRequest::Explicit(4444)).unwrap();
        let err = a.allocate(PortRole::Monitor, PortRequest::Explicit(4444)).unwrap_err();
        assert!(matches!(err, QvmError::Resource(_)));
    }

    #[test]
    fn test_explicit_reclaim_by_same_role() {
        let mut a = allocator(&[], 10);
        a.allocate(PortRole::WebConsole, PortRequest::Explicit(8888)).unwrap();
        let again = a.allocate(PortRole::WebConsole, PortRequest::Explicit(8888)).unwrap();
        assert_eq!(again.port, 8888);
        assert_eq!(a.assigned(PortRole::WebConsole), Some(8888));
    }

    #[test]
    fn test_release_makes_port_available_again() {
        let mut a = allocator(&[], 10);
        let first = a.allocate(PortRole::WebConsole, PortRequest::Preferred(6080)).unwrap();
        a.release(first.port);
        let again = a.allocate(PortRole::WebConsole, PortRequest::Preferred(6080)).unwrap();
        assert_eq!(first.port, again.port);
    }

    #[test]
    fn test_allocation_is_deterministic() {
        let run = || {
            let mut a = allocator(&[10022, 7000], 50);
            vec![
                a.allocate(PortRole::Ssh, PortRequest::Preferred(SSH_BASE_PORT)).unwrap(),
                a.allocate(PortRole::Serial, PortRequest::Preferred(SERIAL_BASE_PORT)).unwrap(),
            ]
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_scan_stops_at_u16_max() {
        let mut a = allocator(&[u16::MAX], 10);
        let err = a.allocate(PortRole::Serial, PortRequest::Preferred(u16::MAX)).unwrap_err();
        assert!(matches!(err, QvmError::Resource(_)));
    }

    #[test]
    fn test_bind_probe_detects_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!BindProbe.is_free(port));
    }
}
