use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::QvmError;

/// Guest-side SSH port every session forwards to
pub const GUEST_SSH_PORT: u16 = 22;

/// User-mode NAT subnet handed to the guest
pub const GUEST_SUBNET: &str = "192.168.122.0/24";
pub const GUEST_DHCP_START: &str = "192.168.122.50";

/// Address of the host as seen from inside the guest
pub const HOST_FROM_GUEST: &str = "192.168.122.2";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// Where forwarded ports, the serial socket and VNC listen on the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BindScope {
    Loopback,
    /// `--public`
    AllInterfaces,
}

impl BindScope {
    /// Address as written into a QEMU `hostfwd=` rule (empty means any)
    pub fn hostfwd_addr(&self) -> &'static str {
        match self {
            BindScope::Loopback => "127.0.0.1",
            BindScope::AllInterfaces => "",
        }
    }

    /// Address for sockets QEMU listens on directly (serial, VNC)
    pub fn listen_addr(&self) -> &'static str {
        match self {
            BindScope::Loopback => "127.0.0.1",
            BindScope::AllInterfaces => "0.0.0.0",
        }
    }
}

/// One host→guest port forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ForwardRule {
    pub host_port: u16,
    pub guest_port: u16,
    pub proto: Protocol,
}

impl ForwardRule {
    pub fn tcp(host_port: u16, guest_port: u16) -> Self {
        Self {
            host_port,
            guest_port,
            proto: Protocol::Tcp,
        }
    }

    /// Parse port mapping from string: [tcp:|udp:]HOSTPORT:GUESTPORT
    pub fn parse(s: &str) -> Result<Self, QvmError> {
        let parts: Vec<&str> = s.trim().split(':').collect();

        let (proto, host_port_str, guest_port_str) = match parts.as_slice() {
            [host, guest] => (Protocol::Tcp, *host, *guest),
            [proto, host, guest] => {
                let proto = match proto.to_ascii_lowercase().as_str() {
                    "tcp" => Protocol::Tcp,
                    "udp" => Protocol::Udp,
                    other => {
                        return Err(QvmError::config(format!(
                            "invalid protocol '{}' in port mapping {} (expected tcp or udp)",
                            other, s
                        )))
                    }
                };
                (proto, *host, *guest)
            }
            _ => {
                return Err(QvmError::config(format!(
                    "invalid port mapping format: {} (expected [tcp:|udp:]HOST:GUEST)",
                    s
                )))
            }
        };

        let host_port = parse_port(host_port_str)
            .ok_or_else(|| QvmError::config(format!("invalid host port: {}", host_port_str)))?;
        let guest_port = parse_port(guest_port_str)
            .ok_or_else(|| QvmError::config(format!("invalid guest port: {}", guest_port_str)))?;

        Ok(Self {
            host_port,
            guest_port,
            proto,
        })
    }

    /// QEMU user-netdev `hostfwd=` value
    pub fn hostfwd(&self, scope: BindScope) -> String {
        format!(
            "{}:{}:{}-:{}",
            self.proto,
            scope.hostfwd_addr(),
            self.host_port,
            self.guest_port
        )
    }
}

fn parse_port(s: &str) -> Option<u16> {
    s.trim().parse::<u16>().ok().filter(|p| *p != 0)
}

/// Reject two forwards binding the same host port with the same protocol.
pub fn ensure_unique(rules: &[ForwardRule]) -> Result<(), QvmError> {
    let mut seen = HashSet::new();
    for rule in rules {
        if !seen.insert((rule.host_port, rule.proto)) {
            return Err(QvmError::config(format!(
                "host port {}/{} is forwarded more than once",
                rule.host_port, rule.proto
            )));
        }
    }
    Ok(())
}
