use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::network::{PortAllocation, PortRole};
use crate::utils;

/// On-disk description of a running session.
///
/// Written once the guest is reachable so a detached session can be found
/// again. Never consulted when allocating ports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: Uuid,
    /// Primary SSH alias, also the record's file stem
    pub name: String,
    pub pid: Option<u32>,
    pub ports: Vec<PortAllocation>,
    pub aliases: Vec<String>,
    pub web_console: Option<SocketAddr>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl SessionRecord {
    pub fn new(name: impl Into<String>, pid: Option<u32>, ports: Vec<PortAllocation>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            pid,
            ports,
            aliases: Vec::new(),
            web_console: None,
            started_at: chrono::Utc::now(),
        }
    }

    pub fn port(&self, role: PortRole) -> Option<u16> {
        self.ports.iter().find(|p| p.role == role).map(|p| p.port)
    }

    /// Whether the recorded hypervisor process still exists
    pub fn is_alive(&self) -> bool {
        self.pid.map(utils::is_process_alive).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::PortRequest;

    fn ssh_port(port: u16) -> PortAllocation {
        PortAllocation {
            role: PortRole::Ssh,
            requested: PortRequest::Preferred(10022),
            port,
            auto_selected: port != 10022,
        }
    }

    #[test]
    fn test_record_new() {
        let record = SessionRecord::new("freebsd-14.3", Some(42), vec![ssh_port(10023)]);
        assert_eq!(record.name, "freebsd-14.3");
        assert_eq!(record.port(PortRole::Ssh), Some(10023));
        assert_eq!(record.port(PortRole::Vnc), None);
        assert!(record.aliases.is_empty());
    }

    #[test]
    fn test_record_serialization() {
        let mut record = SessionRecord::new("alpine-3.20", None, vec![ssh_port(10022)]);
        record.aliases.push("box".to_string());

        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"role\":\"ssh\""));
        let back: SessionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(record, back);
    }

    #[test]
    fn test_liveness() {
        let mine = SessionRecord::new("a", Some(std::process::id()), vec![]);
        assert!(mine.is_alive());
        let none = SessionRecord::new("b", None, vec![]);
        assert!(!none.is_alive());
    }
}
