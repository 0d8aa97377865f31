//! Typed QEMU command-line options.
//!
//! Every option the launcher emits is one [`QemuOption`] value. An
//! [`OptionList`] collects them, rejects conflicting singletons, drops exact
//! duplicates, and serializes everything to argv in one pass.

use std::fmt::Write as _;
use std::path::PathBuf;

use serde::Serialize;

use crate::error::QvmError;

/// Escape a value for a QEMU `key=value,...` list (commas are doubled)
fn esc(value: &str) -> String {
    value.replace(',', ",,")
}

fn path_value(path: &std::path::Path) -> String {
    esc(&path.to_string_lossy())
}

fn props(out: &mut String, props: &[(String, String)]) {
    for (k, v) in props {
        let _ = write!(out, ",{}={}", k, v);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialTarget {
    /// Serial multiplexed with the monitor on the launcher's terminal
    Stdio,
    /// TCP server socket
    Tcp { addr: String, port: u16 },
    /// Routed through a `-chardev` with the given id
    Chardev(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayTarget {
    None,
    Vnc { addr: String, display: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserNetdev {
    pub id: String,
    pub net: String,
    pub dhcp_start: String,
    pub ipv6: bool,
    /// Already-rendered `hostfwd=` values, in order
    pub forwards: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskDrive {
    pub file: PathBuf,
    pub interface: String,
    pub snapshot: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PflashDrive {
    pub file: PathBuf,
    pub readonly: bool,
    pub unit: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SocketChardev {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub logfile: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QemuOption {
    Name(String),
    Smp(u32),
    Memory(u32),
    Machine { kind: String, props: Vec<(String, String)> },
    Cpu(String),
    Netdev(UserNetdev),
    Device { driver: String, props: Vec<(String, String)> },
    Drive(DiskDrive),
    Pflash(PflashDrive),
    Kernel(PathBuf),
    Serial(SerialTarget),
    Chardev(SocketChardev),
    Display(DisplayTarget),
    Monitor { port: u16 },
    Audiodev { driver: String, id: String },
}

impl QemuOption {
    /// Identity used for conflict detection. Options sharing a key may appear
    /// only once; `None` means freely repeatable.
    fn key(&self) -> Option<String> {
        match self {
            QemuOption::Name(_) => Some("name".into()),
            QemuOption::Smp(_) => Some("smp".into()),
            QemuOption::Memory(_) => Some("m".into()),
            QemuOption::Machine { .. } => Some("machine".into()),
            QemuOption::Cpu(_) => Some("cpu".into()),
            QemuOption::Kernel(_) => Some("kernel".into()),
            QemuOption::Serial(_) => Some("serial".into()),
            QemuOption::Display(_) => Some("display".into()),
            QemuOption::Monitor { .. } => Some("monitor".into()),
            QemuOption::Netdev(n) => Some(format!("netdev:{}", n.id)),
            QemuOption::Chardev(c) => Some(format!("chardev:{}", c.id)),
            QemuOption::Audiodev { id, .. } => Some(format!("audiodev:{}", id)),
            QemuOption::Pflash(p) => p.unit.map(|u| format!("pflash:{}", u)),
            QemuOption::Device { .. } | QemuOption::Drive(_) => None,
        }
    }

    fn flag(&self) -> &'static str {
        match self {
            QemuOption::Name(_) => "-name",
            QemuOption::Smp(_) => "-smp",
            QemuOption::Memory(_) => "-m",
            QemuOption::Machine { .. } => "-machine",
            QemuOption::Cpu(_) => "-cpu",
            QemuOption::Netdev(_) => "-netdev",
            QemuOption::Device { .. } => "-device",
            QemuOption::Drive(_) | QemuOption::Pflash(_) => "-drive",
            QemuOption::Kernel(_) => "-kernel",
            QemuOption::Serial(_) => "-serial",
            QemuOption::Chardev(_) => "-chardev",
            QemuOption::Display(_) => "-display",
            QemuOption::Monitor { .. } => "-monitor",
            QemuOption::Audiodev { .. } => "-audiodev",
        }
    }

    fn value(&self) -> String {
        match self {
            QemuOption::Name(n) => n.clone(),
            QemuOption::Smp(n) => n.to_string(),
            QemuOption::Memory(mb) => mb.to_string(),
            QemuOption::Machine { kind, props: p } => {
                let mut s = kind.clone();
                props(&mut s, p);
                s
            }
            QemuOption::Cpu(model) => model.clone(),
            QemuOption::Netdev(n) => {
                let mut s = format!(
                    "user,id={},net={},dhcpstart={}",
                    n.id, n.net, n.dhcp_start
                );
                if !n.ipv6 {
                    s.push_str(",ipv6=off");
                }
                for fwd in &n.forwards {
                    let _ = write!(s, ",hostfwd={}", fwd);
                }
                s
            }
            QemuOption::Device { driver, props: p } => {
                let mut s = driver.clone();
                props(&mut s, p);
                s
            }
            QemuOption::Drive(d) => {
                let mut s = format!("file={},format=qcow2,if={}", path_value(&d.file), d.interface);
                if d.snapshot {
                    s.push_str(",snapshot=on");
                }
                s
            }
            QemuOption::Pflash(p) => {
                let mut s = String::from("if=pflash,format=raw");
                if p.readonly {
                    s.push_str(",readonly=on");
                }
                let _ = write!(s, ",file={}", path_value(&p.file));
                if let Some(unit) = p.unit {
                    let _ = write!(s, ",unit={}", unit);
                }
                s
            }
            QemuOption::Kernel(path) => path.to_string_lossy().into_owned(),
            QemuOption::Serial(SerialTarget::Stdio) => "mon:stdio".to_string(),
            QemuOption::Serial(SerialTarget::Tcp { addr, port }) => {
                format!("tcp:{}:{},server,nowait", addr, port)
            }
            QemuOption::Serial(SerialTarget::Chardev(id)) => format!("chardev:{}", id),
            QemuOption::Chardev(c) => {
                let mut s = format!(
                    "socket,id={},host={},port={},server=on,wait=off",
                    c.id, c.host, c.port
                );
                if let Some(log) = &c.logfile {
                    let _ = write!(s, ",logfile={}", path_value(log));
                }
                s
            }
            QemuOption::Display(DisplayTarget::None) => "none".to_string(),
            QemuOption::Display(DisplayTarget::Vnc { addr, display }) => {
                format!("vnc={}:{}", addr, display)
            }
            QemuOption::Monitor { port } => {
                format!("telnet:localhost:{},server,nowait,nodelay", port)
            }
            QemuOption::Audiodev { driver, id } => format!("{},id={}", driver, id),
        }
    }
}

/// Ordered, validated option set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OptionList {
    opts: Vec<QemuOption>,
}

impl OptionList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an option. Exact repeats are dropped; a different value for a
    /// single-use option is a configuration error.
    pub fn push(&mut self, opt: QemuOption) -> Result<(), QvmError> {
        if self.opts.contains(&opt) {
            return Ok(());
        }
        if let Some(key) = opt.key() {
            if self.opts.iter().any(|o| o.key().as_deref() == Some(key.as_str())) {
                return Err(QvmError::config(format!(
                    "conflicting values for QEMU option {}",
                    key
                )));
            }
        }
        self.opts.push(opt);
        Ok(())
    }

    pub fn extend(&mut self, opts: impl IntoIterator<Item = QemuOption>) -> Result<(), QvmError> {
        for opt in opts {
            self.push(opt)?;
        }
        Ok(())
    }

    pub fn as_slice(&self) -> &[QemuOption] {
        &self.opts
    }

    pub fn to_argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.opts.len() * 2);
        for opt in &self.opts {
            argv.push(opt.flag().to_string());
            argv.push(opt.value());
        }
        argv
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_serialization() {
        let mut list = OptionList::new();
        list.extend([
            QemuOption::Name("freebsd-14.3".into()),
            QemuOption::Machine {
                kind: "pc".into(),
                props: kv(&[("accel", "kvm"), ("hpet", "off")]),
            },
            QemuOption::Netdev(UserNetdev {
                id: "net0".into(),
                net: "192.168.122.0/24".into(),
                dhcp_start: "192.168.122.50".into(),
                ipv6: false,
                forwards: vec!["tcp:127.0.0.1:10022-:22".into()],
            }),
            QemuOption::Serial(SerialTarget::Tcp { addr: "127.0.0.1".into(), port: 7000 }),
            QemuOption::Monitor { port: 4444 },
        ])
        .unwrap();

        assert_eq!(
            list.to_argv(),
            vec![
                "-name",
                "freebsd-14.3",
                "-machine",
                "pc,accel=kvm,hpet=off",
                "-netdev",
                "user,id=net0,net=192.168.122.0/24,dhcpstart=192.168.122.50,ipv6=off,hostfwd=tcp:127.0.0.1:10022-:22",
                "-serial",
                "tcp:127.0.0.1:7000,server,nowait",
                "-monitor",
                "telnet:localhost:4444,server,nowait,nodelay",
            ]
        );
    }

    #[test]
    fn test_drive_paths_escape_commas() {
        let opt = QemuOption::Drive(DiskDrive {
            file: PathBuf::from("/data/a,b.qcow2"),
            interface: "virtio".into(),
            snapshot: true,
        });
        assert_eq!(opt.value(), "file=/data/a,,b.qcow2,format=qcow2,if=virtio,snapshot=on");
    }

    #[test]
    fn test_pflash() {
        let code = QemuOption::Pflash(PflashDrive {
            file: PathBuf::from("/fw/code.fd"),
            readonly: true,
            unit: None,
        });
        let vars = QemuOption::Pflash(PflashDrive {
            file: PathBuf::from("/fw/vars.fd"),
            readonly: false,
            unit: Some(1),
        });
        assert_eq!(code.value(), "if=pflash,format=raw,readonly=on,file=/fw/code.fd");
        assert_eq!(vars.value(), "if=pflash,format=raw,file=/fw/vars.fd,unit=1");
    }

    #[test]
    fn test_exact_duplicates_dropped() {
        let mut list = OptionList::new();
        let balloon = QemuOption::Device { driver: "virtio-balloon-pci".into(), props: vec![] };
        list.push(balloon.clone()).unwrap();
        list.push(balloon).unwrap();
        assert_eq!(list.as_slice().len(), 1);
    }

    #[test]
    fn test_conflicting_singleton_rejected() {
        let mut list = OptionList::new();
        list.push(QemuOption::Memory(2048)).unwrap();
        let err = list.push(QemuOption::Memory(4096)).unwrap_err();
        assert!(matches!(err, QvmError::Config(_)));
    }

    #[test]
    fn test_serial_variants() {
        assert_eq!(QemuOption::Serial(SerialTarget::Stdio).value(), "mon:stdio");
        assert_eq!(
            QemuOption::Serial(SerialTarget::Chardev("serial0".into())).value(),
            "chardev:serial0"
        );
        let chardev = QemuOption::Chardev(SocketChardev {
            id: "serial0".into(),
            host: "0.0.0.0".into(),
            port: 7001,
            logfile: Some(PathBuf::from("/out/vm.serial.log")),
        });
        assert_eq!(
            chardev.value(),
            "socket,id=serial0,host=0.0.0.0,port=7001,server=on,wait=off,logfile=/out/vm.serial.log"
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(QemuOption::Display(DisplayTarget::None).value(), "none");
        assert_eq!(
            QemuOption::Display(DisplayTarget::Vnc { addr: "".into(), display: 3 }).value(),
            "vnc=:3"
        );
    }
}
