//! Launch plan composition.
//!
//! [`LaunchPlanBuilder`] is pure: it takes the resolved profile, the located
//! image and already-allocated ports, and produces an immutable
//! [`LaunchPlan`]. It spawns nothing and binds nothing.

use std::path::PathBuf;

use serde::Serialize;

use super::args::{
    DiskDrive, DisplayTarget, OptionList, PflashDrive, QemuOption, SerialTarget, SocketChardev,
    UserNetdev,
};
use crate::error::QvmError;
use crate::image::GuestImage;
use crate::network::{
    ensure_unique, BindScope, ForwardRule, PortAllocation, PortAllocator, PortRequest, PortRole,
    Protocol, GUEST_DHCP_START, GUEST_SSH_PORT, GUEST_SUBNET, SERIAL_BASE_PORT, SSH_BASE_PORT,
    VNC_BASE_PORT, VNC_SCAN_LIMIT,
};
use crate::profile::{HostInfo, HostPlatform, ResolvedProfile};
use crate::sync::SyncMapping;
use crate::types::{Arch, GuestSpec, OsFamily};

const SERIAL_CHARDEV_ID: &str = "serial0";
const NETDEV_ID: &str = "net0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VncSetting {
    Off,
    /// First display number to try
    Display(u16),
}

impl VncSetting {
    /// Parse `--vnc`: absent or empty means display 0, `off` disables.
    pub fn parse(value: Option<&str>) -> Result<Self, QvmError> {
        match value.map(str::trim) {
            None | Some("") => Ok(VncSetting::Display(0)),
            Some(v) if v.eq_ignore_ascii_case("off") => Ok(VncSetting::Off),
            Some(v) => match v.parse::<u16>() {
                Ok(n) if n < VNC_SCAN_LIMIT => Ok(VncSetting::Display(n)),
                _ => Err(QvmError::config(format!(
                    "invalid --vnc value '{}' (expected 0-{} or off)",
                    v,
                    VNC_SCAN_LIMIT - 1
                ))),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisplayOptions {
    pub vnc: VncSetting,
    pub web_console: bool,
    /// Explicit `--web-port`
    pub web_port: Option<u16>,
}

impl Default for DisplayOptions {
    fn default() -> Self {
        Self {
            vnc: VncSetting::Display(0),
            web_console: true,
            web_port: None,
        }
    }
}

impl DisplayOptions {
    pub fn bridge_enabled(&self) -> bool {
        self.vnc != VncSetting::Off && self.web_console
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LaunchFlags {
    pub public: bool,
    pub ipv6: bool,
    pub snapshot: bool,
    pub console: bool,
    pub debug: bool,
}

impl LaunchFlags {
    pub fn scope(&self) -> BindScope {
        if self.public {
            BindScope::AllInterfaces
        } else {
            BindScope::Loopback
        }
    }
}

/// User-requested ports; `None` means scan from the default base
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortRequests {
    pub ssh: Option<u16>,
    pub serial: Option<u16>,
    pub monitor: Option<u16>,
}

/// Host ports of one session, except the web console which is allocated
/// once the guest is ready
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionPorts {
    pub ssh: PortAllocation,
    /// None in console mode (serial goes to stdio)
    pub serial: Option<PortAllocation>,
    pub vnc: Option<PortAllocation>,
    pub monitor: Option<PortAllocation>,
}

impl SessionPorts {
    /// Claim every explicit port first (including `--web-port` and the host
    /// side of TCP forwards), then scan for the rest so a scan never takes a
    /// port the user asked for.
    pub fn allocate(
        allocator: &mut PortAllocator,
        requests: &PortRequests,
        forwards: &[ForwardRule],
        display: &DisplayOptions,
        console: bool,
    ) -> Result<Self, QvmError> {
        ensure_unique(forwards)?;

        let explicit = |allocator: &mut PortAllocator, role, port: Option<u16>| {
            port.map(|p| allocator.allocate(role, PortRequest::Explicit(p)))
                .transpose()
        };

        let ssh = explicit(allocator, PortRole::Ssh, requests.ssh)?;
        let serial = if console {
            None
        } else {
            explicit(allocator, PortRole::Serial, requests.serial)?
        };
        let monitor = explicit(allocator, PortRole::Monitor, requests.monitor)?;
        if display.bridge_enabled() {
            explicit(allocator, PortRole::WebConsole, display.web_port)?;
        }
        for rule in forwards.iter().filter(|f| f.proto == Protocol::Tcp) {
            allocator.allocate(PortRole::Forward, PortRequest::Explicit(rule.host_port))?;
        }

        let ssh = match ssh {
            Some(ssh) => ssh,
            None => allocator.allocate(PortRole::Ssh, PortRequest::Preferred(SSH_BASE_PORT))?,
        };
        let serial = match (serial, console) {
            (_, true) => None,
            (Some(serial), false) => Some(serial),
            (None, false) => Some(
                allocator.allocate(PortRole::Serial, PortRequest::Preferred(SERIAL_BASE_PORT))?,
            ),
        };
        let vnc = match display.vnc {
            VncSetting::Off => None,
            VncSetting::Display(n) => Some(allocator.allocate_within(
                PortRole::Vnc,
                PortRequest::Preferred(VNC_BASE_PORT + n),
                VNC_SCAN_LIMIT - n,
            )?),
        };

        Ok(Self {
            ssh,
            serial,
            vnc,
            monitor,
        })
    }

    pub fn all(&self) -> Vec<PortAllocation> {
        std::iter::once(self.ssh)
            .chain(self.serial)
            .chain(self.vnc)
            .chain(self.monitor)
            .collect()
    }

    /// VNC display number, if a framebuffer is exported
    pub fn vnc_display(&self) -> Option<u16> {
        self.vnc.map(|v| v.port - VNC_BASE_PORT)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceOverrides {
    /// `--nc`
    pub nic: Option<String>,
    /// `--disktype`
    pub disk_interface: Option<String>,
}

/// Everything needed to launch one session. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchPlan {
    name: String,
    os: OsFamily,
    host: HostInfo,
    profile: ResolvedProfile,
    image: GuestImage,
    ports: SessionPorts,
    forwards: Vec<ForwardRule>,
    sync: Vec<SyncMapping>,
    display: DisplayOptions,
    flags: LaunchFlags,
    options: OptionList,
    binary: String,
    serial_log: Option<PathBuf>,
    /// QEMU stdout/stderr; None in console mode
    output_log: Option<PathBuf>,
    arch: Arch,
}

impl LaunchPlan {
    /// Session name (`freebsd-14.3`, `openbsd-custom`, ...)
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn os(&self) -> OsFamily {
        self.os
    }

    pub fn host(&self) -> &HostInfo {
        &self.host
    }

    pub fn profile(&self) -> &ResolvedProfile {
        &self.profile
    }

    pub fn image(&self) -> &GuestImage {
        &self.image
    }

    pub fn ports(&self) -> &SessionPorts {
        &self.ports
    }

    pub fn forwards(&self) -> &[ForwardRule] {
        &self.forwards
    }

    pub fn sync(&self) -> &[SyncMapping] {
        &self.sync
    }

    pub fn display(&self) -> &DisplayOptions {
        &self.display
    }

    pub fn flags(&self) -> LaunchFlags {
        self.flags
    }

    pub fn options(&self) -> &[QemuOption] {
        self.options.as_slice()
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// Name of the QEMU binary, resolved against PATH at launch
    pub fn binary(&self) -> &str {
        &self.binary
    }

    pub fn serial_log(&self) -> Option<&PathBuf> {
        self.serial_log.as_ref()
    }

    pub fn output_log(&self) -> Option<&PathBuf> {
        self.output_log.as_ref()
    }

    pub fn argv(&self) -> Vec<String> {
        self.options.to_argv()
    }

    /// Printable command line
    pub fn command_line(&self) -> String {
        let mut words = vec![self.binary.clone()];
        words.extend(self.argv());
        shell_words::join(words)
    }
}

pub struct LaunchPlanBuilder {
    spec: GuestSpec,
    profile: ResolvedProfile,
    image: GuestImage,
    ports: SessionPorts,
    host: HostInfo,
    forwards: Vec<ForwardRule>,
    sync: Vec<SyncMapping>,
    display: DisplayOptions,
    flags: LaunchFlags,
    overrides: DeviceOverrides,
}

impl LaunchPlanBuilder {
    pub fn new(
        spec: GuestSpec,
        profile: ResolvedProfile,
        image: GuestImage,
        ports: SessionPorts,
        host: HostInfo,
    ) -> Self {
        Self {
            spec,
            profile,
            image,
            ports,
            host,
            forwards: Vec::new(),
            sync: Vec::new(),
            display: DisplayOptions::default(),
            flags: LaunchFlags::default(),
            overrides: DeviceOverrides::default(),
        }
    }

    pub fn forwards(mut self, forwards: Vec<ForwardRule>) -> Self {
        self.forwards = forwards;
        self
    }

    pub fn sync(mut self, mappings: Vec<SyncMapping>) -> Self {
        self.sync = mappings;
        self
    }

    pub fn display(mut self, display: DisplayOptions) -> Self {
        self.display = display;
        self
    }

    pub fn flags(mut self, flags: LaunchFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn overrides(mut self, overrides: DeviceOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn build(self) -> Result<LaunchPlan, QvmError> {
        let scope = self.flags.scope();
        let name = self.image.name.clone();

        let mut forwards = Vec::with_capacity(self.forwards.len() + 1);
        forwards.push(ForwardRule::tcp(self.ports.ssh.port, GUEST_SSH_PORT));
        forwards.extend(self.forwards.iter().copied());
        ensure_unique(&forwards)?;

        let mut opts = OptionList::new();

        // Serial
        let mut serial_log = None;
        match (&self.ports.serial, self.flags.console) {
            (_, true) => opts.push(QemuOption::Serial(SerialTarget::Stdio))?,
            (Some(serial), false) if self.flags.debug => {
                let log = self.image.work_dir.join(format!("{}.serial.log", name));
                opts.push(QemuOption::Chardev(SocketChardev {
                    id: SERIAL_CHARDEV_ID.into(),
                    host: scope.listen_addr().into(),
                    port: serial.port,
                    logfile: Some(log.clone()),
                }))?;
                opts.push(QemuOption::Serial(SerialTarget::Chardev(SERIAL_CHARDEV_ID.into())))?;
                serial_log = Some(log);
            }
            (Some(serial), false) => opts.push(QemuOption::Serial(SerialTarget::Tcp {
                addr: scope.listen_addr().into(),
                port: serial.port,
            }))?,
            (None, false) => {
                return Err(QvmError::config("serial port missing outside console mode"))
            }
        }

        opts.push(QemuOption::Name(name.clone()))?;
        opts.push(QemuOption::Smp(self.spec.vcpus.max(1)))?;
        opts.push(QemuOption::Memory(self.spec.memory_mb))?;

        opts.push(QemuOption::Netdev(UserNetdev {
            id: NETDEV_ID.into(),
            net: GUEST_SUBNET.into(),
            dhcp_start: GUEST_DHCP_START.into(),
            ipv6: self.flags.ipv6,
            forwards: forwards.iter().map(|f| f.hostfwd(scope)).collect(),
        }))?;

        let disk = match (&self.image.cached_base, self.flags.snapshot) {
            (Some(base), true) => base.clone(),
            _ => self.image.disk.clone(),
        };
        opts.push(QemuOption::Drive(DiskDrive {
            file: disk,
            interface: self
                .overrides
                .disk_interface
                .clone()
                .unwrap_or_else(|| self.profile.disk_interface.clone()),
            snapshot: self.flags.snapshot,
        }))?;

        if self.host.platform == HostPlatform::Windows && self.host.arch == Some(Arch::Aarch64) {
            opts.push(QemuOption::Audiodev {
                driver: "none".into(),
                id: "snd".into(),
            })?;
        }

        let nic = self
            .overrides
            .nic
            .clone()
            .unwrap_or_else(|| self.profile.nic_model.clone());
        opts.extend(self.machine_options(&nic)?)?;

        opts.push(QemuOption::Display(match self.ports.vnc_display() {
            Some(display) => DisplayTarget::Vnc {
                addr: scope.hostfwd_addr().into(),
                display,
            },
            None => DisplayTarget::None,
        }))?;

        if let Some(mon) = &self.ports.monitor {
            opts.push(QemuOption::Monitor { port: mon.port })?;
        }

        let output_log = (!self.flags.console)
            .then(|| self.image.work_dir.join(format!("{}.log", name)));

        Ok(LaunchPlan {
            name,
            os: self.spec.os,
            host: self.host,
            binary: self.spec.arch.qemu_binary().to_string(),
            arch: self.spec.arch,
            profile: self.profile,
            image: self.image,
            ports: self.ports,
            forwards,
            sync: self.sync,
            display: self.display,
            flags: self.flags,
            options: opts,
            serial_log,
            output_log,
        })
    }

    fn machine_options(&self, nic: &str) -> Result<Vec<QemuOption>, QvmError> {
        let accel = self.profile.accel.as_str();
        let kv = |pairs: &[(&str, &str)]| -> Vec<(String, String)> {
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
        };
        let mut opts = Vec::new();

        match self.spec.arch {
            Arch::X86_64 => {
                opts.push(QemuOption::Machine {
                    kind: "pc".into(),
                    props: kv(&[
                        ("accel", accel),
                        ("hpet", "off"),
                        ("smm", "off"),
                        ("graphics", "off"),
                        ("vmport", "off"),
                    ]),
                });
                opts.push(QemuOption::Cpu(self.profile.cpu_model.clone()));
                opts.push(QemuOption::Device {
                    driver: nic.into(),
                    props: kv(&[("netdev", NETDEV_ID), ("bus", "pci.0"), ("addr", "0x3")]),
                });
                opts.push(QemuOption::Device {
                    driver: "virtio-balloon-pci".into(),
                    props: kv(&[("bus", "pci.0"), ("addr", "0x6")]),
                });
                if let Some(pflash) = &self.image.pflash {
                    opts.push(QemuOption::Pflash(PflashDrive {
                        file: pflash.code.clone(),
                        readonly: true,
                        unit: None,
                    }));
                    opts.push(QemuOption::Pflash(PflashDrive {
                        file: pflash.vars.clone(),
                        readonly: false,
                        unit: None,
                    }));
                }
            }
            Arch::Aarch64 => {
                let pflash = self.image.pflash.as_ref().ok_or_else(|| {
                    QvmError::image("aarch64 guests need UEFI firmware files")
                })?;
                opts.push(QemuOption::Machine {
                    kind: "virt".into(),
                    props: kv(&[("accel", accel), ("gic-version", "3")]),
                });
                opts.push(QemuOption::Cpu(self.profile.cpu_model.clone()));
                opts.push(QemuOption::Device {
                    driver: nic.into(),
                    props: kv(&[("netdev", NETDEV_ID)]),
                });
                opts.push(QemuOption::Pflash(PflashDrive {
                    file: pflash.code.clone(),
                    readonly: true,
                    unit: None,
                }));
                opts.push(QemuOption::Pflash(PflashDrive {
                    file: pflash.vars.clone(),
                    readonly: false,
                    unit: Some(1),
                }));
            }
            Arch::Riscv64 => {
                let kernel = self.image.kernel.clone().ok_or_else(|| {
                    QvmError::image("riscv64 guests need the U-Boot kernel")
                })?;
                opts.push(QemuOption::Machine {
                    kind: "virt".into(),
                    props: kv(&[
                        ("accel", "tcg"),
                        ("graphics", "off"),
                        ("usb", "off"),
                        ("dump-guest-core", "off"),
                        ("acpi", "off"),
                    ]),
                });
                opts.push(QemuOption::Cpu(self.profile.cpu_model.clone()));
                opts.push(QemuOption::Device {
                    driver: nic.into(),
                    props: kv(&[("netdev", NETDEV_ID)]),
                });
                opts.push(QemuOption::Kernel(kernel));
                opts.push(QemuOption::Device {
                    driver: "virtio-balloon-pci".into(),
                    props: Vec::new(),
                });
            }
        }
        Ok(opts)
    }
}
