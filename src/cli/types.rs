use std::path::{Path, PathBuf};
use std::time::Duration;

use super::args::Cli;
use crate::error::QvmError;
use crate::network::ForwardRule;
use crate::profile::ResolveOptions;
use crate::qemu::{DeviceOverrides, DisplayOptions, LaunchFlags, PortRequests, VncSetting};
use crate::session::AfterReady;
use crate::ssh::config::validate_alias;
use crate::sync::SyncPlanner;
use crate::types::{Arch, GuestSpec, OsFamily};

/// Validated form of the command line. Building it touches nothing outside
/// the process.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub spec: GuestSpec,
    pub resolve: ResolveOptions,
    pub ports: PortRequests,
    pub forwards: Vec<ForwardRule>,
    pub sync: SyncPlanner,
    pub display: DisplayOptions,
    pub flags: LaunchFlags,
    pub overrides: DeviceOverrides,
    pub ssh_names: Vec<String>,
    pub host_ssh_port: Option<u16>,
    pub boot_timeout: Duration,
    pub after_ready: AfterReady,
}

impl Cli {
    /// Validate everything that can be checked before launch.
    ///
    /// `default_arch` is used when `--arch` is absent, `cwd` anchors relative
    /// `-v` host paths.
    pub fn into_request(self, default_arch: Arch, cwd: &Path) -> Result<RunRequest, QvmError> {
        let os: OsFamily = self.os.parse()?;
        let arch = match self.arch.as_deref() {
            Some(a) => a.parse()?,
            None => default_arch,
        };

        let mut spec = GuestSpec::new(os, arch);
        spec.release = self.release.filter(|r| !r.trim().is_empty());
        spec.memory_mb = self.mem;
        spec.vcpus = self.cpu.unwrap_or_else(host_cores).max(1);
        spec.cpu_model = self.cpu_type;
        spec.image = self
            .qcow2
            .map(|p| PathBuf::from(shellexpand::tilde(&p).as_ref()));

        for alias in &self.ssh_names {
            validate_alias(alias)?;
        }

        let forwards = self
            .publish
            .iter()
            .map(|s| ForwardRule::parse(s))
            .collect::<Result<Vec<_>, _>>()?;

        let sync = SyncPlanner::validate(&self.sync, &self.volumes, cwd)?;

        let display = DisplayOptions {
            vnc: VncSetting::parse(self.vnc.as_deref())?,
            web_console: !self.no_web_console,
            web_port: self.web_port,
        };

        let after_ready = if !self.command.is_empty() {
            AfterReady::Command(self.command)
        } else if self.detach {
            AfterReady::Detach
        } else if self.console {
            AfterReady::Console
        } else {
            AfterReady::Interactive
        };

        Ok(RunRequest {
            spec,
            resolve: ResolveOptions {
                force_uefi: self.uefi,
                want_whpx: self.whpx,
            },
            ports: PortRequests {
                ssh: self.ssh_port,
                serial: self.serial,
                monitor: self.mon,
            },
            forwards,
            sync,
            display,
            flags: LaunchFlags {
                public: self.public,
                ipv6: self.enable_ipv6,
                snapshot: self.snapshot,
                console: self.console,
                debug: self.debug,
            },
            overrides: DeviceOverrides {
                nic: self.nic,
                disk_interface: self.disktype,
            },
            ssh_names: self.ssh_names,
            host_ssh_port: self.host_ssh_port,
            boot_timeout: Duration::from_secs(self.boot_timeout),
            after_ready,
        })
    }
}

fn host_cores() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}
