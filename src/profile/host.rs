use std::path::Path;

use serde::Serialize;
use tracing::debug;

use crate::types::Arch;

const KVM_DEVICE: &str = "/dev/kvm";

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum HostPlatform {
    Linux,
    MacOs,
    Windows,
    Other,
}

/// KVM device state on Linux hosts
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KvmAccess {
    Missing,
    /// Present but not read-writable by the current user
    Denied,
    Usable,
}

/// Host facts consulted by the profile resolver.
///
/// Detection happens once, up front. The resolver only ever sees this value,
/// which keeps resolution a pure function and lets tests describe any host.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HostInfo {
    pub platform: HostPlatform,
    /// None when the host CPU is not one qvm can accelerate (e.g. ppc64)
    pub arch: Option<Arch>,
    pub kvm: KvmAccess,
    pub hvf: bool,
}

impl HostInfo {
    pub fn detect() -> Self {
        let platform = match std::env::consts::OS {
            "linux" => HostPlatform::Linux,
            "macos" => HostPlatform::MacOs,
            "windows" => HostPlatform::Windows,
            _ => HostPlatform::Other,
        };
        let arch = Arch::parse(std::env::consts::ARCH);
        let kvm = if platform == HostPlatform::Linux {
            kvm_access(Path::new(KVM_DEVICE))
        } else {
            KvmAccess::Missing
        };
        let hvf = platform == HostPlatform::MacOs && hvf_supported();

        let info = Self {
            platform,
            arch,
            kvm,
            hvf,
        };
        debug!(target: "profile", host = ?info, "detected host");
        info
    }

    pub fn is_windows(&self) -> bool {
        self.platform == HostPlatform::Windows
    }
}

fn kvm_access(dev: &Path) -> KvmAccess {
    if !dev.exists() {
        return KvmAccess::Missing;
    }
    match nix::unistd::access(dev, nix::unistd::AccessFlags::R_OK | nix::unistd::AccessFlags::W_OK) {
        Ok(()) => KvmAccess::Usable,
        Err(_) => KvmAccess::Denied,
    }
}

/// Hypervisor.framework availability (`sysctl kern.hv_support`)
fn hvf_supported() -> bool {
    std::process::Command::new("sysctl")
        .args(["-n", "kern.hv_support"])
        .output()
        .map(|out| out.status.success() && String::from_utf8_lossy(&out.stdout).trim() == "1")
        .unwrap_or(false)
}
