//! Guest profile resolution.
//!
//! Maps {os, release, arch} plus host facts to the image identity, firmware
//! mode, acceleration backend and device defaults for one launch. Everything
//! here is a pure lookup against [`table`]; no I/O happens after
//! [`HostInfo::detect`] has run.

pub mod host;
pub mod table;

pub use host::{HostInfo, HostPlatform, KvmAccess};

use serde::Serialize;
use tracing::{info, warn};

use crate::error::QvmError;
use crate::types::{Arch, GuestSpec, OsFamily};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Firmware {
    /// Legacy BIOS (SeaBIOS)
    Bios,
    Uefi,
    /// U-Boot loaded as the kernel (riscv64 virt)
    UBoot,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Accel {
    Kvm,
    Hvf,
    Whpx,
    Tcg,
}

impl Accel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Accel::Kvm => "kvm",
            Accel::Hvf => "hvf",
            Accel::Whpx => "whpx",
            Accel::Tcg => "tcg",
        }
    }

    pub fn is_hardware(&self) -> bool {
        !matches!(self, Accel::Tcg)
    }
}

/// User switches that influence resolution
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveOptions {
    /// `--uefi`: boot x86_64 guests through UEFI even if not required
    pub force_uefi: bool,
    /// `--whpx`: opt into WHPX on Windows hosts
    pub want_whpx: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ResolvedProfile {
    /// `<os>-<release>[-<arch>]`, names the image and the session
    pub image_id: String,
    pub release: String,
    pub firmware: Firmware,
    pub accel: Accel,
    pub disk_interface: String,
    pub nic_model: String,
    pub cpu_model: String,
}

/// Resolve a guest request against the compatibility table.
pub fn resolve(
    spec: &GuestSpec,
    host: &HostInfo,
    opts: ResolveOptions,
) -> Result<ResolvedProfile, QvmError> {
    let row = table::lookup(spec.os, spec.arch).ok_or_else(|| {
        let arches: Vec<&str> = table::supported_arches(spec.os)
            .iter()
            .map(Arch::as_str)
            .collect();
        QvmError::profile(format!(
            "{} is not available for {} (supported: {})",
            spec.os,
            spec.arch,
            arches.join(", ")
        ))
    })?;

    let release = match spec.release.as_deref().map(str::trim) {
        Some(r) if !r.is_empty() => {
            if !row.knows(r) {
                warn!(target: "profile", os = %spec.os, release = r, "release not in known list, using as given");
            }
            r.to_string()
        }
        _ => row
            .latest()
            .ok_or_else(|| QvmError::profile(format!("no releases known for {}", spec.os)))?
            .to_string(),
    };

    let firmware = match spec.arch {
        Arch::Aarch64 => Firmware::Uefi,
        Arch::Riscv64 => Firmware::UBoot,
        Arch::X86_64 if spec.os.requires_uefi() || opts.force_uefi => Firmware::Uefi,
        Arch::X86_64 => Firmware::Bios,
    };

    let accel = select_accel(host, spec.arch, opts.want_whpx);

    let mut image_id = format!("{}-{}", spec.os, release);
    if spec.arch != Arch::X86_64 {
        image_id.push('-');
        image_id.push_str(spec.arch.as_str());
    }

    let profile = ResolvedProfile {
        image_id,
        disk_interface: default_disk_interface(spec.os).to_string(),
        nic_model: default_nic_model(spec.os, &release, spec.arch).to_string(),
        cpu_model: default_cpu_model(spec.arch, accel, spec.cpu_model.as_deref()),
        release,
        firmware,
        accel,
    };

    info!(
        target: "profile",
        image = %profile.image_id,
        firmware = ?profile.firmware,
        accel = profile.accel.as_str(),
        "resolved guest profile"
    );
    Ok(profile)
}

/// Hardware acceleration when the host can run the guest natively, TCG
/// otherwise. Never fails.
pub fn select_accel(host: &HostInfo, guest: Arch, want_whpx: bool) -> Accel {
    if host.arch != Some(guest) {
        return Accel::Tcg;
    }
    match table::hardware_accel(host.platform, guest) {
        Some(Accel::Kvm) => match host.kvm {
            KvmAccess::Usable => Accel::Kvm,
            KvmAccess::Denied => {
                warn!(target: "profile", "/dev/kvm exists but is not writable, falling back to TCG");
                Accel::Tcg
            }
            KvmAccess::Missing => Accel::Tcg,
        },
        Some(Accel::Hvf) if host.hvf => Accel::Hvf,
        Some(Accel::Whpx) if want_whpx => Accel::Whpx,
        _ => Accel::Tcg,
    }
}

fn default_disk_interface(os: OsFamily) -> &'static str {
    match os {
        OsFamily::DragonFlyBsd => "ide",
        _ => "virtio",
    }
}

fn default_nic_model(os: OsFamily, release: &str, arch: Arch) -> &'static str {
    if arch == Arch::Riscv64 {
        return "virtio-net-pci";
    }
    match os {
        OsFamily::OpenBsd => {
            let base = release.split('-').next().unwrap_or(release);
            if table::OPENBSD_E1000_RELEASES.contains(&base) {
                "e1000"
            } else {
                "virtio-net-pci"
            }
        }
        OsFamily::DragonFlyBsd if release != table::DRAGONFLY_E1000_RELEASE => "virtio-net-pci",
        _ => "e1000",
    }
}

fn default_cpu_model(arch: Arch, accel: Accel, requested: Option<&str>) -> String {
    let model = match (arch, accel, requested) {
        // KVM on arm only works with host passthrough
        (Arch::Aarch64, Accel::Kvm, _) => "host",
        (_, _, Some(model)) => model,
        (Arch::X86_64, Accel::Kvm, None) => {
            "host,kvm=on,l3-cache=on,+hypervisor,migratable=no,+invtsc"
        }
        (Arch::X86_64, _, None) => "qemu64",
        (Arch::Aarch64, Accel::Hvf, None) => "host",
        (Arch::Aarch64, _, None) => "cortex-a72",
        (Arch::Riscv64, _, None) => "rv64",
    };
    model.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linux_x86_kvm() -> HostInfo {
        HostInfo {
            platform: HostPlatform::Linux,
            arch: Some(Arch::X86_64),
            kvm: KvmAccess::Usable,
            hvf: false,
        }
    }

    fn spec(os: OsFamily, arch: Arch, release: Option<&str>) -> GuestSpec {
        let mut s = GuestSpec::new(os, arch);
        s.release = release.map(String::from);
        s
    }

    #[test]
    fn test_freebsd_on_matching_linux_host() {
        let p = resolve(
            &spec(OsFamily::FreeBsd, Arch::X86_64, Some("14.3")),
            &linux_x86_kvm(),
            ResolveOptions::default(),
        )
        .unwrap();
        assert_eq!(p.image_id, "freebsd-14.3");
        assert_eq!(p.firmware, Firmware::Uefi);
        assert_eq!(p.accel, Accel::Kvm);
        assert!(p.cpu_model.starts_with("host"));
    }

    #[test]
    fn test_openbsd_arm_on_x86_host_falls_back_to_tcg() {
        let p = resolve(
            &spec(OsFamily::OpenBsd, Arch::Aarch64, None),
            &linux_x86_kvm(),
            ResolveOptions::default(),
        )
        .unwrap();
        assert_eq!(p.accel, Accel::Tcg);
        assert_eq!(p.firmware, Firmware::Uefi);
        assert_eq!(p.cpu_model, "cortex-a72");
        assert!(p.image_id.ends_with("-aarch64"));
    }

    #[test]
    fn test_release_omitted_picks_latest() {
        let p = resolve(
            &spec(OsFamily::FreeBsd, Arch::X86_64, None),
            &linux_x86_kvm(),
            ResolveOptions::default(),
        )
        .unwrap();
        assert_eq!(p.release, "15.0");
    }

    #[test]
    fn test_unsupported_arch_is_profile_error() {
        let err = resolve(
            &spec(OsFamily::DragonFlyBsd, Arch::Aarch64, None),
            &linux_x86_kvm(),
            ResolveOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, QvmError::Profile(_)));
    }

    #[test]
    fn test_firmware_selection() {
        let host = linux_x86_kvm();
        let netbsd = resolve(&spec(OsFamily::NetBsd, Arch::X86_64, None), &host, ResolveOptions::default()).unwrap();
        assert_eq!(netbsd.firmware, Firmware::Bios);

        let forced = resolve(
            &spec(OsFamily::NetBsd, Arch::X86_64, None),
            &host,
            ResolveOptions { force_uefi: true, want_whpx: false },
        )
        .unwrap();
        assert_eq!(forced.firmware, Firmware::Uefi);

        let riscv = resolve(&spec(OsFamily::FreeBsd, Arch::Riscv64, None), &host, ResolveOptions::default()).unwrap();
        assert_eq!(riscv.firmware, Firmware::UBoot);
        assert_eq!(riscv.accel, Accel::Tcg);
        assert_eq!(riscv.nic_model, "virtio-net-pci");
    }

    #[test]
    fn test_accel_matrix() {
        let mut host = linux_x86_kvm();
        host.kvm = KvmAccess::Denied;
        assert_eq!(select_accel(&host, Arch::X86_64, false), Accel::Tcg);

        let mac = HostInfo {
            platform: HostPlatform::MacOs,
            arch: Some(Arch::Aarch64),
            kvm: KvmAccess::Missing,
            hvf: true,
        };
        assert_eq!(select_accel(&mac, Arch::Aarch64, false), Accel::Hvf);
        assert_eq!(select_accel(&mac, Arch::X86_64, false), Accel::Tcg);

        let win = HostInfo {
            platform: HostPlatform::Windows,
            arch: Some(Arch::X86_64),
            kvm: KvmAccess::Missing,
            hvf: false,
        };
        assert_eq!(select_accel(&win, Arch::X86_64, false), Accel::Tcg);
        assert_eq!(select_accel(&win, Arch::X86_64, true), Accel::Whpx);
    }

    #[test]
    fn test_guest_device_defaults() {
        let host = linux_x86_kvm();
        let dfly = resolve(&spec(OsFamily::DragonFlyBsd, Arch::X86_64, Some("6.4.0")), &host, ResolveOptions::default()).unwrap();
        assert_eq!(dfly.disk_interface, "ide");
        assert_eq!(dfly.nic_model, "e1000");

        let dfly_new = resolve(&spec(OsFamily::DragonFlyBsd, Arch::X86_64, Some("6.4.2")), &host, ResolveOptions::default()).unwrap();
        assert_eq!(dfly_new.nic_model, "virtio-net-pci");

        let obsd_old = resolve(&spec(OsFamily::OpenBsd, Arch::X86_64, Some("7.4")), &host, ResolveOptions::default()).unwrap();
        assert_eq!(obsd_old.nic_model, "e1000");

        let obsd_new = resolve(&spec(OsFamily::OpenBsd, Arch::X86_64, Some("7.8")), &host, ResolveOptions::default()).unwrap();
        assert_eq!(obsd_new.nic_model, "virtio-net-pci");
        assert_eq!(obsd_new.disk_interface, "virtio");
    }

    #[test]
    fn test_requested_cpu_model_respected_without_kvm() {
        let mut s = spec(OsFamily::FreeBsd, Arch::X86_64, None);
        s.cpu_model = Some("Skylake-Server".into());
        let mut host = linux_x86_kvm();
        host.kvm = KvmAccess::Missing;
        let p = resolve(&s, &host, ResolveOptions::default()).unwrap();
        assert_eq!(p.cpu_model, "Skylake-Server");
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let s = spec(OsFamily::OpenBsd, Arch::X86_64, None);
        let host = linux_x86_kvm();
        assert_eq!(
            resolve(&s, &host, ResolveOptions::default()).unwrap(),
            resolve(&s, &host, ResolveOptions::default()).unwrap()
        );
    }
}
