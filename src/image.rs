//! Locating the guest disk, its cached base, SSH keys and firmware files.
//!
//! Nothing is downloaded here: images must already be in the data directory
//! (or given with `--qcow2`). Firmware NVRAM files are only *named* here and
//! created right before launch by [`prepare_pflash`].

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::QvmError;
use crate::paths;
use crate::profile::{Firmware, HostPlatform, ResolvedProfile};
use crate::types::{Arch, GuestSpec};

const UBOOT_RISCV64: &str = "/usr/lib/u-boot/qemu-riscv64_smode/u-boot.bin";

/// pflash pair for UEFI guests
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PflashLayout {
    /// Read-only firmware code as passed to QEMU
    pub code: PathBuf,
    /// When set, `code` is a zero-padded copy of this file made before launch
    pub code_source: Option<PathBuf>,
    /// Writable variable store
    pub vars: PathBuf,
    /// Size of every pflash file qvm creates
    pub size_mb: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuestImage {
    /// Session name, also used for SSH aliases and per-session files
    pub name: String,
    /// Working copy the guest boots from
    pub disk: PathBuf,
    /// Pristine base image, used by `--snapshot` when present
    pub cached_base: Option<PathBuf>,
    pub explicit: bool,
    /// Directory for per-session files (NVRAM, serial log)
    pub work_dir: PathBuf,
    /// Private key accepted by the guest's root account
    pub identity: Option<PathBuf>,
    /// Guest's public key, authorized on the host for sshfs/rsync pulls
    pub guest_pubkey: Option<PathBuf>,
    pub pflash: Option<PflashLayout>,
    /// Kernel passed with `-kernel` (U-Boot on riscv64)
    pub kernel: Option<PathBuf>,
}

pub struct ImageLocator {
    data_dir: PathBuf,
    host: HostPlatform,
}

impl ImageLocator {
    pub fn new(data_dir: impl Into<PathBuf>, host: HostPlatform) -> Self {
        Self {
            data_dir: data_dir.into(),
            host,
        }
    }

    /// Session name: `<os>-custom` for `--qcow2`, the image id otherwise
    pub fn session_name(spec: &GuestSpec, profile: &ResolvedProfile) -> String {
        if spec.image.is_some() {
            format!("{}-custom", spec.os)
        } else {
            profile.image_id.clone()
        }
    }

    pub fn locate(&self, spec: &GuestSpec, profile: &ResolvedProfile) -> Result<GuestImage, QvmError> {
        let name = Self::session_name(spec, profile);
        let work_dir = paths::os_dir(&self.data_dir, spec.os.as_str());

        let (disk, explicit) = match &spec.image {
            Some(path) => (check_readable(path)?, true),
            None => {
                let disk = work_dir.join(format!("{}.qcow2", profile.image_id));
                if !disk.is_file() {
                    return Err(QvmError::image(format!(
                        "image for {} not found, expected {}",
                        profile.image_id,
                        disk.display()
                    )));
                }
                (check_readable(&disk)?, false)
            }
        };

        let cached_base = Some(paths::cache_dir(&self.data_dir).join(format!("{}.qcow2", profile.image_id)))
            .filter(|p| p.is_file());

        let (identity, guest_pubkey) = if explicit {
            (None, None)
        } else {
            (
                Some(work_dir.join(format!("{}-host.id_rsa", profile.image_id))).filter(|p| p.is_file()),
                Some(work_dir.join(format!("{}-id_rsa.pub", profile.image_id))).filter(|p| p.is_file()),
            )
        };

        let pflash = match profile.firmware {
            Firmware::Uefi => Some(self.pflash_layout(spec.arch, &work_dir, &name)?),
            _ => None,
        };

        let kernel = match profile.firmware {
            Firmware::UBoot => {
                let path = PathBuf::from(UBOOT_RISCV64);
                if !path.is_file() {
                    return Err(QvmError::image(format!(
                        "U-Boot kernel not found at {}",
                        path.display()
                    )));
                }
                Some(path)
            }
            _ => None,
        };

        let image = GuestImage {
            name,
            disk,
            cached_base,
            explicit,
            work_dir,
            identity,
            guest_pubkey,
            pflash,
            kernel,
        };
        info!(disk = %image.disk.display(), explicit = image.explicit, "using guest image");
        Ok(image)
    }

    fn pflash_layout(&self, arch: Arch, work_dir: &Path, name: &str) -> Result<PflashLayout, QvmError> {
        let candidates = firmware_candidates(arch, self.host);
        let found = candidates.iter().find(|p| p.is_file()).cloned();
        debug!(?found, "firmware search");

        match arch {
            Arch::Aarch64 => {
                let code = work_dir.join(format!("{}-QEMU_EFI.fd", name));
                if found.is_none() && !code.is_file() {
                    return Err(missing_firmware(&candidates));
                }
                Ok(PflashLayout {
                    code,
                    code_source: found,
                    vars: work_dir.join(format!("{}-QEMU_EFI_VARS.fd", name)),
                    size_mb: 64,
                })
            }
            _ => Ok(PflashLayout {
                code: found.ok_or_else(|| missing_firmware(&candidates))?,
                code_source: None,
                vars: work_dir.join(format!("{}-OVMF_VARS.fd", name)),
                size_mb: 4,
            }),
        }
    }
}

fn check_readable(path: &Path) -> Result<PathBuf, QvmError> {
    File::open(path).map_err(|e| QvmError::image(format!("cannot read {}: {}", path.display(), e)))?;
    Ok(std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf()))
}

fn missing_firmware(candidates: &[PathBuf]) -> QvmError {
    let list: Vec<String> = candidates.iter().map(|p| p.display().to_string()).collect();
    QvmError::image(format!("UEFI firmware not found (looked in: {})", list.join(", ")))
}

/// Standard install locations of the UEFI code image
pub fn firmware_candidates(arch: Arch, host: HostPlatform) -> Vec<PathBuf> {
    let paths: Vec<String> = match (arch, host) {
        (Arch::Aarch64, _) => vec![
            "/usr/share/qemu-efi-aarch64/QEMU_EFI.fd".into(),
            "/usr/share/AAVMF/AAVMF_CODE.fd".into(),
            "/usr/share/edk2/aarch64/QEMU_EFI.fd".into(),
            "/opt/homebrew/share/qemu/edk2-aarch64-code.fd".into(),
        ],
        (_, HostPlatform::Windows) => {
            let program_files =
                std::env::var("ProgramFiles").unwrap_or_else(|_| r"C:\Program Files".to_string());
            vec![
                format!(r"{}\qemu\share\edk2-x86_64-code.fd", program_files),
                r"C:\msys64\ucrt64\share\qemu\edk2-x86_64-code.fd".into(),
            ]
        }
        (_, HostPlatform::MacOs) => vec![
            "/opt/homebrew/share/qemu/edk2-x86_64-code.fd".into(),
            "/usr/local/share/qemu/edk2-x86_64-code.fd".into(),
        ],
        _ => vec![
            "/usr/share/qemu/OVMF.fd".into(),
            "/usr/share/OVMF/OVMF_CODE.fd".into(),
            "/usr/share/edk2/ovmf/OVMF_CODE.fd".into(),
        ],
    };
    paths.into_iter().map(PathBuf::from).collect()
}

/// Create missing pflash files: the zero-filled vars store and, on aarch64,
/// the padded copy of the firmware code. Existing files are kept so NVRAM
/// survives between sessions.
pub fn prepare_pflash(layout: &PflashLayout) -> Result<()> {
    if let Some(src) = &layout.code_source {
        if !layout.code.exists() {
            create_zeroed(&layout.code, layout.size_mb)?;
            let firmware = fs::read(src).with_context(|| format!("reading {}", src.display()))?;
            let mut f = fs::OpenOptions::new()
                .write(true)
                .open(&layout.code)
                .with_context(|| format!("opening {}", layout.code.display()))?;
            f.write_all(&firmware)
                .with_context(|| format!("writing {}", layout.code.display()))?;
        }
    }
    if !layout.vars.exists() {
        create_zeroed(&layout.vars, layout.size_mb)?;
    }
    Ok(())
}

fn create_zeroed(path: &Path, size_mb: u64) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let f = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    f.set_len(size_mb * 1024 * 1024)
        .with_context(|| format!("sizing {}", path.display()))?;
    debug!(path = %path.display(), size_mb, "created pflash file");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::Accel;
    use crate::types::OsFamily;
    use tempfile::TempDir;

    fn profile(image_id: &str, firmware: Firmware) -> ResolvedProfile {
        ResolvedProfile {
            image_id: image_id.to_string(),
            release: "14.3".to_string(),
            firmware,
            accel: Accel::Tcg,
            disk_interface: "virtio".to_string(),
            nic_model: "e1000".to_string(),
            cpu_model: "qemu64".to_string(),
        }
    }

    #[test]
    fn test_missing_image_names_expected_path() {
        let dir = TempDir::new().unwrap();
        let locator = ImageLocator::new(dir.path(), HostPlatform::Linux);
        let spec = GuestSpec::new(OsFamily::NetBsd, Arch::X86_64);
        let err = locator.locate(&spec, &profile("netbsd-10.1", Firmware::Bios)).unwrap_err();
        match err {
            QvmError::Image(msg) => assert!(msg.contains("netbsd/netbsd-10.1.qcow2"), "{msg}"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_working_image_cache_and_keys() {
        let dir = TempDir::new().unwrap();
        let os_dir = dir.path().join("netbsd");
        fs::create_dir_all(&os_dir).unwrap();
        fs::create_dir_all(dir.path().join("cache")).unwrap();
        fs::write(os_dir.join("netbsd-10.1.qcow2"), b"qcow").unwrap();
        fs::write(os_dir.join("netbsd-10.1-host.id_rsa"), b"key").unwrap();
        fs::write(dir.path().join("cache/netbsd-10.1.qcow2"), b"base").unwrap();

        let locator = ImageLocator::new(dir.path(), HostPlatform::Linux);
        let spec = GuestSpec::new(OsFamily::NetBsd, Arch::X86_64);
        let image = locator.locate(&spec, &profile("netbsd-10.1", Firmware::Bios)).unwrap();

        assert_eq!(image.name, "netbsd-10.1");
        assert_eq!(image.disk, os_dir.join("netbsd-10.1.qcow2"));
        assert_eq!(image.cached_base, Some(dir.path().join("cache/netbsd-10.1.qcow2")));
        assert_eq!(image.identity, Some(os_dir.join("netbsd-10.1-host.id_rsa")));
        assert!(image.guest_pubkey.is_none());
        assert!(image.pflash.is_none());
    }

    #[test]
    fn test_explicit_qcow2() {
        let dir = TempDir::new().unwrap();
        let disk = dir.path().join("mine.qcow2");
        fs::write(&disk, b"qcow").unwrap();

        let mut spec = GuestSpec::new(OsFamily::OpenBsd, Arch::X86_64);
        spec.image = Some(disk.clone());
        let locator = ImageLocator::new(dir.path(), HostPlatform::Linux);
        let image = locator.locate(&spec, &profile("openbsd-7.8", Firmware::Bios)).unwrap();
        assert!(image.explicit);
        assert_eq!(image.name, "openbsd-custom");
        assert_eq!(image.disk, disk);

        spec.image = Some(dir.path().join("absent.qcow2"));
        assert!(matches!(
            locator.locate(&spec, &profile("openbsd-7.8", Firmware::Bios)),
            Err(QvmError::Image(_))
        ));
    }

    #[test]
    fn test_prepare_pflash_creates_sized_files_once() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("QEMU_EFI.fd");
        fs::write(&src, b"EFI!").unwrap();
        let layout = PflashLayout {
            code: dir.path().join("vm-QEMU_EFI.fd"),
            code_source: Some(src),
            vars: dir.path().join("vm-QEMU_EFI_VARS.fd"),
            size_mb: 1,
        };

        prepare_pflash(&layout).unwrap();
        let code = fs::read(&layout.code).unwrap();
        assert_eq!(code.len(), 1024 * 1024);
        assert_eq!(&code[..4], b"EFI!");
        assert!(code[4..].iter().all(|b| *b == 0));
        assert_eq!(fs::metadata(&layout.vars).unwrap().len(), 1024 * 1024);

        // NVRAM written by the guest survives the next launch
        fs::write(&layout.vars, b"saved").unwrap();
        prepare_pflash(&layout).unwrap();
        assert_eq!(fs::read(&layout.vars).unwrap(), b"saved");
    }

    #[test]
    fn test_firmware_candidates_per_host() {
        let linux = firmware_candidates(Arch::X86_64, HostPlatform::Linux);
        assert_eq!(linux[0], PathBuf::from("/usr/share/qemu/OVMF.fd"));
        let mac = firmware_candidates(Arch::X86_64, HostPlatform::MacOs);
        assert!(mac[0].to_string_lossy().contains("homebrew"));
        let arm = firmware_candidates(Arch::Aarch64, HostPlatform::Linux);
        assert!(arm[0].ends_with("QEMU_EFI.fd"));
    }
}
