use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::QvmError;

/// Guest operating system family
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    FreeBsd,
    OpenBsd,
    NetBsd,
    DragonFlyBsd,
    Solaris,
    OmniOs,
    OpenIndiana,
}

impl OsFamily {
    pub const ALL: [OsFamily; 7] = [
        OsFamily::FreeBsd,
        OsFamily::OpenBsd,
        OsFamily::NetBsd,
        OsFamily::DragonFlyBsd,
        OsFamily::Solaris,
        OsFamily::OmniOs,
        OsFamily::OpenIndiana,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OsFamily::FreeBsd => "freebsd",
            OsFamily::OpenBsd => "openbsd",
            OsFamily::NetBsd => "netbsd",
            OsFamily::DragonFlyBsd => "dragonflybsd",
            OsFamily::Solaris => "solaris",
            OsFamily::OmniOs => "omnios",
            OsFamily::OpenIndiana => "openindiana",
        }
    }

    /// Families whose images only boot through UEFI firmware
    pub fn requires_uefi(&self) -> bool {
        matches!(self, OsFamily::FreeBsd)
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OsFamily {
    type Err = QvmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        OsFamily::ALL
            .into_iter()
            .find(|os| os.as_str() == lower)
            .ok_or_else(|| {
                let known: Vec<&str> = OsFamily::ALL.iter().map(OsFamily::as_str).collect();
                QvmError::profile(format!(
                    "unknown OS: {} (supported: {})",
                    s,
                    known.join(", ")
                ))
            })
    }
}

/// CPU architecture of the guest (and, where it matches, of the host)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    X86_64,
    Aarch64,
    Riscv64,
}

impl Arch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::Aarch64 => "aarch64",
            Arch::Riscv64 => "riscv64",
        }
    }

    /// Name of the QEMU system emulator for this architecture
    pub fn qemu_binary(&self) -> &'static str {
        match self {
            Arch::X86_64 => "qemu-system-x86_64",
            Arch::Aarch64 => "qemu-system-aarch64",
            Arch::Riscv64 => "qemu-system-riscv64",
        }
    }

    /// Parse the architecture names used by hosts and users alike
    pub fn parse(s: &str) -> Option<Arch> {
        match s.trim() {
            "x86_64" | "amd64" | "AMD64" | "x64" => Some(Arch::X86_64),
            "aarch64" | "arm64" | "ARM64" | "arm" => Some(Arch::Aarch64),
            "riscv64" | "riscv64gc" => Some(Arch::Riscv64),
            _ => None,
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Arch {
    type Err = QvmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Arch::parse(s).ok_or_else(|| {
            QvmError::profile(format!(
                "unsupported architecture: {} (expected x86_64, aarch64 or riscv64)",
                s
            ))
        })
    }
}

/// Declarative description of the guest to launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestSpec {
    pub os: OsFamily,
    /// None selects the newest known release
    pub release: Option<String>,
    pub arch: Arch,
    pub memory_mb: u32,
    pub vcpus: u32,
    pub cpu_model: Option<String>,
    /// Explicit local qcow2 image, bypassing the data directory lookup
    pub image: Option<PathBuf>,
}

impl GuestSpec {
    pub fn new(os: OsFamily, arch: Arch) -> Self {
        Self {
            os,
            release: None,
            arch,
            memory_mb: 2048,
            vcpus: 1,
            cpu_model: None,
            image: None,
        }
    }
}
