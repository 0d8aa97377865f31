//! Static guest compatibility data.
//!
//! Every supported (OS, architecture) pair has exactly one row listing the
//! releases images are published for. Pairs without a row are unsupported.

use std::cmp::Ordering;

use crate::types::{Arch, OsFamily};

use super::host::HostPlatform;
use super::Accel;

#[derive(Debug)]
pub struct CompatRow {
    pub os: OsFamily,
    pub arch: Arch,
    pub releases: &'static [&'static str],
}

pub static COMPAT: &[CompatRow] = &[
    CompatRow {
        os: OsFamily::FreeBsd,
        arch: Arch::X86_64,
        releases: &["13.4", "13.5", "14.1", "14.2", "14.3", "15.0"],
    },
    CompatRow {
        os: OsFamily::FreeBsd,
        arch: Arch::Aarch64,
        releases: &["13.5", "14.2", "14.3", "15.0"],
    },
    CompatRow {
        os: OsFamily::FreeBsd,
        arch: Arch::Riscv64,
        releases: &["14.2", "14.3", "15.0"],
    },
    CompatRow {
        os: OsFamily::OpenBsd,
        arch: Arch::X86_64,
        releases: &["7.3", "7.4", "7.5", "7.6", "7.7", "7.8"],
    },
    CompatRow {
        os: OsFamily::OpenBsd,
        arch: Arch::Aarch64,
        releases: &["7.6", "7.7", "7.8"],
    },
    CompatRow {
        os: OsFamily::OpenBsd,
        arch: Arch::Riscv64,
        releases: &["7.7", "7.8"],
    },
    CompatRow {
        os: OsFamily::NetBsd,
        arch: Arch::X86_64,
        releases: &["9.4", "10.0", "10.1"],
    },
    CompatRow {
        os: OsFamily::NetBsd,
        arch: Arch::Aarch64,
        releases: &["10.1"],
    },
    CompatRow {
        os: OsFamily::DragonFlyBsd,
        arch: Arch::X86_64,
        releases: &["6.4.0", "6.4.2"],
    },
    CompatRow {
        os: OsFamily::Solaris,
        arch: Arch::X86_64,
        releases: &["11.4"],
    },
    CompatRow {
        os: OsFamily::OmniOs,
        arch: Arch::X86_64,
        releases: &["r151052", "r151054", "r151056"],
    },
    CompatRow {
        os: OsFamily::OpenIndiana,
        arch: Arch::X86_64,
        releases: &["2024.10", "2025.04"],
    },
];

/// Hardware accelerators per host platform, usable only when the guest
/// architecture matches the host's. Anything not listed falls back to TCG.
pub static ACCEL: &[(HostPlatform, Arch, Accel)] = &[
    (HostPlatform::Linux, Arch::X86_64, Accel::Kvm),
    (HostPlatform::Linux, Arch::Aarch64, Accel::Kvm),
    (HostPlatform::MacOs, Arch::X86_64, Accel::Hvf),
    (HostPlatform::MacOs, Arch::Aarch64, Accel::Hvf),
    (HostPlatform::Windows, Arch::X86_64, Accel::Whpx),
];

/// OpenBSD releases whose images still ship with an e1000 driver setup
pub const OPENBSD_E1000_RELEASES: &[&str] = &["7.3", "7.4", "7.5", "7.6"];

/// The only DragonFly release whose image expects an e1000 NIC
pub const DRAGONFLY_E1000_RELEASE: &str = "6.4.0";

pub fn lookup(os: OsFamily, arch: Arch) -> Option<&'static CompatRow> {
    COMPAT.iter().find(|row| row.os == os && row.arch == arch)
}

pub fn supported_arches(os: OsFamily) -> Vec<Arch> {
    COMPAT
        .iter()
        .filter(|row| row.os == os)
        .map(|row| row.arch)
        .collect()
}

pub fn hardware_accel(platform: HostPlatform, arch: Arch) -> Option<Accel> {
    ACCEL
        .iter()
        .find(|(p, a, _)| *p == platform && *a == arch)
        .map(|(_, _, accel)| *accel)
}

impl CompatRow {
    /// Newest release by version order
    pub fn latest(&self) -> Option<&'static str> {
        self.releases
            .iter()
            .copied()
            .max_by(|a, b| cmp_version(a, b))
    }

    pub fn knows(&self, release: &str) -> bool {
        self.releases.contains(&release)
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Token {
    Num(u64),
    Word(String),
}

fn tokens(text: &str) -> Vec<Token> {
    let mut out = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_ascii_digit() {
            let mut digits = String::new();
            while let Some(&d) = chars.peek().filter(|d| d.is_ascii_digit()) {
                digits.push(d);
                chars.next();
            }
            out.push(Token::Num(digits.parse().unwrap_or(u64::MAX)));
        } else if c.is_ascii_alphabetic() {
            let mut word = String::new();
            while let Some(&w) = chars.peek().filter(|w| w.is_ascii_alphabetic()) {
                word.push(w.to_ascii_lowercase());
                chars.next();
            }
            out.push(Token::Word(word));
        } else {
            chars.next();
        }
    }
    out
}

/// Compare release strings token by token: digit runs numerically, letter
/// runs case-insensitively, numbers before words, missing tokens as zero.
pub fn cmp_version(a: &str, b: &str) -> Ordering {
    let mut ta = tokens(a);
    let mut tb = tokens(b);
    let len = ta.len().max(tb.len());
    ta.resize_with(len, || Token::Num(0));
    tb.resize_with(len, || Token::Num(0));
    ta.cmp(&tb)
}
