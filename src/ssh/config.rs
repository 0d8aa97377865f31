//! `~/.ssh/config.d` alias files and the guest-side `host` alias.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use super::NULL_KNOWN_HOSTS;
use crate::error::QvmError;
use crate::network::HOST_FROM_GUEST;

const INCLUDE_LINE: &str = "Include config.d/*.conf";

/// Validate an `--ssh-name` alias: `[A-Za-z0-9._-]+`
pub fn validate_alias(name: &str) -> Result<(), QvmError> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if ok {
        Ok(())
    } else {
        Err(QvmError::config(format!(
            "invalid ssh name '{}': only letters, digits, '.', '_' and '-' are allowed",
            name
        )))
    }
}

/// One `Host` block pointing `hosts` at the forwarded SSH port
pub fn host_block(hosts: &[&str], port: u16, identity: Option<&Path>) -> String {
    let mut block = format!(
        "Host {}\n  StrictHostKeyChecking no\n  UserKnownHostsFile {}\n  User root\n  HostName localhost\n  Port {}\n",
        hosts.join(" "),
        NULL_KNOWN_HOSTS,
        port
    );
    if let Some(key) = identity {
        block.push_str(&format!("  IdentityFile {}\n", key.display()));
    }
    block
}

/// Write `<alias>.conf` and `<port>.conf` (carrying the extra names) under
/// `<ssh_dir>/config.d` and make sure the main config includes them.
///
/// Returns the files written.
pub fn write_aliases(
    ssh_dir: &Path,
    alias: &str,
    extra_names: &[String],
    port: u16,
    identity: Option<&Path>,
) -> Result<Vec<PathBuf>> {
    let conf_dir = ssh_dir.join("config.d");
    fs::create_dir_all(&conf_dir)
        .with_context(|| format!("creating {}", conf_dir.display()))?;
    set_mode(ssh_dir, 0o700)?;

    let port_str = port.to_string();
    let mut port_hosts = vec![port_str.as_str()];
    port_hosts.extend(extra_names.iter().map(String::as_str));

    let files = [
        (conf_dir.join(format!("{}.conf", alias)), host_block(&[alias], port, identity)),
        (conf_dir.join(format!("{}.conf", port)), host_block(&port_hosts, port, identity)),
    ];

    let mut written = Vec::with_capacity(files.len());
    for (path, content) in files {
        fs::write(&path, content).with_context(|| format!("writing {}", path.display()))?;
        set_mode(&path, 0o600)?;
        debug!(target: "ssh", path = %path.display(), "wrote ssh alias");
        written.push(path);
    }

    ensure_include(&ssh_dir.join("config"))?;
    Ok(written)
}

/// Add `Include config.d/*.conf` to the main ssh config once.
///
/// The include is prepended: ssh only honours top-level options that appear
/// before the first `Host` block.
pub fn ensure_include(main_conf: &Path) -> Result<()> {
    let existing = match fs::read_to_string(main_conf) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e).with_context(|| format!("reading {}", main_conf.display())),
    };

    if existing.lines().any(|l| l.trim() == INCLUDE_LINE) {
        return Ok(());
    }

    let updated = format!("{}\n\n{}", INCLUDE_LINE, existing);
    fs::write(main_conf, updated.trim_end().to_string() + "\n")
        .with_context(|| format!("writing {}", main_conf.display()))?;
    set_mode(main_conf, 0o600)
}

/// Append the guest's public key to `authorized_keys` so the guest can reach
/// the host (sshfs, rsync pull, the `host` alias).
pub fn authorize_key(ssh_dir: &Path, pubkey: &Path) -> Result<bool> {
    let key = fs::read_to_string(pubkey)
        .with_context(|| format!("reading {}", pubkey.display()))?;
    let key = key.trim();
    if key.is_empty() {
        return Ok(false);
    }

    let auth = ssh_dir.join("authorized_keys");
    let existing = fs::read_to_string(&auth).unwrap_or_default();
    if existing.lines().any(|l| l.trim() == key) {
        return Ok(false);
    }

    let mut content = existing;
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(key);
    content.push('\n');
    fs::write(&auth, content).with_context(|| format!("writing {}", auth.display()))?;
    set_mode(&auth, 0o600)?;
    Ok(true)
}

/// `~/.ssh/config` content installed in the guest so `ssh host` reaches the
/// host machine through the NAT gateway.
pub fn guest_host_config(host_ssh_port: Option<u16>, user: &str) -> String {
    let mut conf = format!(
        "StrictHostKeyChecking=no\n\nHost host\n  HostName {}\n",
        HOST_FROM_GUEST
    );
    if let Some(port) = host_ssh_port {
        conf.push_str(&format!("  Port {}\n", port));
    }
    conf.push_str(&format!("  User {}\n  ServerAliveInterval 1\n", user));
    conf
}

/// Guest script writing [`guest_host_config`]
pub fn guest_host_alias_script(host_ssh_port: Option<u16>, user: &str) -> String {
    format!(
        "mkdir -p ~/.ssh && chmod 700 ~/.ssh\ncat > ~/.ssh/config <<'QVM_EOF'\n{}QVM_EOF\nchmod 600 ~/.ssh/config\n",
        guest_host_config(host_ssh_port, user)
    )
}

/// Name of the invoking user, as the guest should log into the host
pub fn host_user() -> String {
    ["USER", "USERNAME", "LOGNAME"]
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| "root".to_string())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("chmod {:o} {}", mode, path.display()))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
