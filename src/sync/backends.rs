//! Sync backends. Each one turns a validated [`SyncMapping`] into guest (and
//! for NFS, host) side actions.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use shell_words::quote;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{SyncMapping, SyncMode};
use crate::network::HOST_FROM_GUEST;
use crate::ssh::GuestShell;
use crate::types::OsFamily;

const EXPORTS_FILE: &str = "/etc/exports";

/// Facts every backend needs about the guest and host
#[derive(Debug, Clone, Copy)]
pub struct SyncContext {
    pub os: OsFamily,
    pub host_is_windows: bool,
    pub attempts: u32,
    pub pause: Duration,
}

impl SyncContext {
    pub fn new(os: OsFamily, host_is_windows: bool) -> Self {
        Self {
            os,
            host_is_windows,
            attempts: 10,
            pause: Duration::from_secs(2),
        }
    }
}

#[async_trait::async_trait]
pub trait SyncBackend: Send + Sync {
    /// Make `mapping` visible in the guest
    async fn activate(&self, shell: &dyn GuestShell, mapping: &SyncMapping) -> Result<()>;

    /// Undo [`SyncBackend::activate`]. One-shot copies have nothing to undo.
    async fn stop(&self, _shell: &dyn GuestShell, _mapping: &SyncMapping) -> Result<()> {
        Ok(())
    }
}

pub fn backend_for(mode: SyncMode, ctx: SyncContext) -> Box<dyn SyncBackend> {
    match mode {
        SyncMode::Rsync => Box::new(RsyncBackend { ctx }),
        SyncMode::Sshfs => Box::new(SshfsBackend { ctx }),
        SyncMode::Nfs => Box::new(NfsBackend { ctx }),
        SyncMode::Scp => Box::new(ScpBackend),
    }
}

/// Run `script` until it succeeds or the attempts run out.
async fn run_with_retry(
    shell: &dyn GuestShell,
    script: &str,
    ctx: &SyncContext,
    what: &str,
) -> Result<()> {
    let attempts = ctx.attempts.max(1);
    for attempt in 1..=attempts {
        match shell.run_script(script).await {
            Ok(true) => return Ok(()),
            Ok(false) => debug!(target: "sync", attempt, "{} failed, retrying", what),
            Err(e) => debug!(target: "sync", attempt, error = %e, "{} failed, retrying", what),
        }
        if attempt < attempts {
            tokio::time::sleep(ctx.pause).await;
        }
    }
    bail!("{} failed after {} attempts", what, attempts)
}

fn slash_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

pub fn rsync_pull_script(host: &Path, guest: &str, rsync_path: Option<&str>) -> String {
    let rsync_path = rsync_path
        .map(|p| format!("--rsync-path={} ", quote(p)))
        .unwrap_or_default();
    format!(
        "mkdir -p {guest}\n\
         if ! command -v rsync >/dev/null 2>&1; then\n  echo 'rsync not found in guest' >&2\n  exit 1\nfi\n\
         rsync -avrtopg --delete {rsync_path}{src} {dst}\n",
        guest = quote(guest),
        rsync_path = rsync_path,
        src = quote(&format!("host:{}/", slash_path(host).trim_end_matches('/'))),
        dst = quote(&format!("{}/", guest.trim_end_matches('/'))),
    )
}

pub fn sshfs_mount_script(os: OsFamily, host: &Path, guest: &str) -> String {
    let src = quote(&format!("host:{}", slash_path(host))).into_owned();
    let dst = quote(guest).into_owned();
    let mut script = format!("mkdir -p {}\n", dst);
    match os {
        OsFamily::NetBsd => {
            script.push_str(&format!("/usr/sbin/mount_psshfs {} {}\n", src, dst));
        }
        _ => {
            if os == OsFamily::FreeBsd {
                script.push_str("kldload fusefs >/dev/null 2>&1 || true\n");
            }
            script.push_str(&format!(
                "sshfs -o reconnect,ServerAliveCountMax=2,allow_other,default_permissions {} {}\n",
                src, dst
            ));
        }
    }
    script
}

pub fn nfs_mount_script(os: OsFamily, host: &Path, guest: &str) -> String {
    let src = quote(&format!("{}:{}", HOST_FROM_GUEST, slash_path(host))).into_owned();
    let dst = quote(guest).into_owned();
    let mount = match os {
        OsFamily::OpenBsd => format!("mount -t nfs -o -T {} {}\n", src, dst),
        _ => format!(
            "if [ -e /sbin/mount ]; then\n  /sbin/mount {src} {dst}\nelse\n  mount {src} {dst}\nfi\n",
            src = src,
            dst = dst
        ),
    };
    format!("mkdir -p {}\n{}", dst, mount)
}

pub fn unmount_script(guest: &str) -> String {
    let dst = quote(guest);
    format!("umount {dst} 2>/dev/null || umount -f {dst}\n", dst = dst)
}

pub struct RsyncBackend {
    ctx: SyncContext,
}

#[async_trait::async_trait]
impl SyncBackend for RsyncBackend {
    async fn activate(&self, shell: &dyn GuestShell, mapping: &SyncMapping) -> Result<()> {
        let host_rsync = which::which("rsync").ok();
        if self.ctx.host_is_windows && host_rsync.is_none() {
            bail!("rsync not found on host; install rsync to use rsync sync mode");
        }
        info!(
            target: "sync",
            host = %mapping.host_path().display(),
            guest = %mapping.guest_path(),
            "syncing via rsync"
        );
        let rsync_path = host_rsync.as_deref().map(slash_path);
        let script = rsync_pull_script(mapping.host_path(), mapping.guest_path(), rsync_path.as_deref());
        run_with_retry(shell, &script, &self.ctx, "rsync").await
    }
}

pub struct SshfsBackend {
    ctx: SyncContext,
}

#[async_trait::async_trait]
impl SyncBackend for SshfsBackend {
    async fn activate(&self, shell: &dyn GuestShell, mapping: &SyncMapping) -> Result<()> {
        if self.ctx.host_is_windows {
            bail!("sshfs sync is not supported on Windows hosts");
        }
        let script = sshfs_mount_script(self.ctx.os, mapping.host_path(), mapping.guest_path());
        run_with_retry(shell, &script, &self.ctx, "sshfs mount").await
    }

    async fn stop(&self, shell: &dyn GuestShell, mapping: &SyncMapping) -> Result<()> {
        if !shell.run_script(&unmount_script(mapping.guest_path())).await? {
            bail!("unmounting {} in guest failed", mapping.guest_path());
        }
        Ok(())
    }
}

pub struct NfsBackend {
    ctx: SyncContext,
}

/// `/etc/exports` line for `host`, squashing access to the invoking user
pub fn export_line(host: &Path, uid: u32, gid: u32) -> String {
    format!(
        "{} *(rw,insecure,async,no_subtree_check,anonuid={},anongid={})",
        host.display(),
        uid,
        gid
    )
}

pub fn export_present(exports: &str, host: &Path) -> bool {
    let prefix = format!("{} ", host.display());
    exports.lines().any(|l| l.trim_start().starts_with(&prefix))
}

impl NfsBackend {
    async fn ensure_export(&self, host: &Path) -> Result<()> {
        let exports = tokio::fs::read_to_string(EXPORTS_FILE).await.unwrap_or_default();
        if export_present(&exports, host) {
            debug!(target: "sync", path = %host.display(), "already exported");
            return Ok(());
        }

        let is_root = nix::unistd::geteuid().is_root();
        let sudo = !is_root;
        if sudo && which::which("sudo").is_err() {
            bail!("cannot configure NFS exports without root or sudo");
        }

        info!(target: "sync", path = %host.display(), "adding NFS export on host");
        let line = export_line(
            host,
            nix::unistd::getuid().as_raw(),
            nix::unistd::getgid().as_raw(),
        );
        if !host_command_with_input(sudo, &["tee", "-a", EXPORTS_FILE], &format!("{}\n", line)).await? {
            bail!("failed to write {}", EXPORTS_FILE);
        }

        if !host_command(sudo, &["exportfs", "-a"]).await? {
            warn!(target: "sync", "exportfs -a failed");
        }
        for restart in [
            &["service", "nfs-kernel-server", "restart"][..],
            &["service", "nfs-server", "restart"][..],
            &["systemctl", "restart", "nfs-server"][..],
        ] {
            if host_command(sudo, restart).await? {
                return Ok(());
            }
        }
        bail!("could not restart the host NFS server")
    }
}

fn host_cmd(sudo: bool, args: &[&str]) -> Command {
    let (program, rest) = if sudo { ("sudo", args) } else { (args[0], &args[1..]) };
    let mut cmd = Command::new(program);
    cmd.args(rest);
    cmd
}

async fn host_command(sudo: bool, args: &[&str]) -> Result<bool> {
    let status = host_cmd(sudo, args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match status {
        Ok(s) => Ok(s.success()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("running {}", args.join(" "))),
    }
}

async fn host_command_with_input(sudo: bool, args: &[&str], input: &str) -> Result<bool> {
    let mut child = host_cmd(sudo, args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .spawn()
        .with_context(|| format!("running {}", args.join(" ")))?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(input.as_bytes()).await?;
    }
    Ok(child.wait().await?.success())
}

#[async_trait::async_trait]
impl SyncBackend for NfsBackend {
    async fn activate(&self, shell: &dyn GuestShell, mapping: &SyncMapping) -> Result<()> {
        if self.ctx.host_is_windows {
            bail!("NFS sync is not supported on Windows hosts");
        }
        self.ensure_export(mapping.host_path()).await?;
        let script = nfs_mount_script(self.ctx.os, mapping.host_path(), mapping.guest_path());
        run_with_retry(shell, &script, &self.ctx, "NFS mount").await
    }

    async fn stop(&self, shell: &dyn GuestShell, mapping: &SyncMapping) -> Result<()> {
        if !shell.run_script(&unmount_script(mapping.guest_path())).await? {
            bail!("unmounting {} in guest failed", mapping.guest_path());
        }
        Ok(())
    }
}

pub struct ScpBackend;

/// Entries to push for a host path: a directory's children, or the file itself
pub fn scp_sources(host: &Path) -> Result<Vec<PathBuf>> {
    if !host.exists() {
        bail!("host path {} does not exist", host.display());
    }
    if !host.is_dir() {
        return Ok(vec![host.to_path_buf()]);
    }
    let mut entries = std::fs::read_dir(host)
        .with_context(|| format!("reading {}", host.display()))?
        .map(|e| e.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("reading {}", host.display()))?;
    entries.sort();
    Ok(entries)
}

#[async_trait::async_trait]
impl SyncBackend for ScpBackend {
    async fn activate(&self, shell: &dyn GuestShell, mapping: &SyncMapping) -> Result<()> {
        let guest = mapping.guest_path();
        info!(target: "sync", host = %mapping.host_path().display(), guest, "syncing via scp");

        shell
            .run_script(&format!("mkdir -p {}\n", quote(guest)))
            .await?;

        let sources = scp_sources(mapping.host_path())?;
        if sources.is_empty() {
            info!(target: "sync", host = %mapping.host_path().display(), "host directory is empty, nothing to copy");
            return Ok(());
        }
        if !shell.push(&sources, guest).await? {
            bail!("scp to {} failed", guest);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Guest shell that fails the first `fail_first` scripts
    struct FlakyShell {
        fail_first: usize,
        scripts: Mutex<Vec<String>>,
        pushed: Mutex<Vec<(Vec<PathBuf>, String)>>,
    }

    impl FlakyShell {
        fn new(fail_first: usize) -> Self {
            Self {
                fail_first,
                scripts: Mutex::new(Vec::new()),
                pushed: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl GuestShell for FlakyShell {
        async fn run_script(&self, script: &str) -> Result<bool> {
            let mut scripts = self.scripts.lock().unwrap();
            scripts.push(script.to_string());
            Ok(scripts.len() > self.fail_first)
        }

        async fn push(&self, sources: &[PathBuf], guest_dir: &str) -> Result<bool> {
            self.pushed
                .lock()
                .unwrap()
                .push((sources.to_vec(), guest_dir.to_string()));
            Ok(true)
        }
    }

    fn fast_ctx(os: OsFamily) -> SyncContext {
        SyncContext {
            attempts: 3,
            pause: Duration::from_millis(1),
            ..SyncContext::new(os, false)
        }
    }

    fn mapping(spec: &str, mode: SyncMode) -> SyncMapping {
        SyncMapping::parse(spec, mode, Path::new("/")).unwrap()
    }

    #[test]
    fn test_sshfs_script_per_os() {
        let netbsd = sshfs_mount_script(OsFamily::NetBsd, Path::new("/src"), "/mnt");
        assert!(netbsd.contains("/usr/sbin/mount_psshfs "));
        assert!(netbsd.contains("host:/src"));
        assert!(!netbsd.contains("sshfs -o"));

        let freebsd = sshfs_mount_script(OsFamily::FreeBsd, Path::new("/src"), "/mnt");
        assert!(freebsd.contains("kldload fusefs"));
        assert!(freebsd.contains("sshfs -o reconnect,ServerAliveCountMax=2,allow_other,default_permissions "));
        assert!(freebsd.trim_end().ends_with("/mnt"));

        let openbsd = sshfs_mount_script(OsFamily::OpenBsd, Path::new("/my src"), "/mnt");
        assert!(!openbsd.contains("kldload"));
        assert!(openbsd.contains("'host:/my src'"));
    }

    #[test]
    fn test_nfs_script_uses_tcp_flag_on_openbsd() {
        let s = nfs_mount_script(OsFamily::OpenBsd, Path::new("/src"), "/mnt");
        assert!(s.contains("mount -t nfs -o -T "));
        assert!(s.contains("192.168.122.2:/src"));
        let s = nfs_mount_script(OsFamily::FreeBsd, Path::new("/src"), "/mnt");
        assert!(s.contains("/sbin/mount "));
        assert!(!s.contains("-T"));
    }

    #[test]
    fn test_rsync_script() {
        let s = rsync_pull_script(Path::new("/src/"), "/dst", None);
        assert!(s.contains("rsync -avrtopg --delete "));
        assert!(s.contains("host:/src/"));
        assert!(!s.contains("host:/src//"));
        assert!(s.trim_end().ends_with("/dst/"));
        let s = rsync_pull_script(Path::new("/src"), "/dst", Some("/usr/bin/rsync"));
        assert!(s.contains("--rsync-path=/usr/bin/rsync "));
    }

    #[test]
    fn test_exports() {
        let line = export_line(Path::new("/srv/data"), 1000, 100);
        assert_eq!(
            line,
            "/srv/data *(rw,insecure,async,no_subtree_check,anonuid=1000,anongid=100)"
        );
        assert!(export_present(&format!("# comment\n{}\n", line), Path::new("/srv/data")));
        assert!(!export_present(&line, Path::new("/srv")));
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let shell = FlakyShell::new(2);
        let backend = SshfsBackend { ctx: fast_ctx(OsFamily::FreeBsd) };
        backend.activate(&shell, &mapping("/h:/g", SyncMode::Sshfs)).await.unwrap();
        assert_eq!(shell.scripts.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausted() {
        let shell = FlakyShell::new(10);
        let backend = SshfsBackend { ctx: fast_ctx(OsFamily::FreeBsd) };
        let err = backend.activate(&shell, &mapping("/h:/g", SyncMode::Sshfs)).await.unwrap_err();
        assert!(err.to_string().contains("after 3 attempts"));
    }

    #[tokio::test]
    async fn test_sshfs_refused_on_windows_host() {
        let shell = FlakyShell::new(0);
        let ctx = SyncContext { host_is_windows: true, ..fast_ctx(OsFamily::FreeBsd) };
        let backend = backend_for(SyncMode::Sshfs, ctx);
        assert!(backend.activate(&shell, &mapping("/h:/g", SyncMode::Sshfs)).await.is_err());
        assert!(shell.scripts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scp_pushes_directory_entries() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();

        let shell = FlakyShell::new(0);
        let spec = format!("{}:/data", dir.path().display());
        ScpBackend.activate(&shell, &mapping(&spec, SyncMode::Scp)).await.unwrap();

        let pushed = shell.pushed.lock().unwrap();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].0, vec![dir.path().join("a.txt"), dir.path().join("b.txt")]);
        assert_eq!(pushed[0].1, "/data");
    }

    #[tokio::test]
    async fn test_scp_missing_host_path() {
        let shell = FlakyShell::new(0);
        let err = ScpBackend
            .activate(&shell, &mapping("/definitely/not/here:/data", SyncMode::Scp))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}
