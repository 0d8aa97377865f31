//! SSH access to the guest through the forwarded SSH port.

pub mod config;

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

#[cfg(windows)]
pub const NULL_KNOWN_HOSTS: &str = "NUL";
#[cfg(not(windows))]
pub const NULL_KNOWN_HOSTS: &str = "/dev/null";

/// Runs things inside the guest. Implemented over ssh for real sessions and
/// by recording fakes in tests.
#[async_trait::async_trait]
pub trait GuestShell: Send + Sync {
    /// Feed a POSIX `sh` script to the guest. `Ok(true)` on exit status 0.
    async fn run_script(&self, script: &str) -> Result<bool>;

    /// Copy host paths into a guest directory.
    async fn push(&self, sources: &[PathBuf], guest_dir: &str) -> Result<bool>;
}

/// Connection parameters for the guest's forwarded SSH port
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub identity: Option<PathBuf>,
}

impl SshTarget {
    pub fn new(port: u16) -> Self {
        Self {
            host: "localhost".to_string(),
            port,
            user: "root".to_string(),
            identity: None,
        }
    }

    pub fn with_identity(mut self, identity: Option<PathBuf>) -> Self {
        self.identity = identity;
        self
    }

    fn common_opts(&self) -> Vec<String> {
        let mut opts = vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            format!("UserKnownHostsFile={}", NULL_KNOWN_HOSTS),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
        ];
        if let Some(key) = &self.identity {
            opts.push("-i".to_string());
            opts.push(key.display().to_string());
        }
        opts
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Arguments for `ssh`, without the remote command
    pub fn ssh_args(&self) -> Vec<String> {
        let mut args = self.common_opts();
        args.push("-p".to_string());
        args.push(self.port.to_string());
        args.push(self.destination());
        args
    }

    /// Arguments for `scp` pushing `sources` into `guest_dir`
    pub fn scp_args(&self, sources: &[PathBuf], guest_dir: &str) -> Vec<String> {
        let mut args = vec![
            "-r".to_string(),
            "-q".to_string(),
            "-O".to_string(),
            "-P".to_string(),
            self.port.to_string(),
        ];
        args.extend(self.common_opts());
        args.extend(sources.iter().map(|s| s.display().to_string()));
        args.push(format!(
            "{}:{}/",
            self.destination(),
            guest_dir.trim_end_matches('/')
        ));
        args
    }

    /// `ssh` invocation running `remote` in the guest. An empty `remote`
    /// gives an interactive login.
    pub fn command(&self, remote: &[String]) -> Command {
        let mut cmd = Command::new("ssh");
        if remote.is_empty() {
            cmd.arg("-t");
        }
        cmd.args(self.ssh_args());
        cmd.args(remote);
        cmd
    }

    /// Printable form of the interactive login, for user hints
    pub fn display_command(&self) -> String {
        let mut words = vec!["ssh".to_string()];
        words.extend(self.ssh_args());
        shell_words::join(words)
    }
}

#[async_trait::async_trait]
impl GuestShell for SshTarget {
    async fn run_script(&self, script: &str) -> Result<bool> {
        let mut child = Command::new("ssh")
            .args(self.ssh_args())
            .arg("sh")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("spawning ssh")?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(script.as_bytes())
                .await
                .context("writing script to ssh stdin")?;
        }

        let output = child.wait_with_output().await.context("waiting for ssh")?;
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            debug!(target: "ssh", "{}", line);
        }
        if !output.status.success() {
            debug!(
                target: "ssh",
                status = ?output.status.code(),
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "guest script failed"
            );
        }
        Ok(output.status.success())
    }

    async fn push(&self, sources: &[PathBuf], guest_dir: &str) -> Result<bool> {
        let status = Command::new("scp")
            .args(self.scp_args(sources, guest_dir))
            .stdin(Stdio::null())
            .status()
            .await
            .context("running scp")?;
        Ok(status.success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_args() {
        let t = SshTarget::new(10022);
        let args = t.ssh_args();
        assert_eq!(args.last().unwrap(), "root@localhost");
        let p = args.iter().position(|a| a == "-p").unwrap();
        assert_eq!(args[p + 1], "10022");
        assert!(args.contains(&"StrictHostKeyChecking=no".to_string()));
        assert!(!args.contains(&"-i".to_string()));
    }

    #[test]
    fn test_identity_is_passed() {
        let t = SshTarget::new(10022).with_identity(Some(PathBuf::from("/k/id")));
        let args = t.ssh_args();
        let i = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[i + 1], "/k/id");
    }

    #[test]
    fn test_scp_args_use_capital_p_and_legacy_protocol() {
        let t = SshTarget::new(2222);
        let args = t.scp_args(&[PathBuf::from("/src/a"), PathBuf::from("/src/b")], "/data/");
        assert_eq!(&args[..5], &["-r", "-q", "-O", "-P", "2222"]);
        assert_eq!(args.last().unwrap(), "root@localhost:/data/");
        assert!(args.contains(&"/src/b".to_string()));
    }

    #[test]
    fn test_display_command_is_shell_quoted() {
        let t = SshTarget::new(10022).with_identity(Some(PathBuf::from("/my keys/id")));
        assert!(t.display_command().contains("'/my keys/id'"));
    }
}
