//! Host→guest folder sharing.
//!
//! [`SyncPlanner`] owns every [`SyncMapping`] for a session. Mappings are
//! validated before anything is spawned, activated once the guest answers on
//! SSH, and torn down in reverse activation order.

pub mod backends;

pub use backends::{backend_for, SyncBackend, SyncContext};

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::QvmError;
use crate::ssh::GuestShell;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Rsync,
    Sshfs,
    Nfs,
    Scp,
}

impl SyncMode {
    /// Parse `--sync`. Empty selects rsync.
    pub fn parse(s: &str) -> Result<Self, QvmError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "rsync" => Ok(SyncMode::Rsync),
            "sshfs" => Ok(SyncMode::Sshfs),
            "nfs" => Ok(SyncMode::Nfs),
            "scp" => Ok(SyncMode::Scp),
            other => Err(QvmError::config(format!(
                "unknown sync mode '{}' (expected rsync, sshfs, nfs or scp)",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Rsync => "rsync",
            SyncMode::Sshfs => "sshfs",
            SyncMode::Nfs => "nfs",
            SyncMode::Scp => "scp",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Pending,
    Validated,
    Active,
    Failed,
    Stopped,
}

impl SyncState {
    fn can_move_to(self, next: SyncState) -> bool {
        use SyncState::*;
        matches!(
            (self, next),
            (Pending, Validated) | (Validated, Active) | (Validated, Failed) | (Active, Stopped)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncMapping {
    host_path: PathBuf,
    guest_path: String,
    mode: SyncMode,
    state: SyncState,
    error: Option<String>,
}

impl SyncMapping {
    /// Parse a `-v HOST:GUEST` argument. The split happens at the last `:`
    /// so Windows drive letters survive.
    pub fn parse(spec: &str, mode: SyncMode, cwd: &Path) -> Result<Self, QvmError> {
        let invalid = |why: &str| {
            QvmError::config(format!("invalid -v '{}': {} (use HOST_PATH:GUEST_PATH)", spec, why))
        };

        let (host, guest) = spec.rsplit_once(':').ok_or_else(|| invalid("missing ':'"))?;
        if host.is_empty() {
            return Err(invalid("empty host path"));
        }
        if guest.is_empty() {
            return Err(invalid("empty guest path"));
        }
        if !guest.starts_with('/') {
            return Err(invalid("guest path must be absolute"));
        }

        let host = PathBuf::from(shellexpand::tilde(host).as_ref());
        let host_path = if host.is_absolute() { host } else { cwd.join(host) };

        Ok(Self {
            host_path,
            guest_path: guest.to_string(),
            mode,
            state: SyncState::Pending,
            error: None,
        })
    }

    pub fn host_path(&self) -> &Path {
        &self.host_path
    }

    pub fn guest_path(&self) -> &str {
        &self.guest_path
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn transition(&mut self, next: SyncState) -> Result<()> {
        if !self.state.can_move_to(next) {
            bail!(
                "illegal sync transition {:?} -> {:?} for {}",
                self.state,
                next,
                self.host_path.display()
            );
        }
        self.state = next;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncFailure {
    pub host_path: PathBuf,
    pub guest_path: String,
    pub error: String,
}

/// Outcome of activating or stopping all mappings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub succeeded: usize,
    pub failures: Vec<SyncFailure>,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncPlanner {
    mode: SyncMode,
    mappings: Vec<SyncMapping>,
    /// Indices into `mappings`, in activation order
    activated: Vec<usize>,
}

impl SyncPlanner {
    /// Validate the sync mode and every mapping. Nothing is touched on the
    /// host or in the guest.
    pub fn validate(mode: &str, specs: &[String], cwd: &Path) -> Result<Self, QvmError> {
        let mode = SyncMode::parse(mode)?;
        let mut mappings = Vec::with_capacity(specs.len());
        for spec in specs {
            let mut mapping = SyncMapping::parse(spec, mode, cwd)?;
            mapping.state = SyncState::Validated;
            mappings.push(mapping);
        }
        Ok(Self {
            mode,
            mappings,
            activated: Vec::new(),
        })
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    pub fn mappings(&self) -> &[SyncMapping] {
        &self.mappings
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Activate every validated mapping in order. A failure is recorded and
    /// the next mapping is still attempted.
    pub async fn activate(
        &mut self,
        backend: &dyn SyncBackend,
        shell: &dyn GuestShell,
    ) -> Result<SyncReport> {
        let mut report = SyncReport::default();

        for idx in 0..self.mappings.len() {
            if self.mappings[idx].state != SyncState::Validated {
                continue;
            }

            let outcome = backend.activate(shell, &self.mappings[idx]).await;
            let mapping = &mut self.mappings[idx];
            match outcome {
                Ok(()) => {
                    mapping.transition(SyncState::Active)?;
                    self.activated.push(idx);
                    report.succeeded += 1;
                    info!(
                        target: "sync",
                        mode = %mapping.mode,
                        host = %mapping.host_path.display(),
                        guest = %mapping.guest_path,
                        "shared folder ready"
                    );
                }
                Err(e) => {
                    mapping.transition(SyncState::Failed)?;
                    mapping.error = Some(format!("{:#}", e));
                    warn!(
                        target: "sync",
                        mode = %mapping.mode,
                        host = %mapping.host_path.display(),
                        guest = %mapping.guest_path,
                        error = %format!("{:#}", e),
                        "shared folder failed"
                    );
                    report.failures.push(SyncFailure {
                        host_path: mapping.host_path.clone(),
                        guest_path: mapping.guest_path.clone(),
                        error: format!("{:#}", e),
                    });
                }
            }
        }

        Ok(report)
    }

    /// Stop active mappings, most recently activated first.
    pub async fn teardown(
        &mut self,
        backend: &dyn SyncBackend,
        shell: &dyn GuestShell,
    ) -> Result<SyncReport> {
        let mut report = SyncReport::default();

        while let Some(idx) = self.activated.pop() {
            let result = backend.stop(shell, &self.mappings[idx]).await;
            let mapping = &mut self.mappings[idx];
            mapping.transition(SyncState::Stopped)?;
            match result {
                Ok(()) => report.succeeded += 1,
                Err(e) => {
                    warn!(target: "sync", guest = %mapping.guest_path, error = %e, "failed to stop shared folder");
                    report.failures.push(SyncFailure {
                        host_path: mapping.host_path.clone(),
                        guest_path: mapping.guest_path.clone(),
                        error: format!("{:#}", e),
                    });
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_mode_parse() {
        assert_eq!(SyncMode::parse("").unwrap(), SyncMode::Rsync);
        assert_eq!(SyncMode::parse("sshfs").unwrap(), SyncMode::Sshfs);
        assert_eq!(SyncMode::parse("NFS").unwrap(), SyncMode::Nfs);
        assert!(matches!(SyncMode::parse("ftp"), Err(QvmError::Config(_))));
    }

    #[test]
    fn test_mapping_parse() {
        let cwd = Path::new("/work");
        let m = SyncMapping::parse("src:/mnt/src", SyncMode::Rsync, cwd).unwrap();
        assert_eq!(m.host_path(), Path::new("/work/src"));
        assert_eq!(m.guest_path(), "/mnt/src");
        assert_eq!(m.state(), SyncState::Pending);

        let abs = SyncMapping::parse("/data:/data", SyncMode::Rsync, cwd).unwrap();
        assert_eq!(abs.host_path(), Path::new("/data"));

        let win = SyncMapping::parse("C:\\proj:/proj", SyncMode::Scp, cwd).unwrap();
        assert_eq!(win.guest_path(), "/proj");
    }

    #[test]
    fn test_mapping_parse_errors() {
        let cwd = Path::new("/work");
        for bad in ["nocolon", ":/guest", "/host:", "/host:relative"] {
            assert!(
                matches!(SyncMapping::parse(bad, SyncMode::Rsync, cwd), Err(QvmError::Config(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_validate_rejects_unknown_mode_without_mappings() {
        assert!(matches!(
            SyncPlanner::validate("bogus", &[], Path::new("/")),
            Err(QvmError::Config(_))
        ));
    }

    #[test]
    fn test_state_machine() {
        let mut m = SyncMapping::parse("/a:/b", SyncMode::Rsync, Path::new("/")).unwrap();
        assert!(m.transition(SyncState::Active).is_err());
        m.transition(SyncState::Validated).unwrap();
        m.transition(SyncState::Active).unwrap();
        assert!(m.transition(SyncState::Failed).is_err());
        m.transition(SyncState::Stopped).unwrap();
        assert!(m.transition(SyncState::Active).is_err());
    }

    /// Backend that fails for guest paths containing "bad" and records calls
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl SyncBackend for Recorder {
        async fn activate(&self, _shell: &dyn GuestShell, m: &SyncMapping) -> Result<()> {
            self.calls.lock().unwrap().push(format!("up {}", m.guest_path()));
            if m.guest_path().contains("bad") {
                bail!("mount refused");
            }
            Ok(())
        }

        async fn stop(&self, _shell: &dyn GuestShell, m: &SyncMapping) -> Result<()> {
            self.calls.lock().unwrap().push(format!("down {}", m.guest_path()));
            Ok(())
        }
    }

    struct NoShell;

    #[async_trait::async_trait]
    impl GuestShell for NoShell {
        async fn run_script(&self, _script: &str) -> Result<bool> {
            Ok(true)
        }
        async fn push(&self, _sources: &[PathBuf], _guest_dir: &str) -> Result<bool> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_activation_continues_after_failure_and_teardown_reverses() {
        let specs = vec!["/a:/one".to_string(), "/b:/bad".to_string(), "/c:/three".to_string()];
        let mut planner = SyncPlanner::validate("", &specs, Path::new("/")).unwrap();
        let backend = Recorder::default();

        let report = planner.activate(&backend, &NoShell).await.unwrap();
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].guest_path, "/bad");

        let states: Vec<SyncState> = planner.mappings().iter().map(|m| m.state()).collect();
        assert_eq!(states, vec![SyncState::Active, SyncState::Failed, SyncState::Active]);
        assert!(planner.mappings()[1].error().unwrap().contains("mount refused"));

        let down = planner.teardown(&backend, &NoShell).await.unwrap();
        assert!(down.is_clean());
        assert_eq!(down.succeeded, 2);

        let calls = backend.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec!["up /one", "up /bad", "up /three", "down /three", "down /one"]
        );
        assert_eq!(planner.mappings()[0].state(), SyncState::Stopped);
        assert_eq!(planner.mappings()[1].state(), SyncState::Failed);
    }
}
