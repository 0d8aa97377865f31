use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::plan::LaunchPlan;
use crate::error::QvmError;
use crate::utils;

/// Lines of QEMU output kept for error reports
const OUTPUT_TAIL_LINES: usize = 64;

const FOLLOW_INTERVAL: Duration = Duration::from_millis(200);

/// stderr fragments QEMU prints when a host port cannot be bound
const BIND_FAILURE_MARKERS: &[&str] = &[
    "Could not set up host forwarding rule",
    "Address already in use",
    "Failed to bind socket",
    "Failed to start VNC server",
];

/// Where QEMU's stdout/stderr go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QemuOutput {
    /// QEMU owns the terminal (console mode)
    Inherit,
    /// Both streams appended to this file, which outlives the launcher
    LogFile(PathBuf),
}

/// A running QEMU process.
///
/// Outside console mode the process gets its own process group and writes
/// to a log file, so a session left running in the background never depends
/// on the launcher's terminal or pipes.
pub struct QemuProcess {
    name: String,
    process: Option<Child>,
    pid: Option<u32>,
    log: Option<PathBuf>,
    follower: Option<(watch::Sender<bool>, JoinHandle<()>)>,
}

impl QemuProcess {
    /// Resolve the plan's binary on PATH and start it.
    pub fn spawn(plan: &LaunchPlan) -> Result<Self> {
        let binary = which::which(plan.binary()).map_err(|_| {
            QvmError::process(format!(
                "QEMU binary '{}' not found; install QEMU or check PATH",
                plan.binary()
            ))
        })?;
        debug!(target: "qemu", cmd = %plan.command_line(), "QEMU command line");
        let output = match plan.output_log() {
            Some(log) => QemuOutput::LogFile(log.clone()),
            None => QemuOutput::Inherit,
        };
        Self::spawn_command(plan.name(), &binary, &plan.argv(), output)
    }

    /// Start `program` with `args`.
    pub fn spawn_command(
        name: &str,
        program: &Path,
        args: &[String],
        output: QemuOutput,
    ) -> Result<Self> {
        info!(target: "qemu", vm = %name, program = %program.display(), "starting QEMU");

        let mut cmd = Command::new(program);
        cmd.args(args);

        let log = match output {
            QemuOutput::Inherit => {
                cmd.stdin(Stdio::inherit())
                    .stdout(Stdio::inherit())
                    .stderr(Stdio::inherit());
                None
            }
            QemuOutput::LogFile(path) => {
                if let Some(dir) = path.parent() {
                    std::fs::create_dir_all(dir)
                        .with_context(|| format!("creating {}", dir.display()))?;
                }
                let file = std::fs::File::create(&path)
                    .with_context(|| format!("creating QEMU log {}", path.display()))?;
                let stderr = file.try_clone().context("duplicating QEMU log handle")?;
                cmd.stdin(Stdio::null())
                    .stdout(Stdio::from(file))
                    .stderr(Stdio::from(stderr));
                #[cfg(unix)]
                cmd.process_group(0);
                Some(path)
            }
        };

        let child = cmd
            .spawn()
            .map_err(|e| QvmError::process(format!("failed to start {}: {}", program.display(), e)))?;
        let pid = child.id();

        let follower = log.as_ref().map(|path| {
            let (tx, rx) = watch::channel(false);
            let vm = name.to_string();
            let handle = follow_file(path.clone(), rx, move |line| {
                warn!(target: "qemu", vm = %vm, "{}", line);
            });
            (tx, handle)
        });

        info!(target: "qemu", vm = %name, pid = ?pid, log = ?log, "QEMU started");
        Ok(Self {
            name: name.to_string(),
            process: Some(child),
            pid,
            log,
            follower,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// QEMU's output log, if it is not on the terminal
    pub fn log_path(&self) -> Option<&Path> {
        self.log.as_deref()
    }

    /// Last lines QEMU wrote
    pub fn stderr_output(&self) -> String {
        let Some(path) = &self.log else {
            return String::new();
        };
        let Ok(text) = std::fs::read_to_string(path) else {
            return String::new();
        };
        let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
        let skip = lines.len().saturating_sub(OUTPUT_TAIL_LINES);
        lines[skip..].join("\n")
    }

    /// Exit status if the process has already exited
    pub fn try_exit(&mut self) -> Result<Option<ExitStatus>> {
        match self.process.as_mut() {
            Some(child) => child.try_wait().context("polling QEMU process"),
            None => Ok(None),
        }
    }

    /// Wait for the QEMU process to exit
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        let child = self
            .process
            .as_mut()
            .ok_or_else(|| anyhow!("QEMU process not running"))?;
        child.wait().await.context("waiting for QEMU process")
    }

    /// Typed error describing an early exit, based on what QEMU printed
    pub fn exit_error(&self, status: ExitStatus) -> QvmError {
        classify_exit(status, &self.stderr_output())
    }

    /// SIGTERM, then SIGKILL once `grace` has passed.
    pub async fn stop(&mut self, grace: Duration) -> Result<()> {
        let stopped = self.stop_process(grace).await;
        if let Some((tx, handle)) = self.follower.take() {
            let _ = tx.send(true);
            let _ = handle.await;
        }
        stopped
    }

    async fn stop_process(&mut self, grace: Duration) -> Result<()> {
        let Some(mut child) = self.process.take() else {
            return Ok(());
        };
        if child.try_wait()?.is_some() {
            return Ok(());
        }

        info!(target: "qemu", vm = %self.name, pid = ?self.pid, "stopping QEMU");
        if let Some(pid) = self.pid {
            utils::terminate(pid);
        }

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => {
                debug!(target: "qemu", status = ?status.ok(), "QEMU exited");
            }
            Err(_) => {
                warn!(target: "qemu", vm = %self.name, "QEMU did not exit gracefully, killing");
                child.kill().await.context("killing QEMU process")?;
            }
        }
        Ok(())
    }

    /// Give up ownership and leave the process running. Its output keeps
    /// going to the log file.
    pub fn detach(mut self) -> Option<u32> {
        if let Some((tx, handle)) = self.follower.take() {
            let _ = tx.send(true);
            handle.abort();
        }
        self.process.take();
        self.pid
    }
}

/// Map an early QEMU exit to an error class. Port binding failures are
/// resource errors, everything else is a process error.
pub fn classify_exit(status: ExitStatus, stderr: &str) -> QvmError {
    let detail = if stderr.trim().is_empty() {
        format!("QEMU exited with {}", status)
    } else {
        format!("QEMU exited with {}: {}", status, stderr.trim())
    };
    if BIND_FAILURE_MARKERS.iter().any(|m| stderr.contains(m)) {
        QvmError::resource(detail)
    } else {
        QvmError::process(detail)
    }
}

/// Follow the serial log file into tracing until `shutdown` flips.
pub fn spawn_serial_tail(path: PathBuf, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    follow_file(path, shutdown, |line| debug!(target: "serial", "{}", line))
}

/// Poll `path` for appended lines and hand each non-empty one to `on_line`
/// until `shutdown` flips.
fn follow_file<F>(path: PathBuf, mut shutdown: watch::Receiver<bool>, mut on_line: F) -> JoinHandle<()>
where
    F: FnMut(&str) + Send + 'static,
{
    tokio::spawn(async move {
        let mut offset = 0u64;
        let mut pending = String::new();
        loop {
            if let Ok(mut file) = tokio::fs::File::open(&path).await {
                if file.seek(std::io::SeekFrom::Start(offset)).await.is_ok() {
                    let mut buf = Vec::new();
                    if let Ok(n) = file.read_to_end(&mut buf).await {
                        offset += n as u64;
                        pending.push_str(&String::from_utf8_lossy(&buf));
                        while let Some(idx) = pending.find('\n') {
                            let line: String = pending.drain(..=idx).collect();
                            let line = line.trim_end();
                            if !line.is_empty() {
                                on_line(line);
                            }
                        }
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(FOLLOW_INTERVAL) => {}
                _ = shutdown.changed() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(dir: &tempfile::TempDir, script: &str) -> QemuProcess {
        QemuProcess::spawn_command(
            "test-vm",
            Path::new("/bin/sh"),
            &["-c".into(), script.into()],
            QemuOutput::LogFile(dir.path().join("test-vm.log")),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_stderr_captured() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut p = sh(&dir, "echo 'qemu-system-x86_64: Could not set up host forwarding rule' >&2; exit 1");
        let status = p.wait().await.unwrap();
        assert!(!status.success());
        assert!(matches!(p.exit_error(status), QvmError::Resource(_)));
    }

    #[tokio::test]
    async fn test_generic_failure_is_process_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut p = sh(&dir, "echo 'bad option' >&2; exit 1");
        let status = p.wait().await.unwrap();
        assert!(matches!(p.exit_error(status), QvmError::Process(_)));
        assert!(p.stderr_output().contains("bad option"));
    }

    #[tokio::test]
    async fn test_output_tail_is_bounded() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut p = sh(&dir, "i=0; while [ $i -lt 100 ]; do echo line$i >&2; i=$((i+1)); done");
        p.wait().await.unwrap();
        let tail = p.stderr_output();
        assert_eq!(tail.lines().count(), OUTPUT_TAIL_LINES);
        assert!(tail.ends_with("line99"));
        assert!(!tail.contains("line35\n"));
    }

    #[tokio::test]
    async fn test_detached_process_keeps_writing_log() {
        let dir = tempfile::TempDir::new().unwrap();
        let p = sh(&dir, "sleep 0.3; echo still-here");
        let log = p.log_path().unwrap().to_path_buf();
        let pid = p.detach().unwrap();

        tokio::time::sleep(Duration::from_millis(800)).await;
        let text = std::fs::read_to_string(&log).unwrap();
        assert!(text.contains("still-here"));
        utils::terminate(pid);
    }

    #[tokio::test]
    async fn test_stop_terminates() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut p = sh(&dir, "sleep 30");
        let pid = p.pid().unwrap();
        assert!(p.try_exit().unwrap().is_none());
        p.stop(Duration::from_secs(5)).await.unwrap();
        assert!(!utils::is_process_alive(pid));
    }

    #[tokio::test]
    async fn test_stop_escalates_to_kill() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut p = sh(&dir, "trap '' TERM; sleep 30");
        let pid = p.pid().unwrap();
        // give the shell time to install the trap
        tokio::time::sleep(Duration::from_millis(200)).await;
        p.stop(Duration::from_millis(300)).await.unwrap();
        assert!(!utils::is_process_alive(pid));
    }

    #[tokio::test]
    async fn test_missing_program_is_process_error() {
        let err = QemuProcess::spawn_command("x", Path::new("/nonexistent/qemu"), &[], QemuOutput::Inherit)
            .err()
            .unwrap();
        assert!(matches!(crate::error::classify(&err), Some(QvmError::Process(_))));
    }

    #[tokio::test]
    async fn test_serial_tail_follows_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = dir.path().join("vm.serial.log");
        let (tx, rx) = watch::channel(false);
        let handle = spawn_serial_tail(log.clone(), rx);
        tokio::fs::write(&log, "boot ok\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
