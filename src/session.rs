//! Session lifecycle: spawn QEMU, wait for the guest, hand it to the user and
//! tear everything down in order.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::display::{DisplayBridge, RelayConfig};
use crate::error::QvmError;
use crate::image;
use crate::network::{PortAllocator, PortRequest, WEB_CONSOLE_BASE_PORT};
use crate::qemu::vm::{spawn_serial_tail, QemuProcess};
use crate::qemu::LaunchPlan;
use crate::readiness::{SshProbe, DEFAULT_BOOT_TIMEOUT};
use crate::ssh::{config as ssh_config, GuestShell, SshTarget};
use crate::state::{SessionRecord, SessionStore};
use crate::sync::{backend_for, SyncContext, SyncPlanner};

/// How long QEMU must stay up before the launch counts as started
pub const STARTUP_GRACE: Duration = Duration::from_secs(1);
/// SIGTERM to SIGKILL delay when stopping QEMU
pub const STOP_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Created,
    Starting,
    Running,
    Ready,
    Failed,
    Stopping,
    Stopped,
}

impl SessionState {
    pub fn can_move_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Created, Starting) => true,
            (Starting, Running) => true,
            (Running, Ready) => true,
            (Starting | Running, Failed) => true,
            (Stopping, Stopped) => true,
            (Stopping | Stopped, Stopping) => false,
            (_, Stopping) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == SessionState::Stopped
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// What happens once the guest is reachable
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AfterReady {
    /// Run this command over ssh and exit with its status
    Command(Vec<String>),
    /// Return immediately, QEMU keeps running
    Detach,
    /// QEMU owns the terminal; wait for it to exit or for a signal
    Console,
    /// Interactive ssh login, then leave the VM running
    Interactive,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub after_ready: AfterReady,
    pub boot_timeout: Duration,
    /// Extra `--ssh-name` aliases
    pub ssh_names: Vec<String>,
    /// Host sshd port the guest's `host` alias uses
    pub host_ssh_port: Option<u16>,
    pub ssh_dir: PathBuf,
    pub sessions_dir: PathBuf,
}

impl SessionOptions {
    pub fn new(after_ready: AfterReady, ssh_dir: PathBuf, sessions_dir: PathBuf) -> Self {
        Self {
            after_ready,
            boot_timeout: DEFAULT_BOOT_TIMEOUT,
            ssh_names: Vec::new(),
            host_ssh_port: None,
            ssh_dir,
            sessions_dir,
        }
    }
}

/// SIGINT/SIGTERM listener
struct Interrupts {
    sigint: Signal,
    sigterm: Signal,
}

impl Interrupts {
    fn install() -> Result<Self> {
        Ok(Self {
            sigint: signal(SignalKind::interrupt()).context("installing SIGINT handler")?,
            sigterm: signal(SignalKind::terminate()).context("installing SIGTERM handler")?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.sigint.recv() => "SIGINT",
            _ = self.sigterm.recv() => "SIGTERM",
        }
    }
}

enum BootOutcome {
    Ready,
    /// QEMU exited, or waiting on it failed
    Exited(anyhow::Error),
    Interrupted(&'static str),
    TimedOut(QvmError),
}

/// Owns one session from spawn to teardown
pub struct SessionSupervisor {
    plan: LaunchPlan,
    sync: SyncPlanner,
    options: SessionOptions,
    state: watch::Sender<SessionState>,
    qemu: Option<QemuProcess>,
    bridge: Option<DisplayBridge>,
    serial_tail: Option<(watch::Sender<bool>, JoinHandle<()>)>,
    store: SessionStore,
    record: Option<SessionRecord>,
}

impl SessionSupervisor {
    pub fn new(plan: LaunchPlan, sync: SyncPlanner, options: SessionOptions) -> Self {
        let (state, _) = watch::channel(SessionState::Created);
        let store = SessionStore::new(options.sessions_dir.clone());
        Self {
            plan,
            sync,
            options,
            state,
            qemu: None,
            bridge: None,
            serial_tail: None,
            store,
            record: None,
        }
    }

    pub fn plan(&self) -> &LaunchPlan {
        &self.plan
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Completion signal; await `Ready` or `Stopped` on it
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn transition(&self, next: SessionState) -> Result<()> {
        let current = self.state();
        if !current.can_move_to(next) {
            bail!("illegal session transition {} -> {}", current, next);
        }
        debug!(target: "session", from = %current, to = %next, "session state");
        self.state.send_replace(next);
        Ok(())
    }

    fn guest_shell(&self) -> SshTarget {
        SshTarget::new(self.plan.ports().ssh.port).with_identity(self.plan.image().identity.clone())
    }

    /// Run the whole session. Returns the process exit code.
    pub async fn run(&mut self, allocator: &mut PortAllocator) -> Result<i32> {
        let mut interrupts = Interrupts::install()?;

        if let Err(e) = self.start().await {
            self.fail();
            self.teardown().await;
            return Err(e);
        }

        let console = self.options.after_ready == AfterReady::Console;
        let outcome = match self.wait_ready(&mut interrupts).await {
            Ok(outcome) => outcome,
            Err(e) => BootOutcome::Exited(e),
        };
        match outcome {
            BootOutcome::Ready => {}
            BootOutcome::Exited(e) => {
                self.fail();
                self.teardown().await;
                return Err(e);
            }
            BootOutcome::Interrupted(sig) => {
                info!(target: "session", signal = sig, "interrupted during boot");
                self.teardown().await;
                return Ok(130);
            }
            BootOutcome::TimedOut(e) if console => {
                warn!(target: "session", error = %e, "guest SSH never came up; serial console stays attached");
                return self.console_wait(&mut interrupts).await;
            }
            BootOutcome::TimedOut(e) => {
                // QEMU is left running so the guest can be inspected
                self.fail();
                if let Some(qemu) = self.qemu.take() {
                    let pid = qemu.detach();
                    warn!(target: "session", pid = ?pid, "QEMU left running after boot timeout");
                }
                self.stop_serial_tail().await;
                return Err(e.into());
            }
        }

        if let Err(e) = self.on_ready(allocator).await {
            self.teardown().await;
            return Err(e);
        }

        match self.options.after_ready.clone() {
            AfterReady::Console => {
                self.print_login_hint("You can login the VM with");
                self.console_wait(&mut interrupts).await
            }
            AfterReady::Detach => {
                self.release();
                self.print_login_hint("The VM is running in background");
                Ok(0)
            }
            AfterReady::Command(cmd) => {
                let code = self.run_guest_command(&cmd).await;
                self.release_after_foreground().await;
                code
            }
            AfterReady::Interactive => {
                let code = self.run_guest_command(&[]).await;
                self.release_after_foreground().await;
                code
            }
        }
    }

    /// Created → Starting → Running
    async fn start(&mut self) -> Result<()> {
        self.transition(SessionState::Starting)?;

        if let Some(layout) = &self.plan.image().pflash {
            image::prepare_pflash(layout).context("preparing UEFI pflash files")?;
        }

        let qemu = self.qemu.insert(QemuProcess::spawn(&self.plan)?);

        if let Some(log) = self.plan.serial_log() {
            let (tx, rx) = watch::channel(false);
            let handle = spawn_serial_tail(log.clone(), rx);
            self.serial_tail = Some((tx, handle));
        }

        let early_exit = tokio::select! {
            status = qemu.wait() => Some(status?),
            _ = tokio::time::sleep(STARTUP_GRACE) => None,
        };
        if let Some(status) = early_exit {
            return Err(qemu.exit_error(status).into());
        }

        self.transition(SessionState::Running)?;
        info!(
            target: "session",
            vm = %self.plan.name(),
            ssh_port = self.plan.ports().ssh.port,
            "QEMU running, waiting for guest"
        );
        Ok(())
    }

    /// Running → Ready, racing the probe against QEMU exit and interrupts
    async fn wait_ready(&mut self, interrupts: &mut Interrupts) -> Result<BootOutcome> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, self.plan.ports().ssh.port));
        let probe = SshProbe::new(addr, self.options.boot_timeout);
        let qemu = self
            .qemu
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("QEMU not started"))?;

        let outcome = tokio::select! {
            ready = probe.wait() => match ready {
                Ok(_) => BootOutcome::Ready,
                Err(e) => BootOutcome::TimedOut(e),
            },
            status = qemu.wait() => {
                let status = status?;
                let detail = qemu.stderr_output();
                BootOutcome::Exited(QvmError::process(format!(
                    "QEMU terminated during boot ({}){}",
                    status,
                    if detail.is_empty() { String::new() } else { format!(": {}", detail) }
                )).into())
            }
            sig = interrupts.recv() => BootOutcome::Interrupted(sig),
        };

        if matches!(outcome, BootOutcome::Ready) {
            self.transition(SessionState::Ready)?;
        }
        Ok(outcome)
    }

    /// Everything that needs a reachable guest
    async fn on_ready(&mut self, allocator: &mut PortAllocator) -> Result<()> {
        let shell = self.guest_shell();
        let name = self.plan.name().to_string();
        let ssh_port = self.plan.ports().ssh.port;

        match ssh_config::write_aliases(
            &self.options.ssh_dir,
            &name,
            &self.options.ssh_names,
            ssh_port,
            self.plan.image().identity.as_deref(),
        ) {
            Ok(files) => debug!(target: "session", ?files, "ssh aliases written"),
            Err(e) => warn!(target: "session", error = %format!("{:#}", e), "could not write ssh aliases"),
        }

        if let Some(pubkey) = self.plan.image().guest_pubkey.as_deref() {
            if pubkey.exists() {
                if let Err(e) = ssh_config::authorize_key(&self.options.ssh_dir, pubkey) {
                    warn!(target: "session", error = %format!("{:#}", e), "could not authorize guest key");
                }
            }
        }

        let script =
            ssh_config::guest_host_alias_script(self.options.host_ssh_port, &ssh_config::host_user());
        match shell.run_script(&script).await {
            Ok(true) => {}
            Ok(false) => warn!(target: "session", "guest 'host' alias script failed"),
            Err(e) => warn!(target: "session", error = %e, "could not install guest 'host' alias"),
        }

        let mut record = SessionRecord::new(
            name.clone(),
            self.qemu.as_ref().and_then(QemuProcess::pid),
            self.plan.ports().all(),
        );
        record.aliases = std::iter::once(name)
            .chain(std::iter::once(ssh_port.to_string()))
            .chain(self.options.ssh_names.iter().cloned())
            .collect();

        if !self.sync.is_empty() {
            let ctx = SyncContext::new(self.plan.os(), self.plan.host().is_windows());
            let backend = backend_for(self.sync.mode(), ctx);
            let report = self.sync.activate(backend.as_ref(), &shell).await?;
            if report.is_clean() {
                info!(target: "sync", count = report.succeeded, "shared folders ready");
            } else {
                for failure in &report.failures {
                    warn!(
                        target: "sync",
                        host = %failure.host_path.display(),
                        guest = %failure.guest_path,
                        error = %failure.error,
                        "shared folder unavailable"
                    );
                }
            }
        }

        let detached = self.options.after_ready == AfterReady::Detach;
        if self.plan.display().bridge_enabled() && detached {
            info!(target: "bridge", "web console is not served for detached sessions");
        } else if self.plan.display().bridge_enabled() {
            if let Some(vnc) = self.plan.ports().vnc {
                let request = match self.plan.display().web_port {
                    Some(port) => PortRequest::Explicit(port),
                    None => PortRequest::Preferred(WEB_CONSOLE_BASE_PORT),
                };
                let guest = SocketAddr::from((Ipv4Addr::LOCALHOST, vnc.port));
                let bridge = DisplayBridge::start(
                    allocator,
                    request,
                    self.plan.flags().scope(),
                    RelayConfig::new(guest),
                )
                .await?;
                println!("Web console: {}", bridge.url());
                record.web_console = Some(bridge.addr());
                record.ports.push(bridge.allocation());
                self.bridge = Some(bridge);
            }
        }

        match self.store.save(&record).await {
            Ok(path) => debug!(target: "session", path = %path.display(), "session record written"),
            Err(e) => warn!(target: "session", error = %format!("{:#}", e), "could not write session record"),
        }
        self.record = Some(record);
        Ok(())
    }

    /// Wait for QEMU to exit or for an interrupt, then tear down
    async fn console_wait(&mut self, interrupts: &mut Interrupts) -> Result<i32> {
        let Some(qemu) = self.qemu.as_mut() else {
            return Ok(0);
        };
        let code = tokio::select! {
            status = qemu.wait() => status.map(|status| {
                info!(target: "session", status = %status, "QEMU exited");
                status.code().unwrap_or(1)
            }),
            sig = interrupts.recv() => {
                info!(target: "session", signal = sig, "received signal, shutting down VM");
                Ok(130)
            }
        };
        self.teardown().await;
        code
    }

    async fn run_guest_command(&self, remote: &[String]) -> Result<i32> {
        let target = self.guest_shell();
        debug!(target: "session", cmd = %target.display_command(), ?remote, "ssh");
        let status = target
            .command(remote)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|e| QvmError::process(format!("failed to run ssh: {}", e)))?;
        Ok(status.code().unwrap_or(255))
    }

    /// Stop launcher-owned helpers and leave the VM running
    async fn release_after_foreground(&mut self) {
        if let Some(bridge) = self.bridge.take() {
            bridge.shutdown().await;
        }
        self.release();
        self.print_login_hint("The VM is still running in background");
    }

    fn release(&mut self) {
        if let Some(qemu) = self.qemu.take() {
            let pid = qemu.detach();
            debug!(target: "session", pid = ?pid, "leaving QEMU running");
        }
        if let Some((tx, handle)) = self.serial_tail.take() {
            let _ = tx.send(true);
            handle.abort();
        }
    }

    fn print_login_hint(&self, headline: &str) {
        println!("======================================");
        println!("{}:", headline);
        println!("  ssh {}", self.plan.name());
        println!("  ssh {}", self.plan.ports().ssh.port);
        for alias in &self.options.ssh_names {
            println!("  ssh {}", alias);
        }
        println!("======================================");
    }

    fn fail(&self) {
        if self.state().can_move_to(SessionState::Failed) {
            self.state.send_replace(SessionState::Failed);
        }
    }

    async fn stop_serial_tail(&mut self) {
        if let Some((tx, handle)) = self.serial_tail.take() {
            let _ = tx.send(true);
            let _ = handle.await;
        }
    }

    /// Stopping → Stopped: sync (reverse order), bridge, QEMU, record.
    /// Steps never abort each other.
    pub async fn teardown(&mut self) {
        if self.transition(SessionState::Stopping).is_err() {
            return;
        }

        let shell = self.guest_shell();
        let ctx = SyncContext::new(self.plan.os(), self.plan.host().is_windows());
        let backend = backend_for(self.sync.mode(), ctx);
        match self.sync.teardown(backend.as_ref(), &shell).await {
            Ok(report) if !report.is_clean() => {
                warn!(target: "sync", failures = report.failures.len(), "some shared folders did not stop cleanly")
            }
            Ok(_) => {}
            Err(e) => warn!(target: "sync", error = %e, "sync teardown failed"),
        }

        if let Some(bridge) = self.bridge.take() {
            bridge.shutdown().await;
        }

        if let Some(mut qemu) = self.qemu.take() {
            if let Err(e) = qemu.stop(STOP_GRACE).await {
                warn!(target: "session", error = %e, "failed to stop QEMU");
            }
        }

        self.stop_serial_tail().await;

        if let Some(record) = self.record.take() {
            if let Err(e) = self.store.remove(&record.name).await {
                warn!(target: "session", error = %e, "failed to remove session record");
            }
        }

        let _ = self.transition(SessionState::Stopped);
        info!(target: "session", vm = %self.plan.name(), "session stopped");
    }
}
