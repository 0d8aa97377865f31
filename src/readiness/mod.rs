//! Guest readiness detection.
//!
//! A guest is ready once its sshd answers on the forwarded port. Connecting
//! alone is not enough: user-mode NAT accepts on the host side as soon as
//! QEMU starts, so the probe waits for the `SSH-` identification line.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, info};

use crate::error::QvmError;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_BOOT_TIMEOUT: Duration = Duration::from_secs(600);
const BANNER_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a single probe attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ready(String),
    Refused,
    NoBanner,
}

/// Polls an SSH endpoint until it answers or the deadline passes.
#[derive(Debug, Clone)]
pub struct SshProbe {
    addr: SocketAddr,
    interval: Duration,
    deadline: Duration,
    banner_timeout: Duration,
}

impl SshProbe {
    pub fn new(addr: SocketAddr, deadline: Duration) -> Self {
        Self {
            addr,
            interval: DEFAULT_INTERVAL,
            deadline,
            banner_timeout: BANNER_TIMEOUT,
        }
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn banner_timeout(mut self, banner_timeout: Duration) -> Self {
        self.banner_timeout = banner_timeout;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// One connect + banner read
    pub async fn probe_once(&self) -> ProbeOutcome {
        let mut stream = match timeout(self.banner_timeout, TcpStream::connect(self.addr)).await {
            Ok(Ok(s)) => s,
            _ => return ProbeOutcome::Refused,
        };

        let mut buf = [0u8; 256];
        match timeout(self.banner_timeout, stream.read(&mut buf)).await {
            Ok(Ok(n)) if n >= 4 && buf.starts_with(b"SSH-") => {
                let banner = String::from_utf8_lossy(&buf[..n]).trim_end().to_string();
                ProbeOutcome::Ready(banner)
            }
            _ => ProbeOutcome::NoBanner,
        }
    }

    /// Wait for the guest, returning the SSH banner.
    ///
    /// Gives up with a `NetworkError` once the deadline passes.
    pub async fn wait(&self) -> Result<String, QvmError> {
        info!(
            target: "session",
            addr = %self.addr,
            timeout_secs = self.deadline.as_secs(),
            "waiting for guest SSH"
        );
        let start = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match self.probe_once().await {
                ProbeOutcome::Ready(banner) => {
                    info!(
                        target: "session",
                        addr = %self.addr,
                        elapsed_secs = start.elapsed().as_secs(),
                        banner = %banner,
                        "guest SSH ready"
                    );
                    return Ok(banner);
                }
                outcome => {
                    debug!(target: "session", attempt = attempts, ?outcome, "guest SSH not ready");
                }
            }

            let elapsed = start.elapsed();
            if elapsed >= self.deadline {
                return Err(QvmError::network(format!(
                    "guest SSH on {} not ready after {}s ({} attempts)",
                    self.addr,
                    elapsed.as_secs(),
                    attempts
                )));
            }
            sleep(self.interval.min(self.deadline - elapsed)).await;
        }
    }
}
