//! Per-viewer relay between a browser WebSocket and the guest RFB socket.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::rfb::{self, ClientFramer, ControlMessage, ReplayScript, Resume};
use crate::error::QvmError;

pub const DEFAULT_QUEUE_DEPTH: usize = 64;
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(250);

const CLOSE_GOING_AWAY: u16 = 1001;
const CLOSE_INTERNAL_ERROR: u16 = 1011;
const READ_CHUNK: usize = 16 * 1024;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_DESKTOP_NAME: u32 = 64 * 1024;

/// Settings shared read-only by every viewer
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub guest: SocketAddr,
    pub queue_depth: usize,
    pub reconnect_attempts: u32,
    pub backoff: Duration,
}

impl RelayConfig {
    pub fn new(guest: SocketAddr) -> Self {
        Self {
            guest,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

/// Bounded guest→viewer queue.
///
/// The guest reader never waits on a viewer. A push into a full queue
/// discards everything queued and closes the queue: RFB has no resync
/// points, so a viewer that missed bytes cannot continue.
pub struct ChunkQueue {
    chunks: Mutex<VecDeque<Vec<u8>>>,
    capacity: usize,
    closed: AtomicBool,
    overflowed: AtomicBool,
    notify: Notify,
}

impl ChunkQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            chunks: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
            overflowed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Queue a chunk; false once the queue has overflowed or closed.
    pub fn push(&self, chunk: Vec<u8>) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let Ok(mut chunks) = self.chunks.lock() else {
            return false;
        };
        if chunks.len() >= self.capacity {
            chunks.clear();
            drop(chunks);
            self.overflowed.store(true, Ordering::Release);
            self.close();
            return false;
        }
        chunks.push_back(chunk);
        drop(chunks);
        self.notify.notify_one();
        true
    }

    /// No more chunks will be pushed
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.chunks.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn try_pop(&self) -> Option<Vec<u8>> {
        self.chunks.lock().ok()?.pop_front()
    }

    /// Next chunk, or None once closed and drained. Cancel safe.
    pub async fn next(&self) -> Option<Vec<u8>> {
        loop {
            if let Some(chunk) = self.try_pop() {
                return Some(chunk);
            }
            if self.closed.load(Ordering::Acquire) {
                return self.try_pop();
            }
            self.notify.notified().await;
        }
    }
}

/// A verified connection to the guest display
struct GuestLink {
    writer: OwnedWriteHalf,
    queue: Arc<ChunkQueue>,
    reader: JoinHandle<()>,
}

impl GuestLink {
    /// Connect and verify the RFB banner.
    ///
    /// `resume` is None for a viewer's first link: the banner is queued and
    /// the viewer performs the handshake itself. On a later link the viewer
    /// already holds a banner, so the new one is swallowed and any completed
    /// handshake is replayed on the viewer's behalf.
    async fn open(config: &RelayConfig, resume: Option<&Resume>) -> Result<Self, QvmError> {
        let stream = TcpStream::connect(config.guest).await.map_err(|e| {
            QvmError::bridge(format!("cannot reach guest display {}: {}", config.guest, e))
        })?;
        let (mut reader, mut writer) = stream.into_split();

        let mut banner = [0u8; rfb::BANNER_LEN];
        reader
            .read_exact(&mut banner)
            .await
            .map_err(|e| QvmError::bridge(format!("guest display closed during handshake: {}", e)))?;
        let (major, minor) = rfb::parse_banner(&banner)?;
        debug!(target: "bridge", guest = %config.guest, major, minor, "guest RFB banner");

        let queue = Arc::new(ChunkQueue::new(config.queue_depth));
        match resume {
            None => {
                queue.push(banner.to_vec());
            }
            Some(Resume::Fresh) => {}
            Some(Resume::Replay(script)) => {
                tokio::time::timeout(
                    HANDSHAKE_TIMEOUT,
                    replay_handshake(&mut reader, &mut writer, script),
                )
                .await
                .map_err(|_| QvmError::bridge("guest display handshake timed out"))??;
            }
        }
        let reader = tokio::spawn(pump_guest(reader, Arc::clone(&queue)));

        Ok(Self {
            writer,
            queue,
            reader,
        })
    }

    /// Open with up to `reconnect_attempts` retries, doubling the pause
    async fn open_with_retry(
        config: &RelayConfig,
        resume: Option<&Resume>,
    ) -> Result<Self, QvmError> {
        let mut backoff = config.backoff;
        let mut last_err = None;
        for attempt in 0..=config.reconnect_attempts {
            if attempt > 0 {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            match Self::open(config, resume).await {
                Ok(link) => return Ok(link),
                Err(e) => {
                    debug!(target: "bridge", attempt, error = %e, "guest display connect failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| QvmError::bridge("guest display unavailable")))
    }

    fn close(self) {
        self.reader.abort();
    }
}

fn handshake_io(e: std::io::Error) -> QvmError {
    QvmError::bridge(format!("guest display closed during handshake: {}", e))
}

/// Run the client side of the handshake against a new guest connection.
/// The guest's replies, ServerInit included, never reach the viewer.
async fn replay_handshake(
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    script: &ReplayScript,
) -> Result<(), QvmError> {
    writer.write_all(&script.version).await.map_err(handshake_io)?;

    let count = reader.read_u8().await.map_err(handshake_io)?;
    if count == 0 {
        return Err(QvmError::bridge("guest display refused the connection"));
    }
    let mut types = vec![0u8; usize::from(count)];
    reader.read_exact(&mut types).await.map_err(handshake_io)?;
    if !types.contains(&rfb::SECURITY_NONE) {
        return Err(QvmError::bridge(format!(
            "guest display no longer offers security type None (offers {:?})",
            types
        )));
    }
    writer
        .write_all(&[rfb::SECURITY_NONE])
        .await
        .map_err(handshake_io)?;

    if script.minor >= 8 {
        let result = reader.read_u32().await.map_err(handshake_io)?;
        if result != 0 {
            return Err(QvmError::bridge(format!(
                "guest display rejected the replayed handshake ({})",
                result
            )));
        }
    }
    writer.write_all(&[script.shared]).await.map_err(handshake_io)?;

    let mut fixed = [0u8; rfb::SERVER_INIT_FIXED_LEN];
    reader.read_exact(&mut fixed).await.map_err(handshake_io)?;
    let (width, height, name_len) = rfb::parse_server_init(&fixed);
    if name_len > MAX_DESKTOP_NAME {
        return Err(QvmError::bridge(format!(
            "guest display sent a {} byte desktop name",
            name_len
        )));
    }
    let mut name = vec![0u8; name_len as usize];
    reader.read_exact(&mut name).await.map_err(handshake_io)?;

    let mut tail = script.setup.clone();
    tail.extend_from_slice(&rfb::framebuffer_update_request(false, width, height));
    writer.write_all(&tail).await.map_err(handshake_io)?;

    debug!(target: "bridge", width, height, "replayed viewer handshake");
    Ok(())
}

async fn pump_guest(mut reader: OwnedReadHalf, queue: Arc<ChunkQueue>) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if !queue.push(buf[..n].to_vec()) {
                    return;
                }
            }
        }
    }
    queue.close();
}

enum Step {
    ViewerGone,
    GuestGone,
    /// The viewer fell behind and guest output was discarded
    Desync,
    Shutdown,
}

/// Relay one viewer until it disconnects, the guest becomes unreachable or
/// the bridge shuts down.
pub async fn relay_viewer(
    mut ws: WebSocket,
    config: Arc<RelayConfig>,
    mut shutdown: watch::Receiver<bool>,
    viewer: u64,
) {
    info!(target: "bridge", viewer, guest = %config.guest, "viewer connected");
    let mut framer = ClientFramer::new();

    let mut link = match GuestLink::open_with_retry(&config, None).await {
        Ok(link) => link,
        Err(e) => {
            warn!(target: "bridge", viewer, error = %e, "closing viewer");
            close_ws(&mut ws, CLOSE_INTERNAL_ERROR, &e.to_string()).await;
            return;
        }
    };

    loop {
        let step = pump_link(&mut ws, &mut link, &mut framer, &mut shutdown, viewer).await;
        link.close();
        match step {
            Step::GuestGone => {
                info!(target: "bridge", viewer, "guest display disconnected, reconnecting");
                let reopened = match framer.resume() {
                    Ok(resume) => GuestLink::open_with_retry(&config, Some(&resume)).await,
                    Err(e) => Err(e),
                };
                match reopened {
                    Ok(next) => link = next,
                    Err(e) => {
                        warn!(target: "bridge", viewer, error = %e, "closing viewer");
                        close_ws(&mut ws, CLOSE_INTERNAL_ERROR, &e.to_string()).await;
                        break;
                    }
                }
            }
            Step::Desync => {
                let e = QvmError::bridge(format!(
                    "viewer fell more than {} chunks behind the guest display",
                    config.queue_depth
                ));
                warn!(target: "bridge", viewer, error = %e, "closing viewer");
                close_ws(&mut ws, CLOSE_INTERNAL_ERROR, &e.to_string()).await;
                break;
            }
            Step::ViewerGone => break,
            Step::Shutdown => {
                close_ws(&mut ws, CLOSE_GOING_AWAY, "console shutting down").await;
                break;
            }
        }
    }

    info!(target: "bridge", viewer, "viewer disconnected");
}

async fn pump_link(
    ws: &mut WebSocket,
    link: &mut GuestLink,
    framer: &mut ClientFramer,
    shutdown: &mut watch::Receiver<bool>,
    viewer: u64,
) -> Step {
    let queue = Arc::clone(&link.queue);
    loop {
        tokio::select! {
            chunk = queue.next() => match chunk {
                Some(data) => {
                    if ws.send(Message::Binary(data.into())).await.is_err() {
                        return Step::ViewerGone;
                    }
                }
                None if queue.overflowed() => return Step::Desync,
                None => return Step::GuestGone,
            },
            msg = ws.recv() => {
                let ready = match msg {
                    Some(Ok(Message::Binary(data))) => framer.feed(&data),
                    Some(Ok(Message::Text(text))) => match ControlMessage::parse(text.as_str()) {
                        Ok(control) => {
                            debug!(target: "bridge", viewer, ?control, "control message");
                            framer.inject(control.encode())
                        }
                        Err(e) => {
                            warn!(target: "bridge", viewer, error = %e, "ignoring text frame");
                            Vec::new()
                        }
                    },
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return Step::ViewerGone,
                    Some(Ok(_)) => Vec::new(),
                };
                if !ready.is_empty() && link.writer.write_all(&ready).await.is_err() {
                    return Step::GuestGone;
                }
            }
            _ = shutdown.changed() => return Step::Shutdown,
        }
    }
}

/// A viewer that stopped reading would hold the close frame forever
async fn close_ws(ws: &mut WebSocket, code: u16, reason: &str) {
    let frame = Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, ws.send(frame)).await;
}
