//! Browser console: serves a WebSocket endpoint that relays the guest's VNC
//! framebuffer to any number of viewers.

pub mod relay;
pub mod rfb;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::{Html, Response};
use axum::routing::get;
use axum::Router;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub use relay::RelayConfig;

use crate::error::QvmError;
use crate::network::{BindScope, PortAllocation, PortAllocator, PortRequest, PortRole};

/// Listener bind attempts when another process grabs the probed port first
const BIND_ATTEMPTS: u32 = 3;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>qvm console</title></head>
<body>
<h3>qvm web console</h3>
<p>Point a noVNC client at this host with path <code>websockify</code>,
for example <code>vnc.html?host=HOST&amp;port=PORT&amp;path=websockify</code>.</p>
<p>Text frames accept <code>{"type":"clipboard","text":"..."}</code> and
<code>{"type":"keys","keys":[65507,65513,65535]}</code> (Ctrl-Alt-Del).</p>
</body>
</html>
"#;

struct BridgeState {
    relay: Arc<RelayConfig>,
    shutdown: watch::Receiver<bool>,
    viewers: AtomicU64,
}

type SharedState = Arc<BridgeState>;

/// Running web console server
pub struct DisplayBridge {
    allocation: PortAllocation,
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl DisplayBridge {
    /// Allocate the listen port, bind it and start serving.
    pub async fn start(
        allocator: &mut PortAllocator,
        request: PortRequest,
        scope: BindScope,
        relay: RelayConfig,
    ) -> Result<Self> {
        let (allocation, listener) = bind_listener(allocator, request, scope).await?;
        let addr = listener.local_addr().context("reading bridge address")?;

        info!(target: "bridge", addr = %addr, guest = %relay.guest, "web console listening");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = Arc::new(BridgeState {
            relay: Arc::new(relay),
            shutdown: shutdown_rx.clone(),
            viewers: AtomicU64::new(0),
        });

        let app = Router::new()
            .route("/", get(index))
            .route("/websockify", get(websockify))
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        let mut server_shutdown = shutdown_rx;
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = server_shutdown.wait_for(|stop| *stop).await;
                })
                .await;
            if let Err(e) = served {
                warn!(target: "bridge", error = %e, "web console server error");
            }
        });

        Ok(Self {
            allocation,
            addr,
            shutdown: shutdown_tx,
            task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn allocation(&self) -> PortAllocation {
        self.allocation
    }

    /// Browser URL for the console page
    pub fn url(&self) -> String {
        let host = if self.addr.ip().is_unspecified() {
            "localhost".to_string()
        } else {
            self.addr.ip().to_string()
        };
        format!("http://{}:{}/", host, self.addr.port())
    }

    /// Signal viewers and the server, then wait for them to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let mut task = self.task;
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut task).await.is_err() {
            warn!(target: "bridge", "web console did not stop in time, aborting");
            task.abort();
        }
        info!(target: "bridge", "web console stopped");
    }
}

/// Take a port from the allocator and bind it. A preferred port lost to
/// another process between probe and bind is skipped.
async fn bind_listener(
    allocator: &mut PortAllocator,
    request: PortRequest,
    scope: BindScope,
) -> Result<(PortAllocation, tokio::net::TcpListener)> {
    let mut request = request;
    let mut last_err = None;

    for _ in 0..BIND_ATTEMPTS {
        let allocation = allocator.allocate(PortRole::WebConsole, request)?;
        let addr = format!("{}:{}", scope.listen_addr(), allocation.port);
        match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => return Ok((allocation, listener)),
            Err(e) => {
                allocator.release(allocation.port);
                match request {
                    PortRequest::Explicit(port) => {
                        return Err(QvmError::resource(format!(
                            "web console port {} unavailable: {}",
                            port, e
                        ))
                        .into());
                    }
                    PortRequest::Preferred(_) => {
                        warn!(target: "bridge", port = allocation.port, error = %e, "port taken before bind, trying next");
                        request = PortRequest::Preferred(allocation.port.saturating_add(1));
                        last_err = Some(e);
                    }
                }
            }
        }
    }

    Err(QvmError::resource(format!(
        "could not bind web console listener: {}",
        last_err.map(|e| e.to_string()).unwrap_or_default()
    ))
    .into())
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn websockify(State(state): State<SharedState>, ws: WebSocketUpgrade) -> Response {
    let viewer = state.viewers.fetch_add(1, Ordering::Relaxed) + 1;
    let relay = Arc::clone(&state.relay);
    let shutdown = state.shutdown.clone();
    ws.protocols(["binary"])
        .on_upgrade(move |socket| relay::relay_viewer(socket, relay, shutdown, viewer))
}
