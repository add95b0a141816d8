//! WebSocket listener and per-connection tasks.
//!
//! The listener is bound once per process so the port survives
//! configuration reloads; every orchestrator run spawns its own accept loop
//! on a clone of it and aborts that loop when the run ends.

use std::fmt;
use std::net::TcpListener as StdListener;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::protocol::Message;

use super::SessionTx;

/// Maximum port retry attempts
const MAX_PORT_RETRIES: u16 = 10;

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn next() -> Self {
        Self(NEXT_SESSION.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Socket activity forwarded to the coordinator.
#[derive(Debug)]
pub enum HubEvent {
    Connected {
        id: SessionId,
        /// Request target, e.g. `/elm-watch?targetName=Main&...`
        uri: String,
        tx: SessionTx,
    },
    Message {
        id: SessionId,
        text: String,
    },
    Disconnected {
        id: SessionId,
    },
}

/// Bound listener shared across orchestrator runs.
pub struct WsServer {
    listener: StdListener,
    port: u16,
}

impl WsServer {
    /// Bind `port` (0 = any free port), trying the next ports if it is taken.
    pub fn bind(port: u16) -> Result<Self> {
        let (listener, port) = if port == 0 {
            try_bind_port(0, 1)?
        } else {
            match try_bind_port(port, MAX_PORT_RETRIES) {
                Ok(bound) => bound,
                Err(e) => {
                    crate::log!("warning"; "{}; using a random port", e);
                    try_bind_port(0, 1)?
                }
            }
        };
        listener
            .set_nonblocking(true)
            .context("failed to configure WebSocket listener")?;
        Ok(Self { listener, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Start accepting connections, forwarding everything to `events`.
    pub fn spawn(&self, events: mpsc::UnboundedSender<HubEvent>) -> Result<JoinHandle<()>> {
        let listener = TcpListener::from_std(
            self.listener
                .try_clone()
                .context("failed to clone WebSocket listener")?,
        )?;
        Ok(tokio::spawn(accept_loop(listener, events)))
    }
}

async fn accept_loop(listener: TcpListener, events: mpsc::UnboundedSender<HubEvent>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                crate::debug!("ws"; "client connected: {}", addr);
                tokio::spawn(handle_connection(stream, events.clone()));
            }
            Err(e) => {
                crate::log!("ws"; "accept error: {}", e);
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
        if events.is_closed() {
            break;
        }
    }
}

async fn handle_connection(stream: TcpStream, events: mpsc::UnboundedSender<HubEvent>) {
    let mut uri = String::new();
    let capture = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        uri = request.uri().to_string();
        Ok(response)
    };
    let ws = match accept_hdr_async(stream, capture).await {
        Ok(ws) => ws,
        Err(e) => {
            crate::debug!("ws"; "handshake failed: {}", e);
            return;
        }
    };

    let id = SessionId::next();
    let (tx, mut outgoing) = mpsc::unbounded_channel::<String>();
    if events.send(HubEvent::Connected { id, uri, tx }).is_err() {
        return;
    }

    let (mut sink, mut incoming) = ws.split();
    loop {
        tokio::select! {
            frame = outgoing.recv() => match frame {
                Some(text) => {
                    if sink.send(Message::text(text)).await.is_err() {
                        break;
                    }
                }
                // The hub dropped this session.
                None => {
                    sink.close().await.ok();
                    break;
                }
            },
            message = incoming.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if events.send(HubEvent::Message { id, text: text.to_string() }).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    events.send(HubEvent::Disconnected { id }).ok();
}

/// Try binding to port, retry with incremented port if in use
fn try_bind_port(base_port: u16, max_retries: u16) -> Result<(StdListener, u16)> {
    let mut last_error = None;

    for offset in 0..max_retries {
        let port = base_port.saturating_add(offset);
        match StdListener::bind(("0.0.0.0", port)) {
            Ok(listener) => {
                let actual_port = listener.local_addr()?.port();
                return Ok((listener, actual_port));
            }
            Err(e) => {
                last_error = Some(e);
                continue;
            }
        }
    }

    Err(anyhow::anyhow!(
        "Failed to bind WebSocket server after {} attempts: {}",
        max_retries,
        last_error.map(|e| e.to_string()).unwrap_or_default()
    ))
}
