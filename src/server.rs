//! WebSocket sequencer server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                        ┌──► Client A
//!            ├──► Sequencer ── EventLog ──► Client B
//! Client B ──┘        │                └──► Client C
//!                     └── ConnectionRegistry (fan-out)
//! ```
//!
//! The server is the single authority assigning each update its log index.
//! All submissions funnel through one core lock guarding the event log and
//! the connection registry, which serializes appends (arrival order = log
//! order) and makes registration-plus-replay atomic with respect to later
//! broadcasts.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{ConnectionHandle, ConnectionRegistry};
use crate::event_log::{EventLog, EventLogError};
use crate::protocol::{ClientMessage, LogEntry};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Request path that WebSocket upgrades must target
    pub ws_path: String,
    /// Durable event log path (None = in-memory only)
    pub log_path: Option<PathBuf>,
    /// Per-connection keep-alive ping period
    pub heartbeat_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            ws_path: "/ws".to_string(),
            log_path: None,
            heartbeat_interval: Duration::from_secs(1),
        }
    }
}

/// The event log and connection registry, guarded as one unit.
///
/// Holding the lock across append + broadcast (and across register + replay)
/// is what gives every connection the log from index 0 with no gaps and no
/// duplicates.
struct ServerCore {
    log: EventLog,
    registry: ConnectionRegistry,
}

/// The sequencer server.
pub struct SyncServer {
    config: ServerConfig,
    core: Arc<Mutex<ServerCore>>,
}

impl SyncServer {
    /// Create a server, opening (and replaying) the durable log first.
    pub async fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let log = match &config.log_path {
            Some(path) => EventLog::open(path).await?,
            None => EventLog::in_memory(),
        };

        Ok(Self {
            config,
            core: Arc::new(Mutex::new(ServerCore {
                log,
                registry: ConnectionRegistry::new(),
            })),
        })
    }

    /// Create with default configuration (in-memory, no persistence).
    pub async fn with_defaults() -> Result<Self, ServerError> {
        Self::new(ServerConfig::default()).await
    }

    /// Accept connections forever. Call from an async runtime.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("sync server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let core = Arc::clone(&self.core);
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, core, config).await {
                    log::warn!("connection from {addr} ended with error: {e}");
                }
            });
        }
    }

    /// Number of entries in the event log.
    pub async fn entry_count(&self) -> usize {
        self.core.lock().await.log.len()
    }

    /// Number of currently-registered connections.
    pub async fn connection_count(&self) -> usize {
        self.core.lock().await.registry.len()
    }

    /// The configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}

/// Handle one client connection for its whole lifetime.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    core: Arc<Mutex<ServerCore>>,
    config: ServerConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Upgrade requests for any other path are rejected; the static HTTP
    // layer sharing this endpoint is a separate concern.
    let ws_path = config.ws_path.clone();
    let check_path = move |request: &Request, response: Response| {
        if request.uri().path() == ws_path {
            Ok(response)
        } else {
            log::debug!("rejecting upgrade for path {}", request.uri().path());
            let mut rejection = ErrorResponse::new(Some("not found".to_string()));
            *rejection.status_mut() = StatusCode::NOT_FOUND;
            Err(rejection)
        }
    };

    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, check_path).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let id = Uuid::new_v4();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

    // Keep-alive pings on a fixed period, independent of traffic. The task
    // is aborted by the registry exactly once, on deregistration.
    let heartbeat_tx = out_tx.clone();
    let heartbeat_interval = config.heartbeat_interval;
    let heartbeat = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat_interval);
        ticker.tick().await; // the first tick fires immediately
        loop {
            ticker.tick().await;
            if heartbeat_tx.send(Message::Ping(Vec::new().into())).is_err() {
                break;
            }
        }
    });

    // Register and queue the replay under one lock acquisition: any append
    // that happens afterwards is broadcast to this connection, so the
    // combined stream is the log from index 0 with no gap.
    {
        let mut core = core.lock().await;
        let replay = core.log.replay();
        let replayed = replay.len();
        let handle = ConnectionHandle::with_heartbeat(out_tx, heartbeat);
        if !core.registry.register(id, handle, replay) {
            return Ok(());
        }
        log::info!("connection {id} from {addr} registered, {replayed} entries replayed");
    }

    loop {
        tokio::select! {
            outbound = out_rx.recv() => {
                match outbound {
                    Some(frame) => {
                        if ws_sender.send(frame).await.is_err() {
                            break;
                        }
                    }
                    // Sender side dropped: we were deregistered elsewhere.
                    None => break,
                }
            }

            inbound = ws_receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match ClientMessage::decode(text.as_str()) {
                            Ok(ClientMessage::Update { payload }) => {
                                let mut core = core.lock().await;
                                match core.log.append(payload.clone()).await {
                                    Ok(index) => {
                                        let entry = LogEntry::new(index, payload);
                                        let delivered = core.registry.broadcast(&entry);
                                        log::debug!(
                                            "entry {index} broadcast to {delivered} connections"
                                        );
                                    }
                                    Err(e) => {
                                        // The entry did not persist, so it must
                                        // not be broadcast. Close the submitter;
                                        // everyone else stays consistent.
                                        log::error!(
                                            "durable append failed, closing submitter {id}: {e}"
                                        );
                                        core.registry.deregister(id);
                                        break;
                                    }
                                }
                            }
                            Ok(ClientMessage::Other) => {
                                log::debug!("ignoring unrecognized message kind from {id}");
                            }
                            Err(e) => {
                                log::warn!("undecodable frame from {id}: {e}");
                            }
                        }
                    }

                    Some(Ok(Message::Ping(data))) => {
                        if ws_sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }

                    Some(Ok(Message::Close(_))) | None => {
                        log::debug!("connection {id} closed by peer");
                        break;
                    }

                    Some(Err(e)) => {
                        log::warn!("websocket error on {id}: {e}");
                        break;
                    }

                    _ => {}
                }
            }
        }
    }

    // Idempotent against eviction by a failed broadcast.
    core.lock().await.registry.deregister(id);
    let _ = ws_sender.send(Message::Close(None)).await;
    log::info!("connection {id} deregistered");
    Ok(())
}

/// Server errors.
#[derive(Debug)]
pub enum ServerError {
    /// Binding or accepting on the listener failed.
    Io(std::io::Error),
    /// The durable event log could not be opened or replayed.
    Log(EventLogError),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "server I/O error: {e}"),
            Self::Log(e) => write!(f, "server event log error: {e}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Log(e) => Some(e),
        }
    }
}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<EventLogError> for ServerError {
    fn from(e: EventLogError) -> Self {
        Self::Log(e)
    }
}
