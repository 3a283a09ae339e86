//! WebSocket sync server with room-based document routing.
//!
//! Architecture:
//! ```text
//! ws://host/<document_id>?sessionKey=<key>
//!
//! Client A ──┐                                   ┌── ChannelSocket A ──► writer A
//!             ├── RoomRegistry ── Room (doc id) ──┤
//! Client B ──┘         │                          └── ChannelSocket B ──► writer B
//!                      └── tick task (timeouts, debounce flush)
//! ```
//!
//! Each connection task owns its WebSocket. Inbound binary frames go to the
//! room under the room's lock; outbound frames come back through a bounded
//! channel so the room never waits on the network.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::config::{RoomConfig, DATA_MESSAGE_DEBOUNCE};
use crate::registry::{RoomRegistry, SharedRoom, SnapshotStore};
use crate::room::RoomError;
use crate::socket::{ChannelSocket, RoomSocket};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// How often rooms are swept for timeouts and due debounce windows
    pub tick_interval: Duration,
    /// Outbound frames buffered per connection before it counts as slow
    pub outbound_buffer: usize,
    /// Settings applied to every room
    pub room: RoomConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            tick_interval: DATA_MESSAGE_DEBOUNCE,
            outbound_buffer: 256,
            room: RoomConfig::default(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rejected_upgrades: u64,
}

/// Where a WebSocket upgrade is routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub document_id: String,
    pub session_key: String,
}

/// Parse `/<document_id>?sessionKey=<key>`.
pub fn parse_route(path: &str, query: Option<&str>) -> Result<Route, &'static str> {
    let document_id = path.trim_start_matches('/');
    if document_id.is_empty() {
        return Err("missing document id");
    }
    if document_id.contains('/') {
        return Err("document id may not contain '/'");
    }
    let session_key = query
        .unwrap_or_default()
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(name, _)| *name == "sessionKey")
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
        .ok_or("missing sessionKey")?;
    Ok(Route {
        document_id: document_id.to_string(),
        session_key: session_key.to_string(),
    })
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<RoomRegistry>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a new sync server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(RoomRegistry::new(config.room.clone()));
        Self::with_registry(config, registry)
    }

    /// Create with snapshots kept in `snapshots` between room lifetimes.
    pub fn with_snapshot_store(config: ServerConfig, snapshots: Arc<dyn SnapshotStore>) -> Self {
        let registry = Arc::new(RoomRegistry::with_snapshot_store(config.room.clone(), snapshots));
        Self::with_registry(config, registry)
    }

    fn with_registry(config: ServerConfig, registry: Arc<RoomRegistry>) -> Self {
        Self {
            config,
            registry,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let ticker = self.spawn_ticker();
        let result = loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(ServerError::from(e)),
            };
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();
            let outbound_buffer = self.config.outbound_buffer;
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, registry, stats, outbound_buffer).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        };
        ticker.abort();
        result
    }

    fn spawn_ticker(&self) -> tokio::task::JoinHandle<()> {
        let registry = self.registry.clone();
        let every = self.config.tick_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                for (document_id, event) in registry.tick_all(Instant::now()).await {
                    log::debug!("Room {document_id}: {event:?}");
                }
            }
        })
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<RoomRegistry>,
        stats: Arc<RwLock<ServerStats>>,
        outbound_buffer: usize,
    ) -> Result<(), ServerError> {
        let mut route = None;
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            match parse_route(request.uri().path(), request.uri().query()) {
                Ok(parsed) => {
                    route = Some(parsed);
                    Ok(response)
                }
                Err(reason) => {
                    let mut error = ErrorResponse::new(Some(reason.to_string()));
                    *error.status_mut() = StatusCode::BAD_REQUEST;
                    Err(error)
                }
            }
        };
        let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                stats.write().await.rejected_upgrades += 1;
                return Err(e.into());
            }
        };
        let Some(Route {
            document_id,
            session_key,
        }) = route
        else {
            return Ok(());
        };

        log::info!("WebSocket connection from {addr} for session {session_key} in room {document_id}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (socket, outbound) = ChannelSocket::new(outbound_buffer);
        let socket_id = socket.id();
        let room = registry
            .open_session(
                &document_id,
                &session_key,
                socket.clone(),
                json!({ "remote_addr": addr.to_string() }),
                Instant::now(),
            )
            .await;

        let result = Self::pump(ws_stream, outbound, &room, &session_key, &stats).await;

        room.lock().await.handle_close(&session_key, socket_id, Instant::now());
        socket.close();
        registry.remove_if_empty(&document_id).await;
        stats.write().await.active_connections -= 1;
        log::info!("Connection closed from {addr} (session {session_key})");
        result
    }

    /// Shuttle frames until either side hangs up.
    async fn pump(
        ws_stream: WebSocketStream<TcpStream>,
        mut outbound: mpsc::Receiver<Vec<u8>>,
        room: &SharedRoom,
        session_key: &str,
        stats: &RwLock<ServerStats>,
    ) -> Result<(), ServerError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }
                            let result = room.lock().await.handle_message(session_key, &bytes, Instant::now());
                            match result {
                                Ok(()) => {}
                                Err(RoomError::Rejected(reason)) => {
                                    log::debug!("Session {session_key} rejected: {reason}");
                                }
                                Err(RoomError::Protocol(e)) => {
                                    log::warn!("Session {session_key} dropped: {e}");
                                }
                            }
                        }
                        Some(Ok(Message::Text(_))) => {
                            log::warn!("Ignoring text frame from session {session_key}");
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            log::error!("WebSocket error on session {session_key}: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                // Outgoing frames queued by the room
                frame = outbound.recv() => {
                    match frame {
                        Some(frame) => ws_sender.send(Message::Binary(frame.into())).await?,
                        None => {
                            // The room closed this socket.
                            let _ = ws_sender.send(Message::Close(None)).await;
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }
}
