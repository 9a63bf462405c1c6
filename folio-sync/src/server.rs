//! WebSocket transport for the sync engine.
//!
//! Architecture:
//! ```text
//! Editor A ──┐                 ┌──────────────────┐
//!            ├── socket task ──┤ ConnectionHandler ├──► SessionRegistry
//! Editor B ──┘   (per conn)    └─────────┬────────┘        │
//!                   ▲                    │ outbox           ▼
//!                   └────────────────────┘           DocumentSession ◄──► FanOutBridge
//!                                                          │
//!                                                          ▼
//!                                                   PersistenceGateway
//! ```
//!
//! Each socket task multiplexes four sources: inbound frames, the
//! connection's outbox, the slow-consumer kill signal, and the heartbeat
//! timer. Whatever ends the loop, the connection is detached from every
//! document before the task exits.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::Message;

use crate::auth::{bearer_from_header, token_from_query, TokenVerifier};
use crate::config::ServerConfig;
use crate::connection::{ConnectionHandler, ConnectionLimits, Control};
use crate::protocol::{ProtocolError, ServerMessage};
use crate::registry::SessionRegistry;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("configuration error: {0}")]
    Config(String),
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub auth_failures: u64,
    pub frames_in: u64,
    pub frames_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

#[derive(Debug, Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    auth_failures: AtomicU64,
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl AtomicServerStats {
    fn snapshot(&self) -> ServerStats {
        ServerStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_out: self.frames_out.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
        }
    }
}

/// Per-connection settings copied out of [`ServerConfig`].
#[derive(Debug, Clone)]
struct SocketSettings {
    limits: ConnectionLimits,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
}

/// The sync server.
pub struct SyncServer {
    listener: TcpListener,
    registry: Arc<SessionRegistry>,
    verifier: Arc<dyn TokenVerifier>,
    settings: SocketSettings,
    stats: Arc<AtomicServerStats>,
}

impl SyncServer {
    /// Bind the listener. Use port 0 for an ephemeral port.
    pub async fn bind(
        config: &ServerConfig,
        registry: Arc<SessionRegistry>,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        log::info!("sync server listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            registry,
            verifier,
            settings: SocketSettings {
                limits: ConnectionLimits {
                    outbox_capacity: config.session.outbox_capacity,
                    max_frame_bytes: config.max_frame_bytes,
                    max_protocol_errors: config.max_protocol_errors,
                },
                heartbeat_interval: config.heartbeat_interval,
                heartbeat_timeout: config.heartbeat_timeout,
            },
            stats: Arc::new(AtomicServerStats::default()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> ServerStats {
        self.stats.snapshot()
    }

    /// Accept connections until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = self.listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let registry = Arc::clone(&self.registry);
            let verifier = Arc::clone(&self.verifier);
            let settings = self.settings.clone();
            let stats = Arc::clone(&self.stats);

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, registry, verifier, settings, stats).await
                {
                    log::warn!("connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<SessionRegistry>,
        verifier: Arc<dyn TokenVerifier>,
        settings: SocketSettings,
        stats: Arc<AtomicServerStats>,
    ) -> Result<(), ServerError> {
        let mut upgrade_token: Option<String> = None;
        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                upgrade_token = token_from_request(req);
                Ok(resp)
            },
        )
        .await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (mut handler, mut outbox) =
            ConnectionHandler::new(registry, verifier, settings.limits.clone());
        let connection_id = handler.connection_id();
        let kill = handler.kill_signal();
        log::info!("connection {connection_id} established from {addr}");

        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);

        let mut open = true;
        if let Some(token) = upgrade_token {
            if let Err(e) = handler.authenticate(&token) {
                log::warn!("connection {connection_id} from {addr} rejected: {e}");
                stats.auth_failures.fetch_add(1, Ordering::Relaxed);
                let _ = handler.send(&ServerMessage::error(&e));
                open = false;
            }
        }

        let mut heartbeat = tokio::time::interval(settings.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_seen = Instant::now();
        let mut result = Ok(());

        while open {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            last_seen = Instant::now();
                            stats.frames_in.fetch_add(1, Ordering::Relaxed);
                            stats.bytes_in.fetch_add(data.len() as u64, Ordering::Relaxed);
                            if handler.handle_frame(&data).await == Control::Close {
                                open = false;
                            }
                        }
                        Some(Ok(Message::Text(text))) => {
                            last_seen = Instant::now();
                            stats.frames_in.fetch_add(1, Ordering::Relaxed);
                            // Text frames never decode; this reports MalformedFrame.
                            if handler.handle_frame(text.as_bytes()).await == Control::Close {
                                open = false;
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            last_seen = Instant::now();
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                result = Err(e.into());
                                open = false;
                            }
                        }
                        Some(Ok(Message::Pong(_))) => last_seen = Instant::now(),
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("connection {connection_id} closed by {addr}");
                            open = false;
                        }
                        Some(Ok(Message::Frame(_))) => {}
                        Some(Err(e)) => {
                            log::warn!("websocket error on connection {connection_id}: {e}");
                            open = false;
                        }
                    }
                }

                frame = outbox.recv() => {
                    let Some(frame) = frame else {
                        open = false;
                        continue;
                    };
                    stats.frames_out.fetch_add(1, Ordering::Relaxed);
                    stats.bytes_out.fetch_add(frame.len() as u64, Ordering::Relaxed);
                    if let Err(e) = ws_sender.send(Message::Binary(frame.to_vec().into())).await {
                        result = Err(e.into());
                        open = false;
                    }
                }

                _ = kill.notified() => {
                    log::warn!("connection {connection_id} cannot keep up; disconnecting");
                    open = false;
                }

                _ = heartbeat.tick() => {
                    if last_seen.elapsed() > settings.heartbeat_timeout {
                        log::warn!(
                            "connection {connection_id} silent for {:?}; closing",
                            last_seen.elapsed()
                        );
                        open = false;
                    } else if let Err(e) = ws_sender.send(Message::Ping(Vec::new().into())).await {
                        result = Err(e.into());
                        open = false;
                    }
                }
            }
        }

        handler.close().await;
        stats.active_connections.fetch_sub(1, Ordering::Relaxed);

        // Best effort: deliver what is already queued (e.g. a final error
        // frame), then say goodbye.
        while let Ok(frame) = outbox.try_recv() {
            if ws_sender.send(Message::Binary(frame.to_vec().into())).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
        log::info!("connection {connection_id} from {addr} finished");
        result
    }
}

/// Token from `Authorization: Bearer ...`, falling back to `?token=...`.
fn token_from_request(req: &Request) -> Option<String> {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_from_header)
        .or_else(|| req.uri().query().and_then(token_from_query))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str, auth: Option<&str>) -> Request {
        let mut builder = Request::builder().uri(uri);
        if let Some(value) = auth {
            builder = builder.header(AUTHORIZATION, value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_token_from_header() {
        let req = request("/sync", Some("Bearer abc.def"));
        assert_eq!(token_from_request(&req).as_deref(), Some("abc.def"));
    }

    #[test]
    fn test_token_from_query() {
        let req = request("/sync?doc=1&token=xyz", None);
        assert_eq!(token_from_request(&req).as_deref(), Some("xyz"));
    }

    #[test]
    fn test_header_wins_over_query() {
        let req = request("/sync?token=query", Some("Bearer header"));
        assert_eq!(token_from_request(&req).as_deref(), Some("header"));
    }

    #[test]
    fn test_no_token() {
        assert!(token_from_request(&request("/sync", Some("Basic Zm9v"))).is_none());
    }

    #[test]
    fn test_stats_snapshot() {
        let stats = AtomicServerStats::default();
        stats.total_connections.fetch_add(2, Ordering::Relaxed);
        stats.frames_in.fetch_add(5, Ordering::Relaxed);
        let snap = stats.snapshot();
        assert_eq!(snap.total_connections, 2);
        assert_eq!(snap.frames_in, 5);
        assert_eq!(snap.active_connections, 0);
    }
}
