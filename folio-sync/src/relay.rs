//! WebSocket relay: a shared fan-out channel for several server processes.
//!
//! ```text
//!  folio-server A ──┐                      ┌── folio-server B
//!   RelayChannel    │   Subscribe/Publish  │    RelayChannel
//!                   ▼                      ▼
//!               ┌──────────────────────────────┐
//!               │ RelayServer                  │
//!               │  doc-1 → {A, B}              │
//!               │  doc-2 → {B}                 │
//!               └──────────────────────────────┘
//! ```
//!
//! The relay forwards every published message to every subscriber of the
//! document, the publisher included. Loop prevention is the bridge's job.
//!
//! A relay started [`with_store`](RelayServer::with_store) also answers
//! [`RelayFrame::Store`] requests against its own [`KeyValueStore`], which
//! makes it the shared store for every process that persists through a
//! [`RemoteStore`](crate::persistence::RemoteStore).

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::bridge::{BridgeConfig, FanOutChannel, FanOutError, FanOutMessage};
use crate::persistence::remote::{execute, StoreOp, StoreValue};
use crate::persistence::{KeyValueStore, StoreError};
use crate::protocol::DocumentId;

/// Frames exchanged between a [`RelayChannel`] and the [`RelayServer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RelayFrame {
    Subscribe { document_id: DocumentId },
    Unsubscribe { document_id: DocumentId },
    Publish(FanOutMessage),
    /// Storage call; answered with a `StoreReply` carrying the same id.
    Store { request: u64, op: StoreOp },
    StoreReply {
        request: u64,
        result: Result<StoreValue, StoreError>,
    },
}

impl RelayFrame {
    pub fn encode(&self) -> Result<Vec<u8>, FanOutError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| FanOutError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FanOutError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| FanOutError::Serialization(e.to_string()))?;
        Ok(frame)
    }
}

// ─── Relay hub ────────────────────────────────────────────────────────────

type ClientId = u64;

#[derive(Default)]
struct Routes {
    subscribers: HashMap<DocumentId, HashSet<ClientId>>,
    clients: HashMap<ClientId, mpsc::UnboundedSender<Arc<Vec<u8>>>>,
}

impl Routes {
    fn drop_client(&mut self, client: ClientId) {
        self.clients.remove(&client);
        self.subscribers.retain(|_, subs| {
            subs.remove(&client);
            !subs.is_empty()
        });
    }
}

#[derive(Debug, Default)]
pub struct RelayStats {
    pub clients: AtomicU64,
    pub forwarded: AtomicU64,
    pub store_requests: AtomicU64,
}

/// Standalone hub that server processes connect to with [`RelayChannel`].
pub struct RelayServer {
    listener: TcpListener,
    routes: Arc<Mutex<Routes>>,
    next_client: AtomicU64,
    stats: Arc<RelayStats>,
    store: Option<Arc<dyn KeyValueStore>>,
}

impl RelayServer {
    pub async fn bind(addr: &str) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        log::info!("relay listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            routes: Arc::new(Mutex::new(Routes::default())),
            next_client: AtomicU64::new(1),
            stats: Arc::new(RelayStats::default()),
            store: None,
        })
    }

    /// Serve storage requests from `store` as well as fan-out.
    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> &Arc<RelayStats> {
        &self.stats
    }

    /// Accept relay clients until the listener fails.
    pub async fn run(self) -> std::io::Result<()> {
        loop {
            let (stream, addr) = self.listener.accept().await?;
            let client = self.next_client.fetch_add(1, Ordering::Relaxed);
            let routes = Arc::clone(&self.routes);
            let stats = Arc::clone(&self.stats);
            let store = self.store.clone();
            tokio::spawn(async move {
                stats.clients.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = serve_client(stream, client, Arc::clone(&routes), &stats, store).await
                {
                    log::warn!("relay client {client} ({addr}) failed: {e}");
                }
                if let Ok(mut routes) = routes.lock() {
                    routes.drop_client(client);
                }
                stats.clients.fetch_sub(1, Ordering::Relaxed);
                log::info!("relay client {client} ({addr}) disconnected");
            });
        }
    }
}

async fn serve_client(
    stream: TcpStream,
    client: ClientId,
    routes: Arc<Mutex<Routes>>,
    stats: &RelayStats,
    store: Option<Arc<dyn KeyValueStore>>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Arc<Vec<u8>>>();
    {
        let mut routes = routes.lock().map_err(|_| "relay routes poisoned")?;
        routes.clients.insert(client, tx.clone());
    }
    log::info!("relay client {client} connected");

    loop {
        tokio::select! {
            outgoing = rx.recv() => {
                let Some(frame) = outgoing else { break };
                ws_sender.send(Message::Binary(frame.to_vec().into())).await?;
            }
            incoming = ws_receiver.next() => {
                match incoming {
                    Some(Ok(Message::Binary(data))) => {
                        let frame = match RelayFrame::decode(&data) {
                            Ok(frame) => frame,
                            Err(e) => {
                                log::warn!("relay client {client} sent a bad frame: {e}");
                                continue;
                            }
                        };
                        match frame {
                            RelayFrame::Store { request, op } => {
                                stats.store_requests.fetch_add(1, Ordering::Relaxed);
                                answer_store(store.clone(), request, op, tx.clone());
                            }
                            frame => route(&routes, client, frame, &data, stats)?,
                        }
                    }
                    Some(Ok(Message::Ping(data))) => ws_sender.send(Message::Pong(data)).await?,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                }
            }
        }
    }
    Ok(())
}

fn route(
    routes: &Mutex<Routes>,
    client: ClientId,
    frame: RelayFrame,
    raw: &[u8],
    stats: &RelayStats,
) -> Result<(), &'static str> {
    let mut routes = routes.lock().map_err(|_| "relay routes poisoned")?;
    match frame {
        RelayFrame::Subscribe { document_id } => {
            log::debug!("relay client {client} subscribed to {document_id}");
            routes.subscribers.entry(document_id).or_default().insert(client);
        }
        RelayFrame::Unsubscribe { document_id } => {
            if let Some(subs) = routes.subscribers.get_mut(&document_id) {
                subs.remove(&client);
                if subs.is_empty() {
                    routes.subscribers.remove(&document_id);
                }
            }
        }
        RelayFrame::Publish(msg) => {
            let Some(subs) = routes.subscribers.get(&msg.document_id) else {
                return Ok(());
            };
            // Forward the bytes as received; they already are a Publish frame.
            let shared = Arc::new(raw.to_vec());
            for id in subs {
                if let Some(tx) = routes.clients.get(id) {
                    if tx.send(Arc::clone(&shared)).is_ok() {
                        stats.forwarded.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
        RelayFrame::Store { .. } | RelayFrame::StoreReply { .. } => {
            log::warn!("relay client {client} sent a storage frame to the router");
        }
    }
    Ok(())
}

/// Run one storage request on the blocking pool and queue the reply on the
/// client's socket.
fn answer_store(
    store: Option<Arc<dyn KeyValueStore>>,
    request: u64,
    op: StoreOp,
    reply: mpsc::UnboundedSender<Arc<Vec<u8>>>,
) {
    tokio::spawn(async move {
        let result = match store {
            Some(store) => tokio::task::spawn_blocking(move || execute(store.as_ref(), op))
                .await
                .unwrap_or_else(|e| Err(StoreError::Task(e.to_string()))),
            None => Err(StoreError::Unavailable),
        };
        if let Err(e) = &result {
            log::debug!("store request {request} failed: {e}");
        }
        match (RelayFrame::StoreReply { request, result }).encode() {
            Ok(bytes) => {
                let _ = reply.send(Arc::new(bytes));
            }
            Err(e) => log::error!("cannot encode reply to store request {request}: {e}"),
        }
    });
}

// ─── Relay client ─────────────────────────────────────────────────────────

pub(crate) type RelayStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Shared {
    local: Mutex<HashMap<DocumentId, broadcast::Sender<Arc<FanOutMessage>>>>,
    connected: AtomicBool,
    capacity: usize,
}

impl Shared {
    fn deliver(&self, data: &[u8]) {
        let msg = match RelayFrame::decode(data) {
            Ok(RelayFrame::Publish(msg)) => msg,
            Ok(other) => {
                log::warn!("unexpected frame from relay: {other:?}");
                return;
            }
            Err(e) => {
                log::warn!("bad frame from relay: {e}");
                return;
            }
        };
        if let Ok(local) = self.local.lock() {
            if let Some(tx) = local.get(&msg.document_id) {
                let _ = tx.send(Arc::new(msg));
            }
        }
    }

    fn subscribed(&self) -> Vec<DocumentId> {
        self.local
            .lock()
            .map(|local| local.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Close every local subscription so inbound loops resubscribe (and
    /// resync) once the relay is reachable again.
    fn drop_subscribers(&self) {
        if let Ok(mut local) = self.local.lock() {
            local.clear();
        }
    }
}

/// [`FanOutChannel`] backed by a [`RelayServer`].
///
/// Publishing and subscribing fail with [`FanOutError::NotConnected`] while
/// the relay is unreachable; the bridge retries both with backoff. On
/// reconnect all local subscriptions are closed, which makes every inbound
/// loop resubscribe and re-merge its document from the store.
pub struct RelayChannel {
    url: String,
    shared: Arc<Shared>,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
}

impl RelayChannel {
    /// Connect to the relay at `url` (`ws://host:port`). The first
    /// connection must succeed; later disconnects are retried forever.
    pub async fn connect(url: &str, config: BridgeConfig) -> Result<Arc<Self>, FanOutError> {
        let (stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| FanOutError::Subscribe(format!("relay {url}: {e}")))?;
        log::info!("connected to relay {url}");

        let shared = Arc::new(Shared {
            local: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(true),
            capacity: 1024,
        });
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(drive(
            url.to_string(),
            Arc::clone(&shared),
            rx,
            stream,
            config,
        ));
        Ok(Arc::new(Self {
            url: url.to_string(),
            shared,
            outgoing: tx,
        }))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn send(&self, frame: &RelayFrame) -> Result<(), FanOutError> {
        if !self.is_connected() {
            return Err(FanOutError::NotConnected);
        }
        self.outgoing
            .send(frame.encode()?)
            .map_err(|_| FanOutError::Closed)
    }
}

impl FanOutChannel for RelayChannel {
    fn publish(&self, msg: Arc<FanOutMessage>) -> BoxFuture<'_, Result<(), FanOutError>> {
        Box::pin(async move { self.send(&RelayFrame::Publish(msg.as_ref().clone())) })
    }

    fn subscribe(
        &self,
        document_id: &str,
    ) -> BoxFuture<'_, Result<broadcast::Receiver<Arc<FanOutMessage>>, FanOutError>> {
        let document_id = document_id.to_string();
        Box::pin(async move {
            if !self.is_connected() {
                return Err(FanOutError::NotConnected);
            }
            let (rx, fresh) = {
                let mut local = self
                    .shared
                    .local
                    .lock()
                    .map_err(|_| FanOutError::Subscribe("relay state poisoned".into()))?;
                match local.get(&document_id) {
                    Some(tx) => (tx.subscribe(), false),
                    None => {
                        let (tx, rx) = broadcast::channel(self.shared.capacity);
                        local.insert(document_id.clone(), tx);
                        (rx, true)
                    }
                }
            };
            if fresh {
                self.send(&RelayFrame::Subscribe { document_id })?;
            }
            Ok(rx)
        })
    }

    fn unsubscribe(&self, document_id: &str) -> BoxFuture<'_, Result<(), FanOutError>> {
        let document_id = document_id.to_string();
        Box::pin(async move {
            let removed = match self.shared.local.lock() {
                Ok(mut local) => {
                    let idle = local
                        .get(&document_id)
                        .is_some_and(|tx| tx.receiver_count() == 0);
                    if idle {
                        local.remove(&document_id);
                    }
                    idle
                }
                Err(_) => false,
            };
            if removed && self.is_connected() {
                self.send(&RelayFrame::Unsubscribe { document_id })?;
            }
            Ok(())
        })
    }
}

/// Owns the relay socket: pumps queued frames out, delivers published
/// messages in, and reconnects with backoff. Stops once the
/// [`RelayChannel`] is dropped.
async fn drive(
    url: String,
    shared: Arc<Shared>,
    mut outgoing: mpsc::UnboundedReceiver<Vec<u8>>,
    first: RelayStream,
    config: BridgeConfig,
) {
    let mut stream = Some(first);
    loop {
        let ws = match stream.take() {
            Some(ws) => ws,
            None => match reconnect(&url, &outgoing, &config).await {
                Some(ws) => ws,
                None => break,
            },
        };
        // Subscriptions are only re-created by the inbound loops after the
        // flag is set, so the channel starts from a clean slate.
        shared.connected.store(true, Ordering::SeqCst);

        let (mut sink, mut source) = ws.split();
        let shutdown = loop {
            tokio::select! {
                frame = outgoing.recv() => {
                    let Some(bytes) = frame else { break true };
                    if let Err(e) = sink.send(Message::Binary(bytes.into())).await {
                        log::warn!("relay {url} send failed: {e}");
                        break false;
                    }
                }
                incoming = source.next() => {
                    match incoming {
                        Some(Ok(Message::Binary(data))) => shared.deliver(&data),
                        Some(Ok(Message::Ping(data))) => {
                            if sink.send(Message::Pong(data)).await.is_err() {
                                break false;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break false,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::warn!("relay {url} read failed: {e}");
                            break false;
                        }
                    }
                }
            }
        };

        shared.connected.store(false, Ordering::SeqCst);
        shared.drop_subscribers();
        if shutdown {
            let _ = sink.close().await;
            break;
        }
        log::warn!(
            "lost relay {url}; {} local subscriptions will resync after reconnect",
            shared.subscribed().len()
        );
    }
    log::debug!("relay client for {url} stopped");
}

pub(crate) async fn reconnect(
    url: &str,
    outgoing: &mpsc::UnboundedReceiver<Vec<u8>>,
    config: &BridgeConfig,
) -> Option<RelayStream> {
    let mut backoff = config.initial_backoff;
    loop {
        if outgoing.is_closed() {
            return None;
        }
        match tokio_tungstenite::connect_async(url).await {
            Ok((ws, _)) => {
                log::info!("reconnected to relay {url}");
                return Some(ws);
            }
            Err(e) => {
                log::warn!("relay {url} unreachable: {e}; retry in {backoff:?}");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(config.max_backoff);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{FanOutKind, OriginId};
    use std::time::Duration;
    use uuid::Uuid;

    async fn relay() -> String {
        let server = RelayServer::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", server.local_addr().unwrap());
        tokio::spawn(server.run());
        url
    }

    fn message(doc: &str, n: u8) -> Arc<FanOutMessage> {
        Arc::new(FanOutMessage {
            document_id: doc.into(),
            kind: FanOutKind::Sync,
            delta: vec![n],
            origin: OriginId {
                process: Uuid::new_v4(),
                connection: None,
            },
        })
    }

    async fn recv(rx: &mut broadcast::Receiver<Arc<FanOutMessage>>) -> Arc<FanOutMessage> {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("relay delivery timed out")
            .unwrap()
    }

    #[test]
    fn test_frame_encoding() {
        let frame = RelayFrame::Subscribe {
            document_id: "doc".into(),
        };
        assert_eq!(RelayFrame::decode(&frame.encode().unwrap()).unwrap(), frame);
        assert!(RelayFrame::decode(&[0xFF, 0xFF]).is_err());
    }

    #[tokio::test]
    async fn test_relay_forwards_between_clients() {
        let url = relay().await;
        let a = RelayChannel::connect(&url, BridgeConfig::default()).await.unwrap();
        let b = RelayChannel::connect(&url, BridgeConfig::default()).await.unwrap();

        let mut rx_a = a.subscribe("doc").await.unwrap();
        let mut rx_b = b.subscribe("doc").await.unwrap();
        // Let both subscriptions reach the relay.
        tokio::time::sleep(Duration::from_millis(100)).await;

        a.publish(message("doc", 9)).await.unwrap();
        assert_eq!(recv(&mut rx_b).await.delta, vec![9]);
        // The publisher hears its own message back.
        assert_eq!(recv(&mut rx_a).await.delta, vec![9]);
    }

    #[tokio::test]
    async fn test_relay_filters_by_document() {
        let url = relay().await;
        let a = RelayChannel::connect(&url, BridgeConfig::default()).await.unwrap();
        let b = RelayChannel::connect(&url, BridgeConfig::default()).await.unwrap();

        let mut other = b.subscribe("other").await.unwrap();
        let mut doc = b.subscribe("doc").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        a.publish(message("doc", 1)).await.unwrap();
        assert_eq!(recv(&mut doc).await.delta, vec![1]);
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connect_to_missing_relay_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let result = RelayChannel::connect(&format!("ws://{addr}"), BridgeConfig::default()).await;
        assert!(result.is_err());
    }
}
