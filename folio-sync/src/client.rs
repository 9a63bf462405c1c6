//! WebSocket client for the sync server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect)
//! - Join/leave and update/awareness sending
//! - Offline queue for updates made while disconnected, replayed after the
//!   documents are re-joined
//!
//! Used by editors embedding the engine and by the integration tests.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ClientMessage, DocumentId, ProtocolError, ServerMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    /// A frame from the server.
    Message(ServerMessage),
}

/// Updates made while disconnected, replayed on reconnection.
pub struct OfflineQueue {
    queue: VecDeque<(DocumentId, Vec<u8>)>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an update. Returns false when the queue is full.
    pub fn enqueue(&mut self, document_id: &str, delta: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back((document_id.to_string(), delta));
        true
    }

    pub fn drain(&mut self) -> Vec<(DocumentId, Vec<u8>)> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|(_, delta)| delta.len()).sum()
    }
}

/// The sync client.
pub struct SyncClient {
    server_url: String,
    token: String,
    state: Arc<RwLock<ConnectionState>>,
    offline_queue: Arc<Mutex<OfflineQueue>>,
    /// Documents to re-join after a reconnect.
    joined: Arc<Mutex<BTreeSet<DocumentId>>>,
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_tx: mpsc::Sender<SyncEvent>,
    event_rx: mpsc::Receiver<SyncEvent>,
}

impl SyncClient {
    /// Create a disconnected client. `server_url` is `ws://host:port`.
    pub fn new(server_url: impl Into<String>, token: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(1024);
        Self {
            server_url: server_url.into(),
            token: token.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(10_000))),
            joined: Arc::new(Mutex::new(BTreeSet::new())),
            outgoing_tx: None,
            event_tx,
            event_rx,
        }
    }

    /// Connect, presenting the token as a query parameter. Previously joined
    /// documents are joined again and queued updates replayed.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let url = format!("{}/?token={}", self.server_url.trim_end_matches('/'), self.token);
        let (ws_stream, _) = match tokio_tungstenite::connect_async(&url).await {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("connecting to {} failed: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(1024);
        self.outgoing_tx = Some(out_tx);

        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let event_tx = self.event_tx.clone();
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match ServerMessage::decode(&data) {
                        Ok(frame) => {
                            if event_tx.send(SyncEvent::Message(frame)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("undecodable frame from server: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        let rejoin: Vec<DocumentId> = self.joined.lock().await.iter().cloned().collect();
        for document_id in rejoin {
            self.send(&ClientMessage::Join { document_id }).await?;
        }
        let queued = self.offline_queue.lock().await.drain();
        if !queued.is_empty() {
            log::info!("replaying {} queued updates", queued.len());
            for (document_id, delta) in queued {
                self.send(&ClientMessage::Update { document_id, delta }).await?;
            }
        }
        Ok(())
    }

    /// Close the socket. Joined documents are remembered for the next
    /// [`Self::connect`].
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    async fn send(&self, msg: &ClientMessage) -> Result<(), ProtocolError> {
        let encoded = msg.encode()?;
        let tx = self
            .outgoing_tx
            .as_ref()
            .ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(encoded)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    async fn is_connected(&self) -> bool {
        *self.state.read().await == ConnectionState::Connected && self.outgoing_tx.is_some()
    }

    pub async fn authenticate(&self, token: &str) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Authenticate {
            token: token.to_string(),
        })
        .await
    }

    pub async fn join(&self, document_id: &str) -> Result<(), ProtocolError> {
        self.joined.lock().await.insert(document_id.to_string());
        if !self.is_connected().await {
            return Ok(());
        }
        self.send(&ClientMessage::Join {
            document_id: document_id.to_string(),
        })
        .await
    }

    pub async fn leave(&self, document_id: &str) -> Result<(), ProtocolError> {
        self.joined.lock().await.remove(document_id);
        self.send(&ClientMessage::Leave {
            document_id: document_id.to_string(),
        })
        .await
    }

    /// Send a document update. While disconnected it is queued for replay.
    pub async fn send_update(&self, document_id: &str, delta: Vec<u8>) -> Result<(), ProtocolError> {
        if !self.is_connected().await {
            let mut queue = self.offline_queue.lock().await;
            if !queue.enqueue(document_id, delta) {
                return Err(ProtocolError::ConnectionClosed);
            }
            return Ok(());
        }
        self.send(&ClientMessage::Update {
            document_id: document_id.to_string(),
            delta,
        })
        .await
    }

    /// Send an awareness delta. Dropped while disconnected; presence is
    /// re-announced after reconnecting.
    pub async fn send_awareness(&self, document_id: &str, delta: Vec<u8>) -> Result<(), ProtocolError> {
        if !self.is_connected().await {
            return Ok(());
        }
        self.send(&ClientMessage::Awareness {
            document_id: document_id.to_string(),
            delta,
        })
        .await
    }

    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Ping).await
    }

    /// Send raw bytes, bypassing encoding. Lets tests send frames the encoder would refuse.
    pub async fn send_raw(&self, bytes: Vec<u8>) -> Result<(), ProtocolError> {
        let tx = self
            .outgoing_tx
            .as_ref()
            .ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(bytes)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Next event, or `None` if nothing arrives within `timeout`.
    pub async fn next_event(&mut self, timeout: Duration) -> Option<SyncEvent> {
        tokio::time::timeout(timeout, self.event_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Next server frame matching `pred`, skipping everything else.
    pub async fn wait_for<F>(&mut self, timeout: Duration, mut pred: F) -> Option<ServerMessage>
    where
        F: FnMut(&ServerMessage) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, self.event_rx.recv()).await {
                Ok(Some(SyncEvent::Message(msg))) if pred(&msg) => return Some(msg),
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => return None,
            }
        }
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = SyncClient::new("ws://localhost:9090", "token");
        assert_eq!(client.server_url(), "ws://localhost:9090");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.offline_queue_len().await, 0);
    }

    #[tokio::test]
    async fn test_send_update_offline_queues() {
        let client = SyncClient::new("ws://localhost:9090", "token");
        client.join("doc-1").await.unwrap();
        client.send_update("doc-1", vec![1, 2, 3]).await.unwrap();
        client.send_update("doc-1", vec![4, 5, 6]).await.unwrap();
        assert_eq!(client.offline_queue_len().await, 2);
    }

    #[tokio::test]
    async fn test_send_awareness_offline_noop() {
        let client = SyncClient::new("ws://localhost:9090", "token");
        client.send_awareness("doc-1", vec![1]).await.unwrap();
        assert_eq!(client.offline_queue_len().await, 0);
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_disconnected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut client = SyncClient::new(format!("ws://{addr}"), "token");
        assert!(client.connect().await.is_err());
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[test]
    fn test_offline_queue() {
        let mut queue = OfflineQueue::new(100);
        assert!(queue.is_empty());

        queue.enqueue("a", vec![1, 2, 3]);
        queue.enqueue("b", vec![4, 5, 6, 7]);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.total_bytes(), 7);

        let drained = queue.drain();
        assert_eq!(drained[0], ("a".to_string(), vec![1, 2, 3]));
        assert_eq!(drained[1].0, "b");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_offline_queue_capacity() {
        let mut queue = OfflineQueue::new(3);
        assert!(queue.enqueue("d", vec![1]));
        assert!(queue.enqueue("d", vec![2]));
        assert!(queue.enqueue("d", vec![3]));
        assert!(!queue.enqueue("d", vec![4]));
        assert_eq!(queue.len(), 3);
    }
}
