//! Cross-process fan-out of document deltas.
//!
//! ```text
//!  process A                         shared channel                 process B
//! ┌──────────────────┐  publish   ┌──────────────────┐  deliver   ┌──────────────────┐
//! │ DocumentSession  │ ─────────► │ doc-1: [m1 m2 …] │ ─────────► │ FanOutBridge     │
//! │  (local delta)   │            └──────────────────┘            │  inbound loop    │
//! └──────────────────┘                     │                      └────────┬─────────┘
//!          ▲                               │ (also back to A)              ▼
//!          │           origin.process == A ▼                      DocumentSession
//!          └──────────── dropped by A's inbound loop            apply + local broadcast
//! ```
//!
//! Every message carries an [`OriginId`]. A process publishes each delta
//! produced by its own connections exactly once and never re-publishes what
//! it receives. Publishing runs on a single task per process, so deltas for
//! one document leave in the order the session produced them.

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::protocol::{ConnectionId, DocumentId};
use crate::session::DocumentSession;

/// Producer of a delta: the process, and the connection inside it if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OriginId {
    pub process: Uuid,
    pub connection: Option<ConnectionId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FanOutKind {
    Sync,
    Awareness,
}

/// Payload carried on a document's channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanOutMessage {
    pub document_id: DocumentId,
    pub kind: FanOutKind,
    pub delta: Vec<u8>,
    pub origin: OriginId,
}

impl FanOutMessage {
    pub fn encode(&self) -> Result<Vec<u8>, FanOutError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| FanOutError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FanOutError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| FanOutError::Serialization(e.to_string()))?;
        Ok(msg)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FanOutError {
    #[error("fan-out channel not connected")]
    NotConnected,
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("fan-out serialization error: {0}")]
    Serialization(String),
    #[error("fan-out channel closed")]
    Closed,
}

/// Shared publish/subscribe medium, one logical channel per document.
pub trait FanOutChannel: Send + Sync + 'static {
    fn publish(&self, msg: Arc<FanOutMessage>) -> BoxFuture<'_, Result<(), FanOutError>>;

    /// Receive every message published for `document_id` from now on.
    fn subscribe(
        &self,
        document_id: &str,
    ) -> BoxFuture<'_, Result<broadcast::Receiver<Arc<FanOutMessage>>, FanOutError>>;

    fn unsubscribe(&self, document_id: &str) -> BoxFuture<'_, Result<(), FanOutError>>;
}

// ─── In-process hub ───────────────────────────────────────────────────────

/// In-process channel. Several bridges sharing one hub behave like several
/// server processes sharing a pub/sub store.
pub struct LocalHub {
    channels: Mutex<HashMap<DocumentId, broadcast::Sender<Arc<FanOutMessage>>>>,
    capacity: usize,
    published: AtomicU64,
    fail_next: AtomicU64,
}

impl LocalHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            published: AtomicU64::new(0),
            fail_next: AtomicU64::new(0),
        }
    }

    /// Successful publishes so far.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    /// Make the next `n` publishes fail.
    pub fn fail_next_publishes(&self, n: u64) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    fn sender(&self, document_id: &str) -> Result<broadcast::Sender<Arc<FanOutMessage>>, FanOutError> {
        let mut channels = self
            .channels
            .lock()
            .map_err(|_| FanOutError::Subscribe("hub lock poisoned".into()))?;
        Ok(channels
            .entry(document_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone())
    }
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl FanOutChannel for LocalHub {
    fn publish(&self, msg: Arc<FanOutMessage>) -> BoxFuture<'_, Result<(), FanOutError>> {
        Box::pin(async move {
            let injected = self
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if injected {
                return Err(FanOutError::Publish("injected failure".into()));
            }
            let sender = self.sender(&msg.document_id)?;
            // No subscribers is not an error: nobody else has the document open.
            let _ = sender.send(msg);
            self.published.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn subscribe(
        &self,
        document_id: &str,
    ) -> BoxFuture<'_, Result<broadcast::Receiver<Arc<FanOutMessage>>, FanOutError>> {
        let document_id = document_id.to_string();
        Box::pin(async move { Ok(self.sender(&document_id)?.subscribe()) })
    }

    fn unsubscribe(&self, document_id: &str) -> BoxFuture<'_, Result<(), FanOutError>> {
        let document_id = document_id.to_string();
        Box::pin(async move {
            if let Ok(mut channels) = self.channels.lock() {
                if channels
                    .get(&document_id)
                    .is_some_and(|tx| tx.receiver_count() == 0)
                {
                    channels.remove(&document_id);
                }
            }
            Ok(())
        })
    }
}

// ─── Bridge ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// First retry delay after a failed publish or subscribe.
    pub initial_backoff: Duration,
    /// Retry delay ceiling.
    pub max_backoff: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Default)]
pub struct BridgeStats {
    /// Local deltas handed to the publisher.
    pub enqueued: AtomicU64,
    pub published: AtomicU64,
    pub publish_retries: AtomicU64,
    /// Messages from other processes applied locally.
    pub received: AtomicU64,
    /// Messages dropped because this process produced them.
    pub loops_dropped: AtomicU64,
    pub resyncs: AtomicU64,
}

/// This process's end of the fan-out channel.
pub struct FanOutBridge {
    process_id: Uuid,
    channel: Arc<dyn FanOutChannel>,
    outgoing: mpsc::UnboundedSender<Arc<FanOutMessage>>,
    config: BridgeConfig,
    stats: Arc<BridgeStats>,
}

impl FanOutBridge {
    /// Create the bridge and spawn its publisher task.
    pub fn start(channel: Arc<dyn FanOutChannel>, config: BridgeConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(BridgeStats::default());
        let process_id = Uuid::new_v4();

        tokio::spawn(publisher(
            Arc::clone(&channel),
            rx,
            config.clone(),
            Arc::clone(&stats),
        ));
        log::info!("fan-out bridge started for process {process_id}");

        Arc::new(Self {
            process_id,
            channel,
            outgoing: tx,
            config,
            stats,
        })
    }

    pub fn process_id(&self) -> Uuid {
        self.process_id
    }

    pub fn stats(&self) -> &BridgeStats {
        &self.stats
    }

    /// Origin tag for a delta produced by `connection` in this process.
    pub fn origin(&self, connection: Option<ConnectionId>) -> OriginId {
        OriginId {
            process: self.process_id,
            connection,
        }
    }

    /// Queue a locally produced delta for publication. Never blocks.
    pub fn publish(
        &self,
        document_id: &str,
        kind: FanOutKind,
        delta: Vec<u8>,
        connection: Option<ConnectionId>,
    ) {
        let msg = Arc::new(FanOutMessage {
            document_id: document_id.to_string(),
            kind,
            delta,
            origin: self.origin(connection),
        });
        if self.outgoing.send(msg).is_err() {
            log::error!("fan-out publisher stopped; delta for {document_id} not published");
            return;
        }
        self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// Subscribe to `document_id` and spawn the loop feeding `session`.
    ///
    /// The first subscribe attempt completes before this returns, so the
    /// caller can load persisted state afterwards without missing deltas
    /// published in between.
    pub async fn attach_document(
        self: &Arc<Self>,
        document_id: &str,
        session: Weak<DocumentSession>,
    ) -> JoinHandle<()> {
        let first = self.channel.subscribe(document_id).await;
        if let Err(e) = &first {
            log::warn!("fan-out subscribe for {document_id} failed: {e}; retrying in background");
        }
        let bridge = Arc::clone(self);
        let document_id = document_id.to_string();
        tokio::spawn(async move {
            bridge.run_inbound(document_id, first.ok(), session).await;
        })
    }

    pub async fn detach_document(&self, document_id: &str) {
        if let Err(e) = self.channel.unsubscribe(document_id).await {
            log::warn!("fan-out unsubscribe for {document_id} failed: {e}");
        }
    }

    async fn run_inbound(
        &self,
        document_id: DocumentId,
        mut rx: Option<broadcast::Receiver<Arc<FanOutMessage>>>,
        session: Weak<DocumentSession>,
    ) {
        loop {
            if rx.is_none() {
                match self.resubscribe(&document_id, &session).await {
                    Some(fresh) => {
                        rx = Some(fresh);
                        // Messages published while unsubscribed are only in the store.
                        self.resync(&document_id, &session).await;
                    }
                    None => break,
                }
            }
            let Some(receiver) = rx.as_mut() else {
                break;
            };

            match receiver.recv().await {
                Ok(msg) => {
                    if msg.origin.process == self.process_id {
                        self.stats.loops_dropped.fetch_add(1, Ordering::Relaxed);
                        log::trace!("dropping own fan-out message for {document_id}");
                        continue;
                    }
                    let Some(session) = session.upgrade() else {
                        break;
                    };
                    self.stats.received.fetch_add(1, Ordering::Relaxed);
                    session.apply_remote(&msg).await;
                }
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("fan-out for {document_id} lagged by {skipped} messages; resyncing");
                    self.resync(&document_id, &session).await;
                }
                Err(RecvError::Closed) => {
                    log::warn!("fan-out subscription for {document_id} closed");
                    rx = None;
                }
            }
        }
        log::debug!("fan-out inbound loop for {document_id} stopped");
    }

    async fn resubscribe(
        &self,
        document_id: &str,
        session: &Weak<DocumentSession>,
    ) -> Option<broadcast::Receiver<Arc<FanOutMessage>>> {
        let mut backoff = self.config.initial_backoff;
        loop {
            match session.upgrade() {
                Some(s) if !s.is_closed().await => {}
                _ => return None,
            }
            match self.channel.subscribe(document_id).await {
                Ok(rx) => return Some(rx),
                Err(e) => {
                    log::warn!("fan-out resubscribe for {document_id} failed: {e}; retry in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.config.max_backoff);
                }
            }
        }
    }

    async fn resync(&self, document_id: &str, session: &Weak<DocumentSession>) {
        let Some(session) = session.upgrade() else {
            return;
        };
        self.stats.resyncs.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = session.resync_from_store().await {
            log::error!("resync of {document_id} from store failed: {e}");
        }
    }
}

/// Drains the outgoing queue in order, retrying each message with
/// exponential backoff until it is published.
async fn publisher(
    channel: Arc<dyn FanOutChannel>,
    mut rx: mpsc::UnboundedReceiver<Arc<FanOutMessage>>,
    config: BridgeConfig,
    stats: Arc<BridgeStats>,
) {
    while let Some(msg) = rx.recv().await {
        let mut backoff = config.initial_backoff;
        loop {
            match channel.publish(Arc::clone(&msg)).await {
                Ok(()) => {
                    stats.published.fetch_add(1, Ordering::Relaxed);
                    break;
                }
                Err(e) => {
                    stats.publish_retries.fetch_add(1, Ordering::Relaxed);
                    log::warn!(
                        "fan-out publish for {} failed: {e}; retry in {backoff:?}",
                        msg.document_id
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(config.max_backoff);
                }
            }
        }
    }
    log::debug!("fan-out publisher stopped");
}
