//! One open document: replica, awareness, attached connections.
//!
//! ```text
//!              ┌───────────────── DocumentSession (one tokio Mutex) ─────────────────┐
//! update ────► │ Replica::apply_update ─► BroadcastGroup::broadcast(except origin)   │
//!              │                        ─► UpdateWriter::enqueue     (local only)    │
//!              │                        ─► FanOutBridge::publish     (local only)    │
//!              └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every operation runs under the session lock, so apply, attach, detach and
//! broadcast are strictly serialized per document while different documents
//! proceed in parallel. The lock is only held across non-blocking work; the
//! writer and the bridge are queues.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

use crate::awareness::{AwarenessError, AwarenessState, AwarenessUpdate};
use crate::bridge::{FanOutBridge, FanOutKind, FanOutMessage, OriginId};
use crate::broadcast::{BroadcastGroup, Peer};
use crate::persistence::{PersistedState, PersistenceGateway, StoreError, UpdateWriter};
use crate::protocol::{ConnectionId, DocumentId, ProtocolError, ServerMessage};
use crate::replica::Replica;

/// Where a delta entered this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Sent by a connection attached to this session.
    Connection(ConnectionId),
    /// Received from another process over the fan-out channel.
    Remote(OriginId),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("document session is closed")]
    Closed,
    #[error("connection {0} is not attached")]
    NotAttached(ConnectionId),
    #[error("invalid delta: {0}")]
    InvalidDelta(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<SessionError> for ProtocolError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NotAttached(_) => ProtocolError::Internal(e.to_string()),
            SessionError::InvalidDelta(msg) => ProtocolError::InvalidDelta(msg),
            SessionError::Forbidden(msg) => ProtocolError::Forbidden(msg),
            SessionError::Protocol(inner) => inner,
            SessionError::Closed | SessionError::Store(_) => ProtocolError::Internal(e.to_string()),
        }
    }
}

impl From<AwarenessError> for SessionError {
    fn from(e: AwarenessError) -> Self {
        SessionError::InvalidDelta(e.to_string())
    }
}

/// Handles a session uses to reach the outside world.
#[derive(Clone)]
pub struct SessionOutlets {
    pub gateway: PersistenceGateway,
    pub writer: UpdateWriter,
    pub bridge: Arc<FanOutBridge>,
}

/// State guarded by the session lock.
pub struct SessionState {
    replica: Replica,
    awareness: AwarenessState,
    peers: BroadcastGroup,
    /// Attached connections and the user each speaks for.
    members: HashMap<ConnectionId, String>,
    last_access: Instant,
    loaded: bool,
    /// Every persisted log entry up to this sequence is in the replica.
    merged_seq: u64,
    closed: bool,
}

impl SessionState {
    fn new() -> Self {
        Self {
            replica: Replica::new(),
            awareness: AwarenessState::new(),
            peers: BroadcastGroup::new(),
            members: HashMap::new(),
            last_access: Instant::now(),
            loaded: false,
            merged_seq: 0,
            closed: false,
        }
    }

    fn user_has_other_connection(&self, user_id: &str, except: ConnectionId) -> bool {
        self.members
            .iter()
            .any(|(id, user)| *id != except && user == user_id)
    }
}

/// A document open in this process.
pub struct DocumentSession {
    document_id: DocumentId,
    state: Arc<Mutex<SessionState>>,
    outlets: SessionOutlets,
    connections: AtomicUsize,
    dirty: AtomicBool,
    /// Held for the whole of a flush so a final flush waits for one in flight.
    flushing: Mutex<()>,
    subscription: StdMutex<Option<JoinHandle<()>>>,
}

impl DocumentSession {
    /// Allocate an empty, not yet loaded session.
    pub fn new(document_id: impl Into<DocumentId>, outlets: SessionOutlets) -> Arc<Self> {
        Arc::new(Self {
            document_id: document_id.into(),
            state: Arc::new(Mutex::new(SessionState::new())),
            outlets,
            connections: AtomicUsize::new(0),
            dirty: AtomicBool::new(false),
            flushing: Mutex::new(()),
            subscription: StdMutex::new(None),
        })
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Attached connection count, readable without the session lock.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Take the session lock before anyone else can, so that callers queue
    /// behind the initial load. Only succeeds on a fresh session.
    pub(crate) fn lock_for_load(&self) -> Option<OwnedMutexGuard<SessionState>> {
        Arc::clone(&self.state).try_lock_owned().ok()
    }

    /// Populate the replica from persistence, then release the load guard.
    ///
    /// Failures are logged and leave the document empty; the return value
    /// says whether persisted state was read.
    pub(crate) async fn load(
        &self,
        mut guard: OwnedMutexGuard<SessionState>,
        timeout: Duration,
    ) -> bool {
        let started = Instant::now();
        let loaded = match tokio::time::timeout(timeout, self.outlets.gateway.load(&self.document_id)).await {
            Ok(Ok(persisted)) => {
                let rejected = merge_persisted(&mut guard, &persisted, &self.document_id);
                if rejected > 0 {
                    log::error!(
                        "skipped {rejected} corrupt entries while loading {}",
                        self.document_id
                    );
                }
                log::info!(
                    "loaded {} (snapshot: {}, {} deltas) in {:?}",
                    self.document_id,
                    persisted.snapshot.is_some(),
                    persisted.deltas.len(),
                    started.elapsed()
                );
                true
            }
            Ok(Err(e)) => {
                log::error!("failed to load {}: {e}; starting empty", self.document_id);
                false
            }
            Err(_) => {
                log::error!(
                    "loading {} timed out after {timeout:?}; starting empty",
                    self.document_id
                );
                false
            }
        };
        guard.loaded = true;
        guard.last_access = Instant::now();
        loaded
    }

    pub(crate) fn set_subscription(&self, handle: JoinHandle<()>) {
        if let Ok(mut slot) = self.subscription.lock() {
            if let Some(previous) = slot.replace(handle) {
                previous.abort();
            }
        }
    }

    fn abort_subscription(&self) {
        if let Ok(mut slot) = self.subscription.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }

    /// Attach a connection and bring it up to date.
    ///
    /// The new peer receives the full document state, the awareness snapshot
    /// and one `PeerJoined` per user already present; everyone else learns
    /// that the new user joined.
    pub async fn attach(&self, peer: Peer) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(SessionError::Closed);
        }

        let connection_id = peer.connection_id;
        let user_id = peer.user_id.clone();
        let rejoin = state.members.contains_key(&connection_id);
        let user_already_present = state.user_has_other_connection(&user_id, connection_id);

        state.members.insert(connection_id, user_id.clone());
        state.peers.add_peer(peer);
        state.last_access = Instant::now();
        self.connections.store(state.members.len(), Ordering::SeqCst);

        let doc = self.document_id.clone();
        let mut evicted = Vec::new();
        let full_state = ServerMessage::Synced {
            document_id: doc.clone(),
            delta: state.replica.encode_state(),
        };
        evicted.extend(state.peers.send_to(&connection_id, &full_state)?);

        let snapshot = state.awareness.snapshot();
        if !snapshot.is_empty() {
            let msg = ServerMessage::Awareness {
                document_id: doc.clone(),
                delta: snapshot.encode()?,
            };
            evicted.extend(state.peers.send_to(&connection_id, &msg)?);
        }

        let mut present: Vec<String> = state
            .members
            .iter()
            .filter(|(id, _)| **id != connection_id)
            .map(|(_, user)| user.clone())
            .collect();
        present.sort();
        present.dedup();
        for other in present {
            let msg = ServerMessage::PeerJoined {
                document_id: doc.clone(),
                user_id: other,
            };
            evicted.extend(state.peers.send_to(&connection_id, &msg)?);
        }

        if !rejoin && !user_already_present {
            let msg = ServerMessage::PeerJoined {
                document_id: doc.clone(),
                user_id: user_id.clone(),
            };
            evicted.extend(state.peers.broadcast(&msg, Some(connection_id))?);
        }
        drop(state);

        log::info!("connection {connection_id} ({user_id}) joined {doc}");
        self.log_evicted(&evicted);
        self.record_active_user(user_id, true);
        Ok(())
    }

    /// Detach a connection. Returns the number of connections left, or
    /// `None` if it was not attached.
    ///
    /// Awareness entries the connection owned are removed and the removal is
    /// broadcast locally and published.
    pub async fn detach(&self, connection_id: ConnectionId) -> Result<Option<usize>, SessionError> {
        let mut state = self.state.lock().await;
        let Some(user_id) = state.members.remove(&connection_id) else {
            state.peers.remove_peer(&connection_id);
            return Ok(None);
        };
        state.peers.remove_peer(&connection_id);
        state.last_access = Instant::now();
        let remaining = state.members.len();
        self.connections.store(remaining, Ordering::SeqCst);

        let doc = self.document_id.clone();
        let mut evicted = Vec::new();

        let removal = state.awareness.remove_owned_by(connection_id);
        if !removal.is_empty() {
            let delta = removal.encode()?;
            let msg = ServerMessage::Awareness {
                document_id: doc.clone(),
                delta: delta.clone(),
            };
            evicted.extend(state.peers.broadcast(&msg, None)?);
            if !state.closed {
                self.outlets.bridge.publish(
                    &doc,
                    FanOutKind::Awareness,
                    delta,
                    Some(connection_id),
                );
            }
        }

        let user_gone = !state.user_has_other_connection(&user_id, connection_id);
        if user_gone {
            let msg = ServerMessage::PeerLeft {
                document_id: doc.clone(),
                user_id: user_id.clone(),
            };
            evicted.extend(state.peers.broadcast(&msg, None)?);
        }
        drop(state);

        log::info!("connection {connection_id} ({user_id}) left {doc}; {remaining} remaining");
        self.log_evicted(&evicted);
        if user_gone {
            self.record_active_user(user_id, false);
        }
        Ok(Some(remaining))
    }

    /// Merge a document delta and fan it out.
    ///
    /// Malformed deltas are rejected before the replica is touched. Deltas
    /// from local connections are broadcast to everyone but the sender,
    /// queued for persistence and published once; remote deltas are only
    /// broadcast locally.
    pub async fn apply_update(&self, origin: Origin, delta: Vec<u8>) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(SessionError::Closed);
        }
        if let Origin::Connection(id) = origin {
            if !state.members.contains_key(&id) {
                return Err(SessionError::NotAttached(id));
            }
        }

        if let Err(e) = state.replica.apply_update(&delta) {
            log::error!(
                "rejected malformed delta for {} from {origin:?}: {e}",
                self.document_id
            );
            return Err(SessionError::InvalidDelta(e.to_string()));
        }
        state.last_access = Instant::now();
        self.dirty.store(true, Ordering::SeqCst);

        let except = match origin {
            Origin::Connection(id) => Some(id),
            Origin::Remote(_) => None,
        };
        let msg = ServerMessage::Update {
            document_id: self.document_id.clone(),
            delta: delta.clone(),
        };
        let evicted = state.peers.broadcast(&msg, except)?;

        if let Origin::Connection(id) = origin {
            self.outlets.writer.enqueue(&self.document_id, delta.clone());
            self.outlets
                .bridge
                .publish(&self.document_id, FanOutKind::Sync, delta, Some(id));
        }
        drop(state);

        self.log_evicted(&evicted);
        Ok(())
    }

    /// Merge an awareness delta and fan out the records that won.
    ///
    /// A connection may only speak for its own user. Awareness is never
    /// persisted.
    pub async fn apply_awareness(&self, origin: Origin, delta: &[u8]) -> Result<(), SessionError> {
        let update = AwarenessUpdate::decode(delta)?;

        let mut state = self.state.lock().await;
        if state.closed {
            return Err(SessionError::Closed);
        }

        let owner = match origin {
            Origin::Connection(id) => {
                let user_id = state
                    .members
                    .get(&id)
                    .ok_or(SessionError::NotAttached(id))?;
                if let Some(record) = update.records.iter().find(|r| &r.user_id != user_id) {
                    return Err(SessionError::Forbidden(format!(
                        "{user_id} cannot publish awareness for {}",
                        record.user_id
                    )));
                }
                Some(id)
            }
            Origin::Remote(_) => None,
        };

        let accepted = match owner {
            Some(id) => state.awareness.apply_local(update, id),
            None => state.awareness.apply(update, None),
        };
        if accepted.is_empty() {
            return Ok(());
        }
        state.last_access = Instant::now();

        let encoded = accepted.encode()?;
        let msg = ServerMessage::Awareness {
            document_id: self.document_id.clone(),
            delta: encoded.clone(),
        };
        let evicted = state.peers.broadcast(&msg, owner)?;
        if let Origin::Connection(id) = origin {
            self.outlets
                .bridge
                .publish(&self.document_id, FanOutKind::Awareness, encoded, Some(id));
        }
        drop(state);

        self.log_evicted(&evicted);
        Ok(())
    }

    /// Apply a message received from another process.
    pub async fn apply_remote(&self, msg: &FanOutMessage) {
        let origin = Origin::Remote(msg.origin);
        let result = match msg.kind {
            FanOutKind::Sync => self.apply_update(origin, msg.delta.clone()).await,
            FanOutKind::Awareness => self.apply_awareness(origin, &msg.delta).await,
        };
        match result {
            Ok(()) | Err(SessionError::Closed) => {}
            Err(e) => log::warn!(
                "dropping remote {:?} message for {} from process {}: {e}",
                msg.kind,
                self.document_id,
                msg.origin.process
            ),
        }
    }

    /// Merge whatever the store holds that this replica lacks, and send the
    /// difference to local connections. Used after fan-out gaps.
    pub async fn resync_from_store(&self) -> Result<(), SessionError> {
        let persisted = self.outlets.gateway.load(&self.document_id).await?;

        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        let Some(evicted) = self.merge_and_broadcast(&mut state, &persisted)? else {
            log::debug!("resync of {} found nothing new", self.document_id);
            return Ok(());
        };
        drop(state);

        self.dirty.store(true, Ordering::SeqCst);
        self.log_evicted(&evicted);
        log::info!("resynced {} from store", self.document_id);
        Ok(())
    }

    /// Merge a load into the replica and broadcast what changed. Returns
    /// `None` when the load brought nothing new.
    fn merge_and_broadcast(
        &self,
        state: &mut SessionState,
        persisted: &PersistedState,
    ) -> Result<Option<Vec<Peer>>, SessionError> {
        let before = state.replica.state_vector();
        let before_text = state.replica.text();
        let rejected = merge_persisted(state, persisted, &self.document_id);
        if rejected > 0 {
            log::error!(
                "skipped {rejected} corrupt entries while merging {} from store",
                self.document_id
            );
        }
        if state.replica.state_vector() == before && state.replica.text() == before_text {
            return Ok(None);
        }

        let diff = state
            .replica
            .encode_diff(&before)
            .map_err(|e| SessionError::InvalidDelta(e.to_string()))?;
        let msg = ServerMessage::Update {
            document_id: self.document_id.clone(),
            delta: diff,
        };
        Ok(Some(state.peers.broadcast(&msg, None)?))
    }

    /// Write a snapshot if anything changed since the last one.
    ///
    /// The stored snapshot and log are merged in first, so the snapshot
    /// never drops content persisted by another process or content this
    /// session failed to load. If that read fails nothing is written.
    /// Returns whether a snapshot was written. On failure the session stays
    /// dirty so the next tick retries.
    pub async fn flush(&self) -> Result<bool, SessionError> {
        let _flushing = self.flushing.lock().await;
        if !self.dirty.load(Ordering::SeqCst) {
            return Ok(false);
        }
        // Queued deltas land first so the merged sequence includes them.
        self.outlets.writer.flush().await;

        let persisted = match self.outlets.gateway.load(&self.document_id).await {
            Ok(persisted) => persisted,
            Err(e) => {
                log::error!("snapshot of {} skipped, store read failed: {e}", self.document_id);
                return Err(e.into());
            }
        };

        let (encoded, merged_seq, evicted) = {
            let mut state = self.state.lock().await;
            if !state.loaded {
                return Ok(false);
            }
            let evicted = self
                .merge_and_broadcast(&mut state, &persisted)?
                .unwrap_or_default();
            self.dirty.store(false, Ordering::SeqCst);
            (state.replica.encode_state(), state.merged_seq, evicted)
        };
        self.log_evicted(&evicted);

        match self
            .outlets
            .gateway
            .snapshot(&self.document_id, encoded, merged_seq)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                self.dirty.store(true, Ordering::SeqCst);
                log::error!("snapshot of {} failed: {e}", self.document_id);
                Err(e.into())
            }
        }
    }

    /// Drop awareness entries relayed from other processes that were not
    /// refreshed within `timeout`, and tell local connections. Returns how
    /// many entries were removed.
    pub async fn expire_awareness(&self, now: Instant, timeout: Duration) -> Result<usize, SessionError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(0);
        }
        let removal = state.awareness.remove_stale(now, timeout);
        if removal.is_empty() {
            return Ok(0);
        }
        let msg = ServerMessage::Awareness {
            document_id: self.document_id.clone(),
            delta: removal.encode()?,
        };
        let evicted = state.peers.broadcast(&msg, None)?;
        drop(state);

        log::debug!(
            "expired {} stale awareness entries in {}",
            removal.records.len(),
            self.document_id
        );
        self.log_evicted(&evicted);
        Ok(removal.records.len())
    }

    /// Whether the session has had no connections for at least `threshold`.
    pub async fn is_idle(&self, now: Instant, threshold: Duration) -> bool {
        let state = self.state.lock().await;
        state.members.is_empty() && now.saturating_duration_since(state.last_access) >= threshold
    }

    /// Mark the session closed if it is still idle. Closed sessions reject
    /// every further operation.
    pub(crate) async fn close_if_idle(&self, now: Instant, threshold: Duration) -> bool {
        let mut state = self.state.lock().await;
        let idle =
            state.members.is_empty() && now.saturating_duration_since(state.last_access) >= threshold;
        if idle {
            state.closed = true;
            self.abort_subscription();
        }
        idle
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Current document text.
    pub async fn text(&self) -> String {
        self.state.lock().await.replica.text()
    }

    /// Full encoded document state.
    pub async fn encode_state(&self) -> Vec<u8> {
        self.state.lock().await.replica.encode_state()
    }

    pub async fn awareness_len(&self) -> usize {
        self.state.lock().await.awareness.len()
    }

    /// Ids of the attached connections.
    pub async fn connection_ids(&self) -> Vec<ConnectionId> {
        self.state.lock().await.members.keys().copied().collect()
    }

    fn log_evicted(&self, evicted: &[Peer]) {
        for peer in evicted {
            log::warn!(
                "connection {} ({}) dropped from {}",
                peer.connection_id,
                peer.user_id,
                self.document_id
            );
        }
    }

    /// Queued on the writer so joins and leaves reach the store in the order
    /// they happened here.
    fn record_active_user(&self, user_id: String, present: bool) {
        self.outlets.writer.record_active_user(
            &self.document_id,
            user_id,
            self.outlets.bridge.process_id(),
            present,
        );
    }
}

/// Fold a load into the replica. Returns how many entries were rejected.
fn merge_persisted(state: &mut SessionState, persisted: &PersistedState, document_id: &str) -> usize {
    let mut rejected = 0usize;
    if let Some(snapshot) = &persisted.snapshot {
        if let Err(e) = state.replica.apply_update(snapshot) {
            log::error!("corrupt snapshot for {document_id}: {e}");
            rejected += 1;
        }
    }
    for delta in &persisted.deltas {
        if state.replica.apply_update(delta).is_err() {
            rejected += 1;
        }
    }
    state.merged_seq = state.merged_seq.max(persisted.last_seq);
    rejected
}

impl Drop for DocumentSession {
    fn drop(&mut self) {
        self.abort_subscription();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awareness::{Presence, TextSelection};
    use crate::bridge::{BridgeConfig, LocalHub};
    use crate::persistence::{MemoryStore, RetentionPolicy, WriterConfig};
    use tokio::sync::{mpsc, Notify};
    use uuid::Uuid;

    struct Harness {
        session: Arc<DocumentSession>,
        hub: Arc<LocalHub>,
        store: Arc<MemoryStore>,
    }

    async fn harness() -> Harness {
        harness_with(Arc::new(MemoryStore::new())).await
    }

    async fn harness_with(store: Arc<MemoryStore>) -> Harness {
        let gateway = PersistenceGateway::new(store.clone(), RetentionPolicy::default());
        let writer = UpdateWriter::spawn(gateway.clone(), WriterConfig::default());
        let hub = Arc::new(LocalHub::default());
        let bridge = FanOutBridge::start(hub.clone(), BridgeConfig::default());
        let session = DocumentSession::new(
            "doc-1",
            SessionOutlets {
                gateway,
                writer,
                bridge,
            },
        );
        let guard = session.lock_for_load().unwrap();
        session.load(guard, Duration::from_secs(1)).await;
        Harness {
            session,
            hub,
            store,
        }
    }

    fn peer(user: &str) -> (Peer, mpsc::Receiver<Arc<Vec<u8>>>) {
        let (tx, rx) = mpsc::channel(64);
        (
            Peer {
                connection_id: Uuid::new_v4(),
                user_id: user.into(),
                outbox: tx,
                kill: Arc::new(Notify::new()),
            },
            rx,
        )
    }

    fn drain(rx: &mut mpsc::Receiver<Arc<Vec<u8>>>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(ServerMessage::decode(&frame).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_attach_sends_full_state() {
        let h = harness().await;
        let (a, mut rx_a) = peer("alice");
        let id_a = a.connection_id;
        h.session.attach(a).await.unwrap();

        let editor = Replica::new();
        let delta = editor.insert(0, "hello");
        h.session
            .apply_update(Origin::Connection(id_a), delta)
            .await
            .unwrap();

        let (b, mut rx_b) = peer("bob");
        h.session.attach(b).await.unwrap();

        let frames = drain(&mut rx_b);
        let ServerMessage::Synced { delta, .. } = &frames[0] else {
            panic!("expected synced first, got {frames:?}");
        };
        assert_eq!(Replica::from_state(delta).unwrap().text(), "hello");
        assert!(frames.contains(&ServerMessage::PeerJoined {
            document_id: "doc-1".into(),
            user_id: "alice".into()
        }));

        let to_alice = drain(&mut rx_a);
        assert!(to_alice.contains(&ServerMessage::PeerJoined {
            document_id: "doc-1".into(),
            user_id: "bob".into()
        }));
        assert_eq!(h.session.connection_count(), 2);
    }

    #[tokio::test]
    async fn test_update_skips_origin_and_publishes_once() {
        let h = harness().await;
        let (a, mut rx_a) = peer("alice");
        let (b, mut rx_b) = peer("bob");
        let id_a = a.connection_id;
        h.session.attach(a).await.unwrap();
        h.session.attach(b).await.unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        let delta = Replica::new().insert(0, "x");
        h.session
            .apply_update(Origin::Connection(id_a), delta.clone())
            .await
            .unwrap();

        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(
            drain(&mut rx_b),
            vec![ServerMessage::Update {
                document_id: "doc-1".into(),
                delta
            }]
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.hub.published(), 1);
    }

    #[tokio::test]
    async fn test_malformed_update_rejected_without_mutation() {
        let h = harness().await;
        let (a, _rx) = peer("alice");
        let id = a.connection_id;
        h.session.attach(a).await.unwrap();
        let before = h.session.encode_state().await;

        let err = h
            .session
            .apply_update(Origin::Connection(id), vec![0x03, 0xFF])
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidDelta(_)));
        assert_eq!(h.session.encode_state().await, before);
        assert!(!h.session.is_dirty());
    }

    #[tokio::test]
    async fn test_update_from_detached_connection_rejected() {
        let h = harness().await;
        let err = h
            .session
            .apply_update(Origin::Connection(Uuid::new_v4()), Replica::new().insert(0, "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::NotAttached(_)));
    }

    #[tokio::test]
    async fn test_awareness_for_other_user_forbidden() {
        let h = harness().await;
        let (a, _rx) = peer("alice");
        let id = a.connection_id;
        h.session.attach(a).await.unwrap();

        let spoof = AwarenessUpdate::single("bob", 1, Some(Presence::new("bob", "Bob")))
            .encode()
            .unwrap();
        let err = h
            .session
            .apply_awareness(Origin::Connection(id), &spoof)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_detach_broadcasts_awareness_removal_and_peer_left() {
        let h = harness().await;
        let (a, _rx_a) = peer("alice");
        let (b, mut rx_b) = peer("bob");
        let id_a = a.connection_id;
        h.session.attach(a).await.unwrap();
        h.session.attach(b).await.unwrap();

        let cursor = AwarenessUpdate::single(
            "alice",
            1,
            Some(Presence::new("alice", "Alice").with_selection(TextSelection::caret(0))),
        )
        .encode()
        .unwrap();
        h.session
            .apply_awareness(Origin::Connection(id_a), &cursor)
            .await
            .unwrap();
        drain(&mut rx_b);

        assert_eq!(h.session.detach(id_a).await.unwrap(), Some(1));
        let frames = drain(&mut rx_b);

        let removal = frames
            .iter()
            .find_map(|f| match f {
                ServerMessage::Awareness { delta, .. } => Some(AwarenessUpdate::decode(delta).unwrap()),
                _ => None,
            })
            .expect("awareness removal");
        assert_eq!(removal.records[0].user_id, "alice");
        assert!(removal.records[0].presence.is_none());
        assert!(frames.contains(&ServerMessage::PeerLeft {
            document_id: "doc-1".into(),
            user_id: "alice".into()
        }));
        assert_eq!(h.session.awareness_len().await, 0);
        assert_eq!(h.session.detach(id_a).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_remote_update_is_not_persisted_or_republished() {
        let h = harness().await;
        let (a, mut rx_a) = peer("alice");
        h.session.attach(a).await.unwrap();
        drain(&mut rx_a);

        let msg = FanOutMessage {
            document_id: "doc-1".into(),
            kind: FanOutKind::Sync,
            delta: Replica::new().insert(0, "remote"),
            origin: OriginId {
                process: Uuid::new_v4(),
                connection: None,
            },
        };
        h.session.apply_remote(&msg).await;

        assert_eq!(h.session.text().await, "remote");
        assert_eq!(drain(&mut rx_a).len(), 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.hub.published(), 0);
        assert_eq!(h.store.write_count(), 1); // active-users only
    }

    #[tokio::test]
    async fn test_flush_writes_snapshot_once() {
        let h = harness().await;
        let (a, _rx) = peer("alice");
        let id = a.connection_id;
        h.session.attach(a).await.unwrap();
        h.session
            .apply_update(Origin::Connection(id), Replica::new().insert(0, "persist me"))
            .await
            .unwrap();

        assert!(h.session.flush().await.unwrap());
        assert!(!h.session.flush().await.unwrap());
        assert!(h.store.keys().contains(&"snapshot:doc-1".to_string()));
    }

    #[tokio::test]
    async fn test_failed_snapshot_keeps_session_dirty() {
        let h = harness().await;
        let (a, _rx) = peer("alice");
        let id = a.connection_id;
        h.session.attach(a).await.unwrap();
        h.session
            .apply_update(Origin::Connection(id), Replica::new().insert(0, "x"))
            .await
            .unwrap();

        h.store.set_unavailable(true);
        assert!(h.session.flush().await.is_err());
        assert!(h.session.is_dirty());
        h.store.set_unavailable(false);
        assert!(h.session.flush().await.unwrap());
    }

    #[tokio::test]
    async fn test_snapshot_after_failed_load_keeps_stored_content() {
        let store = Arc::new(MemoryStore::new());
        let gateway = PersistenceGateway::new(store.clone(), RetentionPolicy::default());
        let earlier = Replica::new();
        earlier.insert(0, "OLD CONTENT");
        gateway.snapshot("doc-1", earlier.encode_state(), 0).await.unwrap();

        store.set_unavailable(true);
        let h = harness_with(store.clone()).await;
        store.set_unavailable(false);
        assert_eq!(h.session.text().await, "");

        let (a, mut rx_a) = peer("alice");
        let id = a.connection_id;
        h.session.attach(a).await.unwrap();
        drain(&mut rx_a);
        let editor = Replica::new();
        h.session
            .apply_update(Origin::Connection(id), editor.insert(0, "new"))
            .await
            .unwrap();
        assert!(h.session.flush().await.unwrap());

        let persisted = gateway.load("doc-1").await.unwrap();
        let restored = Replica::from_state(&persisted.snapshot.unwrap()).unwrap();
        for delta in &persisted.deltas {
            restored.apply_update(delta).unwrap();
        }
        assert!(restored.text().contains("OLD CONTENT"), "{}", restored.text());
        assert!(restored.text().contains("new"));
        // The connection is brought up to date with what the store held.
        assert!(h.session.text().await.contains("OLD CONTENT"));
        assert!(drain(&mut rx_a)
            .iter()
            .any(|m| matches!(m, ServerMessage::Update { .. })));
    }

    #[tokio::test]
    async fn test_flush_skipped_while_store_unreadable() {
        let h = harness().await;
        let (a, _rx) = peer("alice");
        let id = a.connection_id;
        h.session.attach(a).await.unwrap();
        h.session
            .apply_update(Origin::Connection(id), Replica::new().insert(0, "x"))
            .await
            .unwrap();

        h.store.set_unavailable(true);
        assert!(h.session.flush().await.is_err());
        h.store.set_unavailable(false);
        assert!(!h.store.keys().contains(&"snapshot:doc-1".to_string()));
        assert!(h.session.is_dirty());
    }

    #[tokio::test]
    async fn test_resync_with_nothing_new_stays_quiet() {
        let h = harness().await;
        let (a, mut rx_a) = peer("alice");
        h.session.attach(a).await.unwrap();
        drain(&mut rx_a);

        h.session.resync_from_store().await.unwrap();
        assert!(drain(&mut rx_a).is_empty());
        assert!(!h.session.is_dirty());
    }

    #[tokio::test]
    async fn test_resync_skips_corrupt_entries_and_sends_the_rest() {
        let h = harness().await;
        let (a, mut rx_a) = peer("alice");
        h.session.attach(a).await.unwrap();
        drain(&mut rx_a);

        let gateway = PersistenceGateway::new(h.store.clone(), RetentionPolicy::default());
        gateway.append_update("doc-1", vec![0x03, 0xFF]).await.unwrap();
        gateway
            .append_update("doc-1", Replica::new().insert(0, "from elsewhere"))
            .await
            .unwrap();

        h.session.resync_from_store().await.unwrap();
        assert_eq!(h.session.text().await, "from elsewhere");
        let frames = drain(&mut rx_a);
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], ServerMessage::Update { .. }));
        assert!(h.session.is_dirty());
    }

    #[tokio::test]
    async fn test_awareness_accepted_after_reconnect() {
        let h = harness().await;
        let (b, mut rx_b) = peer("bob");
        h.session.attach(b).await.unwrap();
        let cursor = AwarenessUpdate::single("alice", 1, Some(Presence::new("alice", "Alice")))
            .encode()
            .unwrap();

        let (first, _rx) = peer("alice");
        let first_id = first.connection_id;
        h.session.attach(first).await.unwrap();
        h.session
            .apply_awareness(Origin::Connection(first_id), &cursor)
            .await
            .unwrap();
        h.session.detach(first_id).await.unwrap();
        drain(&mut rx_b);

        let (second, _rx) = peer("alice");
        let second_id = second.connection_id;
        h.session.attach(second).await.unwrap();
        drain(&mut rx_b);
        h.session
            .apply_awareness(Origin::Connection(second_id), &cursor)
            .await
            .unwrap();

        assert_eq!(h.session.awareness_len().await, 1);
        let frames = drain(&mut rx_b);
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], ServerMessage::Awareness { .. }));
    }

    #[tokio::test]
    async fn test_quick_attach_detach_leaves_no_active_user() {
        let h = harness().await;
        for _ in 0..20 {
            let (a, _rx) = peer("alice");
            let id = a.connection_id;
            h.session.attach(a).await.unwrap();
            h.session.detach(id).await.unwrap();
        }
        let (b, _rx) = peer("bob");
        h.session.attach(b).await.unwrap();

        h.session.outlets.writer.flush().await;
        assert_eq!(
            h.session.outlets.gateway.active_users("doc-1").await.unwrap(),
            vec!["bob"]
        );
    }

    #[tokio::test]
    async fn test_stale_remote_awareness_expires() {
        let h = harness().await;
        let (a, mut rx_a) = peer("alice");
        h.session.attach(a).await.unwrap();

        let remote = FanOutMessage {
            document_id: "doc-1".into(),
            kind: FanOutKind::Awareness,
            delta: AwarenessUpdate::single("carol", 1, Some(Presence::new("carol", "Carol")))
                .encode()
                .unwrap(),
            origin: OriginId {
                process: Uuid::new_v4(),
                connection: None,
            },
        };
        h.session.apply_remote(&remote).await;
        assert_eq!(h.session.awareness_len().await, 1);
        drain(&mut rx_a);

        let later = Instant::now() + Duration::from_secs(120);
        assert_eq!(
            h.session
                .expire_awareness(later, Duration::from_secs(60))
                .await
                .unwrap(),
            1
        );
        assert_eq!(h.session.awareness_len().await, 0);
        assert_eq!(drain(&mut rx_a).len(), 1);
    }

    #[tokio::test]
    async fn test_closed_session_rejects_attach() {
        let h = harness().await;
        assert!(h.session.close_if_idle(Instant::now(), Duration::ZERO).await);
        let (a, _rx) = peer("alice");
        assert!(matches!(h.session.attach(a).await, Err(SessionError::Closed)));
    }
}
