//! Open documents of this process.
//!
//! The registry is an ordinary object: construct one per server (or per test)
//! and tear it down with [`SessionRegistry::shutdown`].
//!
//! ```text
//! get_or_create("doc-1")
//!   ├─ allocate DocumentSession, take its lock  (callers queue here)
//!   ├─ insert into map
//!   └─ spawn: bridge.attach_document ─► session.load ─► release lock
//!
//! maintenance (every tick)
//!   ├─ snapshot_tick   flush dirty sessions
//!   ├─ expire stale remote awareness
//!   └─ sweep_idle      close ─► unmap ─► final flush ─► unsubscribe
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::bridge::FanOutBridge;
use crate::broadcast::Peer;
use crate::config::SessionConfig;
use crate::persistence::{PersistenceGateway, UpdateWriter};
use crate::protocol::{ConnectionId, DocumentId};
use crate::session::{DocumentSession, SessionError, SessionOutlets};

/// Attempts to join a document that keeps getting evicted under our feet.
const JOIN_ATTEMPTS: usize = 3;

#[derive(Debug, Default)]
pub struct RegistryStats {
    pub created: AtomicU64,
    pub evicted: AtomicU64,
    pub load_failures: AtomicU64,
    pub snapshots: AtomicU64,
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<DocumentId, Arc<DocumentSession>>>,
    outlets: SessionOutlets,
    config: SessionConfig,
    stats: Arc<RegistryStats>,
}

impl SessionRegistry {
    /// Build a registry and spawn its update writer.
    pub fn new(
        gateway: PersistenceGateway,
        bridge: Arc<FanOutBridge>,
        config: SessionConfig,
    ) -> Arc<Self> {
        let writer = UpdateWriter::spawn(gateway.clone(), config.writer.clone());
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            outlets: SessionOutlets {
                gateway,
                writer,
                bridge,
            },
            config,
            stats: Arc::new(RegistryStats::default()),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn stats(&self) -> &RegistryStats {
        &self.stats
    }

    pub fn gateway(&self) -> &PersistenceGateway {
        &self.outlets.gateway
    }

    pub fn bridge(&self) -> &Arc<FanOutBridge> {
        &self.outlets.bridge
    }

    pub fn writer(&self) -> &UpdateWriter {
        &self.outlets.writer
    }

    /// Existing session for `document_id`, if open.
    pub async fn get(&self, document_id: &str) -> Option<Arc<DocumentSession>> {
        self.sessions.read().await.get(document_id).cloned()
    }

    /// Return the session for `document_id`, creating it if needed.
    ///
    /// A new session is returned immediately while its persisted state loads
    /// in the background; the load holds the session lock, so every
    /// operation on it waits until the replica is complete.
    pub async fn get_or_create(&self, document_id: &str) -> Arc<DocumentSession> {
        if let Some(session) = self.sessions.read().await.get(document_id) {
            return Arc::clone(session);
        }

        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(document_id) {
            return Arc::clone(session);
        }

        let session = DocumentSession::new(document_id, self.outlets.clone());
        let guard = session.lock_for_load();
        sessions.insert(document_id.to_string(), Arc::clone(&session));
        drop(sessions);

        self.stats.created.fetch_add(1, Ordering::Relaxed);
        log::info!("opened session for {document_id}");

        let Some(guard) = guard else {
            log::error!("session for {document_id} was locked before its load started");
            return session;
        };

        let bridge = Arc::clone(&self.outlets.bridge);
        let stats = Arc::clone(&self.stats);
        let timeout = self.config.load_timeout;
        let weak = Arc::downgrade(&session);
        let doc = document_id.to_string();
        tokio::spawn(async move {
            // Subscribe before loading so nothing published in between is lost.
            let subscription = bridge.attach_document(&doc, weak.clone()).await;
            let Some(session) = weak.upgrade() else {
                subscription.abort();
                return;
            };
            session.set_subscription(subscription);
            if !session.load(guard, timeout).await {
                stats.load_failures.fetch_add(1, Ordering::Relaxed);
            }
        });

        session
    }

    /// Attach `peer` to `document_id`, opening the document if needed.
    pub async fn join(
        &self,
        document_id: &str,
        peer: Peer,
    ) -> Result<Arc<DocumentSession>, SessionError> {
        for _ in 0..JOIN_ATTEMPTS {
            let session = self.get_or_create(document_id).await;
            match session.attach(peer.clone()).await {
                Ok(()) => return Ok(session),
                Err(SessionError::Closed) => {
                    // Evicted between lookup and attach.
                    self.unmap(&session).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(SessionError::Closed)
    }

    /// Detach `connection_id` from `session`. When the last connection
    /// leaves, a snapshot is scheduled right away.
    pub async fn leave(
        &self,
        session: &Arc<DocumentSession>,
        connection_id: ConnectionId,
    ) -> Result<Option<usize>, SessionError> {
        let remaining = session.detach(connection_id).await?;
        if remaining == Some(0) {
            let session = Arc::clone(session);
            tokio::spawn(async move {
                if let Err(e) = session.flush().await {
                    log::error!(
                        "flush of {} after last leave failed: {e}",
                        session.document_id()
                    );
                }
            });
        }
        Ok(remaining)
    }

    fn all(sessions: &HashMap<DocumentId, Arc<DocumentSession>>) -> Vec<Arc<DocumentSession>> {
        sessions.values().cloned().collect()
    }

    /// Snapshot every session changed since its last snapshot. Returns how
    /// many snapshots were written; failures stay dirty for the next tick.
    pub async fn snapshot_tick(&self) -> usize {
        let sessions = Self::all(&*self.sessions.read().await);
        let mut written = 0;
        for session in sessions.into_iter().filter(|s| s.is_dirty()) {
            match session.flush().await {
                Ok(true) => {
                    written += 1;
                    log::debug!("snapshot written for {}", session.document_id());
                }
                Ok(false) => {}
                Err(e) => log::warn!(
                    "snapshot of {} deferred to next tick: {e}",
                    session.document_id()
                ),
            }
        }
        self.stats
            .snapshots
            .fetch_add(written as u64, Ordering::Relaxed);
        written
    }

    /// Remove awareness entries from other processes that went silent.
    pub async fn expire_awareness(&self, now: Instant, timeout: Duration) -> usize {
        let sessions = Self::all(&*self.sessions.read().await);
        let mut expired = 0;
        for session in sessions {
            match session.expire_awareness(now, timeout).await {
                Ok(n) => expired += n,
                Err(e) => log::warn!(
                    "awareness expiry for {} failed: {e}",
                    session.document_id()
                ),
            }
        }
        expired
    }

    /// Evict every session that has had no connections for the inactivity
    /// threshold. Each one gets a final flush before it is dropped.
    pub async fn sweep_idle(&self, now: Instant) -> usize {
        let threshold = self.config.idle_threshold;
        let sessions = Self::all(&*self.sessions.read().await);
        let mut evicted = 0;
        for session in sessions {
            if session.connection_count() > 0 {
                continue;
            }
            // Re-checked under the session lock; a join may have raced us.
            if !session.close_if_idle(now, threshold).await {
                continue;
            }
            self.unmap(&session).await;
            if let Err(e) = session.flush().await {
                log::error!(
                    "final flush of {} failed; unsaved changes since the last snapshot are lost from memory: {e}",
                    session.document_id()
                );
            }
            self.outlets
                .bridge
                .detach_document(session.document_id())
                .await;
            self.stats.evicted.fetch_add(1, Ordering::Relaxed);
            log::info!("evicted idle session {}", session.document_id());
            evicted += 1;
        }
        evicted
    }

    async fn unmap(&self, session: &Arc<DocumentSession>) {
        let mut sessions = self.sessions.write().await;
        if sessions
            .get(session.document_id())
            .is_some_and(|current| Arc::ptr_eq(current, session))
        {
            sessions.remove(session.document_id());
        }
    }

    /// Spawn the periodic snapshot, awareness expiry and idle sweep loops.
    ///
    /// The task holds only a weak reference and stops once the registry is
    /// dropped.
    pub fn spawn_maintenance(self: &Arc<Self>, awareness_timeout: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut snapshot = tokio::time::interval(self.config.snapshot_interval);
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        let mut expiry = tokio::time::interval(awareness_timeout.max(Duration::from_millis(10)));
        snapshot.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        expiry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = snapshot.tick() => {
                        let Some(registry) = weak.upgrade() else { break };
                        registry.snapshot_tick().await;
                    }
                    _ = expiry.tick() => {
                        let Some(registry) = weak.upgrade() else { break };
                        registry.expire_awareness(Instant::now(), awareness_timeout).await;
                    }
                    _ = sweep.tick() => {
                        let Some(registry) = weak.upgrade() else { break };
                        let evicted = registry.sweep_idle(Instant::now()).await;
                        if let Err(e) = registry.outlets.gateway.purge_expired().await {
                            log::warn!("purging expired keys failed: {e}");
                        }
                        if evicted > 0 {
                            log::info!(
                                "idle sweep evicted {evicted} sessions, {} open",
                                registry.session_count().await
                            );
                        }
                    }
                }
            }
            log::debug!("registry maintenance stopped");
        })
    }

    /// Flush every open session. Called once at shutdown.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<DocumentSession>> =
            self.sessions.write().await.drain().map(|(_, s)| s).collect();
        log::info!("shutting down registry with {} open sessions", sessions.len());
        for session in &sessions {
            if let Err(e) = session.flush().await {
                log::error!("shutdown flush of {} failed: {e}", session.document_id());
            }
            self.outlets
                .bridge
                .detach_document(session.document_id())
                .await;
        }
        self.outlets.writer.flush().await;
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Distinct connections attached to at least one open document.
    pub async fn connection_count(&self) -> usize {
        let sessions = Self::all(&*self.sessions.read().await);
        let mut connections = HashSet::new();
        for session in sessions {
            connections.extend(session.connection_ids().await);
        }
        connections.len()
    }
}
