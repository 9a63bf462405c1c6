//! Fan-out of encoded frames to the connections attached to one document.
//!
//! Every peer owns a bounded outbox drained by its socket task. A frame is
//! encoded once and shared as `Arc<Vec<u8>>` across all outboxes.
//!
//! Backpressure policy: a peer whose outbox is full is *evicted* (its socket
//! is told to close) rather than silently skipped, because a skipped CRDT
//! delta would leave that editor permanently diverged. The client resyncs
//! from a full state on reconnect.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};

use crate::protocol::{ConnectionId, ProtocolError, ServerMessage};

/// Encoded frame, shared by every recipient.
pub type Outbound = Arc<Vec<u8>>;

/// One attached connection, as seen by a document.
#[derive(Debug, Clone)]
pub struct Peer {
    pub connection_id: ConnectionId,
    pub user_id: String,
    pub outbox: mpsc::Sender<Outbound>,
    /// Signalled when the document gives up on this connection.
    pub kill: Arc<Notify>,
}

impl Peer {
    /// Push a frame without waiting. Full or closed outboxes are errors.
    pub fn try_send(&self, frame: Outbound) -> Result<(), TrySendError<Outbound>> {
        self.outbox.try_send(frame)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub frames_delivered: u64,
    pub peers_evicted: u64,
    pub active_peers: usize,
}

/// Lock-free counters, readable without holding the session lock.
#[derive(Debug, Default)]
pub struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    frames_delivered: AtomicU64,
    peers_evicted: AtomicU64,
}

/// Connections attached to a single document.
///
/// Lives inside the document session's lock, so it needs no locking itself.
#[derive(Debug, Default)]
pub struct BroadcastGroup {
    peers: HashMap<ConnectionId, Peer>,
    stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_peer(&mut self, peer: Peer) -> Option<Peer> {
        self.peers.insert(peer.connection_id, peer)
    }

    pub fn remove_peer(&mut self, connection_id: &ConnectionId) -> Option<Peer> {
        self.peers.remove(connection_id)
    }

    pub fn get(&self, connection_id: &ConnectionId) -> Option<&Peer> {
        self.peers.get(connection_id)
    }

    pub fn has_peer(&self, connection_id: &ConnectionId) -> bool {
        self.peers.contains_key(connection_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    /// Encode `msg` once and deliver it to every peer except `except`.
    ///
    /// Returns the peers that were evicted because their outbox was full or
    /// already closed. Evicted peers have been removed from the group and, if
    /// still alive, signalled to close.
    pub fn broadcast(
        &mut self,
        msg: &ServerMessage,
        except: Option<ConnectionId>,
    ) -> Result<Vec<Peer>, ProtocolError> {
        let frame: Outbound = Arc::new(msg.encode()?);
        Ok(self.broadcast_raw(frame, except))
    }

    /// Deliver a pre-encoded frame to every peer except `except`.
    pub fn broadcast_raw(&mut self, frame: Outbound, except: Option<ConnectionId>) -> Vec<Peer> {
        let mut failed = Vec::new();
        let mut delivered = 0u64;

        for (id, peer) in &self.peers {
            if Some(*id) == except {
                continue;
            }
            match peer.try_send(Arc::clone(&frame)) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    log::warn!(
                        "outbox full for connection {id} ({}); disconnecting slow consumer",
                        peer.user_id
                    );
                    peer.kill.notify_one();
                    failed.push(*id);
                }
                Err(TrySendError::Closed(_)) => failed.push(*id),
            }
        }

        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.stats
            .frames_delivered
            .fetch_add(delivered, Ordering::Relaxed);
        self.evict(failed)
    }

    /// Deliver to a single peer. A failing peer is evicted.
    pub fn send_to(
        &mut self,
        connection_id: &ConnectionId,
        msg: &ServerMessage,
    ) -> Result<Option<Peer>, ProtocolError> {
        let Some(peer) = self.peers.get(connection_id) else {
            return Ok(None);
        };
        let frame = Arc::new(msg.encode()?);
        match peer.try_send(frame) {
            Ok(()) => {
                self.stats.frames_delivered.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            Err(e) => {
                if matches!(e, TrySendError::Full(_)) {
                    peer.kill.notify_one();
                }
                Ok(self.evict(vec![*connection_id]).pop())
            }
        }
    }

    fn evict(&mut self, ids: Vec<ConnectionId>) -> Vec<Peer> {
        let evicted: Vec<Peer> = ids
            .into_iter()
            .filter_map(|id| self.peers.remove(&id))
            .collect();
        self.stats
            .peers_evicted
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        evicted
    }

    pub fn stats_handle(&self) -> Arc<AtomicBroadcastStats> {
        Arc::clone(&self.stats)
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            frames_delivered: self.stats.frames_delivered.load(Ordering::Relaxed),
            peers_evicted: self.stats.peers_evicted.load(Ordering::Relaxed),
            active_peers: self.peers.len(),
        }
    }
}
