//! Document-level persistence on top of a [`KeyValueStore`].
//!
//! ```text
//! update-log:{id}    append-only deltas, each tagged with a sequence
//! snapshot:{id}      SnapshotRecord { state, covered_seq }
//! active-users:{id}  user@process for each user attached through a process
//! ```
//!
//! A snapshot write never replaces what is stored: the new state is merged
//! with the stored one and swapped in with compare-and-set, retrying when
//! another process got there first. So every stored snapshot contains every
//! log entry up to its `covered_seq`, whichever process wrote it. Writing
//! snapshot N trims the log up to snapshot N-1's `covered_seq`, so a crash
//! between the snapshot write and the trim never loses a delta. Loads replay
//! the remaining log over the snapshot; deltas the snapshot already contains
//! are absorbed by CRDT idempotence.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use uuid::Uuid;

use super::store::{KeyValueStore, RetentionPolicy, StoreError};
use crate::replica::Replica;

/// Compare-and-set rounds before a snapshot write gives up until next tick.
const SNAPSHOT_ATTEMPTS: usize = 8;

pub fn update_log_key(document_id: &str) -> String {
    format!("update-log:{document_id}")
}

pub fn snapshot_key(document_id: &str) -> String {
    format!("snapshot:{document_id}")
}

pub fn active_users_key(document_id: &str) -> String {
    format!("active-users:{document_id}")
}

/// Stored snapshot blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Full replica state.
    pub state: Vec<u8>,
    /// Every log entry up to this sequence is contained in `state`.
    pub covered_seq: u64,
}

impl SnapshotRecord {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(record)
    }
}

/// What `load` found for a document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistedState {
    pub snapshot: Option<Vec<u8>>,
    /// Log entries still present, in append order.
    pub deltas: Vec<Vec<u8>>,
    pub covered_seq: u64,
    /// Highest sequence this load saw, in the snapshot or the log. A replica
    /// that merged the whole load contains every entry up to it.
    pub last_seq: u64,
}

impl PersistedState {
    pub fn is_empty(&self) -> bool {
        self.snapshot.is_none() && self.deltas.is_empty()
    }
}

/// Gateway statistics.
#[derive(Debug, Default)]
pub struct GatewayStats {
    pub appends: AtomicU64,
    pub append_failures: AtomicU64,
    pub snapshots: AtomicU64,
    pub snapshot_failures: AtomicU64,
    pub loads: AtomicU64,
    pub trimmed: AtomicU64,
}

/// Async facade over a blocking store. Cheap to clone.
#[derive(Clone)]
pub struct PersistenceGateway {
    store: Arc<dyn KeyValueStore>,
    retention: RetentionPolicy,
    stats: Arc<GatewayStats>,
}

impl PersistenceGateway {
    pub fn new(store: Arc<dyn KeyValueStore>, retention: RetentionPolicy) -> Self {
        Self {
            store,
            retention,
            stats: Arc::new(GatewayStats::default()),
        }
    }

    pub fn stats(&self) -> &GatewayStats {
        &self.stats
    }

    pub fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn KeyValueStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// Append one delta to the document's log, renewing its expiry.
    pub async fn append_update(&self, document_id: &str, delta: Vec<u8>) -> Result<u64, StoreError> {
        let batch = vec![delta];
        let seqs = self.append_updates(document_id, batch).await?;
        Ok(seqs.last().copied().unwrap_or(0))
    }

    /// Append several deltas in order with one trip to the blocking pool.
    pub async fn append_updates(
        &self,
        document_id: &str,
        deltas: Vec<Vec<u8>>,
    ) -> Result<Vec<u64>, StoreError> {
        let key = update_log_key(document_id);
        let ttl = self.retention.ttl;
        let count = deltas.len() as u64;
        let result = self
            .blocking(move |store| {
                deltas
                    .iter()
                    .map(|delta| store.append(&key, delta, ttl))
                    .collect::<Result<Vec<u64>, StoreError>>()
            })
            .await;
        match &result {
            Ok(_) => {
                self.stats.appends.fetch_add(count, Ordering::Relaxed);
            }
            Err(_) => {
                self.stats.append_failures.fetch_add(count, Ordering::Relaxed);
            }
        }
        result
    }

    /// Merge `state` into the stored snapshot and trim the log behind the
    /// previous one.
    ///
    /// `merged_seq` is the highest log sequence whose entries, and every
    /// one before it, `state` is known to contain (`0` when unknown). The
    /// written record covers the larger of that and the stored record's
    /// sequence. Returns the sequence the new snapshot covers.
    pub async fn snapshot(
        &self,
        document_id: &str,
        state: Vec<u8>,
        merged_seq: u64,
    ) -> Result<u64, StoreError> {
        let log_key = update_log_key(document_id);
        let snap_key = snapshot_key(document_id);
        let ttl = self.retention.ttl;

        let result = self
            .blocking(move |store| {
                for _ in 0..SNAPSHOT_ATTEMPTS {
                    let stored = store.get(&snap_key)?;
                    let previous = match stored.as_deref().map(SnapshotRecord::decode) {
                        Some(Ok(record)) => Some(record),
                        Some(Err(e)) => {
                            log::error!("replacing undecodable {snap_key}: {e}");
                            None
                        }
                        None => None,
                    };
                    let record = match &previous {
                        Some(prev) => SnapshotRecord {
                            state: merge_states(&prev.state, &state)?,
                            covered_seq: prev.covered_seq.max(merged_seq),
                        },
                        None => SnapshotRecord {
                            state: state.clone(),
                            covered_seq: merged_seq,
                        },
                    };
                    if !store.compare_and_set(&snap_key, stored.as_deref(), &record.encode()?, ttl)? {
                        log::debug!("{snap_key} changed while merging; retrying");
                        continue;
                    }

                    // The new record contains the previous one, so everything
                    // the previous one covered may go.
                    let trimmed = match previous {
                        Some(prev) if prev.covered_seq > 0 => store.trim(&log_key, prev.covered_seq)?,
                        _ => 0,
                    };
                    return Ok((record.covered_seq, trimmed));
                }
                Err(StoreError::Database(format!(
                    "{snap_key} kept changing during {SNAPSHOT_ATTEMPTS} merge attempts"
                )))
            })
            .await;

        match result {
            Ok((covered_seq, trimmed)) => {
                self.stats.snapshots.fetch_add(1, Ordering::Relaxed);
                self.stats.trimmed.fetch_add(trimmed, Ordering::Relaxed);
                log::debug!(
                    "snapshot written for {document_id} (covers seq {covered_seq}, trimmed {trimmed})"
                );
                Ok(covered_seq)
            }
            Err(e) => {
                self.stats.snapshot_failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Everything persisted for a document.
    pub async fn load(&self, document_id: &str) -> Result<PersistedState, StoreError> {
        let log_key = update_log_key(document_id);
        let snap_key = snapshot_key(document_id);

        let state = self
            .blocking(move |store| {
                let (snapshot, covered_seq) = match store.get(&snap_key)? {
                    Some(bytes) => {
                        let record = SnapshotRecord::decode(&bytes)?;
                        (Some(record.state), record.covered_seq)
                    }
                    None => (None, 0),
                };
                let entries = store.range(&log_key)?;
                let last_seq = entries
                    .last()
                    .map_or(covered_seq, |(seq, _)| (*seq).max(covered_seq));
                Ok(PersistedState {
                    snapshot,
                    deltas: entries.into_iter().map(|(_, delta)| delta).collect(),
                    covered_seq,
                    last_seq,
                })
            })
            .await?;

        self.stats.loads.fetch_add(1, Ordering::Relaxed);
        Ok(state)
    }

    /// Mark `user_id` present through `process`. Each process holds its own
    /// entry, so one process leaving does not hide a user still attached
    /// through another.
    pub async fn add_active_user(
        &self,
        document_id: &str,
        user_id: &str,
        process: Uuid,
    ) -> Result<(), StoreError> {
        let key = active_users_key(document_id);
        let member = active_member(user_id, process);
        let ttl = self.retention.ttl;
        self.blocking(move |store| store.add_member(&key, &member, ttl))
            .await
    }

    pub async fn remove_active_user(
        &self,
        document_id: &str,
        user_id: &str,
        process: Uuid,
    ) -> Result<(), StoreError> {
        let key = active_users_key(document_id);
        let member = active_member(user_id, process);
        self.blocking(move |store| store.remove_member(&key, &member))
            .await
    }

    /// Users attached to the document through any process, sorted.
    pub async fn active_users(&self, document_id: &str) -> Result<Vec<String>, StoreError> {
        let key = active_users_key(document_id);
        let members = self.blocking(move |store| store.members(&key)).await?;
        let mut users: Vec<String> = members
            .into_iter()
            .map(|member| match member.rsplit_once('@') {
                Some((user, _)) => user.to_string(),
                None => member,
            })
            .collect();
        users.sort();
        users.dedup();
        Ok(users)
    }

    /// Drop expired keys.
    pub async fn purge_expired(&self) -> Result<u64, StoreError> {
        self.blocking(|store| store.purge_expired(SystemTime::now()))
            .await
    }
}

/// `user@process`; process ids never contain `@`.
fn active_member(user_id: &str, process: Uuid) -> String {
    format!("{user_id}@{process}")
}

/// CRDT union of two full states.
fn merge_states(stored: &[u8], ours: &[u8]) -> Result<Vec<u8>, StoreError> {
    let replica =
        Replica::from_state(stored).map_err(|e| StoreError::Deserialization(e.to_string()))?;
    replica
        .apply_update(ours)
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(replica.encode_state())
}
