//! Key/value store served by the relay hub and shared by every server
//! process.
//!
//! ```text
//!  folio-server A ──┐                          ┌───────────────────────┐
//!   RemoteStore     │  Store { request, op }   │ RelayServer           │
//!                   ├────────────────────────► │   execute(op)         │
//!  folio-server B ──┘ ◄──────────────────────  │    └─ RocksStore or   │
//!   RemoteStore       StoreReply { request }   │       MemoryStore     │
//!                                              └───────────────────────┘
//! ```
//!
//! The [`KeyValueStore`] trait is synchronous, so each call sends one request
//! and parks its thread until the reply arrives or the request times out.
//! Calls come through [`PersistenceGateway`](super::PersistenceGateway),
//! which runs them on the blocking pool. While the relay is unreachable
//! every call fails with [`StoreError::Unavailable`] and the socket is
//! re-dialed with backoff.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use super::store::{KeyValueStore, StoreError};
use crate::bridge::BridgeConfig;
use crate::relay::{reconnect, RelayFrame, RelayStream};

/// Default bound on one request's round trip.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// One [`KeyValueStore`] call, as sent to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoreOp {
    Append { key: String, value: Vec<u8>, ttl: Duration },
    Range { key: String },
    Trim { key: String, up_to: u64 },
    LastSeq { key: String },
    Get { key: String },
    Set { key: String, value: Vec<u8>, ttl: Duration },
    CompareAndSet {
        key: String,
        expected: Option<Vec<u8>>,
        value: Vec<u8>,
        ttl: Duration,
    },
    AddMember { key: String, member: String, ttl: Duration },
    RemoveMember { key: String, member: String },
    Members { key: String },
    Delete { key: String },
    PurgeExpired { now: SystemTime },
}

/// Successful result of a [`StoreOp`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoreValue {
    Done,
    Seq(u64),
    LastSeq(Option<u64>),
    Entries(Vec<(u64, Vec<u8>)>),
    Blob(Option<Vec<u8>>),
    Swapped(bool),
    Members(Vec<String>),
    Count(u64),
}

/// Run `op` against a local store. This is the relay's side of a request.
pub fn execute(store: &dyn KeyValueStore, op: StoreOp) -> Result<StoreValue, StoreError> {
    Ok(match op {
        StoreOp::Append { key, value, ttl } => StoreValue::Seq(store.append(&key, &value, ttl)?),
        StoreOp::Range { key } => StoreValue::Entries(store.range(&key)?),
        StoreOp::Trim { key, up_to } => StoreValue::Count(store.trim(&key, up_to)?),
        StoreOp::LastSeq { key } => StoreValue::LastSeq(store.last_seq(&key)?),
        StoreOp::Get { key } => StoreValue::Blob(store.get(&key)?),
        StoreOp::Set { key, value, ttl } => {
            store.set(&key, &value, ttl)?;
            StoreValue::Done
        }
        StoreOp::CompareAndSet {
            key,
            expected,
            value,
            ttl,
        } => StoreValue::Swapped(store.compare_and_set(&key, expected.as_deref(), &value, ttl)?),
        StoreOp::AddMember { key, member, ttl } => {
            store.add_member(&key, &member, ttl)?;
            StoreValue::Done
        }
        StoreOp::RemoveMember { key, member } => {
            store.remove_member(&key, &member)?;
            StoreValue::Done
        }
        StoreOp::Members { key } => StoreValue::Members(store.members(&key)?),
        StoreOp::Delete { key } => {
            store.delete(&key)?;
            StoreValue::Done
        }
        StoreOp::PurgeExpired { now } => StoreValue::Count(store.purge_expired(now)?),
    })
}

type Reply = Result<StoreValue, StoreError>;

/// Requests waiting for their reply.
#[derive(Default)]
struct Pending {
    waiting: Mutex<HashMap<u64, SyncSender<Reply>>>,
    connected: AtomicBool,
}

impl Pending {
    fn insert(&self, request: u64, tx: SyncSender<Reply>) -> Result<(), StoreError> {
        self.waiting
            .lock()
            .map_err(|_| StoreError::Database("remote store state poisoned".into()))?
            .insert(request, tx);
        Ok(())
    }

    fn take(&self, request: u64) -> Option<SyncSender<Reply>> {
        self.waiting.lock().ok()?.remove(&request)
    }

    fn deliver(&self, data: &[u8]) {
        match RelayFrame::decode(data) {
            Ok(RelayFrame::StoreReply { request, result }) => match self.take(request) {
                Some(tx) => {
                    let _ = tx.try_send(result);
                }
                None => log::debug!("late reply to store request {request}"),
            },
            Ok(_) => log::warn!("unexpected frame on store connection"),
            Err(e) => log::warn!("bad frame from store relay: {e}"),
        }
    }

    /// Fail every waiting request.
    fn fail_all(&self) {
        let waiting: Vec<SyncSender<Reply>> = match self.waiting.lock() {
            Ok(mut waiting) => waiting.drain().map(|(_, tx)| tx).collect(),
            Err(_) => return,
        };
        for tx in waiting {
            let _ = tx.try_send(Err(StoreError::Unavailable));
        }
    }
}

/// [`KeyValueStore`] client for a store hosted by a relay hub.
pub struct RemoteStore {
    url: String,
    pending: Arc<Pending>,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    next_request: AtomicU64,
    request_timeout: Duration,
}

impl RemoteStore {
    /// Connect to the relay at `url`. The first connection must succeed;
    /// later disconnects are retried with the bridge backoff settings.
    pub async fn connect(url: &str, config: BridgeConfig) -> Result<Arc<Self>, StoreError> {
        let (stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| StoreError::Database(format!("store relay {url}: {e}")))?;
        log::info!("connected to shared store at {url}");

        let pending = Arc::new(Pending::default());
        pending.connected.store(true, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(drive(url.to_string(), Arc::clone(&pending), rx, stream, config));
        Ok(Arc::new(Self {
            url: url.to_string(),
            pending,
            outgoing: tx,
            next_request: AtomicU64::new(1),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_connected(&self) -> bool {
        self.pending.connected.load(Ordering::SeqCst)
    }

    fn call(&self, op: StoreOp) -> Result<StoreValue, StoreError> {
        if !self.is_connected() {
            return Err(StoreError::Unavailable);
        }
        let request = self.next_request.fetch_add(1, Ordering::Relaxed);
        let frame = RelayFrame::Store { request, op }
            .encode()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let (tx, rx) = sync_channel(1);
        self.pending.insert(request, tx)?;
        // A disconnect between the check above and the insert would leave
        // the request waiting for the full timeout.
        if !self.is_connected() || self.outgoing.send(frame).is_err() {
            self.pending.take(request);
            return Err(StoreError::Unavailable);
        }

        match rx.recv_timeout(self.request_timeout) {
            Ok(reply) => reply,
            Err(_) => {
                self.pending.take(request);
                log::warn!(
                    "store request {request} to {} timed out after {:?}",
                    self.url,
                    self.request_timeout
                );
                Err(StoreError::Unavailable)
            }
        }
    }
}

fn unexpected(op: &str) -> StoreError {
    StoreError::Deserialization(format!("unexpected reply to {op}"))
}

impl KeyValueStore for RemoteStore {
    fn append(&self, key: &str, value: &[u8], ttl: Duration) -> Result<u64, StoreError> {
        let op = StoreOp::Append {
            key: key.to_string(),
            value: value.to_vec(),
            ttl,
        };
        match self.call(op)? {
            StoreValue::Seq(seq) => Ok(seq),
            _ => Err(unexpected("append")),
        }
    }

    fn range(&self, key: &str) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        match self.call(StoreOp::Range { key: key.to_string() })? {
            StoreValue::Entries(entries) => Ok(entries),
            _ => Err(unexpected("range")),
        }
    }

    fn trim(&self, key: &str, up_to: u64) -> Result<u64, StoreError> {
        let op = StoreOp::Trim {
            key: key.to_string(),
            up_to,
        };
        match self.call(op)? {
            StoreValue::Count(count) => Ok(count),
            _ => Err(unexpected("trim")),
        }
    }

    fn last_seq(&self, key: &str) -> Result<Option<u64>, StoreError> {
        match self.call(StoreOp::LastSeq { key: key.to_string() })? {
            StoreValue::LastSeq(seq) => Ok(seq),
            _ => Err(unexpected("last_seq")),
        }
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match self.call(StoreOp::Get { key: key.to_string() })? {
            StoreValue::Blob(blob) => Ok(blob),
            _ => Err(unexpected("get")),
        }
    }

    fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        let op = StoreOp::Set {
            key: key.to_string(),
            value: value.to_vec(),
            ttl,
        };
        match self.call(op)? {
            StoreValue::Done => Ok(()),
            _ => Err(unexpected("set")),
        }
    }

    fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let op = StoreOp::CompareAndSet {
            key: key.to_string(),
            expected: expected.map(<[u8]>::to_vec),
            value: value.to_vec(),
            ttl,
        };
        match self.call(op)? {
            StoreValue::Swapped(swapped) => Ok(swapped),
            _ => Err(unexpected("compare_and_set")),
        }
    }

    fn add_member(&self, key: &str, member: &str, ttl: Duration) -> Result<(), StoreError> {
        let op = StoreOp::AddMember {
            key: key.to_string(),
            member: member.to_string(),
            ttl,
        };
        match self.call(op)? {
            StoreValue::Done => Ok(()),
            _ => Err(unexpected("add_member")),
        }
    }

    fn remove_member(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let op = StoreOp::RemoveMember {
            key: key.to_string(),
            member: member.to_string(),
        };
        match self.call(op)? {
            StoreValue::Done => Ok(()),
            _ => Err(unexpected("remove_member")),
        }
    }

    fn members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        match self.call(StoreOp::Members { key: key.to_string() })? {
            StoreValue::Members(members) => Ok(members),
            _ => Err(unexpected("members")),
        }
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        match self.call(StoreOp::Delete { key: key.to_string() })? {
            StoreValue::Done => Ok(()),
            _ => Err(unexpected("delete")),
        }
    }

    fn purge_expired(&self, now: SystemTime) -> Result<u64, StoreError> {
        match self.call(StoreOp::PurgeExpired { now })? {
            StoreValue::Count(count) => Ok(count),
            _ => Err(unexpected("purge_expired")),
        }
    }
}

/// Owns the store socket: sends requests, routes replies to their callers
/// and reconnects with backoff. Stops once the [`RemoteStore`] is dropped.
async fn drive(
    url: String,
    pending: Arc<Pending>,
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
        pending.connected.store(true, Ordering::SeqCst);

        let (mut sink, mut source) = ws.split();
        let shutdown = loop {
            tokio::select! {
                frame = outgoing.recv() => {
                    let Some(bytes) = frame else { break true };
                    if let Err(e) = sink.send(Message::Binary(bytes.into())).await {
                        log::warn!("store relay {url} send failed: {e}");
                        break false;
                    }
                }
                incoming = source.next() => {
                    match incoming {
                        Some(Ok(Message::Binary(data))) => pending.deliver(&data),
                        Some(Ok(Message::Ping(data))) => {
                            if sink.send(Message::Pong(data)).await.is_err() {
                                break false;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break false,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::warn!("store relay {url} read failed: {e}");
                            break false;
                        }
                    }
                }
            }
        };

        pending.connected.store(false, Ordering::SeqCst);
        pending.fail_all();
        if shutdown {
            let _ = sink.close().await;
            break;
        }
        log::warn!("lost shared store {url}; requests fail until it is back");
    }
    log::debug!("store client for {url} stopped");
}
