//! Buffered, non-blocking update writer.
//!
//! ```text
//! DocumentSession ──enqueue()──► [ mpsc queue ] ──► writer task
//!   (never waits)                                    │ drains up to
//!                                                    │ `max_batch` commands,
//!                                                    ▼ groups per document
//!                                           PersistenceGateway::append_updates
//! ```
//!
//! Append failures are logged and the batch is skipped; in-memory
//! convergence never waits on storage. Active-user changes ride the same
//! queue and are applied one by one in arrival order. `flush()` resolves
//! once every command enqueued before it has been processed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::gateway::PersistenceGateway;
use crate::protocol::DocumentId;

/// Writer configuration.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Commands drained per batch. Default: 256.
    pub max_batch: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self { max_batch: 256 }
    }
}

enum WriterCommand {
    Append { document_id: DocumentId, delta: Vec<u8> },
    ActiveUser {
        document_id: DocumentId,
        user_id: String,
        process: Uuid,
        present: bool,
    },
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Default)]
pub struct WriterStats {
    pub enqueued: AtomicU64,
    pub written: AtomicU64,
    pub failed: AtomicU64,
    pub batches: AtomicU64,
}

/// Handle to the writer task. Cheap to clone.
#[derive(Clone)]
pub struct UpdateWriter {
    tx: mpsc::UnboundedSender<WriterCommand>,
    stats: Arc<WriterStats>,
}

impl UpdateWriter {
    /// Spawn the writer task on the current runtime.
    pub fn spawn(gateway: PersistenceGateway, config: WriterConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(WriterStats::default());
        tokio::spawn(run(gateway, config, rx, Arc::clone(&stats)));
        Self { tx, stats }
    }

    /// Queue a delta for the document's log. Never blocks.
    pub fn enqueue(&self, document_id: &str, delta: Vec<u8>) {
        let cmd = WriterCommand::Append {
            document_id: document_id.to_string(),
            delta,
        };
        if self.tx.send(cmd).is_err() {
            log::error!("update writer stopped; dropping delta for {document_id}");
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// Queue an active-user change for `process`. Never blocks.
    pub fn record_active_user(&self, document_id: &str, user_id: String, process: Uuid, present: bool) {
        let cmd = WriterCommand::ActiveUser {
            document_id: document_id.to_string(),
            user_id,
            process,
            present,
        };
        if self.tx.send(cmd).is_err() {
            log::error!("update writer stopped; active users of {document_id} not updated");
        }
    }

    /// Wait until everything queued so far has been handed to the store.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(WriterCommand::Flush(ack_tx)).is_err() {
            return;
        }
        let _ = ack_rx.await;
    }

    pub fn stats(&self) -> &WriterStats {
        &self.stats
    }
}

async fn run(
    gateway: PersistenceGateway,
    config: WriterConfig,
    mut rx: mpsc::UnboundedReceiver<WriterCommand>,
    stats: Arc<WriterStats>,
) {
    let max_batch = config.max_batch.max(1);
    let mut batch = Vec::with_capacity(max_batch);

    while rx.recv_many(&mut batch, max_batch).await > 0 {
        stats.batches.fetch_add(1, Ordering::Relaxed);

        // Per-document append lists, in first-seen order.
        let mut pending: Vec<(DocumentId, Vec<Vec<u8>>)> = Vec::new();
        let mut index: HashMap<DocumentId, usize> = HashMap::new();

        for cmd in batch.drain(..) {
            match cmd {
                WriterCommand::Append { document_id, delta } => {
                    match index.get(&document_id) {
                        Some(&i) => pending[i].1.push(delta),
                        None => {
                            index.insert(document_id.clone(), pending.len());
                            pending.push((document_id, vec![delta]));
                        }
                    }
                }
                WriterCommand::ActiveUser {
                    document_id,
                    user_id,
                    process,
                    present,
                } => {
                    let result = if present {
                        gateway.add_active_user(&document_id, &user_id, process).await
                    } else {
                        gateway.remove_active_user(&document_id, &user_id, process).await
                    };
                    if let Err(e) = result {
                        log::error!("failed to update active users of {document_id}: {e}");
                    }
                }
                WriterCommand::Flush(ack) => {
                    write_pending(&gateway, &stats, std::mem::take(&mut pending)).await;
                    index.clear();
                    let _ = ack.send(());
                }
            }
        }
        write_pending(&gateway, &stats, pending).await;
    }

    log::debug!("update writer stopped");
}

async fn write_pending(
    gateway: &PersistenceGateway,
    stats: &WriterStats,
    pending: Vec<(DocumentId, Vec<Vec<u8>>)>,
) {
    for (document_id, deltas) in pending {
        let count = deltas.len() as u64;
        match gateway.append_updates(&document_id, deltas).await {
            Ok(_) => {
                stats.written.fetch_add(count, Ordering::Relaxed);
            }
            Err(e) => {
                stats.failed.fetch_add(count, Ordering::Relaxed);
                log::error!("failed to append {count} deltas for {document_id}: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{MemoryStore, RetentionPolicy};

    fn writer() -> (Arc<MemoryStore>, PersistenceGateway, UpdateWriter) {
        let store = Arc::new(MemoryStore::new());
        let gateway = PersistenceGateway::new(store.clone(), RetentionPolicy::default());
        let writer = UpdateWriter::spawn(gateway.clone(), WriterConfig::default());
        (store, gateway, writer)
    }

    #[tokio::test]
    async fn test_enqueue_and_flush_preserves_order() {
        let (_, gateway, writer) = writer();
        for i in 0..100u8 {
            writer.enqueue("doc-1", vec![i]);
            if i % 3 == 0 {
                writer.enqueue("doc-2", vec![i]);
            }
        }
        writer.flush().await;

        let doc1 = gateway.load("doc-1").await.unwrap();
        let expected: Vec<Vec<u8>> = (0..100u8).map(|i| vec![i]).collect();
        assert_eq!(doc1.deltas, expected);
        assert_eq!(gateway.load("doc-2").await.unwrap().deltas.len(), 34);
        assert_eq!(writer.stats().written.load(Ordering::Relaxed), 134);
    }

    #[tokio::test]
    async fn test_failed_append_is_skipped() {
        let (store, gateway, writer) = writer();
        store.set_unavailable(true);
        writer.enqueue("doc", vec![1]);
        writer.flush().await;
        assert_eq!(writer.stats().failed.load(Ordering::Relaxed), 1);

        store.set_unavailable(false);
        writer.enqueue("doc", vec![2]);
        writer.flush().await;
        assert_eq!(gateway.load("doc").await.unwrap().deltas, vec![vec![2]]);
    }

    #[tokio::test]
    async fn test_active_user_changes_apply_in_order() {
        let (_, gateway, writer) = writer();
        let process = Uuid::new_v4();
        for _ in 0..50 {
            writer.record_active_user("doc", "alice".into(), process, true);
            writer.record_active_user("doc", "alice".into(), process, false);
        }
        writer.record_active_user("doc", "bob".into(), process, true);
        writer.flush().await;
        assert_eq!(gateway.active_users("doc").await.unwrap(), vec!["bob"]);
    }

    #[tokio::test]
    async fn test_flush_on_idle_writer_returns() {
        let (_, _, writer) = writer();
        writer.flush().await;
        assert_eq!(writer.stats().enqueued.load(Ordering::Relaxed), 0);
    }
}
