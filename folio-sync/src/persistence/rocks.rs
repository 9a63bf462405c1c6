//! RocksDB-backed key/value store.
//!
//! Column families:
//! - `logs`: log entries, key `<name>\0<seq:8 bytes BE>`, LZ4 values
//! - `blobs`: single values, key `<name>`, LZ4 values
//! - `members`: set members, key `<name>\0<member>`, empty values
//! - `expiry`: key `<name>`, value expiry secs (8 bytes BE)
//!
//! Names never contain NUL (document ids reject control characters), so the
//! `\0` separator keeps one name's entries contiguous and prefix-scannable.
//! Sequence numbers are store-wide and recovered at open from the highest
//! surviving log entry.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use super::store::{unix_secs, KeyValueStore, StoreError};

const CF_LOGS: &str = "logs";
const CF_BLOBS: &str = "blobs";
const CF_MEMBERS: &str = "members";
const CF_EXPIRY: &str = "expiry";

const COLUMN_FAMILIES: &[&str] = &[CF_LOGS, CF_BLOBS, CF_MEMBERS, CF_EXPIRY];

const SEPARATOR: u8 = 0;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write batch (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("folio_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, caller-provided directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// RocksDB implementation of [`KeyValueStore`].
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    sequence: AtomicU64,
    /// Serializes blob writes so `compare_and_set` reads and writes as one step.
    blob_writes: Mutex<()>,
}

impl RocksStore {
    /// Open (or create) the store at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(128 * 1024 * 1024);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let sequence = Self::recover_sequence(&db)?;
        log::info!(
            "opened store at {} (sequence {sequence})",
            config.path.display()
        );

        Ok(Self {
            db,
            config,
            sequence: AtomicU64::new(sequence),
            blob_writes: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_LOGS => {
                // Many small appends, prefix-scanned on load.
                opts.set_max_write_buffer_number(4);
                // Values are already LZ4 framed.
                opts.set_compression_type(DBCompressionType::None);
            }
            CF_BLOBS => {
                opts.set_max_write_buffer_number(2);
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {
                opts.set_max_write_buffer_number(2);
                opts.set_compression_type(DBCompressionType::Lz4);
            }
        }

        opts
    }

    /// Highest sequence among surviving log entries.
    fn recover_sequence(db: &DBWithThreadMode<SingleThreaded>) -> Result<u64, StoreError> {
        let cf = db
            .cf_handle(CF_LOGS)
            .ok_or_else(|| StoreError::Database(format!("column family '{CF_LOGS}' not found")))?;

        let mut highest = 0u64;
        for item in db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            if let Some(seq) = seq_suffix(&key) {
                highest = highest.max(seq);
            }
        }
        Ok(highest)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Force memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }

    fn put_blob(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        let cf = self.cf(CF_BLOBS)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(cf, key.as_bytes(), lz4_flex::compress_prepend_size(value));
        self.touch(&mut batch, key, ttl)?;
        self.write(batch)
    }

    fn lock_blobs(&self) -> Result<std::sync::MutexGuard<'_, ()>, StoreError> {
        self.blob_writes
            .lock()
            .map_err(|_| StoreError::Database("blob write lock poisoned".into()))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn touch(&self, batch: &mut WriteBatch, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let cf = self.cf(CF_EXPIRY)?;
        let expires_at = unix_secs(SystemTime::now()).saturating_add(ttl.as_secs().max(1));
        batch.put_cf(cf, key.as_bytes(), expires_at.to_be_bytes());
        Ok(())
    }

    fn is_expired(&self, key: &str) -> Result<bool, StoreError> {
        let cf = self.cf(CF_EXPIRY)?;
        Ok(match self.db.get_cf(cf, key.as_bytes())? {
            Some(bytes) => read_u64(&bytes) <= unix_secs(SystemTime::now()),
            None => false,
        })
    }

    /// Every raw key under `prefix` in `cf_name`, with its value.
    fn scan_prefix(
        &self,
        cf_name: &str,
        prefix: &[u8],
    ) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>, StoreError> {
        let cf = self.cf(cf_name)?;
        let mut out = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key, value));
        }
        Ok(out)
    }

    fn delete_into(&self, batch: &mut WriteBatch, key: &str) -> Result<(), StoreError> {
        let prefix = scoped_prefix(key);
        let logs = self.cf(CF_LOGS)?;
        for (raw, _) in self.scan_prefix(CF_LOGS, &prefix)? {
            batch.delete_cf(logs, raw);
        }
        let members = self.cf(CF_MEMBERS)?;
        for (raw, _) in self.scan_prefix(CF_MEMBERS, &prefix)? {
            batch.delete_cf(members, raw);
        }
        batch.delete_cf(self.cf(CF_BLOBS)?, key.as_bytes());
        batch.delete_cf(self.cf(CF_EXPIRY)?, key.as_bytes());
        Ok(())
    }
}

impl KeyValueStore for RocksStore {
    fn append(&self, key: &str, value: &[u8], ttl: Duration) -> Result<u64, StoreError> {
        let cf = self.cf(CF_LOGS)?;
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;

        let mut batch = WriteBatch::default();
        if self.is_expired(key)? {
            // Expired but not yet purged: start a fresh log.
            self.delete_into(&mut batch, key)?;
        }
        batch.put_cf(cf, log_key(key, seq), lz4_flex::compress_prepend_size(value));
        self.touch(&mut batch, key, ttl)?;
        self.write(batch)?;
        Ok(seq)
    }

    fn range(&self, key: &str) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        if self.is_expired(key)? {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for (raw, value) in self.scan_prefix(CF_LOGS, &scoped_prefix(key))? {
            let Some(seq) = seq_suffix(&raw) else {
                continue;
            };
            let delta = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::Compression(e.to_string()))?;
            entries.push((seq, delta));
        }
        Ok(entries)
    }

    fn trim(&self, key: &str, up_to: u64) -> Result<u64, StoreError> {
        let cf = self.cf(CF_LOGS)?;
        let end = log_key(key, up_to.saturating_add(1));

        let mut batch = WriteBatch::default();
        let mut count = 0u64;
        for (raw, _) in self.scan_prefix(CF_LOGS, &scoped_prefix(key))? {
            if raw.as_ref() >= end.as_slice() {
                break;
            }
            batch.delete_cf(cf, raw);
            count += 1;
        }
        if count > 0 {
            self.write(batch)?;
        }
        Ok(count)
    }

    fn last_seq(&self, key: &str) -> Result<Option<u64>, StoreError> {
        if self.is_expired(key)? {
            return Ok(None);
        }
        Ok(self
            .scan_prefix(CF_LOGS, &scoped_prefix(key))?
            .last()
            .and_then(|(raw, _)| seq_suffix(raw)))
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        if self.is_expired(key)? {
            return Ok(None);
        }
        let cf = self.cf(CF_BLOBS)?;
        match self.db.get_cf(cf, key.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StoreError::Compression(e.to_string())),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        let _guard = self.lock_blobs()?;
        self.put_blob(key, value, ttl)
    }

    fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let _guard = self.lock_blobs()?;
        if self.get(key)?.as_deref() != expected {
            return Ok(false);
        }
        self.put_blob(key, value, ttl)?;
        Ok(true)
    }

    fn add_member(&self, key: &str, member: &str, ttl: Duration) -> Result<(), StoreError> {
        let cf = self.cf(CF_MEMBERS)?;
        let mut raw = scoped_prefix(key);
        raw.extend_from_slice(member.as_bytes());

        let mut batch = WriteBatch::default();
        batch.put_cf(cf, raw, b"");
        self.touch(&mut batch, key, ttl)?;
        self.write(batch)
    }

    fn remove_member(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let cf = self.cf(CF_MEMBERS)?;
        let mut raw = scoped_prefix(key);
        raw.extend_from_slice(member.as_bytes());
        self.db.delete_cf(cf, raw)?;
        Ok(())
    }

    fn members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        if self.is_expired(key)? {
            return Ok(Vec::new());
        }
        let prefix = scoped_prefix(key);
        self.scan_prefix(CF_MEMBERS, &prefix)?
            .into_iter()
            .map(|(raw, _)| {
                String::from_utf8(raw[prefix.len()..].to_vec())
                    .map_err(|e| StoreError::Deserialization(e.to_string()))
            })
            .collect()
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        self.delete_into(&mut batch, key)?;
        self.write(batch)
    }

    fn purge_expired(&self, now: SystemTime) -> Result<u64, StoreError> {
        let cutoff = unix_secs(now);
        let cf = self.cf(CF_EXPIRY)?;

        let mut expired = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item?;
            if read_u64(&value) <= cutoff {
                expired.push(
                    String::from_utf8(key.to_vec())
                        .map_err(|e| StoreError::Deserialization(e.to_string()))?,
                );
            }
        }

        let mut batch = WriteBatch::default();
        for key in &expired {
            self.delete_into(&mut batch, key)?;
        }
        if !expired.is_empty() {
            self.write(batch)?;
            log::debug!("purged {} expired keys", expired.len());
        }
        Ok(expired.len() as u64)
    }
}

/// `<name>\0`
fn scoped_prefix(key: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(key.len() + 1);
    prefix.extend_from_slice(key.as_bytes());
    prefix.push(SEPARATOR);
    prefix
}

/// `<name>\0<seq:8 bytes BE>`
fn log_key(key: &str, seq: u64) -> Vec<u8> {
    let mut raw = scoped_prefix(key);
    raw.extend_from_slice(&seq.to_be_bytes());
    raw
}

fn seq_suffix(raw: &[u8]) -> Option<u64> {
    if raw.len() < 9 || raw[raw.len() - 9] != SEPARATOR {
        return None;
    }
    Some(read_u64(&raw[raw.len() - 8..]))
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let n = bytes.len().min(8);
    buf[..n].copy_from_slice(&bytes[..n]);
    u64::from_be_bytes(buf)
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const TTL: Duration = Duration::from_secs(3_600);

    #[test]
    fn test_store_open_close() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        assert!(store.path().exists());
    }

    #[test]
    fn test_log_append_range() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();

        let mut seqs = Vec::new();
        for i in 0..10u8 {
            seqs.push(store.append("update-log:doc-1", &[i; 32], TTL).unwrap());
        }
        let entries = store.range("update-log:doc-1").unwrap();
        assert_eq!(entries.len(), 10);
        assert_eq!(entries[0], (seqs[0], vec![0u8; 32]));
        assert_eq!(entries[9].1, vec![9u8; 32]);
        assert_eq!(store.last_seq("update-log:doc-1").unwrap(), Some(seqs[9]));
    }

    #[test]
    fn test_log_trim() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();

        let seqs: Vec<u64> = (0..20u8)
            .map(|i| store.append("log", &[i], TTL).unwrap())
            .collect();
        assert_eq!(store.trim("log", seqs[9]).unwrap(), 10);

        let remaining = store.range("log").unwrap();
        assert_eq!(remaining.len(), 10);
        assert_eq!(remaining[0].0, seqs[10]);
    }

    #[test]
    fn test_prefix_isolation() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();

        store.append("update-log:a", b"a", TTL).unwrap();
        store.append("update-log:ab", b"ab", TTL).unwrap();
        store.add_member("active-users:a", "alice", TTL).unwrap();
        store.add_member("active-users:ab", "bob", TTL).unwrap();

        assert_eq!(store.range("update-log:a").unwrap().len(), 1);
        assert_eq!(store.members("active-users:a").unwrap(), vec!["alice"]);
    }

    #[test]
    fn test_blob_set_get() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();

        assert_eq!(store.get("snapshot:doc").unwrap(), None);
        let data = "The quick brown fox jumps over the lazy dog. ".repeat(200);
        store.set("snapshot:doc", data.as_bytes(), TTL).unwrap();
        assert_eq!(store.get("snapshot:doc").unwrap(), Some(data.into_bytes()));
    }

    #[test]
    fn test_blob_compare_and_set() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();

        assert!(store.compare_and_set("snapshot:doc", None, b"one", TTL).unwrap());
        assert!(!store.compare_and_set("snapshot:doc", None, b"two", TTL).unwrap());
        assert!(store
            .compare_and_set("snapshot:doc", Some(b"one"), b"two", TTL)
            .unwrap());
        assert_eq!(store.get("snapshot:doc").unwrap(), Some(b"two".to_vec()));
    }

    #[test]
    fn test_members() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();

        store.add_member("users", "bob", TTL).unwrap();
        store.add_member("users", "alice", TTL).unwrap();
        assert_eq!(store.members("users").unwrap(), vec!["alice", "bob"]);
        store.remove_member("users", "bob").unwrap();
        assert_eq!(store.members("users").unwrap(), vec!["alice"]);
    }

    #[test]
    fn test_sequence_recovery() {
        let dir = tempdir().unwrap();
        let last = {
            let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
            for i in 0..5u8 {
                store.append("log", &[i], TTL).unwrap();
            }
            store.last_seq("log").unwrap().unwrap()
        };

        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        let next = store.append("log", b"after restart", TTL).unwrap();
        assert!(next > last);
        assert_eq!(store.range("log").unwrap().len(), 6);
    }

    #[test]
    fn test_purge_expired_removes_every_shape() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();

        store.append("log", b"x", Duration::from_secs(1)).unwrap();
        store.set("blob", b"x", Duration::from_secs(1)).unwrap();
        store.add_member("set", "m", Duration::from_secs(1)).unwrap();
        store.set("keep", b"x", TTL).unwrap();

        let later = SystemTime::now() + Duration::from_secs(60);
        assert_eq!(store.purge_expired(later).unwrap(), 3);
        assert!(store.range("log").unwrap().is_empty());
        assert!(store.members("set").unwrap().is_empty());
        assert_eq!(store.get("keep").unwrap(), Some(b"x".to_vec()));
    }

    #[test]
    fn test_delete_key() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();

        store.append("log", b"1", TTL).unwrap();
        store.append("log", b"2", TTL).unwrap();
        store.delete("log").unwrap();
        assert!(store.range("log").unwrap().is_empty());
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.bloom_filter_bits, 10);
        assert!(!config.sync_writes);
    }
}
