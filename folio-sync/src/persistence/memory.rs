//! In-process store, for tests and single-node development.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use super::store::{unix_secs, KeyValueStore, StoreError};

#[derive(Debug, Clone)]
enum Value {
    Log(BTreeMap<u64, Vec<u8>>),
    Blob(Vec<u8>),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: u64,
}

impl Slot {
    fn is_live(&self, now: u64) -> bool {
        self.expires_at > now
    }
}

/// `KeyValueStore` held entirely in memory.
///
/// Can be switched offline with [`MemoryStore::set_unavailable`] to exercise
/// persistence failure paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    slots: Mutex<HashMap<String, Slot>>,
    sequence: AtomicU64,
    unavailable: AtomicBool,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every operation fails with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Successful write operations so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Live keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let now = unix_secs(SystemTime::now());
        let slots = match self.slots.lock() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut keys: Vec<String> = slots
            .iter()
            .filter(|(_, slot)| slot.is_live(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    fn with_slots<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, Slot>, u64) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| StoreError::Database("memory store lock poisoned".into()))?;
        f(&mut slots, unix_secs(SystemTime::now()))
    }

    fn wrote(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }
}

fn expiry(now: u64, ttl: Duration) -> u64 {
    now.saturating_add(ttl.as_secs().max(1))
}

fn shape_error(key: &str, expected: &str) -> StoreError {
    StoreError::Database(format!("key {key} does not hold a {expected}"))
}

/// Live slot at `key`, dropping it first if it has expired.
fn live<'a>(slots: &'a mut HashMap<String, Slot>, key: &str, now: u64) -> Option<&'a mut Slot> {
    if slots.get(key).is_some_and(|slot| !slot.is_live(now)) {
        slots.remove(key);
    }
    slots.get_mut(key)
}

impl KeyValueStore for MemoryStore {
    fn append(&self, key: &str, value: &[u8], ttl: Duration) -> Result<u64, StoreError> {
        let seq = self.with_slots(|slots, now| {
            let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
            let expires_at = expiry(now, ttl);
            match live(slots, key, now) {
                Some(slot) => match &mut slot.value {
                    Value::Log(entries) => {
                        entries.insert(seq, value.to_vec());
                        slot.expires_at = expires_at;
                    }
                    _ => return Err(shape_error(key, "log")),
                },
                None => {
                    let mut entries = BTreeMap::new();
                    entries.insert(seq, value.to_vec());
                    slots.insert(
                        key.to_string(),
                        Slot {
                            value: Value::Log(entries),
                            expires_at,
                        },
                    );
                }
            }
            Ok(seq)
        })?;
        self.wrote();
        Ok(seq)
    }

    fn range(&self, key: &str) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        self.with_slots(|slots, now| match live(slots, key, now) {
            Some(Slot {
                value: Value::Log(entries),
                ..
            }) => Ok(entries.iter().map(|(seq, v)| (*seq, v.clone())).collect()),
            Some(_) => Err(shape_error(key, "log")),
            None => Ok(Vec::new()),
        })
    }

    fn trim(&self, key: &str, up_to: u64) -> Result<u64, StoreError> {
        self.with_slots(|slots, now| match live(slots, key, now) {
            Some(Slot {
                value: Value::Log(entries),
                ..
            }) => {
                let keep = entries.split_off(&(up_to.saturating_add(1)));
                let removed = entries.len() as u64;
                *entries = keep;
                Ok(removed)
            }
            Some(_) => Err(shape_error(key, "log")),
            None => Ok(0),
        })
    }

    fn last_seq(&self, key: &str) -> Result<Option<u64>, StoreError> {
        self.with_slots(|slots, now| match live(slots, key, now) {
            Some(Slot {
                value: Value::Log(entries),
                ..
            }) => Ok(entries.keys().next_back().copied()),
            Some(_) => Err(shape_error(key, "log")),
            None => Ok(None),
        })
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.with_slots(|slots, now| match live(slots, key, now) {
            Some(Slot {
                value: Value::Blob(bytes),
                ..
            }) => Ok(Some(bytes.clone())),
            Some(_) => Err(shape_error(key, "blob")),
            None => Ok(None),
        })
    }

    fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        self.with_slots(|slots, now| {
            slots.insert(
                key.to_string(),
                Slot {
                    value: Value::Blob(value.to_vec()),
                    expires_at: expiry(now, ttl),
                },
            );
            Ok(())
        })?;
        self.wrote();
        Ok(())
    }

    fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let swapped = self.with_slots(|slots, now| {
            let matches = match live(slots, key, now) {
                Some(Slot {
                    value: Value::Blob(bytes),
                    ..
                }) => expected == Some(bytes.as_slice()),
                Some(_) => return Err(shape_error(key, "blob")),
                None => expected.is_none(),
            };
            if !matches {
                return Ok(false);
            }
            slots.insert(
                key.to_string(),
                Slot {
                    value: Value::Blob(value.to_vec()),
                    expires_at: expiry(now, ttl),
                },
            );
            Ok(true)
        })?;
        if swapped {
            self.wrote();
        }
        Ok(swapped)
    }

    fn add_member(&self, key: &str, member: &str, ttl: Duration) -> Result<(), StoreError> {
        self.with_slots(|slots, now| {
            let expires_at = expiry(now, ttl);
            match live(slots, key, now) {
                Some(slot) => match &mut slot.value {
                    Value::Set(members) => {
                        members.insert(member.to_string());
                        slot.expires_at = expires_at;
                    }
                    _ => return Err(shape_error(key, "set")),
                },
                None => {
                    slots.insert(
                        key.to_string(),
                        Slot {
                            value: Value::Set(BTreeSet::from([member.to_string()])),
                            expires_at,
                        },
                    );
                }
            }
            Ok(())
        })?;
        self.wrote();
        Ok(())
    }

    fn remove_member(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.with_slots(|slots, now| match live(slots, key, now) {
            Some(Slot {
                value: Value::Set(members),
                ..
            }) => {
                members.remove(member);
                if members.is_empty() {
                    slots.remove(key);
                }
                Ok(())
            }
            Some(_) => Err(shape_error(key, "set")),
            None => Ok(()),
        })
    }

    fn members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.with_slots(|slots, now| match live(slots, key, now) {
            Some(Slot {
                value: Value::Set(members),
                ..
            }) => Ok(members.iter().cloned().collect()),
            Some(_) => Err(shape_error(key, "set")),
            None => Ok(Vec::new()),
        })
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.with_slots(|slots, _| {
            slots.remove(key);
            Ok(())
        })
    }

    fn purge_expired(&self, now: SystemTime) -> Result<u64, StoreError> {
        let cutoff = unix_secs(now);
        self.with_slots(|slots, _| {
            let before = slots.len();
            slots.retain(|_, slot| slot.is_live(cutoff));
            Ok((before - slots.len()) as u64)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn test_append_range_trim() {
        let store = MemoryStore::new();
        let s1 = store.append("log", b"a", TTL).unwrap();
        let s2 = store.append("log", b"b", TTL).unwrap();
        let s3 = store.append("log", b"c", TTL).unwrap();
        assert!(s1 < s2 && s2 < s3);
        assert_eq!(store.last_seq("log").unwrap(), Some(s3));

        assert_eq!(store.trim("log", s2).unwrap(), 2);
        let rest = store.range("log").unwrap();
        assert_eq!(rest, vec![(s3, b"c".to_vec())]);
    }

    #[test]
    fn test_sequences_are_store_wide() {
        let store = MemoryStore::new();
        let a = store.append("a", b"1", TTL).unwrap();
        let b = store.append("b", b"1", TTL).unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_blob_and_members() {
        let store = MemoryStore::new();
        assert_eq!(store.get("blob").unwrap(), None);
        store.set("blob", b"v1", TTL).unwrap();
        store.set("blob", b"v2", TTL).unwrap();
        assert_eq!(store.get("blob").unwrap(), Some(b"v2".to_vec()));

        store.add_member("users", "alice", TTL).unwrap();
        store.add_member("users", "bob", TTL).unwrap();
        store.add_member("users", "alice", TTL).unwrap();
        assert_eq!(store.members("users").unwrap(), vec!["alice", "bob"]);
        store.remove_member("users", "alice").unwrap();
        assert_eq!(store.members("users").unwrap(), vec!["bob"]);
    }

    #[test]
    fn test_compare_and_set() {
        let store = MemoryStore::new();
        assert!(store.compare_and_set("blob", None, b"v1", TTL).unwrap());
        assert!(!store.compare_and_set("blob", None, b"v2", TTL).unwrap());
        assert!(!store.compare_and_set("blob", Some(b"v0"), b"v2", TTL).unwrap());
        assert!(store.compare_and_set("blob", Some(b"v1"), b"v2", TTL).unwrap());
        assert_eq!(store.get("blob").unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_shape_mismatch_is_error() {
        let store = MemoryStore::new();
        store.set("k", b"blob", TTL).unwrap();
        assert!(store.append("k", b"x", TTL).is_err());
        assert!(store.members("k").is_err());
    }

    #[test]
    fn test_purge_expired() {
        let store = MemoryStore::new();
        store.set("short", b"x", Duration::from_secs(1)).unwrap();
        store.set("long", b"x", Duration::from_secs(3_600)).unwrap();

        let later = SystemTime::now() + Duration::from_secs(10);
        assert_eq!(store.purge_expired(later).unwrap(), 1);
        assert_eq!(store.keys(), vec!["long"]);
    }

    #[test]
    fn test_unavailable_store_fails() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.append("log", b"x", TTL),
            Err(StoreError::Unavailable)
        ));
        store.set_unavailable(false);
        assert!(store.append("log", b"x", TTL).is_ok());
        assert_eq!(store.write_count(), 1);
    }
}
