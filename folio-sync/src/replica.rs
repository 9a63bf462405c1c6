//! In-memory CRDT replica of one document.
//!
//! Wraps a yrs `Doc` (YATA sequence CRDT) with a single shared text root.
//! Update deltas are yrs v1 updates: applying the same set of deltas in any
//! order, any number of times, converges to the same state.
//!
//! The replica knows nothing about sessions, sockets or storage.

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update, WriteTxn};

/// Name of the shared text root holding the document body.
pub const CONTENT_ROOT: &str = "content";

#[derive(Debug, thiserror::Error)]
pub enum ReplicaError {
    #[error("malformed update: {0}")]
    MalformedUpdate(String),
    #[error("update rejected: {0}")]
    Rejected(String),
    #[error("malformed state vector: {0}")]
    MalformedStateVector(String),
}

/// Mergeable document replica.
pub struct Replica {
    doc: Doc,
}

impl Replica {
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Replica with a fixed yrs client id, for deterministic tests and benches.
    pub fn with_client_id(client_id: u64) -> Self {
        Self {
            doc: Doc::with_client_id(client_id),
        }
    }

    /// Build a replica from a full-state snapshot.
    pub fn from_state(state: &[u8]) -> Result<Self, ReplicaError> {
        let replica = Self::new();
        replica.apply_update(state)?;
        Ok(replica)
    }

    /// Merge an update delta.
    ///
    /// The delta is fully decoded before the document is touched, so corrupt
    /// input is rejected without mutating state.
    pub fn apply_update(&self, delta: &[u8]) -> Result<(), ReplicaError> {
        let update =
            Update::decode_v1(delta).map_err(|e| ReplicaError::MalformedUpdate(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| ReplicaError::Rejected(e.to_string()))
    }

    /// Full state as a single delta ("since the beginning of time").
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Everything this replica has that `remote_sv` does not.
    pub fn encode_diff(&self, remote_sv: &[u8]) -> Result<Vec<u8>, ReplicaError> {
        let sv = StateVector::decode_v1(remote_sv)
            .map_err(|e| ReplicaError::MalformedStateVector(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Encoded state vector.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Current document text.
    pub fn text(&self) -> String {
        let txn = self.doc.transact();
        txn.get_text(CONTENT_ROOT)
            .map(|text| text.get_string(&txn))
            .unwrap_or_default()
    }

    /// Length of the document text.
    pub fn len(&self) -> u32 {
        let txn = self.doc.transact();
        txn.get_text(CONTENT_ROOT)
            .map(|text| text.len(&txn))
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert text locally and return the resulting delta.
    ///
    /// `index` is clamped to the current length.
    pub fn insert(&self, index: u32, chunk: &str) -> Vec<u8> {
        let before = self.doc.transact().state_vector();
        {
            let mut txn = self.doc.transact_mut();
            let text = txn.get_or_insert_text(CONTENT_ROOT);
            let index = index.min(text.len(&txn));
            text.insert(&mut txn, index, chunk);
        }
        self.doc.transact().encode_state_as_update_v1(&before)
    }

    /// Remove a range locally and return the resulting delta.
    pub fn remove(&self, index: u32, len: u32) -> Vec<u8> {
        let before = self.doc.transact().state_vector();
        {
            let mut txn = self.doc.transact_mut();
            let text = txn.get_or_insert_text(CONTENT_ROOT);
            let total = text.len(&txn);
            let index = index.min(total);
            let len = len.min(total - index);
            if len > 0 {
                text.remove_range(&mut txn, index, len);
            }
        }
        self.doc.transact().encode_state_as_update_v1(&before)
    }
}

impl Default for Replica {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sv(replica: &Replica) -> StateVector {
        StateVector::decode_v1(&replica.state_vector()).unwrap()
    }

    /// Deltas produced by three editors typing concurrently and then
    /// continuing after a partial merge.
    fn concurrent_deltas() -> Vec<Vec<u8>> {
        let a = Replica::with_client_id(1);
        let b = Replica::with_client_id(2);
        let c = Replica::with_client_id(3);

        let d1 = a.insert(0, "Hello");
        let d2 = b.insert(0, "World");
        let d3 = c.insert(0, "!");
        b.apply_update(&d1).unwrap();
        let d4 = b.insert(2, "--");
        a.apply_update(&d3).unwrap();
        let d5 = a.remove(0, 2);
        vec![d1, d2, d3, d4, d5]
    }

    fn permutations(n: usize) -> Vec<Vec<usize>> {
        if n == 0 {
            return vec![Vec::new()];
        }
        let mut out = Vec::new();
        for perm in permutations(n - 1) {
            for pos in 0..=perm.len() {
                let mut next = perm.clone();
                next.insert(pos, n - 1);
                out.push(next);
            }
        }
        out
    }

    #[test]
    fn test_insert_and_text() {
        let replica = Replica::new();
        replica.insert(0, "world");
        replica.insert(0, "hello ");
        assert_eq!(replica.text(), "hello world");
        assert_eq!(replica.len(), 11);
    }

    #[test]
    fn test_insert_index_is_clamped() {
        let replica = Replica::new();
        replica.insert(100, "abc");
        assert_eq!(replica.text(), "abc");
    }

    #[test]
    fn test_convergence_all_orders() {
        let deltas = concurrent_deltas();
        let reference = Replica::new();
        for delta in &deltas {
            reference.apply_update(delta).unwrap();
        }
        let expected_text = reference.text();
        let expected_sv = sv(&reference);

        for order in permutations(deltas.len()) {
            let replica = Replica::new();
            for i in order {
                replica.apply_update(&deltas[i]).unwrap();
            }
            assert_eq!(replica.text(), expected_text);
            assert_eq!(sv(&replica), expected_sv);
        }
    }

    #[test]
    fn test_apply_is_idempotent() {
        let source = Replica::new();
        let delta = source.insert(0, "once");

        let target = Replica::new();
        target.apply_update(&delta).unwrap();
        let after_once = (target.text(), sv(&target));
        target.apply_update(&delta).unwrap();
        assert_eq!((target.text(), sv(&target)), after_once);
    }

    #[test]
    fn test_malformed_update_does_not_mutate() {
        let replica = Replica::new();
        replica.insert(0, "stable");
        let before = sv(&replica);

        let err = replica.apply_update(&[0x03, 0xFF]).unwrap_err();
        assert!(matches!(err, ReplicaError::MalformedUpdate(_)));
        assert_eq!(replica.text(), "stable");
        assert_eq!(sv(&replica), before);
    }

    #[test]
    fn test_snapshot_roundtrip_matches_replay() {
        let source = Replica::new();
        let mut deltas = Vec::new();
        for i in 0..20u32 {
            deltas.push(source.insert(i, "x"));
        }
        deltas.push(source.remove(3, 4));

        let restored = Replica::from_state(&source.encode_state()).unwrap();
        let replayed = Replica::new();
        for delta in &deltas {
            replayed.apply_update(delta).unwrap();
        }
        assert_eq!(restored.text(), replayed.text());
        assert_eq!(sv(&restored), sv(&replayed));
    }

    #[test]
    fn test_encode_diff_brings_peer_up_to_date() {
        let a = Replica::new();
        let b = Replica::new();
        let shared = a.insert(0, "base");
        b.apply_update(&shared).unwrap();
        a.insert(4, " more");

        let diff = a.encode_diff(&b.state_vector()).unwrap();
        b.apply_update(&diff).unwrap();
        assert_eq!(b.text(), "base more");
    }

    #[test]
    fn test_encode_diff_rejects_bad_state_vector() {
        let replica = Replica::new();
        assert!(replica.encode_diff(&[0xFF, 0xFF, 0xFF]).is_err());
    }

    proptest! {
        #[test]
        fn prop_random_order_with_duplicates_converges(
            order in proptest::collection::vec(0usize..5, 5..20)
        ) {
            let deltas = concurrent_deltas();
            let reference = Replica::new();
            for delta in &deltas {
                reference.apply_update(delta).unwrap();
            }

            let replica = Replica::new();
            for i in &order {
                replica.apply_update(&deltas[*i]).unwrap();
            }
            // Make sure every delta landed at least once.
            for delta in &deltas {
                replica.apply_update(delta).unwrap();
            }
            prop_assert_eq!(replica.text(), reference.text());
            prop_assert_eq!(sv(&replica), sv(&reference));
        }
    }
}
