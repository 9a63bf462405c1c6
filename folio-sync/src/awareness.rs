//! Ephemeral per-user presence: cursor, selection, display profile.
//!
//! Awareness merges like a tiny CRDT (last-writer-wins per user, ordered by
//! a per-user clock) but is never persisted. Wire deltas are bincode lists
//! of [`AwarenessRecord`]s; a record without presence removes the user.
//!
//! Clients count their own clock per connection. The process that accepts a
//! record re-stamps it with the greater of the user's last clock plus one
//! and the wall clock in milliseconds, so a reconnect or a second tab that
//! starts counting from 1 again still supersedes the user's old entry or
//! removal, here and in every other process.
//!
//! ```text
//! client cursor move
//!       │
//!       ▼
//! AwarenessUpdate { records: [ {user, clock, presence} ] }
//!       │
//!       ▼  DocumentSession::apply_awareness
//! AwarenessState::apply  ── accepted records ──► broadcast / fan-out
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime};

use crate::protocol::ConnectionId;

/// RGBA color for cursor/selection rendering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable, vivid color derived from a user id.
    pub fn from_user_id(user_id: &str) -> Self {
        // FNV-1a over the id bytes
        let mut hash: u32 = 0x811c_9dc5;
        for byte in user_id.as_bytes() {
            hash ^= *byte as u32;
            hash = hash.wrapping_mul(0x0100_0193);
        }
        let hue = ((hash % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self { r: 0.26, g: 0.52, b: 0.96, a: 1.0 }
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Text selection in document character offsets. A caret has `anchor == head`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextSelection {
    pub anchor: u32,
    pub head: u32,
}

impl TextSelection {
    pub fn caret(offset: u32) -> Self {
        Self { anchor: offset, head: offset }
    }

    pub fn is_caret(&self) -> bool {
        self.anchor == self.head
    }
}

/// What a user shares with the other editors of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Presence {
    pub name: String,
    pub color: CursorColor,
    pub selection: Option<TextSelection>,
}

impl Presence {
    pub fn new(user_id: &str, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: CursorColor::from_user_id(user_id),
            selection: None,
        }
    }

    pub fn with_selection(mut self, selection: TextSelection) -> Self {
        self.selection = Some(selection);
        self
    }
}

/// One user's awareness change. `presence: None` removes the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessRecord {
    pub user_id: String,
    pub clock: u64,
    pub presence: Option<Presence>,
}

/// Awareness delta as carried on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub records: Vec<AwarenessRecord>,
}

impl AwarenessUpdate {
    pub fn single(user_id: impl Into<String>, clock: u64, presence: Option<Presence>) -> Self {
        Self {
            records: vec![AwarenessRecord {
                user_id: user_id.into(),
                clock,
                presence,
            }],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn encode(&self) -> Result<Vec<u8>, AwarenessError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| AwarenessError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, AwarenessError> {
        let (update, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| AwarenessError::Malformed(e.to_string()))?;
        Ok(update)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AwarenessError {
    #[error("malformed awareness delta: {0}")]
    Malformed(String),
    #[error("awareness serialization error: {0}")]
    Serialization(String),
}

/// A live awareness entry.
#[derive(Debug, Clone)]
pub struct AwarenessEntry {
    pub user_id: String,
    pub clock: u64,
    pub presence: Presence,
    /// Local connection that published the entry; `None` when it came from
    /// another process.
    pub owner: Option<ConnectionId>,
    pub last_seen: Instant,
}

/// Awareness map of one document.
#[derive(Debug, Default)]
pub struct AwarenessState {
    entries: HashMap<String, AwarenessEntry>,
    /// Last clock seen per user, kept after removal so stale re-adds lose.
    clocks: HashMap<String, u64>,
    /// Last client clock per local connection.
    client_clocks: HashMap<ConnectionId, u64>,
}

impl AwarenessState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a decoded update and return the records that won.
    ///
    /// Records whose clock is not newer than the stored clock are dropped,
    /// so applying the same update twice changes nothing the second time.
    pub fn apply(
        &mut self,
        update: AwarenessUpdate,
        owner: Option<ConnectionId>,
    ) -> AwarenessUpdate {
        let now = Instant::now();
        let mut accepted = Vec::new();

        for record in update.records {
            if let Some(&known) = self.clocks.get(&record.user_id) {
                if record.clock <= known {
                    continue;
                }
            }
            self.clocks.insert(record.user_id.clone(), record.clock);

            match &record.presence {
                Some(presence) => {
                    self.entries.insert(
                        record.user_id.clone(),
                        AwarenessEntry {
                            user_id: record.user_id.clone(),
                            clock: record.clock,
                            presence: presence.clone(),
                            owner,
                            last_seen: now,
                        },
                    );
                }
                None => {
                    self.entries.remove(&record.user_id);
                }
            }
            accepted.push(record);
        }

        AwarenessUpdate { records: accepted }
    }

    /// Merge records published by a local connection.
    ///
    /// Records are ordered by the client's clock within the connection only;
    /// accepted ones are re-stamped with [`Self::next_clock`] and then merged
    /// like any other update. Returns the re-stamped records.
    pub fn apply_local(&mut self, update: AwarenessUpdate, connection: ConnectionId) -> AwarenessUpdate {
        let mut stamped = Vec::with_capacity(update.records.len());
        for mut record in update.records {
            if let Some(&seen) = self.client_clocks.get(&connection) {
                if record.clock <= seen {
                    continue;
                }
            }
            self.client_clocks.insert(connection, record.clock);
            record.clock = self.next_clock(&record.user_id);
            stamped.push(record);
        }
        self.apply(AwarenessUpdate { records: stamped }, Some(connection))
    }

    /// Clock for the next record this process issues for `user_id`.
    fn next_clock(&self, user_id: &str) -> u64 {
        let next = self.clocks.get(user_id).map_or(1, |clock| clock.saturating_add(1));
        next.max(unix_millis())
    }

    /// Every live entry, as sent to a newly joined connection.
    pub fn snapshot(&self) -> AwarenessUpdate {
        AwarenessUpdate {
            records: self
                .entries
                .values()
                .map(|entry| AwarenessRecord {
                    user_id: entry.user_id.clone(),
                    clock: entry.clock,
                    presence: Some(entry.presence.clone()),
                })
                .collect(),
        }
    }

    /// Remove every entry published by `connection`, returning the removal
    /// records to broadcast.
    pub fn remove_owned_by(&mut self, connection: ConnectionId) -> AwarenessUpdate {
        self.client_clocks.remove(&connection);
        let owned: Vec<String> = self
            .entries
            .values()
            .filter(|entry| entry.owner == Some(connection))
            .map(|entry| entry.user_id.clone())
            .collect();
        self.remove_users(owned)
    }

    /// Remove entries not refreshed within `timeout`. Entries owned by an
    /// attached connection go away through [`Self::remove_owned_by`] instead.
    pub fn remove_stale(&mut self, now: Instant, timeout: Duration) -> AwarenessUpdate {
        let stale: Vec<String> = self
            .entries
            .values()
            .filter(|entry| entry.owner.is_none())
            .filter(|entry| now.saturating_duration_since(entry.last_seen) > timeout)
            .map(|entry| entry.user_id.clone())
            .collect();
        self.remove_users(stale)
    }

    fn remove_users(&mut self, users: Vec<String>) -> AwarenessUpdate {
        let mut records = Vec::with_capacity(users.len());
        for user_id in users {
            if self.entries.remove(&user_id).is_none() {
                continue;
            }
            let clock = self.next_clock(&user_id);
            self.clocks.insert(user_id.clone(), clock);
            records.push(AwarenessRecord {
                user_id,
                clock,
                presence: None,
            });
        }
        AwarenessUpdate { records }
    }

    pub fn get(&self, user_id: &str) -> Option<&AwarenessEntry> {
        self.entries.get(user_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn cursor(user: &str, clock: u64, at: u32) -> AwarenessUpdate {
        AwarenessUpdate::single(
            user,
            clock,
            Some(Presence::new(user, user).with_selection(TextSelection::caret(at))),
        )
    }

    #[test]
    fn test_color_is_stable_per_user() {
        assert_eq!(CursorColor::from_user_id("alice"), CursorColor::from_user_id("alice"));
        let c = CursorColor::from_user_id("bob");
        assert!(c.r >= 0.0 && c.r <= 1.0);
        assert_eq!(c.a, 1.0);
    }

    #[test]
    fn test_hsl_to_rgb_red() {
        let (r, g, b) = hsl_to_rgb(0.0, 1.0, 0.5);
        assert!((r - 1.0).abs() < 0.01);
        assert!(g.abs() < 0.01);
        assert!(b.abs() < 0.01);
    }

    #[test]
    fn test_newer_clock_wins() {
        let mut state = AwarenessState::new();
        state.apply(cursor("alice", 1, 3), None);
        let accepted = state.apply(cursor("alice", 2, 9), None);

        assert_eq!(accepted.records.len(), 1);
        let selection = state.get("alice").unwrap().presence.selection.unwrap();
        assert_eq!(selection.head, 9);
    }

    #[test]
    fn test_stale_clock_rejected() {
        let mut state = AwarenessState::new();
        state.apply(cursor("alice", 5, 3), None);
        let accepted = state.apply(cursor("alice", 4, 100), None);

        assert!(accepted.is_empty());
        assert_eq!(state.get("alice").unwrap().presence.selection.unwrap().head, 3);
    }

    #[test]
    fn test_reapply_is_idempotent() {
        let mut state = AwarenessState::new();
        let update = cursor("alice", 1, 0);
        assert_eq!(state.apply(update.clone(), None).records.len(), 1);
        assert!(state.apply(update, None).is_empty());
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn test_removal_tombstone_blocks_stale_readd() {
        let mut state = AwarenessState::new();
        state.apply(cursor("alice", 1, 0), None);
        state.apply(AwarenessUpdate::single("alice", 2, None), None);
        assert!(state.get("alice").is_none());

        assert!(state.apply(cursor("alice", 1, 0), None).is_empty());
        assert!(state.is_empty());
    }

    #[test]
    fn test_remove_owned_by_connection() {
        let mut state = AwarenessState::new();
        let conn_a = Uuid::new_v4();
        let conn_b = Uuid::new_v4();
        state.apply(cursor("alice", 1, 0), Some(conn_a));
        state.apply(cursor("bob", 1, 0), Some(conn_b));

        let removed = state.remove_owned_by(conn_a);
        assert_eq!(removed.records.len(), 1);
        assert_eq!(removed.records[0].user_id, "alice");
        assert!(removed.records[0].clock > 1);
        assert!(removed.records[0].presence.is_none());
        assert!(state.get("bob").is_some());

        // A replica that sees the removal drops alice too.
        let mut remote = AwarenessState::new();
        remote.apply(cursor("alice", 1, 0), None);
        remote.apply(removed, None);
        assert!(remote.get("alice").is_none());
    }

    #[test]
    fn test_reconnected_connection_restarting_its_clock_is_accepted() {
        let mut state = AwarenessState::new();
        let first = Uuid::new_v4();
        let stamped = state.apply_local(cursor("alice", 1, 0), first);
        assert_eq!(stamped.records.len(), 1);
        assert!(state.apply_local(cursor("alice", 1, 5), first).is_empty());

        let removal = state.remove_owned_by(first);
        assert!(removal.records[0].clock > stamped.records[0].clock);
        assert!(state.is_empty());

        let second = Uuid::new_v4();
        let again = state.apply_local(cursor("alice", 1, 7), second);
        assert_eq!(again.records.len(), 1);
        assert!(again.records[0].clock > removal.records[0].clock);
        assert_eq!(state.get("alice").unwrap().presence.selection.unwrap().head, 7);

        // Another process that saw the removal takes the new entry too.
        let mut remote = AwarenessState::new();
        remote.apply(stamped, None);
        remote.apply(removal, None);
        assert_eq!(remote.apply(again, None).records.len(), 1);
        assert_eq!(remote.len(), 1);
    }

    #[test]
    fn test_second_tab_supersedes_first() {
        let mut state = AwarenessState::new();
        state.apply_local(cursor("alice", 9, 1), Uuid::new_v4());
        let tab = Uuid::new_v4();
        assert_eq!(state.apply_local(cursor("alice", 1, 2), tab).records.len(), 1);
        assert_eq!(state.get("alice").unwrap().owner, Some(tab));
    }

    #[test]
    fn test_remove_stale_entries() {
        let mut state = AwarenessState::new();
        state.apply(cursor("alice", 1, 0), None);
        state.apply(cursor("bob", 1, 0), Some(Uuid::new_v4()));

        let later = Instant::now() + Duration::from_secs(120);
        let removed = state.remove_stale(later, Duration::from_secs(60));
        assert_eq!(removed.records.len(), 1);
        assert_eq!(removed.records[0].user_id, "alice");
        assert!(state.get("bob").is_some());
    }

    #[test]
    fn test_snapshot_lists_live_entries() {
        let mut state = AwarenessState::new();
        state.apply(cursor("alice", 1, 0), None);
        state.apply(cursor("bob", 7, 2), None);

        let snapshot = state.snapshot();
        assert_eq!(snapshot.records.len(), 2);

        let mut fresh = AwarenessState::new();
        fresh.apply(snapshot, None);
        assert_eq!(fresh.get("bob").unwrap().clock, 7);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(AwarenessUpdate::decode(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF]).is_err());
    }
}
