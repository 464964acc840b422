//! In-memory content index
//!
//! Authoritative record of which content hashes are present in the local
//! store, their sizes and access metadata.
//!
//! Mutation is crate-private and performed only by the quota keeper's drain
//! loop. Every other component reads point-in-time values and must not
//! assume they stay valid across an `.await`.

use crate::hash::ContentHash;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// One piece of locally stored content
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContentEntry {
    /// Content hash
    pub hash: ContentHash,
    /// Size in bytes
    pub size_bytes: u64,
    /// Wall-clock time of the last access
    pub last_access: DateTime<Utc>,
    /// Monotonic access stamp; larger = more recent
    pub access_seq: u64,
    /// Number of outstanding pins; pinned content is never evicted
    pub pin_count: u32,
}

impl ContentEntry {
    /// Whether the entry is currently protected from eviction
    pub fn is_pinned(&self) -> bool {
        self.pin_count > 0
    }

    /// Age since last access, clamped at zero
    pub fn idle_secs(&self, now: DateTime<Utc>) -> u64 {
        (now - self.last_access).num_seconds().max(0) as u64
    }
}

/// Outcome of inserting content into the index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InsertOutcome {
    Inserted,
    AlreadyPresent,
}

#[derive(Debug, Default)]
struct IndexState {
    entries: HashMap<ContentHash, ContentEntry>,
    total_bytes: u64,
    next_seq: u64,
}

impl IndexState {
    fn stamp(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

/// Index of locally present content
#[derive(Debug, Default)]
pub struct ContentIndex {
    state: RwLock<IndexState>,
}

impl ContentIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an index from content discovered on disk at startup
    ///
    /// Access stamps follow `last_access` order so recency-based policies
    /// see the same ordering the previous process did.
    pub fn from_existing(
        existing: impl IntoIterator<Item = (ContentHash, u64, DateTime<Utc>)>,
    ) -> Self {
        let mut found: Vec<_> = existing.into_iter().collect();
        found.sort_by(|a, b| a.2.cmp(&b.2).then(a.0.cmp(&b.0)));

        let mut state = IndexState::default();
        for (hash, size_bytes, last_access) in found {
            if state.entries.contains_key(&hash) {
                continue;
            }
            let access_seq = state.stamp();
            state.total_bytes += size_bytes;
            state.entries.insert(
                hash,
                ContentEntry {
                    hash,
                    size_bytes,
                    last_access,
                    access_seq,
                    pin_count: 0,
                },
            );
        }

        Self {
            state: RwLock::new(state),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, IndexState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, IndexState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the hash is present
    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.read().entries.contains_key(hash)
    }

    /// Copy of the entry for a hash
    pub fn get(&self, hash: &ContentHash) -> Option<ContentEntry> {
        self.read().entries.get(hash).cloned()
    }

    /// Size of the content, if present
    pub fn size_of(&self, hash: &ContentHash) -> Option<u64> {
        self.read().entries.get(hash).map(|e| e.size_bytes)
    }

    /// Sum of entry sizes
    pub fn total_bytes(&self) -> u64 {
        self.read().total_bytes
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    /// Whether the index has no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point-in-time copy of every entry, ordered by hash
    pub fn snapshot(&self) -> IndexSnapshot {
        let state = self.read();
        let mut entries: Vec<ContentEntry> = state.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.hash.cmp(&b.hash));
        IndexSnapshot {
            entries,
            total_bytes: state.total_bytes,
            taken_at: Utc::now(),
        }
    }

    pub(crate) fn insert(
        &self,
        hash: ContentHash,
        size_bytes: u64,
        now: DateTime<Utc>,
    ) -> InsertOutcome {
        let mut state = self.write();
        let access_seq = state.stamp();

        if let Some(entry) = state.entries.get_mut(&hash) {
            entry.last_access = now;
            entry.access_seq = access_seq;
            return InsertOutcome::AlreadyPresent;
        }

        state.total_bytes += size_bytes;
        state.entries.insert(
            hash,
            ContentEntry {
                hash,
                size_bytes,
                last_access: now,
                access_seq,
                pin_count: 0,
            },
        );
        InsertOutcome::Inserted
    }

    pub(crate) fn remove(&self, hash: &ContentHash) -> Option<ContentEntry> {
        let mut state = self.write();
        let entry = state.entries.remove(hash)?;
        state.total_bytes -= entry.size_bytes;
        Some(entry)
    }

    pub(crate) fn touch(&self, hash: &ContentHash, now: DateTime<Utc>) -> bool {
        let mut state = self.write();
        let access_seq = state.stamp();
        match state.entries.get_mut(hash) {
            Some(entry) => {
                entry.last_access = now;
                entry.access_seq = access_seq;
                true
            }
            None => false,
        }
    }

    pub(crate) fn pin(&self, hash: &ContentHash) -> bool {
        match self.write().entries.get_mut(hash) {
            Some(entry) => {
                entry.pin_count += 1;
                true
            }
            None => false,
        }
    }

    pub(crate) fn unpin(&self, hash: &ContentHash) {
        if let Some(entry) = self.write().entries.get_mut(hash) {
            entry.pin_count = entry.pin_count.saturating_sub(1);
        }
    }
}

/// Read-only copy of the index handed to eviction policies
#[derive(Debug, Clone)]
pub struct IndexSnapshot {
    entries: Vec<ContentEntry>,
    total_bytes: u64,
    taken_at: DateTime<Utc>,
}

impl IndexSnapshot {
    /// Build a snapshot directly (used by policies' callers and tests)
    pub fn from_entries(mut entries: Vec<ContentEntry>, taken_at: DateTime<Utc>) -> Self {
        entries.sort_by(|a, b| a.hash.cmp(&b.hash));
        let total_bytes = entries.iter().map(|e| e.size_bytes).sum();
        Self {
            entries,
            total_bytes,
            taken_at,
        }
    }

    /// All entries, ordered by hash
    pub fn entries(&self) -> &[ContentEntry] {
        &self.entries
    }

    /// Entries that may be evicted
    pub fn unpinned(&self) -> impl Iterator<Item = &ContentEntry> {
        self.entries.iter().filter(|e| !e.is_pinned())
    }

    /// Sum of entry sizes at snapshot time
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// When the snapshot was taken
    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the snapshot is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
