//! Eviction policies
//!
//! A policy ranks the unpinned entries of an index snapshot and yields them
//! lazily, most evictable first. The keeper stops pulling candidates as soon
//! as enough bytes are freed, so policies must be free of side effects.
//! Ties are broken by content hash to keep the order deterministic.

use crate::index::{ContentEntry, IndexSnapshot};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::Arc;

/// Ranking function for eviction candidates
pub trait EvictionPolicy: Send + Sync + fmt::Debug {
    /// Name for logs and status output
    fn name(&self) -> &'static str;

    /// Candidates in eviction order; never yields pinned entries
    ///
    /// `min_bytes` is the amount the keeper needs to free. Policies may use
    /// it as a hint but must keep yielding until exhausted.
    fn candidates<'a>(
        &self,
        snapshot: &'a IndexSnapshot,
        min_bytes: u64,
    ) -> Box<dyn Iterator<Item = &'a ContentEntry> + 'a>;
}

/// Heap-ordered iterator over snapshot entries
///
/// Heapify is O(n); each yielded candidate costs O(log n), so stopping
/// early stays cheap on large indexes.
struct Ranked<'a, K: Ord> {
    entries: &'a [ContentEntry],
    heap: BinaryHeap<Reverse<(K, usize)>>,
}

impl<'a, K: Ord> Ranked<'a, K> {
    fn new(snapshot: &'a IndexSnapshot, key: impl Fn(&ContentEntry) -> K) -> Self {
        let entries = snapshot.entries();
        let heap = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.is_pinned())
            .map(|(i, e)| Reverse((key(e), i)))
            .collect();
        Self { entries, heap }
    }
}

impl<'a, K: Ord> Iterator for Ranked<'a, K> {
    type Item = &'a ContentEntry;

    fn next(&mut self) -> Option<Self::Item> {
        // Snapshot entries are ordered by hash, so the index breaks ties by hash
        self.heap.pop().map(|Reverse((_, i))| &self.entries[i])
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.heap.len(), Some(self.heap.len()))
    }
}

/// Evict the least recently accessed content first
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastRecentlyUsed;

impl EvictionPolicy for LeastRecentlyUsed {
    fn name(&self) -> &'static str {
        "lru"
    }

    fn candidates<'a>(
        &self,
        snapshot: &'a IndexSnapshot,
        _min_bytes: u64,
    ) -> Box<dyn Iterator<Item = &'a ContentEntry> + 'a> {
        Box::new(Ranked::new(snapshot, |e| e.access_seq))
    }
}

/// Evict the largest content first
#[derive(Debug, Default, Clone, Copy)]
pub struct LargestFirst;

impl EvictionPolicy for LargestFirst {
    fn name(&self) -> &'static str {
        "largest"
    }

    fn candidates<'a>(
        &self,
        snapshot: &'a IndexSnapshot,
        _min_bytes: u64,
    ) -> Box<dyn Iterator<Item = &'a ContentEntry> + 'a> {
        Box::new(Ranked::new(snapshot, |e| Reverse(e.size_bytes)))
    }
}

/// Evict by idle time × size, so large content that has gone cold goes first
#[derive(Debug, Default, Clone, Copy)]
pub struct CompositeScore;

impl EvictionPolicy for CompositeScore {
    fn name(&self) -> &'static str {
        "composite"
    }

    fn candidates<'a>(
        &self,
        snapshot: &'a IndexSnapshot,
        _min_bytes: u64,
    ) -> Box<dyn Iterator<Item = &'a ContentEntry> + 'a> {
        let now = snapshot.taken_at();
        Box::new(Ranked::new(snapshot, move |e| {
            let idle = u128::from(e.idle_secs(now)) + 1;
            // Higher score first; access stamp orders equal scores oldest first
            (Reverse(idle * u128::from(e.size_bytes.max(1))), e.access_seq)
        }))
    }
}

/// Policy selection in configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    /// Least recently used
    #[default]
    Lru,
    /// Largest first
    Largest,
    /// Idle time × size
    Composite,
}

impl PolicyKind {
    /// Instantiate the policy
    pub fn build(self) -> Arc<dyn EvictionPolicy> {
        match self {
            Self::Lru => Arc::new(LeastRecentlyUsed),
            Self::Largest => Arc::new(LargestFirst),
            Self::Composite => Arc::new(CompositeScore),
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Lru => "lru",
            Self::Largest => "largest",
            Self::Composite => "composite",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::ContentHash;
    use chrono::{Duration, Utc};

    fn entry(n: u8, size: u64, idle_hours: i64, seq: u64, pins: u32) -> ContentEntry {
        ContentEntry {
            hash: ContentHash::of(&[n]),
            size_bytes: size,
            last_access: Utc::now() - Duration::hours(idle_hours),
            access_seq: seq,
            pin_count: pins,
        }
    }

    fn snapshot(entries: Vec<ContentEntry>) -> IndexSnapshot {
        IndexSnapshot::from_entries(entries, Utc::now())
    }

    fn order(policy: &dyn EvictionPolicy, snapshot: &IndexSnapshot) -> Vec<ContentHash> {
        policy.candidates(snapshot, 0).map(|e| e.hash).collect()
    }

    #[test]
    fn lru_orders_by_access() {
        let snap = snapshot(vec![
            entry(1, 10, 0, 3, 0),
            entry(2, 10, 0, 1, 0),
            entry(3, 10, 0, 2, 0),
        ]);

        assert_eq!(
            order(&LeastRecentlyUsed, &snap),
            vec![
                ContentHash::of(&[2]),
                ContentHash::of(&[3]),
                ContentHash::of(&[1])
            ]
        );
    }

    #[test]
    fn largest_first_orders_by_size() {
        let snap = snapshot(vec![
            entry(1, 5, 0, 1, 0),
            entry(2, 50, 0, 2, 0),
            entry(3, 20, 0, 3, 0),
        ]);

        let sizes: Vec<u64> = LargestFirst
            .candidates(&snap, 0)
            .map(|e| e.size_bytes)
            .collect();
        assert_eq!(sizes, vec![50, 20, 5]);
    }

    #[test]
    fn composite_prefers_cold_and_large() {
        let snap = snapshot(vec![
            entry(1, 100, 1, 1, 0),  // score ~ 3601 * 100
            entry(2, 10, 48, 2, 0),  // score ~ 172801 * 10
            entry(3, 100, 24, 3, 0), // score ~ 86401 * 100
        ]);

        assert_eq!(order(&CompositeScore, &snap)[0], ContentHash::of(&[3]));
    }

    #[test]
    fn pinned_entries_never_yielded() {
        let snap = snapshot(vec![entry(1, 10, 0, 1, 1), entry(2, 10, 0, 2, 0)]);

        for kind in [PolicyKind::Lru, PolicyKind::Largest, PolicyKind::Composite] {
            let policy = kind.build();
            assert_eq!(order(policy.as_ref(), &snap), vec![ContentHash::of(&[2])]);
        }
    }

    #[test]
    fn ties_are_deterministic() {
        let entries = vec![entry(1, 10, 0, 1, 0), entry(2, 10, 0, 1, 0), entry(3, 10, 0, 1, 0)];
        let mut reversed = entries.clone();
        reversed.reverse();

        let a = order(&LargestFirst, &snapshot(entries));
        let b = order(&LargestFirst, &snapshot(reversed));
        assert_eq!(a, b);
    }

    #[test]
    fn policy_kind_parses_lowercase() {
        #[derive(Deserialize)]
        struct Wrapper {
            policy: PolicyKind,
        }
        let parsed: Wrapper = toml::from_str("policy = \"composite\"").unwrap();
        assert_eq!(parsed.policy, PolicyKind::Composite);
        assert_eq!(PolicyKind::default().to_string(), "lru");
    }
}
