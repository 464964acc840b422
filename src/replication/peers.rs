//! Peer membership and content locations
//!
//! A machine's peers fall into two classes: members of its ring partition
//! and everyone else. Proactive copy picks one target from each class.
//! Within a class, targets are ordered by rendezvous hashing on the content
//! hash, so every machine agrees on where a given blob should go without
//! coordination.

use crate::hash::ContentHash;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// Identifier of a machine in the cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MachineId(String);

impl MachineId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MachineId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Eligible proactive copy targets, best first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicaCandidates {
    pub ring: Vec<MachineId>,
    pub outside_ring: Vec<MachineId>,
}

impl ReplicaCandidates {
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty() && self.outside_ring.is_empty()
    }
}

/// Ring membership and content location lookup
#[async_trait]
pub trait PeerLocator: Send + Sync + fmt::Debug {
    /// This machine
    fn local_machine(&self) -> &MachineId;

    /// Machines known to hold the content, possibly stale
    async fn locations(&self, hash: &ContentHash) -> Vec<MachineId>;

    /// Targets for a proactive copy, excluding this machine and known
    /// locations
    async fn candidates(&self, hash: &ContentHash) -> ReplicaCandidates;

    /// Record that `machine` holds the content
    async fn register_location(&self, hash: &ContentHash, machine: &MachineId);

    /// Record that `machine` no longer holds the content
    async fn unregister_location(&self, hash: &ContentHash, machine: &MachineId);
}

/// Content locations shared by every locator of one cluster
#[derive(Debug, Clone, Default)]
pub struct LocationRegistry {
    inner: Arc<RwLock<HashMap<ContentHash, BTreeSet<MachineId>>>>,
}

impl LocationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn locations(&self, hash: &ContentHash) -> Vec<MachineId> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(hash)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn register(&self, hash: &ContentHash, machine: &MachineId) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(*hash)
            .or_default()
            .insert(machine.clone());
    }

    pub fn unregister(&self, hash: &ContentHash, machine: &MachineId) {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(set) = map.get_mut(hash) {
            set.remove(machine);
            if set.is_empty() {
                map.remove(hash);
            }
        }
    }
}

/// Rendezvous weight of `machine` for `hash`; higher wins
pub fn rendezvous_score(hash: &ContentHash, machine: &MachineId) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(hash.as_bytes());
    hasher.update(machine.as_str().as_bytes());
    let digest = hasher.finalize();

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

fn rank(hash: &ContentHash, machines: impl Iterator<Item = MachineId>) -> Vec<MachineId> {
    let mut ranked: Vec<(u64, MachineId)> = machines
        .map(|m| (rendezvous_score(hash, &m), m))
        .collect();
    ranked.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    ranked.into_iter().map(|(_, m)| m).collect()
}

/// Fixed membership read from configuration
#[derive(Debug, Clone)]
pub struct StaticRing {
    local: MachineId,
    ring: BTreeSet<MachineId>,
    peers: BTreeSet<MachineId>,
    registry: LocationRegistry,
}

impl StaticRing {
    /// `ring` are this machine's partition partners; `peers` everyone else.
    /// A machine listed in both counts as a ring member.
    pub fn new(
        local: MachineId,
        ring: impl IntoIterator<Item = MachineId>,
        peers: impl IntoIterator<Item = MachineId>,
        registry: LocationRegistry,
    ) -> Self {
        let ring: BTreeSet<MachineId> = ring.into_iter().filter(|m| *m != local).collect();
        let peers = peers
            .into_iter()
            .filter(|m| *m != local && !ring.contains(m))
            .collect();
        Self {
            local,
            ring,
            peers,
            registry,
        }
    }

    /// Ring from the `[replication]` config section
    pub fn from_config(
        local: MachineId,
        config: &crate::config::ReplicationConfig,
        registry: LocationRegistry,
    ) -> Self {
        Self::new(
            local,
            config.ring.iter().map(|m| MachineId::new(m.as_str())),
            config.peers.iter().map(|m| MachineId::new(m.as_str())),
            registry,
        )
    }

    pub fn registry(&self) -> &LocationRegistry {
        &self.registry
    }
}

#[async_trait]
impl PeerLocator for StaticRing {
    fn local_machine(&self) -> &MachineId {
        &self.local
    }

    async fn locations(&self, hash: &ContentHash) -> Vec<MachineId> {
        self.registry.locations(hash)
    }

    async fn candidates(&self, hash: &ContentHash) -> ReplicaCandidates {
        let known: BTreeSet<MachineId> = self.registry.locations(hash).into_iter().collect();
        let eligible = |set: &BTreeSet<MachineId>| {
            set.iter()
                .filter(|m| !known.contains(*m))
                .cloned()
                .collect::<Vec<_>>()
        };

        ReplicaCandidates {
            ring: rank(hash, eligible(&self.ring).into_iter()),
            outside_ring: rank(hash, eligible(&self.peers).into_iter()),
        }
    }

    async fn register_location(&self, hash: &ContentHash, machine: &MachineId) {
        self.registry.register(hash, machine);
    }

    async fn unregister_location(&self, hash: &ContentHash, machine: &MachineId) {
        self.registry.unregister(hash, machine);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<MachineId> {
        names.iter().map(|n| MachineId::from(*n)).collect()
    }

    fn ring(local: &str, registry: LocationRegistry) -> StaticRing {
        StaticRing::new(
            local.into(),
            ids(&["a", "b", "c"]),
            ids(&["a", "x", "y", "z"]),
            registry,
        )
    }

    #[tokio::test]
    async fn candidates_exclude_self_and_known_locations() {
        let registry = LocationRegistry::new();
        let hash = ContentHash::of(b"artifact");
        registry.register(&hash, &"b".into());
        registry.register(&hash, &"y".into());
        let locator = ring("a", registry);

        let candidates = locator.candidates(&hash).await;

        assert_eq!(candidates.ring.len(), 1);
        assert_eq!(candidates.ring[0], MachineId::from("c"));
        let mut outside = candidates.outside_ring.clone();
        outside.sort();
        assert_eq!(outside, ids(&["x", "z"]));
    }

    #[tokio::test]
    async fn ordering_is_agreed_across_machines() {
        let hash = ContentHash::of(b"shared");
        let from_a = ring("a", LocationRegistry::new()).candidates(&hash).await;
        let from_b = StaticRing::new(
            "b".into(),
            ids(&["a", "c"]),
            ids(&["x", "y", "z"]),
            LocationRegistry::new(),
        )
        .candidates(&hash)
        .await;

        assert_eq!(from_a.outside_ring, from_b.outside_ring);
    }

    #[test]
    fn rendezvous_spreads_hashes() {
        let machines = ids(&["m1", "m2", "m3", "m4"]);
        let mut winners = BTreeSet::new();
        for i in 0u32..64 {
            let hash = ContentHash::of(&i.to_le_bytes());
            winners.insert(rank(&hash, machines.iter().cloned())[0].clone());
        }
        assert!(winners.len() > 1);
    }

    #[test]
    fn registry_tracks_locations() {
        let registry = LocationRegistry::new();
        let hash = ContentHash::of(b"r");
        registry.register(&hash, &"m1".into());
        registry.register(&hash, &"m1".into());
        registry.register(&hash, &"m2".into());
        assert_eq!(registry.locations(&hash), ids(&["m1", "m2"]));

        registry.unregister(&hash, &"m1".into());
        registry.unregister(&hash, &"m2".into());
        assert!(registry.locations(&hash).is_empty());
    }
}
