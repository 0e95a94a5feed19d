/// Consistent-hash ring mapping contexts to partitions.
///
/// Each partition owns `replicas` points on a 64-bit ring. A context is
/// hashed with blake3 over its canonical bytes and belongs to the first point
/// at or after its hash, wrapping around. Growing the ring by one partition
/// only adds points, so the only contexts that move are the ones the new
/// partition captures.
///
/// Only `(partitions, replicas)` is persisted. Point positions are derived
/// from those two numbers, so a reloaded ring is identical to the one that
/// was saved.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::types::Context;

/// Number of ring points per partition.
pub const DEFAULT_REPLICAS: u32 = 64;

/// Identifier of a partition (shard), contiguous from 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionId(pub u32);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Persisted shape of a ring.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct RingLayout {
    partitions: u32,
    replicas: u32,
}

/// The consistent-hash ring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RingLayout", into = "RingLayout")]
pub struct PartitionRing {
    partitions: u32,
    replicas: u32,
    points: BTreeMap<u64, PartitionId>,
}

impl From<RingLayout> for PartitionRing {
    fn from(layout: RingLayout) -> Self {
        Self::build(layout.partitions, layout.replicas)
    }
}

impl From<PartitionRing> for RingLayout {
    fn from(ring: PartitionRing) -> Self {
        RingLayout {
            partitions: ring.partitions,
            replicas: ring.replicas,
        }
    }
}

impl PartitionRing {
    /// A ring with a single partition.
    pub fn new() -> Self {
        Self::build(1, DEFAULT_REPLICAS)
    }

    /// A ring with `partitions` nodes of `replicas` points each.
    pub fn build(partitions: u32, replicas: u32) -> Self {
        let partitions = partitions.max(1);
        let replicas = replicas.max(1);
        let mut points = BTreeMap::new();
        for id in 0..partitions {
            Self::insert_points(&mut points, PartitionId(id), replicas);
        }
        Self {
            partitions,
            replicas,
            points,
        }
    }

    fn insert_points(points: &mut BTreeMap<u64, PartitionId>, id: PartitionId, replicas: u32) {
        for replica in 0..replicas {
            let label = format!("koru-chain/partition/{}/{}", id.0, replica);
            // On a collision the older partition keeps the point.
            points.entry(hash64(label.as_bytes())).or_insert(id);
        }
    }

    /// Partition that owns `context`.
    pub fn locate(&self, context: &Context) -> PartitionId {
        let h = hash64(&context.canonical_bytes());
        self.points
            .range(h..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, id)| *id)
            .unwrap_or(PartitionId(0))
    }

    /// A copy of this ring grown by exactly one partition.
    ///
    /// The new partition's id is the current partition count.
    pub fn add_partition(&self) -> PartitionRing {
        let mut next = self.clone();
        let id = PartitionId(self.partitions);
        Self::insert_points(&mut next.points, id, self.replicas);
        next.partitions += 1;
        next
    }

    /// All partition ids in ascending order.
    pub fn partitions(&self) -> Vec<PartitionId> {
        (0..self.partitions).map(PartitionId).collect()
    }

    /// Number of partitions.
    pub fn partition_count(&self) -> u32 {
        self.partitions
    }

    /// True if `id` belongs to this ring.
    pub fn contains(&self, id: PartitionId) -> bool {
        id.0 < self.partitions
    }
}

impl Default for PartitionRing {
    fn default() -> Self {
        Self::new()
    }
}

fn hash64(bytes: &[u8]) -> u64 {
    let digest = blake3::hash(bytes);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Token;
    use proptest::prelude::*;

    fn ctx(words: &[&str]) -> Context {
        Context::new(words.iter().map(|w| Token::text(*w)).collect())
    }

    #[test]
    fn test_single_partition_owns_everything() {
        let ring = PartitionRing::new();
        assert_eq!(ring.partitions(), vec![PartitionId(0)]);
        assert_eq!(ring.locate(&ctx(&["a", "b"])), PartitionId(0));
        assert_eq!(ring.locate(&Context::start(3)), PartitionId(0));
    }

    #[test]
    fn test_add_partition_ids() {
        let ring = PartitionRing::new().add_partition().add_partition();
        assert_eq!(ring.partition_count(), 3);
        assert_eq!(
            ring.partitions(),
            vec![PartitionId(0), PartitionId(1), PartitionId(2)]
        );
        assert!(ring.contains(PartitionId(2)));
        assert!(!ring.contains(PartitionId(3)));
    }

    #[test]
    fn test_keys_spread_over_partitions() {
        let ring = PartitionRing::build(4, DEFAULT_REPLICAS);
        let mut counts = [0usize; 4];
        for i in 0..2000 {
            let c = Context::new(vec![Token::Int(i), Token::Int(i * 7)]);
            counts[ring.locate(&c).0 as usize] += 1;
        }
        for count in counts {
            assert!(count > 100, "uneven distribution: {:?}", counts);
        }
    }

    #[test]
    fn test_serde_rebuilds_identical_ring() {
        let ring = PartitionRing::new().add_partition().add_partition();
        let bytes = bincode::serialize(&ring).unwrap();
        let restored: PartitionRing = bincode::deserialize(&bytes).unwrap();
        assert_eq!(ring, restored);
        for i in 0..200 {
            let c = Context::new(vec![Token::Int(i)]);
            assert_eq!(ring.locate(&c), restored.locate(&c));
        }
    }

    proptest! {
        #[test]
        fn prop_growth_only_moves_to_new_partition(
            partitions in 1u32..6,
            keys in proptest::collection::vec(any::<i64>(), 1..200),
        ) {
            let ring = PartitionRing::build(partitions, DEFAULT_REPLICAS);
            let grown = ring.add_partition();
            let new_id = PartitionId(partitions);
            for k in keys {
                let c = Context::new(vec![Token::Int(k), Token::text("x")]);
                let before = ring.locate(&c);
                let after = grown.locate(&c);
                prop_assert!(after == before || after == new_id);
            }
        }

        #[test]
        fn prop_locate_is_deterministic(words in proptest::collection::vec("[a-z]{1,8}", 1..4)) {
            let c = Context::new(words.into_iter().map(Token::Text).collect());
            let a = PartitionRing::build(5, DEFAULT_REPLICAS);
            let b = PartitionRing::build(5, DEFAULT_REPLICAS);
            prop_assert_eq!(a.locate(&c), b.locate(&c));
        }
    }
}
