/// Online resharding.
///
/// When a model outgrows its partitions the owning actor grows the ring by
/// one partition and migrates the contexts the new ring assigns elsewhere.
/// The work is split into steps, one old partition per step, so the actor can
/// keep answering callers in between.
///
/// ## State machine
///
/// ```text
///            total_link_count > partitions * partition_size
///   Normal ──────────────────────────────────────────────────▶ Resharding
///     ▲                                                            │
///     │   delete migrated keys from old partitions,               │ step():
///     │   ring = new_ring, replay deferred writes                 │ copy moved keys of
///     └────────────────────────────────────────────────────────────┘ one old partition
/// ```
///
/// While resharding, a context that has been copied is served from its new
/// partition and everything else from its old one, so each context has
/// exactly one authoritative location at every point. Copies are only deleted
/// from the old partition once every old partition has been scanned.
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace};

use crate::cache::PartitionCache;
use crate::error::ChainResult;
use crate::ring::{PartitionId, PartitionRing};
use crate::storage::ContextEdges;
use crate::types::Context;

/// Persistent record of an in-flight resharding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReshardProgress {
    /// Old-ring partitions to scan, in order
    sources: Vec<PartitionId>,
    /// Index into `sources` of the next partition to scan
    next_source: usize,
    /// Keys copied out of each old partition
    migrated: BTreeMap<PartitionId, BTreeSet<Context>>,
    /// Total weight of the copied edges
    links_moved: u64,
    /// `total_link_count` when resharding began
    links_at_start: u64,
}

/// Outcome of a completed resharding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReshardSummary {
    /// Partition count after the commit
    pub partitions: u32,
    /// Weight of the edges that changed partition
    pub links_moved: u64,
    /// `links_moved` as a percentage of the link count at the start
    pub percent_moved: f64,
}

impl ReshardProgress {
    /// Start resharding `ring`. Returns the grown ring and empty progress.
    pub fn begin(ring: &PartitionRing, total_link_count: u64) -> (PartitionRing, Self) {
        let progress = Self {
            sources: ring.partitions(),
            next_source: 0,
            migrated: BTreeMap::new(),
            links_moved: 0,
            links_at_start: total_link_count,
        };
        (ring.add_partition(), progress)
    }

    /// The next old partition to scan, if any remain.
    pub fn current_source(&self) -> Option<PartitionId> {
        self.sources.get(self.next_source).copied()
    }

    /// True once every old partition has been scanned.
    pub fn is_scan_complete(&self) -> bool {
        self.next_source >= self.sources.len()
    }

    /// True if `context` has already been copied out of `source`.
    pub fn is_migrated(&self, source: PartitionId, context: &Context) -> bool {
        self.migrated
            .get(&source)
            .is_some_and(|keys| keys.contains(context))
    }

    /// Number of keys copied so far.
    pub fn migrated_count(&self) -> usize {
        self.migrated.values().map(BTreeSet::len).sum()
    }

    /// Authoritative partition for `context` while resharding.
    pub fn route(&self, ring: &PartitionRing, new_ring: &PartitionRing, context: &Context) -> PartitionId {
        let old = ring.locate(context);
        if self.is_migrated(old, context) {
            new_ring.locate(context)
        } else {
            old
        }
    }

    /// Copy every moved key of the current source partition into its new
    /// partition and advance to the next source.
    ///
    /// Returns the number of keys copied. Keys already recorded as migrated
    /// are skipped, so a step interrupted by an error can simply be retried.
    pub fn step(&mut self, cache: &mut PartitionCache, new_ring: &PartitionRing) -> ChainResult<usize> {
        let Some(source) = self.current_source() else {
            return Ok(0);
        };

        let moves: Vec<(Context, PartitionId, ContextEdges)> = {
            let partition = cache.acquire(source)?;
            partition
                .contexts()
                .into_iter()
                .filter_map(|context| {
                    let dest = new_ring.locate(&context);
                    if dest == source || self.is_migrated(source, &context) {
                        return None;
                    }
                    let edges = partition.edges(&context)?.clone();
                    Some((context, dest, edges))
                })
                .collect()
        };

        let copied = moves.len();
        for (context, dest, edges) in moves {
            let weight: u64 = edges.values().sum();
            cache.acquire(dest)?.merge_context(&context, &edges);
            self.links_moved += weight;
            self.migrated.entry(source).or_default().insert(context);
        }

        debug!(source = %source, copied, "Migrated partition");
        self.next_source += 1;
        Ok(copied)
    }

    /// Delete migrated keys from their old partitions.
    ///
    /// Safe to repeat: keys that are already gone are skipped.
    pub fn finish(&self, cache: &mut PartitionCache, new_ring: &PartitionRing) -> ChainResult<ReshardSummary> {
        for (source, keys) in &self.migrated {
            let partition = cache.acquire(*source)?;
            for context in keys {
                partition.remove_context(context);
            }
            trace!(source = %source, removed = keys.len(), "Cleared migrated keys");
        }

        let percent_moved = if self.links_at_start == 0 {
            0.0
        } else {
            self.links_moved as f64 * 100.0 / self.links_at_start as f64
        };
        Ok(ReshardSummary {
            partitions: new_ring.partition_count(),
            links_moved: self.links_moved,
            percent_moved,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Tag, Token};
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use std::time::Duration;

    fn ctx(i: i64) -> Context {
        Context::new(vec![Token::Int(i), Token::text("k")])
    }

    #[tokio::test]
    async fn test_full_cycle_moves_each_key_once() {
        let dir = TempDir::new().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut cache = PartitionCache::new(dir.path(), Duration::from_secs(60), tx);
        let ring = PartitionRing::new();

        for i in 0..200 {
            let p = cache.acquire(ring.locate(&ctx(i))).unwrap();
            p.increment(&ctx(i), &Tag::Default, &Token::End);
            p.increment(&ctx(i), &Tag::symbol("x"), &Token::End);
        }

        let (new_ring, mut progress) = ReshardProgress::begin(&ring, 200);
        assert_eq!(new_ring.partition_count(), 2);
        assert_eq!(progress.current_source(), Some(PartitionId(0)));

        let copied = progress.step(&mut cache, &new_ring).unwrap();
        assert!(copied > 0 && copied < 200);
        assert!(progress.is_scan_complete());

        // While unfinished both copies exist, but routing picks exactly one
        for i in 0..200 {
            let route = progress.route(&ring, &new_ring, &ctx(i));
            assert_eq!(route, new_ring.locate(&ctx(i)));
        }

        // A second pass over the same source copies nothing new
        let mut replay = progress.clone();
        replay.next_source = 0;
        assert_eq!(replay.step(&mut cache, &new_ring).unwrap(), 0);

        let summary = progress.finish(&mut cache, &new_ring).unwrap();
        assert_eq!(summary.partitions, 2);
        assert_eq!(summary.links_moved, copied as u64 * 2);

        let p0 = cache.get(PartitionId(0)).unwrap().total_weight();
        let p1 = cache.get(PartitionId(1)).unwrap().total_weight();
        assert_eq!(p0 + p1, 400);
        for i in 0..200 {
            let home = new_ring.locate(&ctx(i));
            assert!(cache.get(home).unwrap().contains(&ctx(i)));
        }

        // Finishing twice is harmless
        progress.finish(&mut cache, &new_ring).unwrap();
        assert_eq!(cache.get(PartitionId(0)).unwrap().total_weight(), p0);
    }

    #[test]
    fn test_progress_roundtrip() {
        let (_, progress) = ReshardProgress::begin(&PartitionRing::new(), 10);
        let bytes = bincode::serialize(&progress).unwrap();
        let back: ReshardProgress = bincode::deserialize(&bytes).unwrap();
        assert_eq!(progress, back);
    }
}
