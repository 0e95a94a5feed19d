/// Edge store: one persistent partition of the transition table.
///
/// A partition holds every edge whose context hashes onto it. Edges live in
/// memory while the partition is open and are written back to
/// `<dir>/<id>.part` on flush. The tag is part of the edge key, so a single
/// lookup of a context yields every `(target, tag)` pair recorded for it.
///
/// # File Format
///
/// A bincode-encoded [`PartitionSnapshot`]. Writes go to a temporary file
/// that is then renamed over the real one, so a crash mid-write leaves the
/// previous snapshot intact.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{ChainError, ChainResult};
use crate::ring::PartitionId;
use crate::types::{Context, EdgeRecord, Tag, Token};

/// Edges stored for one context, keyed by `(target, tag)`.
pub type ContextEdges = BTreeMap<(Token, Tag), u64>;

const PARTITION_VERSION: u32 = 1;

/// On-disk shape of a partition.
#[derive(Debug, Serialize, Deserialize)]
struct PartitionSnapshot {
    version: u32,
    id: u32,
    entries: Vec<(Context, Vec<(Token, Tag, u64)>)>,
}

/// Path of the table file for partition `id` under `dir`.
pub fn partition_path(dir: &Path, id: PartitionId) -> PathBuf {
    dir.join(format!("{}.part", id.0))
}

/// An open partition.
#[derive(Debug)]
pub struct Partition {
    id: PartitionId,
    path: PathBuf,
    table: BTreeMap<Context, ContextEdges>,
    edge_count: usize,
    dirty: bool,
}

impl Partition {
    /// Open partition `id` in `dir`, creating an empty table file if none
    /// exists yet.
    pub fn open(dir: &Path, id: PartitionId) -> ChainResult<Self> {
        fs::create_dir_all(dir).map_err(|e| ChainError::io(dir, e))?;
        let path = partition_path(dir, id);

        if !path.exists() {
            let mut partition = Self {
                id,
                path,
                table: BTreeMap::new(),
                edge_count: 0,
                dirty: true,
            };
            partition.flush()?;
            return Ok(partition);
        }

        let bytes = fs::read(&path).map_err(|e| ChainError::io(&path, e))?;
        let snapshot: PartitionSnapshot = bincode::deserialize(&bytes)?;
        if snapshot.version != PARTITION_VERSION {
            return Err(ChainError::Serialization(format!(
                "Incompatible partition version: {} (expected {})",
                snapshot.version, PARTITION_VERSION
            )));
        }

        let mut table = BTreeMap::new();
        let mut edge_count = 0;
        for (context, edges) in snapshot.entries {
            let edges: ContextEdges = edges
                .into_iter()
                .filter(|(_, _, weight)| *weight > 0)
                .map(|(target, tag, weight)| ((target, tag), weight))
                .collect();
            if !edges.is_empty() {
                edge_count += edges.len();
                table.insert(context, edges);
            }
        }

        Ok(Self {
            id,
            path,
            table,
            edge_count,
            dirty: false,
        })
    }

    /// Partition id.
    pub fn id(&self) -> PartitionId {
        self.id
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Add one occurrence of `context --tag--> target`. Returns the new weight.
    pub fn increment(&mut self, context: &Context, tag: &Tag, target: &Token) -> u64 {
        let edges = self.table.entry(context.clone()).or_default();
        let weight = edges.entry((target.clone(), tag.clone())).or_insert(0);
        if *weight == 0 {
            self.edge_count += 1;
        }
        *weight += 1;
        self.dirty = true;
        *weight
    }

    /// Edges recorded for `context`.
    pub fn edges(&self, context: &Context) -> Option<&ContextEdges> {
        self.table.get(context)
    }

    /// True if any edge is stored for `context`.
    pub fn contains(&self, context: &Context) -> bool {
        self.table.contains_key(context)
    }

    /// Every stored context key, in order.
    pub fn contexts(&self) -> Vec<Context> {
        self.table.keys().cloned().collect()
    }

    /// Add `edges` to whatever is stored for `context`.
    pub fn merge_context(&mut self, context: &Context, edges: &ContextEdges) {
        let stored = self.table.entry(context.clone()).or_default();
        for (key, weight) in edges {
            if *weight == 0 {
                continue;
            }
            let slot = stored.entry(key.clone()).or_insert(0);
            if *slot == 0 {
                self.edge_count += 1;
            }
            *slot += weight;
        }
        if stored.is_empty() {
            self.table.remove(context);
        }
        self.dirty = true;
    }

    /// Delete every edge of `context`, returning what was removed.
    pub fn remove_context(&mut self, context: &Context) -> Option<ContextEdges> {
        let removed = self.table.remove(context)?;
        self.edge_count -= removed.len();
        self.dirty = true;
        Some(removed)
    }

    /// Number of distinct `(context, tag, target)` edges.
    pub fn edge_count(&self) -> usize {
        self.edge_count
    }

    /// Number of distinct contexts.
    pub fn context_count(&self) -> usize {
        self.table.len()
    }

    /// Sum of all edge weights.
    pub fn total_weight(&self) -> u64 {
        self.table.values().flat_map(|edges| edges.values()).sum()
    }

    /// All edges as flat records.
    pub fn records(&self) -> Vec<EdgeRecord> {
        self.table
            .iter()
            .flat_map(|(context, edges)| {
                edges.iter().map(move |((target, tag), weight)| EdgeRecord {
                    context: context.clone(),
                    tag: tag.clone(),
                    target: target.clone(),
                    weight: *weight,
                })
            })
            .collect()
    }

    /// True if there are changes not yet on disk.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Write pending changes to disk.
    pub fn flush(&mut self) -> ChainResult<()> {
        if !self.dirty {
            return Ok(());
        }

        let snapshot = PartitionSnapshot {
            version: PARTITION_VERSION,
            id: self.id.0,
            entries: self
                .table
                .iter()
                .map(|(context, edges)| {
                    let edges = edges
                        .iter()
                        .map(|((target, tag), weight)| (target.clone(), tag.clone(), *weight))
                        .collect();
                    (context.clone(), edges)
                })
                .collect(),
        };
        let bytes = bincode::serialize(&snapshot)?;

        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, &bytes).map_err(|e| ChainError::io(&temp_path, e))?;
        fs::rename(&temp_path, &self.path).map_err(|e| ChainError::io(&self.path, e))?;

        self.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ctx(a: &str, b: &str) -> Context {
        Context::new(vec![Token::text(a), Token::text(b)])
    }

    #[test]
    fn test_open_creates_file() {
        let dir = TempDir::new().unwrap();
        let partition = Partition::open(dir.path(), PartitionId(3)).unwrap();
        assert!(partition.path().exists());
        assert_eq!(partition.edge_count(), 0);
        assert!(!partition.is_dirty());
    }

    #[test]
    fn test_increment_and_lookup() {
        let dir = TempDir::new().unwrap();
        let mut partition = Partition::open(dir.path(), PartitionId(0)).unwrap();
        let c = ctx("a", "b");

        assert_eq!(partition.increment(&c, &Tag::Default, &Token::text("c")), 1);
        assert_eq!(partition.increment(&c, &Tag::Default, &Token::text("c")), 2);
        partition.increment(&c, &Tag::symbol("x"), &Token::text("c"));

        let edges = partition.edges(&c).unwrap();
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[&(Token::text("c"), Tag::Default)], 2);
        assert_eq!(partition.edge_count(), 2);
        assert_eq!(partition.total_weight(), 3);
    }

    #[test]
    fn test_flush_and_reopen() {
        let dir = TempDir::new().unwrap();
        let c = ctx("hello", "world");
        {
            let mut partition = Partition::open(dir.path(), PartitionId(1)).unwrap();
            partition.increment(&c, &Tag::Default, &Token::End);
            partition.flush().unwrap();
        }
        let partition = Partition::open(dir.path(), PartitionId(1)).unwrap();
        assert_eq!(partition.edges(&c).unwrap()[&(Token::End, Tag::Default)], 1);
        assert_eq!(partition.records().len(), 1);
    }

    #[test]
    fn test_merge_and_remove() {
        let dir = TempDir::new().unwrap();
        let mut src = Partition::open(dir.path(), PartitionId(0)).unwrap();
        let mut dst = Partition::open(dir.path(), PartitionId(1)).unwrap();
        let c = ctx("a", "b");
        src.increment(&c, &Tag::Default, &Token::text("c"));
        src.increment(&c, &Tag::Default, &Token::text("d"));

        let edges = src.edges(&c).cloned().unwrap();
        dst.merge_context(&c, &edges);
        assert_eq!(dst.edge_count(), 2);
        assert_eq!(dst.total_weight(), 2);

        let removed = src.remove_context(&c).unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(src.edge_count(), 0);
        assert!(!src.contains(&c));
        assert!(src.remove_context(&c).is_none());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        fs::write(partition_path(dir.path(), PartitionId(0)), b"\xff\xff").unwrap();
        assert!(Partition::open(dir.path(), PartitionId(0)).is_err());
    }
}
