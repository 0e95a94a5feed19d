/// Partition cache: lazy open, touch tracking and idle eviction.
///
/// Every resident partition has an idle worker: a small tokio task that
/// sleeps until the partition's deadline and then sends an [`IdleNotice`] to
/// the owning actor. Workers never close anything themselves. The actor
/// hands each notice back to [`PartitionCache::handle_idle`], which closes the
/// partition only if its deadline has really passed, so a touch that races
/// the timer always wins.
///
/// Deadlines are published to workers through a `watch` channel. A touch
/// updates the channel before returning, which makes it visible to any
/// expiry check that happens afterwards.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::{ChainError, ChainResult};
use crate::ring::PartitionId;
use crate::storage::Partition;

/// Request from an idle worker to close a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleNotice {
    /// The partition that went idle
    pub partition: PartitionId,
}

struct Resident {
    partition: Partition,
    deadline: Instant,
    deadline_tx: watch::Sender<Instant>,
    worker: JoinHandle<()>,
}

impl Drop for Resident {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

/// The set of open partitions of one model.
pub struct PartitionCache {
    dir: PathBuf,
    idle_timeout: Duration,
    resident: BTreeMap<PartitionId, Resident>,
    notices: mpsc::UnboundedSender<IdleNotice>,
}

impl std::fmt::Debug for PartitionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionCache")
            .field("dir", &self.dir)
            .field("idle_timeout", &self.idle_timeout)
            .field("open", &self.open_ids())
            .finish()
    }
}

impl PartitionCache {
    /// Create an empty cache for partitions stored in `dir`.
    ///
    /// Idle notices are delivered on `notices`.
    pub fn new(
        dir: impl Into<PathBuf>,
        idle_timeout: Duration,
        notices: mpsc::UnboundedSender<IdleNotice>,
    ) -> Self {
        Self {
            dir: dir.into(),
            idle_timeout,
            resident: BTreeMap::new(),
            notices,
        }
    }

    /// Directory holding the partition files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Change the idle timeout. Takes effect on the next touch.
    pub fn set_idle_timeout(&mut self, timeout: Duration) {
        self.idle_timeout = timeout;
    }

    /// Open partition `id`, or return it if it is already resident.
    ///
    /// Opening an already-open partition leaves its deadline alone.
    pub fn open(&mut self, id: PartitionId) -> ChainResult<&mut Partition> {
        if !self.resident.contains_key(&id) {
            let partition = Partition::open(&self.dir, id)?;
            let deadline = Instant::now() + self.idle_timeout;
            let (deadline_tx, deadline_rx) = watch::channel(deadline);
            let worker = spawn_idle_worker(id, deadline_rx, self.notices.clone());
            debug!(partition = %id, "Opened partition");
            self.resident.insert(
                id,
                Resident {
                    partition,
                    deadline,
                    deadline_tx,
                    worker,
                },
            );
        }
        match self.resident.get_mut(&id) {
            Some(resident) => Ok(&mut resident.partition),
            None => Err(ChainError::UnknownPartition(id.0)),
        }
    }

    /// Open (if needed) and touch partition `id`.
    pub fn acquire(&mut self, id: PartitionId) -> ChainResult<&mut Partition> {
        self.open(id)?;
        self.touch(id);
        self.open(id)
    }

    /// Push back the idle deadline of `id`. Never moves it earlier.
    pub fn touch(&mut self, id: PartitionId) {
        let timeout = self.idle_timeout;
        if let Some(resident) = self.resident.get_mut(&id) {
            let candidate = Instant::now() + timeout;
            if candidate > resident.deadline {
                resident.deadline = candidate;
                resident.deadline_tx.send_replace(candidate);
            }
            trace!(partition = %id, "Touched partition");
        }
    }

    /// The resident partition `id`, if open.
    pub fn get(&self, id: PartitionId) -> Option<&Partition> {
        self.resident.get(&id).map(|r| &r.partition)
    }

    /// Current idle deadline of `id`, if open.
    pub fn deadline(&self, id: PartitionId) -> Option<Instant> {
        self.resident.get(&id).map(|r| r.deadline)
    }

    /// True if `id` is resident.
    pub fn is_open(&self, id: PartitionId) -> bool {
        self.resident.contains_key(&id)
    }

    /// Ids of resident partitions.
    pub fn open_ids(&self) -> Vec<PartitionId> {
        self.resident.keys().copied().collect()
    }

    /// Flush and release partition `id`. Closing a closed partition is a no-op.
    ///
    /// If the flush fails the partition stays resident so nothing is lost.
    pub fn close(&mut self, id: PartitionId) -> ChainResult<bool> {
        let Some(resident) = self.resident.get_mut(&id) else {
            return Ok(false);
        };
        resident.partition.flush()?;
        self.resident.remove(&id);
        debug!(partition = %id, "Closed partition");
        Ok(true)
    }

    /// Act on a notice from an idle worker.
    ///
    /// Returns `true` if the partition was closed. If closing fails the
    /// partition gets a fresh deadline so its worker tries again later.
    pub fn handle_idle(&mut self, notice: IdleNotice) -> ChainResult<bool> {
        let id = notice.partition;
        let Some(deadline) = self.deadline(id) else {
            return Ok(false);
        };
        if deadline > Instant::now() {
            warn!(partition = %id, "Ignoring stale idle notice");
            return Ok(false);
        }
        debug!(partition = %id, "Evicting idle partition");
        self.close(id).inspect_err(|e| {
            warn!(partition = %id, error = %e, "Idle eviction failed, retrying after timeout");
            self.rearm(id);
        })
    }

    fn rearm(&mut self, id: PartitionId) {
        let timeout = self.idle_timeout;
        if let Some(resident) = self.resident.get_mut(&id) {
            resident.deadline = Instant::now() + timeout;
            resident.deadline_tx.send_replace(resident.deadline);
        }
    }

    /// Flush every resident partition without closing it.
    pub fn flush_all(&mut self) -> ChainResult<()> {
        let mut first_error = None;
        for resident in self.resident.values_mut() {
            if let Err(e) = resident.partition.flush() {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Close every resident partition.
    pub fn close_all(&mut self) -> ChainResult<()> {
        let mut first_error = None;
        for id in self.open_ids() {
            if let Err(e) = self.close(id) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

fn spawn_idle_worker(
    id: PartitionId,
    mut deadline_rx: watch::Receiver<Instant>,
    notices: mpsc::UnboundedSender<IdleNotice>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let deadline = *deadline_rx.borrow_and_update();
            let expired = tokio::select! {
                _ = tokio::time::sleep_until(deadline) => true,
                changed = deadline_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    false
                }
            };
            if !expired || *deadline_rx.borrow() > deadline {
                continue;
            }
            if notices.send(IdleNotice { partition: id }).is_err() {
                break;
            }
            // Wait for a touch; if the actor closes us the sender drops.
            if deadline_rx.changed().await.is_err() {
                break;
            }
        }
    })
}
