//! Write coalescing.
//!
//! Producers append typed statements; a single flush at a time applies them
//! per shard-group inside one transaction and keeps the remembered per-key
//! row counts in step with what was actually written.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Mutex, RwLock};

use crate::{
    error::Result,
    pool::{ConnectionPool, IntegrityLog},
    shard::ShardKey,
    state::{DatabaseStatus, StatusCell},
    store::{Statement, TaskTag},
};

pub const DEFAULT_CAPACITY: usize = 5000;
/// Queue depth past which a flush runs without waiting for the timer.
pub const FLUSH_THRESHOLD: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Command {
    pub statement: Statement,
    /// Shard-group the statement targets.
    pub group: String,
    /// Set for statements that change the row count of a shard key.
    pub key: Option<ShardKey>,
}

impl Command {
    pub fn new(group: impl Into<String>, statement: Statement) -> Self {
        Self {
            statement,
            group: group.into(),
            key: None,
        }
    }

    pub fn keyed(mut self, key: ShardKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn tag(&self) -> TaskTag {
        self.statement.tag()
    }
}

/// Remembered row count per shard key. Unknown keys are assumed non-empty.
#[derive(Debug, Default)]
pub struct RowCounts {
    counts: RwLock<HashMap<ShardKey, u64>>,
}

impl RowCounts {
    pub fn get(&self, key: &ShardKey) -> Option<u64> {
        self.counts.read().get(key).copied()
    }

    /// Remembered count, or 1 when the key was never counted.
    pub fn get_or_assume(&self, key: &ShardKey) -> u64 {
        self.get(key).unwrap_or(1)
    }

    pub fn set(&self, key: ShardKey, count: u64) {
        self.counts.write().insert(key, count);
    }

    /// Adjust a remembered count. Keys never counted stay unknown.
    pub fn adjust(&self, key: &ShardKey, delta: i64) {
        if let Some(count) = self.counts.write().get_mut(key) {
            *count = count.saturating_add_signed(delta);
        }
    }

    pub fn clear(&self) {
        self.counts.write().clear();
    }
}

#[derive(Debug, Default)]
struct Pending {
    queue: VecDeque<Command>,
    seen: HashSet<Command>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub applied: usize,
    pub failed_groups: Vec<String>,
}

pub struct CommandQueue {
    pending: Mutex<Pending>,
    capacity: usize,
    status: Arc<StatusCell>,
    counts: Arc<RowCounts>,
    flush_lock: Mutex<()>,
    last_flush: Mutex<Instant>,
}

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl CommandQueue {
    pub fn new(
        capacity: usize,
        status: Arc<StatusCell>,
        counts: Arc<RowCounts>,
    ) -> Self {
        Self {
            pending: Mutex::new(Pending::default()),
            capacity,
            status,
            counts,
            flush_lock: Mutex::new(()),
            last_flush: Mutex::new(Instant::now()),
        }
    }

    pub fn counts(&self) -> &Arc<RowCounts> {
        &self.counts
    }

    pub fn len(&self) -> usize {
        self.pending.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a write. Dropped while the dataset is being rebuilt or
    /// compacted, when an identical command is already pending, or when the
    /// queue is full. Returns whether the command was queued.
    pub fn enqueue(&self, command: Command) -> bool {
        let status = self.status.get();
        if !status.accepts_writes() {
            tracing::debug!(?status, ?command, "write dropped");
            return false;
        }
        self.push(command)
    }

    /// Append a command issued by the rebuild itself, bypassing the status
    /// gate.
    pub fn enqueue_maintenance(&self, command: Command) -> bool {
        self.push(command)
    }

    fn push(&self, command: Command) -> bool {
        let mut pending = self.pending.lock();
        if pending.seen.contains(&command) {
            return false;
        }
        if pending.queue.len() >= self.capacity {
            tracing::warn!(
                capacity = self.capacity,
                "command queue is full, dropping write"
            );
            return false;
        }
        pending.seen.insert(command.clone());
        pending.queue.push_back(command);
        true
    }

    /// Drop a pending insert of `path` so a delete does not have to follow
    /// it. Returns whether one was found.
    pub fn cancel_pending_insert(&self, path: &str) -> bool {
        let mut pending = self.pending.lock();
        let Some(idx) = pending
            .queue
            .iter()
            .position(|c| c.statement.inserted_path() == Some(path))
        else {
            return false;
        };
        if let Some(command) = pending.queue.remove(idx) {
            pending.seen.remove(&command);
        }
        true
    }

    pub fn has_pending(&self, tag: TaskTag) -> bool {
        self.pending.lock().queue.iter().any(|c| c.tag() == tag)
    }

    /// Discard everything pending. Returns how many commands were dropped.
    pub fn clear(&self) -> usize {
        let mut pending = self.pending.lock();
        let dropped = pending.queue.len();
        pending.queue.clear();
        pending.seen.clear();
        dropped
    }

    /// Count `key` with `count` and remember the result. No flush runs in
    /// between, so a flush's delta cannot land before a stale count.
    pub fn recount(
        &self,
        key: ShardKey,
        count: impl FnOnce() -> Result<u64>,
    ) -> Result<u64> {
        let _flushing = self.flush_lock.lock();
        let rows = count()?;
        self.counts.set(key, rows);
        Ok(rows)
    }

    /// Whether the timer or the depth threshold calls for a flush.
    pub fn should_flush(&self, quiet_interval: Duration) -> bool {
        let len = self.len();
        if len == 0 {
            return false;
        }
        (len > FLUSH_THRESHOLD && self.status.get() == DatabaseStatus::Normal)
            || self.last_flush.lock().elapsed() >= quiet_interval
    }

    /// Apply every pending command, one transaction per shard-group. A
    /// failing group is flagged in `integrity` for a check on next startup
    /// while the others still commit.
    pub fn flush(
        &self,
        pool: &ConnectionPool,
        integrity: &IntegrityLog,
    ) -> Result<FlushReport> {
        let _flushing = self.flush_lock.lock();
        let batch: Vec<Command> = {
            let mut pending = self.pending.lock();
            pending.seen.clear();
            pending.queue.drain(..).collect()
        };
        *self.last_flush.lock() = Instant::now();
        if batch.is_empty() {
            return Ok(FlushReport::default());
        }

        let mut groups: BTreeMap<String, Vec<Command>> = BTreeMap::new();
        for command in batch {
            groups.entry(command.group.clone()).or_default().push(command);
        }

        let mut report = FlushReport::default();
        let mut broken = BTreeMap::new();
        for (group, commands) in groups {
            match self.flush_group(pool, &group, &commands) {
                Ok((applied, ok)) => {
                    report.applied += applied;
                    if !ok {
                        broken.insert(group.clone(), false);
                        report.failed_groups.push(group);
                    }
                }
                Err(e) => {
                    tracing::error!(group, error = %e, "flush failed");
                    broken.insert(group.clone(), false);
                    report.failed_groups.push(group);
                }
            }
        }
        if !broken.is_empty() {
            integrity.merge(&broken)?;
        }
        tracing::trace!(applied = report.applied, "command queue flushed");
        Ok(report)
    }

    /// Returns how many statements applied and whether all of them did.
    fn flush_group(
        &self,
        pool: &ConnectionPool,
        group: &str,
        commands: &[Command],
    ) -> Result<(usize, bool)> {
        let session = pool.get(group)?;
        let txn = session.begin_write()?;
        let mut deltas: Vec<(&ShardKey, i64)> = Vec::new();
        let mut applied = 0;
        let mut all_ok = true;
        for command in commands {
            match command.statement.apply(&txn) {
                Ok(affected) => {
                    applied += 1;
                    if let Some(key) = &command.key
                        && affected != 0
                    {
                        let delta = affected as i64;
                        match command.tag() {
                            TaskTag::InsertToList => deltas.push((key, delta)),
                            TaskTag::DeleteFromList => {
                                deltas.push((key, -delta))
                            }
                            _ => {}
                        }
                    }
                }
                Err(e) => {
                    all_ok = false;
                    tracing::error!(
                        group,
                        ?command,
                        error = %e,
                        "statement failed"
                    );
                }
            }
        }
        txn.commit()?;
        for (key, delta) in deltas {
            self.counts.adjust(key, delta);
        }
        Ok((applied, all_ok))
    }
}
