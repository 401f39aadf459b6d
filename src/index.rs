//! Shared index state and the write path.
//!
//! [`Index`] bundles what both searches and writes touch: the status cell,
//! the connection pool, the command queue, the weights, the suffix table and
//! both cache tiers. File changes enter here and are turned into queued
//! statements plus direct updates of whichever cache tier holds the key.

use std::{path::Path, sync::Arc, time::Duration};

use parking_lot::RwLock;

use crate::{
    accelerator::{Accelerator, AcceleratorCache},
    cache::MemoryCache,
    command_queue::{Command, CommandQueue, DEFAULT_CAPACITY, FlushReport},
    config::Config,
    error::Result,
    frequent::FrequentPaths,
    matcher::PathMatcher,
    pool::{CACHE_GROUP, ConnectionPool, IntegrityLog, WEIGHT_GROUP},
    shard::{
        self, DEFAULT_PRIORITY, DEFAULT_SENTINEL, DIR_PRIORITY, DIR_SENTINEL,
        Disks, ShardKey, ShardWeights, SuffixPriorities,
    },
    state::StatusCell,
    store::{self, Statement},
};

#[derive(Debug, Clone)]
pub struct IndexSettings {
    pub max_results: usize,
    pub threads_per_disk: usize,
    /// Extra time granted to workers still draining after the primary wait.
    pub secondary_wait: Duration,
    pub priority_folder: Option<std::path::PathBuf>,
    pub accelerator_threads: usize,
    pub quiet_interval: Duration,
}

impl IndexSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_results: config.max_results.max(1),
            threads_per_disk: config.search_thread_number.max(1),
            secondary_wait: config.advanced.wait_for_search_tasks_timeout(),
            priority_folder: config.priority_folder.clone(),
            accelerator_threads: (config.search_thread_number / 4).max(2),
            quiet_interval: config.update_time_limit(),
        }
    }
}

pub struct Index {
    pub(crate) status: Arc<StatusCell>,
    pub(crate) pool: Arc<ConnectionPool>,
    pub(crate) integrity: IntegrityLog,
    pub(crate) queue: CommandQueue,
    pub(crate) weights: ShardWeights,
    pub(crate) priorities: RwLock<SuffixPriorities>,
    pub(crate) disks: Disks,
    pub(crate) memory: MemoryCache,
    pub(crate) accelerator: Option<AcceleratorCache>,
    pub(crate) frequent: FrequentPaths,
    pub(crate) matcher: Arc<dyn PathMatcher>,
    pub(crate) settings: IndexSettings,
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("status", &self.status.get())
            .field("disks", &self.disks.ids())
            .field("pending", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl Index {
    pub fn new(
        config: &Config,
        pool: Arc<ConnectionPool>,
        integrity: IntegrityLog,
        matcher: Arc<dyn PathMatcher>,
        accelerator: Option<Arc<dyn Accelerator>>,
    ) -> Self {
        let status = Arc::new(StatusCell::default());
        let queue = CommandQueue::new(
            DEFAULT_CAPACITY,
            status.clone(),
            Default::default(),
        );
        Self {
            queue,
            status,
            pool,
            integrity,
            weights: ShardWeights::default(),
            priorities: RwLock::new(SuffixPriorities::default()),
            disks: Disks::new(&config.disks),
            memory: MemoryCache::new(
                config.cache_record_budget,
                config.cache_band(),
            ),
            accelerator: accelerator.map(AcceleratorCache::new),
            frequent: FrequentPaths::new(config.cache_num_limit),
            matcher,
            settings: IndexSettings::from_config(config),
        }
    }

    pub fn status(&self) -> &Arc<StatusCell> {
        &self.status
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn weights(&self) -> &ShardWeights {
        &self.weights
    }

    pub fn memory(&self) -> &MemoryCache {
        &self.memory
    }

    pub fn accelerator(&self) -> Option<&AcceleratorCache> {
        self.accelerator.as_ref()
    }

    pub fn frequent(&self) -> &FrequentPaths {
        &self.frequent
    }

    pub fn disks(&self) -> &Disks {
        &self.disks
    }

    pub fn settings(&self) -> &IndexSettings {
        &self.settings
    }

    pub fn priorities(&self) -> SuffixPriorities {
        self.priorities.read().clone()
    }

    /// Shard key and name checksum for `path`.
    pub fn locate(&self, path: &str, is_dir: bool) -> Option<(ShardKey, u32)> {
        if path.is_empty() {
            return None;
        }
        let disk = self.disks.disk_of(path)?;
        let ascii = shard::utf8_sum(shard::file_name(path));
        let priority = self.priorities.read().priority_for(path, is_dir);
        let key = ShardKey::new(disk, shard::shard_of_sum(ascii), priority);
        Some((key, ascii))
    }

    /// Queue an insert of `path` and mirror it into the cache tiers. Returns
    /// whether the write was queued.
    pub fn add_path(&self, path: &str) -> bool {
        let Some((key, ascii)) = self.locate(path, Path::new(path).is_dir())
        else {
            return false;
        };
        let statement = Statement::InsertPath {
            shard: key.shard,
            ascii,
            path: path.to_string(),
            priority: key.priority,
        };
        let command =
            Command::new(key.disk.clone(), statement).keyed(key.clone());
        if !self.queue.enqueue(command) {
            return false;
        }
        if let Some(accel) = &self.accelerator {
            accel.record_add(&key, path);
        }
        self.memory.on_insert(&key, path);
        true
    }

    /// Queue deletes of `path` under every priority it could have been
    /// stored with; a pending insert of it is dropped first.
    pub fn remove_path(&self, path: &str) -> bool {
        let Some((key, _)) = self.locate(path, false) else {
            return false;
        };
        self.queue.cancel_pending_insert(path);
        let dir_priority =
            self.priorities.read().priority_of_suffix(DIR_SENTINEL);
        let mut keys = vec![key.clone()];
        if key.priority != dir_priority {
            keys.push(ShardKey::new(key.disk.clone(), key.shard, dir_priority));
        }
        let mut queued = false;
        for key in keys {
            let statement = Statement::DeletePath {
                shard: key.shard,
                path: path.to_string(),
                priority: key.priority,
            };
            let command =
                Command::new(key.disk.clone(), statement).keyed(key.clone());
            queued |= self.queue.enqueue(command);
            if let Some(accel) = &self.accelerator {
                accel.record_remove(&key, path);
            }
            self.memory.on_delete(&key, path);
        }
        queued
    }

    /// Credit a scan's matches to its shard and persist the new weight.
    pub fn record_weight(&self, shard: u8, matched: u64) {
        let before = self.weights.get(shard);
        let Some(after) = self.weights.record_matches(shard, matched) else {
            return;
        };
        if after < before {
            for (shard, weight) in self.weights.snapshot() {
                self.enqueue_weight(shard, weight);
            }
        } else {
            self.enqueue_weight(shard, after);
        }
    }

    fn enqueue_weight(&self, shard: u8, weight: u64) {
        let statement = Statement::SetWeight { shard, weight };
        self.queue.enqueue(Command::new(WEIGHT_GROUP, statement));
    }

    pub fn flush(&self) -> Result<FlushReport> {
        self.queue.flush(&self.pool, &self.integrity)
    }

    // -- Persisted tables --

    /// Load weights from the weight group, halving and persisting them when
    /// any is past the high-water mark.
    pub fn load_weights(&self) -> Result<()> {
        let session = self.pool.get(WEIGHT_GROUP)?;
        let persisted = store::shard_weights(&session)?;
        drop(session);
        if self.weights.restore(persisted) {
            for (shard, weight) in self.weights.snapshot() {
                let statement = Statement::SetWeight { shard, weight };
                self.queue
                    .enqueue_maintenance(Command::new(WEIGHT_GROUP, statement));
            }
        }
        Ok(())
    }

    /// Re-read the suffix table. An empty table is seeded with the two
    /// sentinels.
    pub fn load_priorities(&self) -> Result<()> {
        let session = self.pool.get(CACHE_GROUP)?;
        let entries = store::suffix_priorities(&session)?;
        drop(session);
        if entries.is_empty() {
            for (suffix, priority) in [
                (DEFAULT_SENTINEL, DEFAULT_PRIORITY),
                (DIR_SENTINEL, DIR_PRIORITY),
            ] {
                let statement = Statement::SetSuffix {
                    suffix: suffix.to_string(),
                    priority,
                };
                self.queue
                    .enqueue_maintenance(Command::new(CACHE_GROUP, statement));
            }
            *self.priorities.write() = SuffixPriorities::default();
        } else {
            *self.priorities.write() = SuffixPriorities::from_entries(entries);
        }
        Ok(())
    }

    /// Load the frequently used paths, queueing any count repairs.
    pub fn load_frequent(&self) -> Result<()> {
        let session = self.pool.get(CACHE_GROUP)?;
        let rows = store::cached_paths(&session)?;
        drop(session);
        let loaded = self.frequent.load(rows);
        for path in loaded.reset {
            let statement = Statement::ResetStatistics { path };
            self.queue.enqueue(Command::new(CACHE_GROUP, statement));
        }
        if loaded.needs_halving {
            self.frequent.halve();
            self.queue
                .enqueue(Command::new(CACHE_GROUP, Statement::HalveStatistics));
        }
        Ok(())
    }

    /// Make sure every disk has all of its shard tables.
    pub fn ensure_tables(&self) {
        for disk in self.disks.ids() {
            let command = Command::new(disk, Statement::EnsureTables);
            self.queue.enqueue_maintenance(command);
        }
    }

    // -- Cache refresh --

    /// Count every `(disk, shard, priority)` key in weight order, remember
    /// the counts, and rebuild both cache tiers from them.
    pub fn refresh_caches(&self, should_stop: impl Fn() -> bool) -> Result<()> {
        let order = self.weights.scan_order();
        let priorities = self.priorities.read().priorities();
        let mut small = Vec::new();
        let mut large = Vec::new();
        for disk in self.disks.ids() {
            let session = match self.pool.get(&disk) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(disk, error = %e, "skipping cache refresh");
                    continue;
                }
            };
            for &shard in &order {
                for &priority in &priorities {
                    if should_stop() {
                        return Ok(());
                    }
                    let key = ShardKey::new(disk.clone(), shard, priority);
                    let rows = self.queue.recount(key.clone(), || {
                        store::count_rows(&session, shard, priority)
                    })?;
                    if self.memory.qualifies(rows) {
                        small.push((key, rows));
                    } else if rows > self.memory.band_max() as u64 {
                        large.push((key, rows));
                    }
                }
            }
        }

        let load = |key: &ShardKey| -> Result<Vec<String>> {
            let session = self.pool.get(&key.disk)?;
            store::load_paths(&session, key.shard, key.priority)
        };
        if let Some(accel) = &self.accelerator
            && !accel.relieve_pressure()
        {
            let created = accel.fill(&large, &load, &should_stop)?;
            tracing::debug!(created, "accelerator caches created");
        }
        let report = self.memory.refresh(&small, &load, &should_stop)?;
        tracing::debug!(
            cached = report.cached,
            evicted = report.evicted,
            used = self.memory.used(),
            "memory cache refreshed"
        );
        Ok(())
    }

    /// Drop every cache tier and forget remembered counts.
    pub fn invalidate_caches(&self) {
        self.memory.clear();
        self.queue.counts().clear();
        if let Some(accel) = &self.accelerator {
            accel.clear();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::matcher::StoreMatcher;

    pub(crate) fn test_index(
        roots: &[&Path],
        tweak: impl FnOnce(&mut Config),
    ) -> (tempfile::TempDir, Index) {
        test_index_with(roots, tweak, None)
    }

    pub(crate) fn test_index_with(
        roots: &[&Path],
        tweak: impl FnOnce(&mut Config),
        accelerator: Option<Arc<dyn Accelerator>>,
    ) -> (tempfile::TempDir, Index) {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config {
            disks: roots.iter().map(|r| r.to_path_buf()).collect(),
            ..Config::default()
        };
        tweak(&mut config);
        let pool = Arc::new(ConnectionPool::new(Duration::from_secs(60)));
        let integrity = IntegrityLog::new(tmp.path().join("integrity.json"));
        pool.init(&tmp.path().join("data"), &integrity).unwrap();
        let index = Index::new(
            &config,
            pool,
            integrity,
            Arc::new(StoreMatcher),
            accelerator,
        );
        (tmp, index)
    }

    fn stored(index: &Index, key: &ShardKey) -> Vec<String> {
        let session = index.pool.get(&key.disk).unwrap();
        store::load_paths(&session, key.shard, key.priority).unwrap()
    }

    #[test]
    fn insert_then_delete_leaves_nothing() {
        let files = tempfile::tempdir().unwrap();
        let path = files.path().join("b.txt");
        std::fs::write(&path, b"").unwrap();
        let path = path.to_string_lossy().into_owned();
        let (_tmp, index) = test_index(&[files.path()], |_| {});

        assert!(index.add_path(&path));
        index.flush().unwrap();
        let (key, _) = index.locate(&path, false).unwrap();
        assert_eq!(stored(&index, &key), vec![path.clone()]);

        assert!(index.remove_path(&path));
        index.flush().unwrap();
        assert!(stored(&index, &key).is_empty());
    }

    #[test]
    fn delete_cancels_pending_insert() {
        let files = tempfile::tempdir().unwrap();
        let path = files.path().join("gone.log").to_string_lossy().into_owned();
        let (_tmp, index) = test_index(&[files.path()], |_| {});

        index.add_path(&path);
        index.remove_path(&path);
        index.flush().unwrap();
        let (key, _) = index.locate(&path, false).unwrap();
        assert!(stored(&index, &key).is_empty());
    }

    #[test]
    fn remembered_counts_track_flushes() {
        let files = tempfile::tempdir().unwrap();
        let (_tmp, index) = test_index(&[files.path()], |_| {});
        let a = files.path().join("aa.md").to_string_lossy().into_owned();
        let (key, _) = index.locate(&a, false).unwrap();
        index.queue.counts().set(key.clone(), 0);

        index.add_path(&a);
        index.flush().unwrap();
        assert_eq!(index.queue.counts().get(&key), Some(1));
        // Inserting again affects no rows.
        index.add_path(&a);
        index.flush().unwrap();
        assert_eq!(index.queue.counts().get(&key), Some(1));
        index.remove_path(&a);
        index.flush().unwrap();
        assert_eq!(index.queue.counts().get(&key), Some(0));
    }

    #[test]
    fn weights_persist_through_the_queue() {
        let (_tmp, index) = test_index(&[], |_| {});
        index.record_weight(7, 9);
        assert_eq!(index.weights.get(7), 5);
        index.flush().unwrap();

        index.weights.restore([]);
        index.load_weights().unwrap();
        assert_eq!(index.weights.get(7), 5);
    }

    #[test]
    fn empty_suffix_table_is_seeded() {
        let (_tmp, index) = test_index(&[], |_| {});
        index.load_priorities().unwrap();
        index.flush().unwrap();
        let session = index.pool.get(CACHE_GROUP).unwrap();
        let mut entries = store::suffix_priorities(&session).unwrap();
        entries.sort();
        assert_eq!(
            entries,
            vec![
                (DEFAULT_SENTINEL.to_string(), DEFAULT_PRIORITY),
                (DIR_SENTINEL.to_string(), DIR_PRIORITY),
            ]
        );
    }

    #[test]
    fn refresh_caches_small_keys() {
        let files = tempfile::tempdir().unwrap();
        let (_tmp, index) = test_index(&[files.path()], |c| {
            c.cache_band = (2, 10);
        });
        let disk = index.disks.ids()[0].clone();
        let key = ShardKey::new(disk.clone(), 3, DEFAULT_PRIORITY);
        let rows: Vec<(ShardKey, u32, String)> = (0..4)
            .map(|i| (key.clone(), 300, format!("/x/{i}")))
            .collect();
        let session = index.pool.get(&disk).unwrap();
        store::insert_rows(&session, &rows).unwrap();
        drop(session);

        index.refresh_caches(|| false).unwrap();
        assert!(index.memory.is_valid(&key));
        assert_eq!(index.queue.counts().get(&key), Some(4));
        let empty = ShardKey::new(disk, 4, DEFAULT_PRIORITY);
        assert_eq!(index.queue.counts().get(&empty), Some(0));

        index.invalidate_caches();
        assert!(!index.memory.is_valid(&key));
        assert_eq!(index.queue.counts().get(&key), None);
    }
}
