//! Search task scheduling.
//!
//! A task is prepared once per normalized query: the frequently used paths
//! and the priority folder fill its fast bucket, and an accelerator pass may
//! start alongside. Starting it fans one job per `(shard, priority)` key out
//! to per-disk queues; workers of the scheduler's search pool drain their
//! own disk first and then steal from the others.

use std::{
    collections::{HashMap, VecDeque},
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use crossbeam::deque::{Injector, Steal};
use parking_lot::{Condvar, Mutex};
use uuid::Uuid;

use crate::{
    accelerator::{AcceleratorQuery, GATE_TIMEOUT},
    error::{Error, Result},
    index::Index,
    matcher::{self, MatchRequest, Verdict},
    query::SearchQuery,
    shard::{DIR_SENTINEL, ShardKey},
    task::{Bucket, SearchTask, TaskRegistry},
};

/// How long a new search waits for the index to be serving.
pub const WAIT_FOR_SERVING: Duration = Duration::from_secs(3);
/// Primary wait for a task's jobs before falling back to the secondary one.
pub const JOB_WAIT: Duration = Duration::from_secs(60);
pub const PRIORITY_FOLDER_BUDGET: Duration = Duration::from_secs(5);

/// A path a search found missing from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Vanished {
    /// Stored in a shard; should be deleted from the index.
    Indexed(String),
    /// Listed among the frequently used paths.
    Cached(String),
}

pub type VanishedSink = Arc<dyn Fn(Vanished) + Send + Sync>;

/// Countdown with a bounded wait.
#[derive(Debug)]
struct Latch {
    remaining: Mutex<usize>,
    zero: Condvar,
}

impl Latch {
    fn new(count: usize) -> Self {
        Self {
            remaining: Mutex::new(count),
            zero: Condvar::new(),
        }
    }

    fn count_down(&self) {
        let mut remaining = self.remaining.lock();
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.zero.notify_all();
        }
    }

    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut remaining = self.remaining.lock();
        while *remaining > 0 {
            if self.zero.wait_until(&mut remaining, deadline).timed_out() {
                return *remaining == 0;
            }
        }
        true
    }
}

/// Running search workers across all tasks.
#[derive(Debug, Default)]
struct WorkerCount {
    active: Mutex<usize>,
    idle: Condvar,
}

impl WorkerCount {
    fn enter(&self) {
        *self.active.lock() += 1;
    }

    fn leave(&self) {
        let mut active = self.active.lock();
        *active = active.saturating_sub(1);
        if *active == 0 {
            self.idle.notify_all();
        }
    }

    fn get(&self) -> usize {
        *self.active.lock()
    }

    fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut active = self.active.lock();
        while *active > 0 {
            if self.idle.wait_until(&mut active, deadline).timed_out() {
                return *active == 0;
            }
        }
        true
    }
}

pub struct Scheduler {
    index: Arc<Index>,
    /// Shared by every task, `threads_per_disk` threads for each disk.
    search_pool: rayon::ThreadPool,
    tasks: TaskRegistry,
    workers: WorkerCount,
    accelerator_passes: Mutex<HashMap<Uuid, Arc<Latch>>>,
    on_vanished: VanishedSink,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("tasks", &self.tasks.len())
            .field("workers", &self.workers.get())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(index: Arc<Index>, on_vanished: VanishedSink) -> Result<Self> {
        let disks = index.disks().ids().len().max(1);
        let threads = disks * index.settings().threads_per_disk;
        let search_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|n| format!("search-{n}"))
            .build()?;
        Ok(Self {
            index,
            search_pool,
            tasks: TaskRegistry::default(),
            workers: WorkerCount::default(),
            accelerator_passes: Mutex::new(HashMap::new()),
            on_vanished,
        })
    }

    pub fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }

    pub fn active_workers(&self) -> usize {
        self.workers.get()
    }

    /// Wait until no search worker is running. Returns whether that
    /// happened before `timeout`.
    pub fn wait_for_workers(&self, timeout: Duration) -> bool {
        self.workers.wait_idle(timeout)
    }

    pub fn stop_all(&self) {
        self.tasks.stop_all();
        if let Some(accel) = self.index.accelerator() {
            accel.device().stop_collecting();
        }
    }

    /// Parse `raw`, then reuse or create its task. A new task gets its fast
    /// bucket filled before this returns.
    pub fn prepare(self: &Arc<Self>, raw: &str) -> Result<Arc<SearchTask>> {
        let query = SearchQuery::parse(raw)?;
        let status = self.index.status();
        let serving = status.wait_until(WAIT_FOR_SERVING, |s| s.is_serving());

        let max_results = self.index.settings().max_results;
        let (task, created) = self.tasks.get_or_create(query, max_results);
        if !created {
            return Ok(task);
        }
        if !serving {
            tracing::warn!(
                status = ?status.get(),
                "index not serving, returning an empty task"
            );
            task.mark_running();
            task.mark_done();
            return Ok(task);
        }

        self.spawn_accelerator_pass(&task)?;
        std::thread::scope(|scope| {
            scope.spawn(|| self.search_frequent(&task));
            if let Some(folder) = &self.index.settings().priority_folder {
                scope.spawn(|| self.search_folder(&task, folder));
            }
        });
        task.mark_fast_done();
        Ok(task)
    }

    /// Prepare `raw` and start its shard scan in the background.
    pub fn start(self: &Arc<Self>, raw: &str) -> Result<Arc<SearchTask>> {
        let task = self.prepare(raw)?;
        if task.mark_running() {
            let scheduler = Arc::clone(self);
            let running = task.clone();
            std::thread::Builder::new()
                .name("search-coordinator".into())
                .spawn(move || scheduler.run(&running))?;
        }
        Ok(task)
    }

    /// Start `raw` and block until it finishes or `timeout` passes.
    pub fn search(
        self: &Arc<Self>,
        raw: &str,
        timeout: Duration,
    ) -> Result<Arc<SearchTask>> {
        let task = self.start(raw)?;
        if !task.wait_done(timeout) {
            task.stop();
            return Err(Error::Timeout("search"));
        }
        Ok(task)
    }

    // -- Fast bucket --

    /// Check `path` against the task's query and record a match in
    /// `bucket`. A vanished path is reported instead.
    fn offer(&self, task: &SearchTask, bucket: Bucket, path: &str) -> bool {
        match matcher::verdict(path, task.query()) {
            Verdict::Matched => task.add_result(bucket, path),
            Verdict::Vanished => {
                (self.on_vanished)(Vanished::Indexed(path.to_string()));
                false
            }
            Verdict::Rejected => false,
        }
    }

    /// Frequently used files first, then directories.
    fn search_frequent(&self, task: &SearchTask) {
        let mut dirs = Vec::new();
        for path in self.index.frequent().paths() {
            if task.should_stop() {
                return;
            }
            match std::fs::metadata(&path) {
                Err(_) => (self.on_vanished)(Vanished::Cached(path)),
                Ok(meta) if meta.is_dir() => dirs.push(path),
                Ok(_) => {
                    self.offer(task, Bucket::Fast, &path);
                }
            }
        }
        for dir in dirs {
            if task.should_stop() {
                return;
            }
            self.offer(task, Bucket::Fast, &dir);
        }
    }

    /// Breadth-first walk of `root`, files before directories, bounded by
    /// [`PRIORITY_FOLDER_BUDGET`].
    fn search_folder(&self, task: &SearchTask, root: &Path) {
        let deadline = Instant::now() + PRIORITY_FOLDER_BUDGET;
        let mut pending: VecDeque<PathBuf> = VecDeque::from([root.into()]);
        let mut dirs = Vec::new();
        while let Some(dir) = pending.pop_front() {
            if task.should_stop() || Instant::now() >= deadline {
                break;
            }
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if entry.file_type().is_ok_and(|t| t.is_dir()) {
                    dirs.push(path.clone());
                    pending.push_back(path);
                } else {
                    self.offer(task, Bucket::Fast, &path.to_string_lossy());
                }
            }
        }
        for dir in dirs {
            if task.should_stop() {
                break;
            }
            self.offer(task, Bucket::Fast, &dir.to_string_lossy());
        }
    }

    fn spawn_accelerator_pass(
        self: &Arc<Self>,
        task: &Arc<SearchTask>,
    ) -> Result<()> {
        if self.index.accelerator().is_none() || task.query().is_pattern() {
            return Ok(());
        }
        let latch = Arc::new(Latch::new(1));
        self.accelerator_passes
            .lock()
            .insert(task.id(), latch.clone());
        let scheduler = Arc::clone(self);
        let task = task.clone();
        std::thread::Builder::new()
            .name("accelerator-pass".into())
            .spawn(move || {
                scheduler.accelerator_pass(&task);
                latch.count_down();
            })?;
        Ok(())
    }

    fn accelerator_pass(&self, task: &SearchTask) {
        let Some(accel) = self.index.accelerator() else {
            return;
        };
        let Some(_gate) = accel.enter(GATE_TIMEOUT, || task.should_stop())
        else {
            return;
        };
        let device = accel.device();
        device.reset_results();
        let request = AcceleratorQuery {
            query: task.query(),
            max_results: task.max_results(),
            threads: self.index.settings().accelerator_threads,
        };
        let matched = match device.match_query(&request) {
            Ok(paths) => paths,
            Err(e) => {
                tracing::warn!(error = %e, "accelerator match failed");
                return;
            }
        };
        for path in matched {
            if task.should_stop() {
                break;
            }
            if std::fs::symlink_metadata(&path).is_err() {
                (self.on_vanished)(Vanished::Indexed(path));
            } else {
                task.add_result(Bucket::Full, &path);
            }
        }
    }

    // -- Shard scan --

    /// Jobs per disk: every priority from high to low, each over the shard
    /// the keywords hash to and then the weight order. Directory-only
    /// queries scan the directory priority alone.
    fn build_jobs(&self, query: &SearchQuery) -> Vec<Vec<ShardKey>> {
        let order = self.index.weights().scan_order_from(query.first_shard());
        let table = self.index.priorities();
        let priorities = if query.dirs_only() {
            vec![table.priority_of_suffix(DIR_SENTINEL)]
        } else {
            table.priorities()
        };
        self.index
            .disks()
            .ids()
            .into_iter()
            .map(|disk| {
                priorities
                    .iter()
                    .flat_map(|&priority| {
                        let disk = disk.clone();
                        order
                            .iter()
                            .map(move |&shard| {
                                ShardKey::new(disk.clone(), shard, priority)
                            })
                    })
                    .collect()
            })
            .collect()
    }

    /// Run every job of `task`, then mark it done.
    pub fn run(self: &Arc<Self>, task: &Arc<SearchTask>) {
        let jobs = self.build_jobs(task.query());
        let queues: Arc<Vec<Injector<ShardKey>>> = Arc::new(
            jobs.into_iter()
                .map(|keys| {
                    let queue = Injector::new();
                    for key in keys {
                        queue.push(key);
                    }
                    queue
                })
                .collect(),
        );
        let per_disk = self.index.settings().threads_per_disk;
        let latch = Arc::new(Latch::new(queues.len() * per_disk));

        for home in 0..queues.len() {
            for _ in 0..per_disk {
                self.workers.enter();
                let scheduler = Arc::clone(self);
                let task = task.clone();
                let queues = queues.clone();
                let latch = latch.clone();
                self.search_pool.spawn(move || {
                    while let Some(key) = next_job(&queues, home) {
                        if !task.should_stop() {
                            scheduler.run_job(&task, &key);
                        }
                    }
                    latch.count_down();
                    scheduler.workers.leave();
                });
            }
        }

        if !latch.wait(JOB_WAIT) {
            tracing::info!("search jobs still running, waiting longer");
            let secondary = self.index.settings().secondary_wait;
            if !self.workers.wait_idle(secondary) {
                tracing::warn!(task = %task.id(), "search workers timed out");
            }
        }
        let pass = self.accelerator_passes.lock().remove(&task.id());
        if let Some(pass) = pass {
            pass.wait(GATE_TIMEOUT);
        }
        if let Some(accel) = self.index.accelerator() {
            accel.device().stop_collecting();
        }
        task.mark_done();
        tracing::debug!(
            task = %task.id(),
            results = task.result_count(),
            "search done"
        );
    }

    fn run_job(&self, task: &SearchTask, key: &ShardKey) {
        let pattern = task.query().is_pattern();
        let accelerated = self.index.accelerator().filter(|_| !pattern);
        let matched = match accelerated {
            Some(accel) if accel.device().is_match_done(key) => {
                accel.device().matched_count(key)
            }
            _ if self.index.queue().counts().get_or_assume(key) == 0 => 0,
            _ => self.match_key(task, key),
        };
        self.index.record_weight(key.shard, matched);
    }

    /// Accelerator result if ready, else the memory tier, else the storage
    /// engine. Returns the number of matches found for `key`.
    fn match_key(&self, task: &SearchTask, key: &ShardKey) -> u64 {
        if task.should_stop() {
            return 0;
        }
        if let Some(accel) = self.index.accelerator()
            && !task.query().is_pattern()
            && accel.device().is_match_done(key)
        {
            return accel.device().matched_count(key);
        }

        let query = task.query();
        let cached = self.index.memory().filter(key, |path| {
            match matcher::verdict(path, query) {
                Verdict::Matched => true,
                Verdict::Vanished => {
                    (self.on_vanished)(Vanished::Indexed(path.to_string()));
                    false
                }
                Verdict::Rejected => false,
            }
        });
        if let Some(hits) = cached {
            for path in &hits {
                task.add_result(Bucket::Full, path);
            }
            return hits.len() as u64;
        }

        let pool = self.index.pool();
        let session = match pool.get(&key.disk) {
            Ok(session) => session,
            Err(e) => {
                tracing::debug!(%key, error = %e, "shard-group unavailable");
                return 0;
            }
        };
        let db_path = pool.db_path(&key.disk);
        let report = |path: &str| {
            (self.on_vanished)(Vanished::Indexed(path.to_string()));
        };
        let request = MatchRequest {
            db: &session,
            db_path: &db_path,
            key,
            query,
            max_results: task.max_results(),
            on_vanished: &report,
        };
        match self.index.matcher.match_key(&request) {
            Ok(Some(paths)) => {
                for path in &paths {
                    task.add_result(Bucket::Full, path);
                    if task.should_stop() {
                        break;
                    }
                }
                paths.len() as u64
            }
            Ok(None) => 0,
            Err(e) => {
                tracing::error!(%key, error = %e, "shard match failed");
                0
            }
        }
    }
}

/// Own queue first, then the others in turn.
fn next_job(queues: &[Injector<ShardKey>], home: usize) -> Option<ShardKey> {
    for offset in 0..queues.len() {
        let queue = &queues[(home + offset) % queues.len()];
        loop {
            match queue.steal() {
                Steal::Success(key) => return Some(key),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        accelerator::tests::FakeAccelerator,
        index::tests::{test_index, test_index_with},
        shard::DEFAULT_PRIORITY,
    };
    use std::sync::atomic::Ordering;

    fn sink() -> (Arc<Mutex<Vec<Vanished>>>, VanishedSink) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = seen.clone();
        let sink: VanishedSink =
            Arc::new(move |v| captured.lock().push(v));
        (seen, sink)
    }

    fn touch(dir: &Path, name: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, b"").unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn finds_inserted_file_and_forgets_deleted_one() {
        let files = tempfile::tempdir().unwrap();
        let (_tmp, index) = test_index(&[files.path()], |c| {
            c.search_thread_number = 2;
        });
        let index = Arc::new(index);
        let (_, sink) = sink();
        let scheduler = Arc::new(Scheduler::new(index.clone(), sink).unwrap());

        let path = touch(files.path(), "b.txt");
        index.add_path(&path);
        index.flush().unwrap();

        let task = scheduler.search("b", Duration::from_secs(10)).unwrap();
        assert_eq!(task.all_results(), vec![path.clone()]);

        std::fs::remove_file(&path).unwrap();
        index.remove_path(&path);
        index.flush().unwrap();
        scheduler.tasks().clear();
        let task = scheduler.search("b", Duration::from_secs(10)).unwrap();
        assert!(task.all_results().is_empty());
    }

    #[test]
    fn matches_feed_shard_weights() {
        let files = tempfile::tempdir().unwrap();
        let (_tmp, index) = test_index(&[files.path()], |_| {});
        let index = Arc::new(index);
        let (_, sink) = sink();
        let scheduler = Arc::new(Scheduler::new(index.clone(), sink).unwrap());

        // Nine names summing into shard 7 (700..800).
        let names: Vec<String> =
            (0..9).map(|i| format!("qqqqqq{i}")).collect();
        for name in &names {
            assert_eq!(crate::shard::shard_for(name), 7);
            index.add_path(&touch(files.path(), name));
        }
        index.flush().unwrap();
        assert_eq!(index.weights().get(7), 0);

        let task = scheduler.search("qqq", Duration::from_secs(10)).unwrap();
        assert_eq!(task.result_count(), 9);
        assert_eq!(index.weights().get(7), 5);
    }

    #[test]
    fn remembered_zero_skips_key() {
        let files = tempfile::tempdir().unwrap();
        let (_tmp, index) = test_index(&[files.path()], |_| {});
        let index = Arc::new(index);
        let (_, sink) = sink();
        let scheduler = Arc::new(Scheduler::new(index.clone(), sink).unwrap());

        let path = touch(files.path(), "zz");
        let (key, _) = index.locate(&path, false).unwrap();
        let session = index.pool().get(&key.disk).unwrap();
        crate::store::insert_rows(&session, &[(key.clone(), 0, path)])
            .unwrap();
        drop(session);
        index.queue().counts().set(key, 0);

        let task = scheduler.search("zz", Duration::from_secs(10)).unwrap();
        assert_eq!(task.result_count(), 0);
    }

    #[test]
    fn memory_tier_reports_vanished_paths() {
        let files = tempfile::tempdir().unwrap();
        let (_tmp, index) = test_index(&[files.path()], |c| {
            c.cache_band = (1, 10);
        });
        let index = Arc::new(index);
        let (seen, sink) = sink();
        let scheduler = Arc::new(Scheduler::new(index.clone(), sink).unwrap());

        let live = touch(files.path(), "keep.txt");
        let (key, _) = index.locate(&live, false).unwrap();
        let gone = files.path().join("kept.txt").to_string_lossy().into_owned();
        assert!(
            index
                .memory()
                .try_cache(key, vec![live.clone(), gone.clone()])
        );

        let task = scheduler.search("kee|f", Duration::from_secs(10)).unwrap();
        assert_eq!(task.all_results(), vec![live]);
        let task = scheduler.search("kept", Duration::from_secs(10)).unwrap();
        assert!(task.all_results().is_empty());
        assert!(seen.lock().contains(&Vanished::Indexed(gone)));
    }

    #[test]
    fn storage_fallback_reports_vanished_rows() {
        let files = tempfile::tempdir().unwrap();
        let (_tmp, index) = test_index(&[files.path()], |_| {});
        let index = Arc::new(index);
        let (seen, sink) = sink();
        let scheduler = Arc::new(Scheduler::new(index.clone(), sink).unwrap());

        let gone = touch(files.path(), "stale.txt");
        index.add_path(&gone);
        index.flush().unwrap();
        std::fs::remove_file(&gone).unwrap();

        let task = scheduler.search("stale", Duration::from_secs(10)).unwrap();
        assert!(task.all_results().is_empty());
        assert_eq!(*seen.lock(), vec![Vanished::Indexed(gone)]);
    }

    #[test]
    fn fast_bucket_from_frequent_and_priority_folder() {
        let files = tempfile::tempdir().unwrap();
        let favorites = files.path().join("fav");
        std::fs::create_dir(&favorites).unwrap();
        let nested = favorites.join("deep");
        std::fs::create_dir(&nested).unwrap();
        let folder_hit = touch(&nested, "plan.doc");
        let cached_hit = touch(files.path(), "plan.txt");
        let folder = favorites.clone();
        let (_tmp, index) = test_index(&[files.path()], |c| {
            c.priority_folder = Some(folder);
        });
        index.frequent().record_use(&cached_hit);
        index.frequent().record_use("/no/such/plan");
        let index = Arc::new(index);
        let (seen, sink) = sink();
        let scheduler = Arc::new(Scheduler::new(index.clone(), sink).unwrap());

        let task = scheduler.prepare("plan").unwrap();
        assert!(task.is_fast_done());
        let mut fast = task.page(Bucket::Fast, 0).data;
        fast.sort();
        let mut expected = vec![folder_hit, cached_hit];
        expected.sort();
        assert_eq!(fast, expected);
        assert!(
            seen.lock()
                .contains(&Vanished::Cached("/no/such/plan".to_string()))
        );
    }

    #[test]
    fn directory_queries_scan_directory_priority_only() {
        let files = tempfile::tempdir().unwrap();
        let (_tmp, index) = test_index(&[files.path()], |_| {});
        let index = Arc::new(index);
        let (_, sink) = sink();
        let scheduler = Scheduler::new(index, sink).unwrap();

        let dirs = scheduler.build_jobs(&SearchQuery::parse("x|d").unwrap());
        assert_eq!(dirs.len(), 1);
        assert_eq!(dirs[0].len(), crate::shard::SHARD_COUNT);
        assert!(dirs[0].iter().all(|k| k.priority == -1));

        let all = scheduler.build_jobs(&SearchQuery::parse("b.txt").unwrap());
        assert_eq!(all[0].len(), 2 * crate::shard::SHARD_COUNT);
        assert_eq!(all[0][0], ShardKey::new(all[0][0].disk.clone(), 4, 0));
        assert_eq!(all[0][0].priority, DEFAULT_PRIORITY);
    }

    #[test]
    fn accelerator_counts_short_circuit() {
        let files = tempfile::tempdir().unwrap();
        let hit = touch(files.path(), "gpu.bin");
        let fake = Arc::new(FakeAccelerator::default());
        fake.matches.lock().push(hit.clone());
        let (_tmp, index) =
            test_index_with(&[files.path()], |_| {}, Some(fake.clone()));
        let (_, sink) = sink();
        let scheduler =
            Arc::new(Scheduler::new(Arc::new(index), sink).unwrap());

        let task = scheduler.search("gpu", Duration::from_secs(10)).unwrap();
        assert_eq!(task.all_results(), vec![hit]);
        assert!(fake.stop_calls.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn searches_share_one_worker_pool() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let (_tmp, index) = test_index(&[a.path(), b.path()], |c| {
            c.search_thread_number = 2;
        });
        let index = Arc::new(index);
        let first = touch(a.path(), "shared.txt");
        let second = touch(b.path(), "shared.md");
        index.add_path(&first);
        index.add_path(&second);
        index.flush().unwrap();
        let (_, sink) = sink();
        let scheduler = Arc::new(Scheduler::new(index, sink).unwrap());
        assert_eq!(scheduler.search_pool.current_num_threads(), 4);

        for query in ["shared", "shared|f", "share"] {
            let task =
                scheduler.search(query, Duration::from_secs(10)).unwrap();
            let mut results = task.all_results();
            results.sort();
            let mut expected = vec![first.clone(), second.clone()];
            expected.sort();
            assert_eq!(results, expected, "query {query}");
        }
        assert!(scheduler.wait_for_workers(Duration::from_secs(5)));
        assert_eq!(scheduler.search_pool.current_num_threads(), 4);
    }

    #[test]
    fn worker_drain_wait() {
        let counter = WorkerCount::default();
        assert!(counter.wait_idle(Duration::from_millis(1)));
        counter.enter();
        assert!(!counter.wait_idle(Duration::from_millis(10)));
        counter.leave();
        assert!(counter.wait_idle(Duration::from_millis(1)));
    }
}
