//! Per-query search tasks and their registry.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::query::SearchQuery;

/// Tasks not touched within this window are reissued and purged.
pub const TASK_VALIDITY: Duration = Duration::from_secs(10);
pub const MAX_TASKS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Created,
    Running,
    Done,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Running,
            _ => Self::Done,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
    /// Cache and priority-folder hits, available before any shard scan.
    Fast,
    /// Shard scan hits, streamed as jobs finish.
    #[default]
    Full,
}

/// One page of results, read from `start_index` onward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page {
    pub uuid: Uuid,
    pub data: Vec<String>,
    pub next_index: usize,
    pub is_done: bool,
}

pub struct SearchTask {
    id: Uuid,
    query: SearchQuery,
    key: String,
    max_results: usize,
    seen: Mutex<HashSet<String>>,
    fast: Mutex<Vec<String>>,
    full: Mutex<Vec<String>>,
    result_count: AtomicUsize,
    stopped: AtomicBool,
    fast_done: AtomicBool,
    state: AtomicU8,
    state_lock: Mutex<()>,
    finished: Condvar,
    created: Instant,
    last_touch: Mutex<Instant>,
}

impl std::fmt::Debug for SearchTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchTask")
            .field("id", &self.id)
            .field("query", &self.query.raw)
            .field("state", &self.state())
            .field("results", &self.result_count())
            .finish_non_exhaustive()
    }
}

impl SearchTask {
    pub fn new(query: SearchQuery, max_results: usize) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            key: query.normalized_key(),
            query,
            max_results,
            seen: Mutex::new(HashSet::new()),
            fast: Mutex::new(Vec::new()),
            full: Mutex::new(Vec::new()),
            result_count: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
            fast_done: AtomicBool::new(false),
            state: AtomicU8::new(0),
            state_lock: Mutex::new(()),
            finished: Condvar::new(),
            created: now,
            last_touch: Mutex::new(now),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn query(&self) -> &SearchQuery {
        &self.query
    }

    pub fn normalized_key(&self) -> &str {
        &self.key
    }

    pub fn max_results(&self) -> usize {
        self.max_results
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// `Created -> Running`. Returns false when the task already started.
    pub fn mark_running(&self) -> bool {
        self.state
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn mark_done(&self) {
        let _guard = self.state_lock.lock();
        self.state.store(2, Ordering::Release);
        self.fast_done.store(true, Ordering::Release);
        self.finished.notify_all();
    }

    pub fn is_done(&self) -> bool {
        self.state() == TaskState::Done
    }

    /// Block until done or `timeout` passes. Returns whether it finished.
    pub fn wait_done(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.state_lock.lock();
        while !self.is_done() {
            if self.finished.wait_until(&mut guard, deadline).timed_out() {
                return self.is_done();
            }
        }
        true
    }

    pub fn mark_fast_done(&self) {
        self.fast_done.store(true, Ordering::Release);
    }

    pub fn is_fast_done(&self) -> bool {
        self.fast_done.load(Ordering::Acquire)
    }

    /// Advisory: workers check it between iterations.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stopped, or the result cap is reached.
    pub fn should_stop(&self) -> bool {
        self.is_stopped() || self.result_count() >= self.max_results
    }

    pub fn result_count(&self) -> usize {
        self.result_count.load(Ordering::Acquire)
    }

    pub fn touch(&self) {
        *self.last_touch.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_touch.lock().elapsed()
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Record a hit in `bucket` unless it is a duplicate or the cap is
    /// reached. Returns whether it was added.
    pub fn add_result(&self, bucket: Bucket, path: &str) -> bool {
        let max = self.max_results;
        let reserved = self.result_count.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |n| (n < max).then_some(n + 1),
        );
        if reserved.is_err() {
            return false;
        }
        if !self.seen.lock().insert(path.to_string()) {
            self.result_count.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        let target = match bucket {
            Bucket::Fast => &self.fast,
            Bucket::Full => &self.full,
        };
        target.lock().push(path.to_string());
        true
    }

    pub fn contains(&self, path: &str) -> bool {
        self.seen.lock().contains(path)
    }

    pub fn page(&self, bucket: Bucket, start_index: usize) -> Page {
        self.touch();
        let (results, is_done) = match bucket {
            Bucket::Fast => (&self.fast, self.is_fast_done()),
            Bucket::Full => (&self.full, self.is_done()),
        };
        let results = results.lock();
        let start = start_index.min(results.len());
        Page {
            uuid: self.id,
            data: results[start..].to_vec(),
            next_index: results.len(),
            is_done,
        }
    }

    /// Fast bucket first, then the full scan, in insertion order.
    pub fn all_results(&self) -> Vec<String> {
        let mut out = self.fast.lock().clone();
        out.extend(self.full.lock().iter().cloned());
        out
    }
}

#[derive(Debug)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<Uuid, Arc<SearchTask>>>,
    validity: Duration,
    limit: usize,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new(TASK_VALIDITY, MAX_TASKS)
    }
}

impl TaskRegistry {
    pub fn new(validity: Duration, limit: usize) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            validity,
            limit: limit.max(1),
        }
    }

    /// Reuse a live task for the same normalized query, or register a new
    /// one. Returns the task and whether it was created.
    pub fn get_or_create(
        &self,
        query: SearchQuery,
        max_results: usize,
    ) -> (Arc<SearchTask>, bool) {
        let key = query.normalized_key();
        let mut tasks = self.tasks.lock();
        self.purge_locked(&mut tasks);

        if let Some(task) = tasks.values().find(|t| {
            t.normalized_key() == key
                && !t.is_stopped()
                && t.idle_for() < self.validity
        }) {
            task.touch();
            return (task.clone(), false);
        }

        while tasks.len() >= self.limit {
            let Some(oldest) = tasks
                .values()
                .max_by_key(|t| t.idle_for())
                .map(|t| t.id())
            else {
                break;
            };
            if let Some(task) = tasks.remove(&oldest) {
                task.stop();
            }
        }

        let task = Arc::new(SearchTask::new(query, max_results));
        tasks.insert(task.id(), task.clone());
        (task, true)
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<SearchTask>> {
        self.tasks.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tasks(&self) -> Vec<Arc<SearchTask>> {
        self.tasks.lock().values().cloned().collect()
    }

    pub fn results(
        &self,
        id: &Uuid,
        bucket: Bucket,
        start_index: usize,
    ) -> Option<Page> {
        self.get(id).map(|t| t.page(bucket, start_index))
    }

    pub fn stop_all(&self) {
        for task in self.tasks.lock().values() {
            task.stop();
        }
    }

    /// Drop tasks idle past the validity window. Returns how many went.
    pub fn purge(&self) -> usize {
        let mut tasks = self.tasks.lock();
        self.purge_locked(&mut tasks)
    }

    fn purge_locked(
        &self,
        tasks: &mut HashMap<Uuid, Arc<SearchTask>>,
    ) -> usize {
        let before = tasks.len();
        tasks.retain(|_, task| {
            let keep = task.idle_for() < self.validity;
            if !keep {
                task.stop();
            }
            keep
        });
        before - tasks.len()
    }

    pub fn clear(&self) {
        self.stop_all();
        self.tasks.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(raw: &str) -> SearchQuery {
        SearchQuery::parse(raw).unwrap()
    }

    #[test]
    fn results_are_deduplicated_and_capped() {
        let task = SearchTask::new(q("x"), 3);
        assert!(task.add_result(Bucket::Fast, "/a"));
        assert!(!task.add_result(Bucket::Full, "/a"));
        assert!(task.add_result(Bucket::Full, "/b"));
        assert!(task.add_result(Bucket::Full, "/c"));
        assert!(!task.add_result(Bucket::Full, "/d"));
        assert!(task.should_stop());
        assert_eq!(task.all_results(), vec!["/a", "/b", "/c"]);
    }

    #[test]
    fn concurrent_hits_never_exceed_the_cap() {
        let task = SearchTask::new(q("x"), 50);
        std::thread::scope(|s| {
            for worker in 0..8 {
                let task = &task;
                s.spawn(move || {
                    for i in 0..100 {
                        let path = format!("/{worker}/{i}");
                        task.add_result(Bucket::Full, &path);
                        // Duplicates give their reserved slot back.
                        task.add_result(Bucket::Full, &path);
                    }
                });
            }
        });
        assert_eq!(task.all_results().len(), 50);
        assert_eq!(task.result_count(), 50);
    }

    #[test]
    fn pages_follow_cursor() {
        let task = SearchTask::new(q("x"), 10);
        task.add_result(Bucket::Full, "/a");
        task.add_result(Bucket::Full, "/b");

        let page = task.page(Bucket::Full, 0);
        assert_eq!(page.data, vec!["/a", "/b"]);
        assert_eq!(page.next_index, 2);
        assert!(!page.is_done);

        task.add_result(Bucket::Full, "/c");
        task.mark_done();
        let page = task.page(Bucket::Full, page.next_index);
        assert_eq!(page.data, vec!["/c"]);
        assert!(page.is_done);

        let past_end = task.page(Bucket::Full, 99);
        assert!(past_end.data.is_empty());
        assert_eq!(past_end.next_index, 3);
    }

    #[test]
    fn lifecycle() {
        let task = SearchTask::new(q("x"), 10);
        assert_eq!(task.state(), TaskState::Created);
        assert!(task.mark_running());
        assert!(!task.mark_running());
        assert!(!task.wait_done(Duration::from_millis(10)));
        task.mark_done();
        assert!(task.wait_done(Duration::from_millis(10)));
        assert!(task.is_fast_done());
    }

    #[test]
    fn identical_query_reuses_task_within_window() {
        let registry = TaskRegistry::new(Duration::from_millis(100), 8);
        let (a, created) = registry.get_or_create(q("foo|d;case"), 10);
        assert!(created);
        let (b, created) = registry.get_or_create(q("foo|case;d"), 10);
        assert!(!created);
        assert_eq!(a.id(), b.id());

        std::thread::sleep(Duration::from_millis(150));
        let (c, created) = registry.get_or_create(q("foo|d;case"), 10);
        assert!(created);
        assert_ne!(a.id(), c.id());
        assert!(a.is_stopped());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn stopped_task_is_not_reused() {
        let registry = TaskRegistry::default();
        let (a, _) = registry.get_or_create(q("foo"), 10);
        registry.stop_all();
        let (b, created) = registry.get_or_create(q("foo"), 10);
        assert!(created);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn cap_evicts_least_recently_touched() {
        let registry = TaskRegistry::new(TASK_VALIDITY, 2);
        let (a, _) = registry.get_or_create(q("a"), 10);
        std::thread::sleep(Duration::from_millis(5));
        let (b, _) = registry.get_or_create(q("b"), 10);
        std::thread::sleep(Duration::from_millis(5));
        a.touch();
        let (c, _) = registry.get_or_create(q("c"), 10);

        assert_eq!(registry.len(), 2);
        assert!(registry.get(&a.id()).is_some());
        assert!(registry.get(&b.id()).is_none());
        assert!(registry.get(&c.id()).is_some());
        assert!(b.is_stopped());
    }

    #[test]
    fn results_by_id() {
        let registry = TaskRegistry::default();
        let (task, _) = registry.get_or_create(q("a"), 10);
        task.add_result(Bucket::Fast, "/fast");
        let page = registry.results(&task.id(), Bucket::Fast, 0).unwrap();
        assert_eq!(page.uuid, task.id());
        assert_eq!(page.data, vec!["/fast"]);
        assert!(registry.results(&Uuid::new_v4(), Bucket::Fast, 0).is_none());
    }
}
