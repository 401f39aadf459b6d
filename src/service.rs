//! The long-lived index service.
//!
//! [`Service`] owns the index, the scheduler, the event bus and the disk
//! monitors, and runs the background loops that flush writes, refresh the
//! cache tiers and keep monitors alive. It also drives the two maintenance
//! sequences: a full rebuild served from a snapshot, and compaction.

use std::{
    path::Path,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use crate::{
    accelerator::{Accelerator, INVALID_SWEEP_INTERVAL},
    config::Config,
    data_dir::DataDir,
    dataset::{self, CreateDates},
    error::{Error, Result},
    event_bus::{Event, EventBus, Registry},
    events::{EventKind, IndexEvent, Reply},
    index::Index,
    matcher::{PathMatcher, StoreMatcher},
    pool::{CACHE_GROUP, ConnectionPool, IntegrityLog, WEIGHT_GROUP},
    scanner::{ProcessScanner, ScanRequest, VolumeScanner, WalkScanner},
    scheduler::{Scheduler, Vanished, VanishedSink},
    shard::{DEFAULT_PRIORITY, DEFAULT_SENTINEL, DIR_PRIORITY, DIR_SENTINEL},
    state::{DatabaseStatus, StopSignal},
    store::{self, Statement},
    task::{Bucket, Page, SearchTask},
    command_queue::Command,
    watcher::{DiskMonitors, FileWatcher, QueueWatcher},
};

const FLUSH_POLL: Duration = Duration::from_millis(100);
const CACHE_REFRESH_DELAY: Duration = Duration::from_secs(10);
const CACHE_REFRESH_INTERVAL: Duration = Duration::from_secs(10 * 60);
/// How often the refresh loop looks for a finished rebuild.
const CACHE_REFRESH_POLL: Duration = Duration::from_secs(1);
const RECONCILE_INTERVAL: Duration = Duration::from_secs(1);
const TASK_PURGE_INTERVAL: Duration = Duration::from_secs(1);
/// Bound on flushing leftover writes before a rebuild.
const DRAIN_WRITES_TIMEOUT: Duration = Duration::from_secs(3);
/// Bound on search workers draining before the cutover.
const WORKER_DRAIN_TIMEOUT: Duration = Duration::from_secs(60);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);
const EXCLUSIVE_TIMEOUT: Duration = Duration::from_secs(30);

/// The pluggable parts of a service.
pub struct Collaborators {
    pub scanner: Arc<dyn VolumeScanner>,
    pub watcher: Arc<dyn FileWatcher>,
    pub matcher: Arc<dyn PathMatcher>,
    pub accelerator: Option<Arc<dyn Accelerator>>,
}

impl Collaborators {
    /// The in-process defaults: the configured scanner executable or the
    /// walker, a queue-fed watcher, the store matcher and no accelerator.
    pub fn from_config(config: &Config) -> Self {
        let scanner: Arc<dyn VolumeScanner> = match &config.scanner {
            Some(exe) => Arc::new(ProcessScanner::new(exe)),
            None => Arc::new(WalkScanner),
        };
        Self {
            scanner,
            watcher: Arc::new(QueueWatcher::new()),
            matcher: Arc::new(StoreMatcher),
            accelerator: None,
        }
    }

    pub fn with_watcher(mut self, watcher: Arc<dyn FileWatcher>) -> Self {
        self.watcher = watcher;
        self
    }

    pub fn with_scanner(mut self, scanner: Arc<dyn VolumeScanner>) -> Self {
        self.scanner = scanner;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub status: DatabaseStatus,
    pub disks: Vec<String>,
    pub pending_writes: usize,
    pub tasks: usize,
    pub active_workers: usize,
    pub memory_cache_used: usize,
    pub memory_cache_budget: usize,
    pub frequent_paths: usize,
    pub accelerator: bool,
    pub suffixes: Vec<(String, i32)>,
    pub weights: Vec<(u8, u64)>,
}

pub struct Service {
    config: Config,
    data_dir: DataDir,
    index: Arc<Index>,
    scheduler: Arc<Scheduler>,
    bus: EventBus<IndexEvent>,
    monitors: DiskMonitors,
    scanner: Arc<dyn VolumeScanner>,
    dates: CreateDates,
    stop: Arc<StopSignal>,
    /// Raised at cutover so the cache tiers are rebuilt without waiting for
    /// the next periodic refresh.
    index_updated: AtomicBool,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("data_dir", &self.data_dir.root())
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

impl Service {
    /// Open the dataset under `data_dir`, start the event bus, the
    /// background loops and the disk monitors.
    pub fn open(
        data_dir: DataDir,
        config: Config,
        parts: Collaborators,
    ) -> Result<Arc<Self>> {
        let pool = Arc::new(ConnectionPool::new(
            config.advanced.connection_idle_timeout(),
        ));
        let integrity = IntegrityLog::new(data_dir.integrity_file());
        pool.init(&data_dir.dataset_dir()?, &integrity)?;
        for group in pool.malformed_groups() {
            tracing::warn!(group, "malformed shard-group removed");
        }

        let accelerator = parts
            .accelerator
            .filter(|_| config.enable_accelerator)
            .filter(|accel| accel.is_available())
            .and_then(|accel| {
                match accel.set_device(&config.accelerator_device) {
                    Ok(()) => Some(accel),
                    Err(e) => {
                        tracing::warn!(error = %e, "accelerator disabled");
                        None
                    }
                }
            });
        let index = Arc::new(Index::new(
            &config,
            pool.clone(),
            integrity,
            parts.matcher,
            accelerator,
        ));
        index.ensure_tables();
        index.flush()?;
        index.load_weights()?;
        index.load_priorities()?;
        index.load_frequent()?;
        index.flush()?;

        let bus = EventBus::new(config.max_event_retries);
        let scheduler =
            Arc::new(Scheduler::new(index.clone(), vanished_sink(&bus))?);
        let monitors = DiskMonitors::new(parts.watcher, bus.clone());
        let stop = Arc::new(StopSignal::new());
        let service = Arc::new(Self {
            dates: CreateDates::new(data_dir.create_time_file()),
            config,
            data_dir,
            index,
            scheduler,
            bus,
            monitors,
            scanner: parts.scanner,
            stop,
            index_updated: AtomicBool::new(false),
            background: Mutex::new(Vec::new()),
        });

        service
            .bus
            .start(registry(&service)?, service.config.event_workers)?;
        service.spawn_background(&pool)?;
        service.start_monitors();
        tracing::info!(
            disks = ?service.index.disks().ids(),
            "index service started"
        );
        Ok(service)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn index(&self) -> &Arc<Index> {
        &self.index
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn bus(&self) -> &EventBus<IndexEvent> {
        &self.bus
    }

    pub fn status(&self) -> DatabaseStatus {
        self.index.status().get()
    }

    /// Whether the dataset looks empty enough to need a rebuild.
    pub fn needs_rebuild(&self) -> bool {
        dataset::is_damaged(self.index.pool(), &self.index.disks().ids())
    }

    fn start_monitors(&self) {
        if let Err(e) = self.monitors.start(&self.index.disks().roots()) {
            tracing::error!(error = %e, "failed to start disk monitors");
        }
    }

    // -- Searching --

    pub fn prepare_search(&self, raw: &str) -> Result<Arc<SearchTask>> {
        self.scheduler.prepare(raw)
    }

    pub fn start_search(&self, raw: &str) -> Result<Arc<SearchTask>> {
        self.scheduler.start(raw)
    }

    pub fn search(
        &self,
        raw: &str,
        timeout: Duration,
    ) -> Result<Arc<SearchTask>> {
        self.scheduler.search(raw, timeout)
    }

    pub fn stop_search(&self) {
        self.scheduler.stop_all();
    }

    pub fn results(
        &self,
        id: &Uuid,
        bucket: Bucket,
        start_index: usize,
    ) -> Option<Page> {
        self.scheduler.tasks().results(id, bucket, start_index)
    }

    // -- Writes --

    pub fn add_path(&self, path: &str) -> bool {
        self.index.add_path(path)
    }

    pub fn remove_path(&self, path: &str) -> bool {
        self.index.remove_path(path)
    }

    fn enqueue_cache(&self, statement: Statement) -> bool {
        self.index
            .queue()
            .enqueue(Command::new(CACHE_GROUP, statement))
    }

    /// Count a use of `path` among the frequently used paths. The least used
    /// entry makes room once the limit is reached.
    pub fn add_to_cache(&self, path: &str) -> bool {
        let frequent = self.index.frequent();
        let evicted = frequent.record_use(path);
        if self.status() == DatabaseStatus::Snapshot {
            return false;
        }
        if let Some(victim) = evicted {
            self.enqueue_cache(Statement::DeleteCache {
                path: victim.clone(),
            });
            self.enqueue_cache(Statement::DeleteStatistics { path: victim });
        }
        let queued = self.enqueue_cache(Statement::InsertCache {
            path: path.to_string(),
        });
        self.enqueue_cache(Statement::BumpStatistics {
            path: path.to_string(),
        });
        if frequent.count(path).is_some_and(store::statistics_near_max) {
            frequent.halve();
            self.enqueue_cache(Statement::HalveStatistics);
        }
        queued
    }

    pub fn remove_from_cache(&self, path: &str) -> bool {
        self.index.frequent().remove(path);
        if self.status() == DatabaseStatus::Snapshot {
            return false;
        }
        self.enqueue_cache(Statement::DeleteStatistics {
            path: path.to_string(),
        });
        self.enqueue_cache(Statement::DeleteCache {
            path: path.to_string(),
        })
    }

    pub fn frequently_used(&self, n: usize) -> Vec<String> {
        self.index.frequent().top(n)
    }

    pub fn flush(&self) -> Result<()> {
        let report = self.index.flush()?;
        if !report.failed_groups.is_empty() {
            tracing::warn!(
                groups = ?report.failed_groups,
                "flush failed for some shard-groups"
            );
        }
        Ok(())
    }

    // -- Suffix priorities --

    pub fn suffixes(&self) -> Vec<(String, i32)> {
        self.index.priorities().entries().to_vec()
    }

    /// Apply queued suffix changes now and re-read the table.
    fn reload_suffixes(&self) -> Result<()> {
        self.flush()?;
        self.index.load_priorities()
    }

    pub fn add_suffix(&self, suffix: &str, priority: i32) -> Result<bool> {
        if self.status() == DatabaseStatus::Snapshot {
            return Ok(false);
        }
        let queued = self.enqueue_cache(Statement::SetSuffix {
            suffix: suffix.to_lowercase(),
            priority,
        });
        self.reload_suffixes()?;
        Ok(queued)
    }

    /// Sentinels cannot be deleted.
    pub fn delete_suffix(&self, suffix: &str) -> Result<bool> {
        if self.status() == DatabaseStatus::Snapshot
            || suffix == DIR_SENTINEL
            || suffix == DEFAULT_SENTINEL
        {
            return Ok(false);
        }
        let queued = self.enqueue_cache(Statement::DeleteSuffix {
            suffix: suffix.to_lowercase(),
        });
        self.reload_suffixes()?;
        Ok(queued)
    }

    pub fn update_suffix(
        &self,
        old_suffix: &str,
        suffix: &str,
        priority: i32,
    ) -> Result<bool> {
        if self.status() == DatabaseStatus::Snapshot {
            return Ok(false);
        }
        self.delete_suffix(old_suffix)?;
        self.add_suffix(suffix, priority)
    }

    /// Remove every suffix and put the two sentinels back.
    pub fn clear_suffixes(&self) -> Result<bool> {
        if self.status() == DatabaseStatus::Snapshot {
            return Ok(false);
        }
        let queued = self.enqueue_cache(Statement::ClearSuffixes);
        for (suffix, priority) in [
            (DEFAULT_SENTINEL, DEFAULT_PRIORITY),
            (DIR_SENTINEL, DIR_PRIORITY),
        ] {
            self.enqueue_cache(Statement::SetSuffix {
                suffix: suffix.to_string(),
                priority,
            });
        }
        self.reload_suffixes()?;
        Ok(queued)
    }

    // -- Maintenance --

    /// Wait for running search workers, bounded by `timeout`, then flush.
    /// Writes are already refused, so one flush empties the queue.
    fn drain_writes(&self, timeout: Duration) {
        if !self.scheduler.wait_for_workers(timeout) {
            tracing::warn!("search workers still running before rebuild");
        }
        if let Err(e) = self.flush() {
            tracing::error!(error = %e, "flush before rebuild failed");
        }
    }

    fn compact(&self, groups: &[String]) {
        for group in groups {
            let pool = self.index.pool();
            let compacted = pool.with_exclusive(group, EXCLUSIVE_TIMEOUT, |db| {
                Ok(db.compact()?)
            });
            match compacted {
                Ok(changed) => tracing::debug!(group, changed, "compacted"),
                Err(e) => tracing::error!(group, error = %e, "compact failed"),
            }
        }
    }

    /// Rescan every volume. Queries are served from a snapshot of the
    /// current dataset while the scanner writes the live files.
    pub fn update_index(&self, drop_previous: bool) -> Result<()> {
        let status = self.index.status();
        status.transition(DatabaseStatus::Normal, DatabaseStatus::Rebuilding)?;
        tracing::info!(drop_previous, "rebuilding index");
        self.monitors.stop();
        self.scheduler.stop_all();
        self.drain_writes(DRAIN_WRITES_TIMEOUT);

        let data = self.data_dir.dataset_dir()?;
        if let Err(e) = self.enter_snapshot(&data, drop_previous) {
            tracing::error!(error = %e, "cannot serve from snapshot");
            self.reopen(&data)?;
            status.transition(status.get(), DatabaseStatus::Normal)?;
            self.start_monitors();
            return Err(e);
        }

        let disks = self.index.disks().ids();
        match dataset::prune(&data, &disks, &self.dates, drop_previous) {
            Ok(dropped) if !dropped.is_empty() => {
                tracing::info!(?dropped, "previous datasets dropped");
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "dataset pruning failed"),
        }

        let roots = self.index.disks().roots();
        let ignore = self.config.ignore_paths_lowercase();
        let priorities = self.index.priorities();
        let request = ScanRequest {
            roots: &roots,
            output: &data,
            ignore: &ignore,
            disks: self.index.disks(),
            priorities: &priorities,
        };
        let scanned = self.scanner.scan(&request);
        if let Err(e) = &scanned {
            tracing::error!(error = %e, "volume scan failed");
        }

        self.cut_over(&data)?;
        tracing::info!("index rebuilt");
        scanned
    }

    /// Copy the dataset aside and point the pool at the copy.
    fn enter_snapshot(&self, data: &Path, drop_previous: bool) -> Result<()> {
        if !drop_previous {
            self.compact(&self.index.disks().ids());
        }
        let pool = self.index.pool();
        if let Err(e) = pool.close_all(CLOSE_TIMEOUT) {
            tracing::warn!(error = %e, "closing connections for snapshot");
        }
        let snapshot = self.data_dir.snapshot_dir()?;
        let copied = dataset::copy_dataset(data, &snapshot)?;
        pool.init(&snapshot, &self.index.integrity)?;
        self.index.status().transition(
            DatabaseStatus::Rebuilding,
            DatabaseStatus::Snapshot,
        )?;
        tracing::info!(copied, "serving from snapshot");
        Ok(())
    }

    fn reopen(&self, data: &Path) -> Result<()> {
        let pool = self.index.pool();
        if let Err(e) = pool.close_all(CLOSE_TIMEOUT) {
            tracing::warn!(error = %e, "connections still busy at cutover");
        }
        self.index.invalidate_caches();
        pool.init(data, &self.index.integrity)
    }

    /// Swap the rebuilt files in. Writes queued against the snapshot are
    /// discarded.
    fn cut_over(&self, data: &Path) -> Result<()> {
        let status = self.index.status();
        self.scheduler.stop_all();
        let resumed = status.compare_and_set(
            DatabaseStatus::Snapshot,
            DatabaseStatus::Rebuilding,
        );
        if !resumed {
            tracing::warn!(status = ?status.get(), "cutover outside snapshot");
        }
        if !self.scheduler.wait_for_workers(WORKER_DRAIN_TIMEOUT) {
            tracing::warn!("search workers still running at cutover");
        }
        let discarded = self.index.queue().clear();
        if discarded > 0 {
            tracing::info!(discarded, "discarded writes queued on snapshot");
        }
        self.reopen(data)?;

        self.index.ensure_tables();
        self.index.flush()?;
        self.index.load_weights()?;
        self.index.load_priorities()?;
        self.index.load_frequent()?;
        self.index.flush()?;
        self.scheduler.tasks().clear();

        self.index_updated.store(true, Ordering::Release);
        status.transition(DatabaseStatus::Rebuilding, DatabaseStatus::Normal)?;
        self.start_monitors();
        Ok(())
    }

    /// Compact every shard-group. Ignored while serving from a snapshot.
    pub fn optimize(&self) -> Result<bool> {
        let status = self.index.status();
        if status.get() == DatabaseStatus::Snapshot {
            return Ok(false);
        }
        self.flush()?;
        status.transition(DatabaseStatus::Normal, DatabaseStatus::Compacting)?;
        let mut groups = self.index.disks().ids();
        groups.push(CACHE_GROUP.to_string());
        groups.push(WEIGHT_GROUP.to_string());
        self.compact(&groups);
        status.transition(DatabaseStatus::Compacting, DatabaseStatus::Normal)?;
        Ok(true)
    }

    pub fn report(&self) -> StatusReport {
        StatusReport {
            status: self.status(),
            disks: self.index.disks().ids(),
            pending_writes: self.index.queue().len(),
            tasks: self.scheduler.tasks().len(),
            active_workers: self.scheduler.active_workers(),
            memory_cache_used: self.index.memory().used(),
            memory_cache_budget: self.index.memory().budget(),
            frequent_paths: self.index.frequent().len(),
            accelerator: self.index.accelerator().is_some(),
            suffixes: self.suffixes(),
            weights: self.index.weights().snapshot(),
        }
    }

    // -- Events --

    fn handle(&self, message: &IndexEvent) -> Result<Option<Reply>> {
        let reply = match message {
            IndexEvent::PrepareSearch { query } => {
                Some(self.prepare_search(query)?)
            }
            IndexEvent::StartSearch { query } => {
                Some(self.start_search(query)?)
            }
            IndexEvent::StopSearch => {
                self.stop_search();
                None
            }
            IndexEvent::AddPath(path) => {
                self.add_path(path);
                None
            }
            IndexEvent::RemovePath(path) => {
                self.remove_path(path);
                None
            }
            IndexEvent::AddToCache(path) => {
                self.add_to_cache(path);
                None
            }
            IndexEvent::RemoveFromCache(path) => {
                self.remove_from_cache(path);
                None
            }
            IndexEvent::UpdateIndex { drop_previous } => {
                self.update_index(*drop_previous)?;
                None
            }
            IndexEvent::Optimize => {
                self.optimize()?;
                None
            }
            IndexEvent::AddSuffix { suffix, priority } => {
                self.add_suffix(suffix, *priority)?;
                None
            }
            IndexEvent::DeleteSuffix { suffix } => {
                self.delete_suffix(suffix)?;
                None
            }
            IndexEvent::UpdateSuffix {
                old_suffix,
                suffix,
                priority,
            } => {
                self.update_suffix(old_suffix, suffix, *priority)?;
                None
            }
            IndexEvent::ClearSuffixes => {
                self.clear_suffixes()?;
                None
            }
            IndexEvent::Close => None,
        };
        Ok(reply)
    }

    /// Publish a rebuild. It runs once; a rebuild already in progress makes
    /// it fail instead of being retried.
    pub fn request_update(
        &self,
        drop_previous: bool,
    ) -> Arc<Event<IndexEvent>> {
        let message = IndexEvent::UpdateIndex { drop_previous };
        self.bus.submit(Event::new(message).max_retries(0))
    }

    /// Shut the bus down, stop every background loop and monitor, flush
    /// what is pending and close the connections.
    pub fn close(&self) -> Result<()> {
        self.bus.publish(IndexEvent::Close);
        self.bus.join();
        self.stop.stop();
        let handles: Vec<JoinHandle<()>> =
            self.background.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("background loop panicked");
            }
        }
        self.monitors.stop();
        if self.status().accepts_writes() {
            self.flush()?;
        }
        self.index.pool().close_all(CLOSE_TIMEOUT)
    }

    // -- Background loops --

    fn spawn_background(
        self: &Arc<Self>,
        pool: &Arc<ConnectionPool>,
    ) -> Result<()> {
        let quiet = self.index.settings().quiet_interval;
        let restart = self
            .config
            .advanced
            .restart_monitor_disk_timeout()
            .max(Duration::from_secs(1));
        let mut handles = vec![pool.spawn_idle_reaper(self.stop.clone())?];

        handles.push(self.spawn_loop(
            "flush",
            Duration::ZERO,
            FLUSH_POLL,
            move |service| {
                if service.index.queue().should_flush(quiet)
                    && let Err(e) = service.flush()
                {
                    tracing::error!(error = %e, "flush failed");
                }
            },
        )?);

        let next_refresh = Mutex::new(Instant::now() + CACHE_REFRESH_DELAY);
        handles.push(self.spawn_loop(
            "cache-refresh",
            Duration::ZERO,
            CACHE_REFRESH_POLL,
            move |service| {
                let status = service.index.status();
                if !status.get().is_serving() {
                    return;
                }
                let updated =
                    service.index_updated.swap(false, Ordering::AcqRel);
                let mut next = next_refresh.lock();
                if !updated && Instant::now() < *next {
                    return;
                }
                let stop = &service.stop;
                let stopped =
                    || stop.is_stopped() || !status.get().is_serving();
                match service.index.refresh_caches(stopped) {
                    Ok(()) if updated => {
                        tracing::debug!("cache tiers rebuilt after cutover");
                    }
                    Ok(()) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "cache refresh failed");
                    }
                }
                *next = Instant::now() + CACHE_REFRESH_INTERVAL;
            },
        )?);

        handles.push(self.spawn_loop(
            "task-purge",
            TASK_PURGE_INTERVAL,
            TASK_PURGE_INTERVAL,
            |service| {
                let purged = service.scheduler.tasks().purge();
                if purged > 0 {
                    tracing::trace!(purged, "idle tasks purged");
                }
            },
        )?);

        handles.push(self.spawn_loop(
            "monitor-restart",
            restart,
            restart,
            |service| {
                if service.status() != DatabaseStatus::Normal {
                    return;
                }
                let roots = service.index.disks().roots();
                if let Err(e) = service.monitors.restart(&roots) {
                    tracing::error!(error = %e, "disk monitor restart failed");
                }
            },
        )?);

        if self.index.accelerator().is_some() {
            handles.push(self.spawn_loop(
                "accelerator-reconcile",
                RECONCILE_INTERVAL,
                RECONCILE_INTERVAL,
                |service| {
                    let Some(accel) = service.index.accelerator() else {
                        return;
                    };
                    if service.status() != DatabaseStatus::Normal
                        || !service.index.queue().is_empty()
                        || !accel.has_pending()
                    {
                        return;
                    }
                    let report = accel.reconcile();
                    tracing::trace!(?report, "accelerator reconciled");
                },
            )?);
            handles.push(self.spawn_loop(
                "accelerator-sweep",
                INVALID_SWEEP_INTERVAL,
                INVALID_SWEEP_INTERVAL,
                |service| {
                    if let Some(accel) = service.index.accelerator() {
                        accel.sweep_invalid();
                    }
                },
            )?);
        }

        self.background.lock().extend(handles);
        Ok(())
    }

    /// Run `tick` every `interval` after `delay`, until stopped or the
    /// service is dropped.
    fn spawn_loop(
        self: &Arc<Self>,
        name: &str,
        delay: Duration,
        interval: Duration,
        tick: impl Fn(&Service) + Send + 'static,
    ) -> Result<JoinHandle<()>> {
        let service = Arc::downgrade(self);
        let stop = self.stop.clone();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                if stop.wait_timeout(delay) {
                    return;
                }
                loop {
                    match service.upgrade() {
                        Some(service) => tick(&service),
                        None => return,
                    }
                    if stop.wait_timeout(interval) {
                        return;
                    }
                }
            })?;
        Ok(handle)
    }
}

/// Vanished search hits become removal events.
fn vanished_sink(bus: &EventBus<IndexEvent>) -> VanishedSink {
    let bus = bus.clone();
    Arc::new(move |vanished| {
        let message = match vanished {
            Vanished::Indexed(path) => IndexEvent::RemovePath(path),
            Vanished::Cached(path) => IndexEvent::RemoveFromCache(path),
        };
        bus.publish(message);
    })
}

const HANDLED: [EventKind; 13] = [
    EventKind::PrepareSearch,
    EventKind::StartSearch,
    EventKind::StopSearch,
    EventKind::AddPath,
    EventKind::RemovePath,
    EventKind::AddToCache,
    EventKind::RemoveFromCache,
    EventKind::UpdateIndex,
    EventKind::Optimize,
    EventKind::AddSuffix,
    EventKind::DeleteSuffix,
    EventKind::UpdateSuffix,
    EventKind::ClearSuffixes,
];

fn registry(service: &Arc<Service>) -> Result<Registry<IndexEvent>> {
    let mut registry = Registry::new();
    for kind in HANDLED {
        let service: Weak<Service> = Arc::downgrade(service);
        registry.handler(kind, move |event| match service.upgrade() {
            Some(service) => service.handle(event.message()),
            None => Err(Error::BusClosed),
        })?;
    }
    let service = Arc::downgrade(service);
    registry.listener(EventKind::Close, move |_| {
        if let Some(service) = service.upgrade() {
            service.scheduler.stop_all();
            service.stop.stop();
        }
    });
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::DEFAULT_AWAIT_TIMEOUT;

    fn test_service(
        roots: &[&Path],
    ) -> (tempfile::TempDir, Arc<QueueWatcher>, Arc<Service>) {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = DataDir::resolve(Some(tmp.path())).unwrap();
        let config = Config {
            disks: roots.iter().map(|r| r.to_path_buf()).collect(),
            update_time_limit_secs: 1,
            event_workers: 2,
            ..Config::default()
        };
        let watcher = Arc::new(QueueWatcher::new());
        let parts =
            Collaborators::from_config(&config).with_watcher(watcher.clone());
        let service = Service::open(data_dir, config, parts).unwrap();
        (tmp, watcher, service)
    }

    fn touch(dir: &Path, name: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, b"").unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn watched_changes_reach_the_index() {
        let files = tempfile::tempdir().unwrap();
        let (_tmp, watcher, service) = test_service(&[files.path()]);
        let path = touch(files.path(), "watched.txt");

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !watcher.notify_added(&path) {
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(10));
        }
        while service.index().queue().is_empty()
            && std::time::Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(10));
        }
        service.flush().unwrap();
        let task = service.search("watched", Duration::from_secs(10)).unwrap();
        assert_eq!(task.all_results(), vec![path]);
        service.close().unwrap();
    }

    #[test]
    fn suffix_crud_keeps_sentinels() {
        let (_tmp, _, service) = test_service(&[]);
        assert!(service.add_suffix("TXT", 5).unwrap());
        assert!(service.suffixes().contains(&("txt".to_string(), 5)));
        assert!(!service.delete_suffix(DIR_SENTINEL).unwrap());

        service.update_suffix("txt", "md", 3).unwrap();
        let suffixes = service.suffixes();
        assert!(!suffixes.iter().any(|(s, _)| s == "txt"));
        assert!(suffixes.contains(&("md".to_string(), 3)));

        service.clear_suffixes().unwrap();
        let mut suffixes = service.suffixes();
        suffixes.sort();
        assert_eq!(
            suffixes,
            vec![
                (DEFAULT_SENTINEL.to_string(), DEFAULT_PRIORITY),
                (DIR_SENTINEL.to_string(), DIR_PRIORITY),
            ]
        );
        service.close().unwrap();
    }

    #[test]
    fn cache_table_evicts_least_used() {
        let files = tempfile::tempdir().unwrap();
        let (_tmp, _, service) = test_service(&[files.path()]);
        let a = touch(files.path(), "a.txt");
        service.add_to_cache(&a);
        service.add_to_cache(&a);
        service.flush().unwrap();

        let session = service.index().pool().get(CACHE_GROUP).unwrap();
        let rows = store::cached_paths(&session).unwrap();
        drop(session);
        assert_eq!(rows, vec![(a.clone(), 2)]);
        assert_eq!(service.frequently_used(5), vec![a.clone()]);

        service.remove_from_cache(&a);
        service.flush().unwrap();
        let session = service.index().pool().get(CACHE_GROUP).unwrap();
        assert!(store::cached_paths(&session).unwrap().is_empty());
        drop(session);
        service.close().unwrap();
    }

    #[test]
    fn rebuild_cuts_over_to_scanned_dataset() {
        let files = tempfile::tempdir().unwrap();
        let (_tmp, _, service) = test_service(&[files.path()]);
        let path = touch(files.path(), "scanned.log");

        let event = service.request_update(false);
        let failed = event.await_finished(DEFAULT_AWAIT_TIMEOUT);
        assert!(!failed, "{:?}", event.error());
        assert_eq!(service.status(), DatabaseStatus::Normal);

        let task = service.search("scanned", Duration::from_secs(10)).unwrap();
        assert_eq!(task.all_results(), vec![path]);

        assert!(service.optimize().unwrap());
        assert_eq!(service.status(), DatabaseStatus::Normal);
        service.close().unwrap();
    }

    #[test]
    fn rebuild_refused_outside_normal() {
        let (_tmp, _, service) = test_service(&[]);
        service
            .index()
            .status()
            .transition(DatabaseStatus::Normal, DatabaseStatus::Compacting)
            .unwrap();
        let err = service.update_index(false).unwrap_err();
        assert!(matches!(err, Error::StateTransition { .. }));
        assert!(!service.add_path("/x/y"));
        service
            .index()
            .status()
            .transition(DatabaseStatus::Compacting, DatabaseStatus::Normal)
            .unwrap();
        service.close().unwrap();
    }
}
