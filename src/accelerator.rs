//! Optional external accelerator tier.
//!
//! No device ships with the crate; [`Accelerator`] is the call shape a GPU
//! (or other bulk) matcher plugs into. [`AcceleratorCache`] owns everything
//! the core does on its side of that boundary: pending adds and removes held
//! back from the hot write path, the set of keys found inconsistent after a
//! flush, and the single-flight gate for match passes.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::{error::Result, query::SearchQuery, shard::ShardKey};

/// New keys are only cached while device memory usage is below this.
pub const CREATE_CACHE_THRESHOLD: u8 = 50;
/// At or above this usage every accelerator cache is dropped.
pub const FREE_CACHE_THRESHOLD: u8 = 70;
/// Removals for a key are held until this many are pending.
pub const REMOVE_BATCH_THRESHOLD: usize = 100;
pub const INVALID_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);
/// How long a new task waits for the previous match pass to vacate.
pub const GATE_TIMEOUT: Duration = Duration::from_secs(3);

const GATE_POLL: Duration = Duration::from_millis(20);

pub struct AcceleratorQuery<'a> {
    pub query: &'a SearchQuery,
    pub max_results: usize,
    pub threads: usize,
}

pub trait Accelerator: Send + Sync {
    fn is_available(&self) -> bool;
    fn set_device(&self, device: &str) -> Result<()>;

    /// Match every cached key; per-key completion is reported through
    /// [`is_match_done`](Self::is_match_done).
    fn match_query(
        &self,
        request: &AcceleratorQuery<'_>,
    ) -> Result<Vec<String>>;
    fn is_match_done(&self, key: &ShardKey) -> bool;
    fn matched_count(&self, key: &ShardKey) -> u64;
    fn reset_results(&self);
    fn stop_collecting(&self);

    fn init_cache(&self, key: &ShardKey, paths: &[String]) -> Result<()>;
    fn add_records(&self, key: &ShardKey, paths: &[String]) -> Result<()>;
    fn remove_records(&self, key: &ShardKey, paths: &[String]) -> Result<()>;
    fn clear_cache(&self, key: &ShardKey);
    fn clear_all(&self);
    fn has_cache(&self, key: &ShardKey) -> bool;
    fn has_any_cache(&self) -> bool;
    fn is_cache_valid(&self, key: &ShardKey) -> bool;
    fn memory_usage_percent(&self) -> u8;
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: usize,
    pub removed: usize,
    pub invalidated: usize,
}

type Pending = Mutex<HashMap<ShardKey, HashSet<String>>>;

pub struct AcceleratorCache {
    device: Arc<dyn Accelerator>,
    to_add: Pending,
    to_remove: Pending,
    invalid: Mutex<HashSet<ShardKey>>,
    gate: Mutex<bool>,
    gate_free: Condvar,
}

impl std::fmt::Debug for AcceleratorCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcceleratorCache")
            .field("pending_adds", &self.to_add.lock().len())
            .field("pending_removes", &self.to_remove.lock().len())
            .field("invalid", &self.invalid.lock().len())
            .finish_non_exhaustive()
    }
}

/// Held while a match pass runs; dropping it opens the gate.
pub struct GateGuard<'a> {
    cache: &'a AcceleratorCache,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        *self.cache.gate.lock() = false;
        self.cache.gate_free.notify_one();
    }
}

impl AcceleratorCache {
    pub fn new(device: Arc<dyn Accelerator>) -> Self {
        Self {
            device,
            to_add: Mutex::new(HashMap::new()),
            to_remove: Mutex::new(HashMap::new()),
            invalid: Mutex::new(HashSet::new()),
            gate: Mutex::new(false),
            gate_free: Condvar::new(),
        }
    }

    pub fn device(&self) -> &Arc<dyn Accelerator> {
        &self.device
    }

    /// Whether `key` is served by the accelerator right now.
    pub fn serves(&self, key: &ShardKey) -> bool {
        self.device.has_cache(key) && self.device.is_cache_valid(key)
    }

    pub fn record_add(&self, key: &ShardKey, path: &str) {
        if !self.device.has_cache(key) {
            return;
        }
        if let Some(removes) = self.to_remove.lock().get_mut(key) {
            removes.remove(path);
        }
        self.to_add
            .lock()
            .entry(key.clone())
            .or_default()
            .insert(path.to_string());
    }

    pub fn record_remove(&self, key: &ShardKey, path: &str) {
        if !self.device.has_cache(key) {
            return;
        }
        if let Some(adds) = self.to_add.lock().get_mut(key) {
            adds.remove(path);
        }
        self.to_remove
            .lock()
            .entry(key.clone())
            .or_default()
            .insert(path.to_string());
    }

    pub fn has_pending(&self) -> bool {
        let nonempty = |p: &Pending| p.lock().values().any(|s| !s.is_empty());
        nonempty(&self.to_add) || nonempty(&self.to_remove)
    }

    /// `(adds, removes)` waiting for `key`.
    pub fn pending_for(&self, key: &ShardKey) -> (usize, usize) {
        let len = |p: &Pending| p.lock().get(key).map_or(0, HashSet::len);
        (len(&self.to_add), len(&self.to_remove))
    }

    /// Push pending changes to the device. Adds always go; removals for a
    /// key wait until [`REMOVE_BATCH_THRESHOLD`] have accumulated. The caller
    /// decides whether the system is idle enough to call this.
    pub fn reconcile(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let adds: Vec<(ShardKey, Vec<String>)> = self
            .to_add
            .lock()
            .drain()
            .filter(|(_, paths)| !paths.is_empty())
            .map(|(key, paths)| (key, paths.into_iter().collect()))
            .collect();
        for (key, paths) in adds {
            match self.device.add_records(&key, &paths) {
                Ok(()) => report.added += paths.len(),
                Err(e) => {
                    tracing::warn!(%key, error = %e, "accelerator add failed");
                }
            }
            report.invalidated += usize::from(self.check_consistent(&key));
        }

        let removes: Vec<(ShardKey, Vec<String>)> = {
            let mut pending = self.to_remove.lock();
            let ready: Vec<ShardKey> = pending
                .iter()
                .filter(|(_, paths)| paths.len() >= REMOVE_BATCH_THRESHOLD)
                .map(|(key, _)| key.clone())
                .collect();
            ready
                .into_iter()
                .filter_map(|key| {
                    let paths = pending.remove(&key)?;
                    Some((key, paths.into_iter().collect()))
                })
                .collect()
        };
        for (key, paths) in removes {
            match self.device.remove_records(&key, &paths) {
                Ok(()) => report.removed += paths.len(),
                Err(e) => {
                    tracing::warn!(
                        %key,
                        error = %e,
                        "accelerator remove failed"
                    );
                }
            }
            report.invalidated += usize::from(self.check_consistent(&key));
        }
        report
    }

    /// Marks `key` invalid when the device disagrees with itself. Returns
    /// whether it was newly marked.
    fn check_consistent(&self, key: &ShardKey) -> bool {
        if self.device.has_cache(key) && !self.device.is_cache_valid(key) {
            return self.invalid.lock().insert(key.clone());
        }
        false
    }

    pub fn invalid_keys(&self) -> Vec<ShardKey> {
        self.invalid.lock().iter().cloned().collect()
    }

    /// Ask the device to drop every key found inconsistent.
    pub fn sweep_invalid(&self) -> usize {
        let keys: Vec<ShardKey> = self.invalid.lock().drain().collect();
        for key in &keys {
            tracing::debug!(%key, "dropping invalid accelerator cache");
            self.device.clear_cache(key);
        }
        keys.len()
    }

    /// Cache large keys, in preference order, while device memory stays
    /// under [`CREATE_CACHE_THRESHOLD`].
    pub fn fill(
        &self,
        candidates: &[(ShardKey, u64)],
        mut load: impl FnMut(&ShardKey) -> Result<Vec<String>>,
        should_stop: impl Fn() -> bool,
    ) -> Result<usize> {
        if self.device.memory_usage_percent() >= CREATE_CACHE_THRESHOLD {
            return Ok(0);
        }
        let mut created = 0;
        for (key, _) in candidates {
            if self.device.has_cache(key) {
                continue;
            }
            let paths = load(key)?;
            self.device.init_cache(key, &paths)?;
            created += 1;
            if should_stop()
                || self.device.memory_usage_percent() > CREATE_CACHE_THRESHOLD
            {
                break;
            }
        }
        Ok(created)
    }

    /// Drop all device caches once usage reaches [`FREE_CACHE_THRESHOLD`].
    pub fn relieve_pressure(&self) -> bool {
        if self.device.memory_usage_percent() < FREE_CACHE_THRESHOLD
            || !self.device.has_any_cache()
        {
            return false;
        }
        tracing::info!("accelerator memory high, clearing its caches");
        self.clear();
        true
    }

    pub fn clear(&self) {
        self.device.clear_all();
        self.to_add.lock().clear();
        self.to_remove.lock().clear();
        self.invalid.lock().clear();
    }

    /// Enter the single-flight gate. Any running pass is told to stop
    /// collecting; `None` when it does not vacate within `timeout` or
    /// `should_stop` turns true first.
    pub fn enter(
        &self,
        timeout: Duration,
        should_stop: impl Fn() -> bool,
    ) -> Option<GateGuard<'_>> {
        self.device.stop_collecting();
        let deadline = Instant::now() + timeout;
        let mut busy = self.gate.lock();
        while *busy {
            if should_stop() {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!("previous accelerator pass did not finish");
                return None;
            }
            let slice = GATE_POLL.min(deadline - now);
            self.gate_free.wait_for(&mut busy, slice);
        }
        *busy = true;
        Some(GateGuard { cache: self })
    }
}
