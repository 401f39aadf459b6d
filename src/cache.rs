//! In-process memory tier.
//!
//! Small shard keys (row count inside the configured band) are materialized
//! as path sets, all counted against one global record budget. A key whose
//! set could not absorb a write is marked lost and reads as a miss until the
//! next refresh replaces it.

use std::{
    collections::{HashMap, HashSet},
    ops::RangeInclusive,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use parking_lot::RwLock;
use rayon::prelude::*;

use crate::{error::Result, shard::ShardKey};

pub const DEFAULT_RECORD_BUDGET: usize = 51_200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    NotCached,
    Valid,
    /// A write could not be applied; treat as a miss until refreshed.
    Stale,
}

#[derive(Debug, Default)]
struct CacheEntry {
    paths: RwLock<HashSet<String>>,
    file_lost: AtomicBool,
}

impl CacheEntry {
    fn is_valid(&self) -> bool {
        !self.file_lost.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RefreshReport {
    pub cached: usize,
    pub evicted: usize,
}

#[derive(Debug)]
pub struct MemoryCache {
    entries: RwLock<HashMap<ShardKey, Arc<CacheEntry>>>,
    budget: usize,
    used: AtomicUsize,
    band: RangeInclusive<usize>,
}

impl MemoryCache {
    pub fn new(budget: usize, band: RangeInclusive<usize>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            budget,
            used: AtomicUsize::new(0),
            band,
        }
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Records currently counted against the budget.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// Whether a key with `rows` rows belongs in this tier.
    pub fn qualifies(&self, rows: u64) -> bool {
        usize::try_from(rows).is_ok_and(|r| self.band.contains(&r))
    }

    /// Upper end of the band; larger keys belong to the accelerator tier.
    pub fn band_max(&self) -> usize {
        *self.band.end()
    }

    fn reserve(&self, n: usize) -> bool {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                let next = used.checked_add(n)?;
                (next <= self.budget).then_some(next)
            })
            .is_ok()
    }

    fn release(&self, n: usize) {
        let _ = self.used.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |used| Some(used.saturating_sub(n)),
        );
    }

    pub fn state(&self, key: &ShardKey) -> CacheState {
        match self.entries.read().get(key) {
            None => CacheState::NotCached,
            Some(entry) if entry.is_valid() => CacheState::Valid,
            Some(_) => CacheState::Stale,
        }
    }

    pub fn is_valid(&self, key: &ShardKey) -> bool {
        self.state(key) == CacheState::Valid
    }

    pub fn keys(&self) -> Vec<ShardKey> {
        self.entries.read().keys().cloned().collect()
    }

    /// Materialize `paths` for `key`. A key outside the band is ignored; one
    /// that does not fit the remaining budget is recorded as stale. Returns
    /// whether the set is now cached.
    pub fn try_cache(&self, key: ShardKey, paths: Vec<String>) -> bool {
        if !self.qualifies(paths.len() as u64) {
            return false;
        }
        self.evict(&key);
        let paths: HashSet<String> = paths.into_iter().collect();
        let entry = CacheEntry {
            paths: RwLock::new(HashSet::new()),
            file_lost: AtomicBool::new(false),
        };
        let fits = self.reserve(paths.len());
        if fits {
            *entry.paths.write() = paths;
        } else {
            tracing::debug!(%key, rows = paths.len(), "cache budget exceeded");
            entry.file_lost.store(true, Ordering::Release);
        }
        self.entries.write().insert(key, Arc::new(entry));
        fits
    }

    /// Mirror an insert into a valid cached set.
    pub fn on_insert(&self, key: &ShardKey, path: &str) {
        let Some(entry) = self.entries.read().get(key).cloned() else {
            return;
        };
        if !entry.is_valid() {
            return;
        }
        let mut paths = entry.paths.write();
        if paths.contains(path) {
            return;
        }
        if self.reserve(1) {
            paths.insert(path.to_string());
        } else {
            entry.file_lost.store(true, Ordering::Release);
        }
    }

    /// Mirror a delete into a cached set.
    pub fn on_delete(&self, key: &ShardKey, path: &str) {
        let Some(entry) = self.entries.read().get(key).cloned() else {
            return;
        };
        if entry.paths.write().remove(path) {
            self.release(1);
        }
    }

    /// Drop `key` and return its records to the budget.
    pub fn evict(&self, key: &ShardKey) -> bool {
        let Some(entry) = self.entries.write().remove(key) else {
            return false;
        };
        self.release(entry.paths.read().len());
        true
    }

    pub fn clear(&self) {
        let drained: Vec<Arc<CacheEntry>> =
            self.entries.write().drain().map(|(_, e)| e).collect();
        for entry in drained {
            self.release(entry.paths.read().len());
        }
    }

    /// Run `f` over a valid cached set in parallel, keeping the paths it
    /// accepts. `None` when the key is not served from memory.
    pub fn filter(
        &self,
        key: &ShardKey,
        f: impl Fn(&str) -> bool + Sync,
    ) -> Option<Vec<String>> {
        let entry = self.entries.read().get(key).cloned()?;
        if !entry.is_valid() {
            return None;
        }
        let paths = entry.paths.read();
        Some(paths.par_iter().filter(|p| f(p)).cloned().collect())
    }

    /// Rebuild membership from `candidates`, given in preference order with
    /// their row counts. Keys no longer listed, and stale keys, are evicted
    /// first; candidates are then loaded until the budget runs out.
    pub fn refresh(
        &self,
        candidates: &[(ShardKey, u64)],
        mut load: impl FnMut(&ShardKey) -> Result<Vec<String>>,
        should_stop: impl Fn() -> bool,
    ) -> Result<RefreshReport> {
        let mut report = RefreshReport::default();
        let wanted: HashSet<&ShardKey> =
            candidates.iter().map(|(k, _)| k).collect();
        for key in self.keys() {
            if !wanted.contains(&key) || self.state(&key) == CacheState::Stale
            {
                self.evict(&key);
                report.evicted += 1;
            }
        }

        for (key, rows) in candidates {
            if should_stop() {
                break;
            }
            if self.is_valid(key) || !self.qualifies(*rows) {
                continue;
            }
            if self.used() as u64 + rows > self.budget as u64 {
                continue;
            }
            let paths = load(key)?;
            if self.try_cache(key.clone(), paths) {
                report.cached += 1;
            }
        }
        Ok(report)
    }
}
