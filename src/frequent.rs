//! Frequently used paths with their use counts.
//!
//! This is the in-memory side of the `cache` shard-group; the service mirrors
//! every change into the command queue.

use std::collections::HashMap;

use parking_lot::RwLock;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Loaded {
    /// Paths whose count was not positive and was reset to 1.
    pub reset: Vec<String>,
    /// Some count is close to overflowing; all should be halved.
    pub needs_halving: bool,
}

#[derive(Debug)]
pub struct FrequentPaths {
    counts: RwLock<HashMap<String, u32>>,
    limit: usize,
}

impl FrequentPaths {
    pub fn new(limit: usize) -> Self {
        Self {
            counts: RwLock::new(HashMap::new()),
            limit: limit.max(1),
        }
    }

    /// Replace the contents with persisted `(path, count)` rows.
    pub fn load(
        &self,
        rows: impl IntoIterator<Item = (String, u32)>,
    ) -> Loaded {
        let mut loaded = Loaded::default();
        let mut counts = self.counts.write();
        counts.clear();
        for (path, count) in rows {
            let count = if count == 0 {
                loaded.reset.push(path.clone());
                1
            } else {
                count
            };
            if crate::store::statistics_near_max(count) {
                loaded.needs_halving = true;
            }
            counts.insert(path, count);
        }
        loaded
    }

    pub fn len(&self) -> usize {
        self.counts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, path: &str) -> bool {
        self.counts.read().contains_key(path)
    }

    pub fn count(&self, path: &str) -> Option<u32> {
        self.counts.read().get(path).copied()
    }

    /// Count a use of `path`. When a new path would push the set past its
    /// limit the least used entry is evicted and returned.
    pub fn record_use(&self, path: &str) -> Option<String> {
        let mut counts = self.counts.write();
        if let Some(count) = counts.get_mut(path) {
            *count = count.saturating_add(1);
            return None;
        }
        let evicted = if counts.len() >= self.limit {
            counts
                .iter()
                .min_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)))
                .map(|(p, _)| p.clone())
        } else {
            None
        };
        if let Some(victim) = &evicted {
            counts.remove(victim);
        }
        counts.insert(path.to_string(), 1);
        evicted
    }

    pub fn remove(&self, path: &str) -> bool {
        self.counts.write().remove(path).is_some()
    }

    pub fn halve(&self) {
        for count in self.counts.write().values_mut() {
            *count = (*count / 2).max(1);
        }
    }

    pub fn paths(&self) -> Vec<String> {
        self.counts.read().keys().cloned().collect()
    }

    /// The `n` most used paths that are still regular files.
    pub fn top(&self, n: usize) -> Vec<String> {
        let mut ranked: Vec<(String, u32)> = self
            .counts
            .read()
            .iter()
            .map(|(p, c)| (p.clone(), *c))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked
            .into_iter()
            .map(|(p, _)| p)
            .filter(|p| std::fs::metadata(p).is_ok_and(|m| m.is_file()))
            .take(n)
            .collect()
    }
}
