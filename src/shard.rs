//! Shard addressing, suffix priorities and adaptive shard weights.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    path::Path,
    sync::atomic::{AtomicU64, Ordering},
};

/// Shards per disk: `list0` through `list40`.
pub const SHARD_COUNT: usize = 41;
const MAX_SHARD: u32 = SHARD_COUNT as u32 - 1;

/// Per-scan weight increment cap.
pub const MAX_WEIGHT_STEP: u64 = 5;
/// Weights are halved once any of them passes this mark.
pub const WEIGHT_HIGH_WATER: u64 = 100_000_000;

pub const DIR_SENTINEL: &str = "dirPriority";
pub const DEFAULT_SENTINEL: &str = "defaultPriority";
pub const DIR_PRIORITY: i32 = -1;
pub const DEFAULT_PRIORITY: i32 = 0;

/// Sum of the UTF-8 bytes of `s`.
pub fn utf8_sum(s: &str) -> u32 {
    s.bytes().map(u32::from).sum()
}

/// Shard holding rows whose file name sums to `sum`.
pub fn shard_of_sum(sum: u32) -> u8 {
    (sum / 100).min(MAX_SHARD) as u8
}

pub fn shard_for(name: &str) -> u8 {
    shard_of_sum(utf8_sum(name))
}

pub fn table_name(shard: u8) -> String {
    format!("list{shard}")
}

fn is_separator(c: char) -> bool {
    c == '/' || c == '\\'
}

/// Final component of `path`, accepting either separator.
pub fn file_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches(is_separator);
    match trimmed.rfind(is_separator) {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

/// Everything before the final component, without the trailing separator.
pub fn parent_path(path: &str) -> &str {
    let trimmed = path.trim_end_matches(is_separator);
    match trimmed.rfind(is_separator) {
        Some(idx) => &trimmed[..idx],
        None => "",
    }
}

/// Lowercased text after the last `.` of the whole path. A path with no dot
/// in its file name yields a string containing a separator.
pub fn suffix_of(path: &str) -> String {
    match path.rfind('.') {
        Some(idx) => path[idx + 1..].to_lowercase(),
        None => path.to_lowercase(),
    }
}

/// Identifier of the shard-group backing the volume at `root`.
///
/// `C:\` becomes `C`; POSIX roots become their sanitized path.
pub fn disk_id(root: &Path) -> String {
    let text = root.to_string_lossy();
    let bytes = text.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return (bytes[0] as char).to_ascii_uppercase().to_string();
    }
    let sanitized: Vec<&str> =
        text.split(is_separator).filter(|s| !s.is_empty()).collect();
    if sanitized.is_empty() {
        "root".to_string()
    } else {
        sanitized.join("_")
    }
}

/// Maps paths onto the configured volume roots.
#[derive(Debug, Clone, Default)]
pub struct Disks {
    roots: Vec<(String, String)>,
}

impl Disks {
    pub fn new<P: AsRef<Path>>(roots: &[P]) -> Self {
        let mut roots: Vec<(String, String)> = roots
            .iter()
            .map(|r| {
                let r = r.as_ref();
                (r.to_string_lossy().into_owned(), disk_id(r))
            })
            .collect();
        // Longest prefix wins.
        roots.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self { roots }
    }

    pub fn ids(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.roots
            .iter()
            .filter(|(_, id)| seen.insert(id.clone()))
            .map(|(_, id)| id.clone())
            .collect()
    }

    pub fn roots(&self) -> Vec<String> {
        self.roots.iter().map(|(root, _)| root.clone()).collect()
    }

    /// Disk id owning `path`: the longest configured root prefixing it, or
    /// the first character when no root matches.
    pub fn disk_of(&self, path: &str) -> Option<String> {
        if let Some((_, id)) =
            self.roots.iter().find(|(root, _)| is_under(path, root))
        {
            return Some(id.clone());
        }
        path.chars().next().map(|c| c.to_ascii_uppercase().to_string())
    }
}

/// Whether `path` is `root` itself or lies below it.
pub fn is_under(path: &str, root: &str) -> bool {
    let Some(rest) = path.strip_prefix(root) else {
        return false;
    };
    rest.is_empty()
        || root.ends_with(is_separator)
        || rest.starts_with(is_separator)
}

/// One `(disk, shard, priority)` partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardKey {
    pub disk: String,
    pub shard: u8,
    pub priority: i32,
}

impl ShardKey {
    pub fn new(disk: impl Into<String>, shard: u8, priority: i32) -> Self {
        Self {
            disk: disk.into(),
            shard,
            priority,
        }
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},list{},{}", self.disk, self.shard, self.priority)
    }
}

/// The suffix → priority table, kept sorted by descending priority.
#[derive(Debug, Clone)]
pub struct SuffixPriorities {
    entries: Vec<(String, i32)>,
    by_suffix: HashMap<String, i32>,
}

impl Default for SuffixPriorities {
    fn default() -> Self {
        Self::from_entries([
            (DEFAULT_SENTINEL.to_string(), DEFAULT_PRIORITY),
            (DIR_SENTINEL.to_string(), DIR_PRIORITY),
        ])
    }
}

impl SuffixPriorities {
    pub fn from_entries(
        entries: impl IntoIterator<Item = (String, i32)>,
    ) -> Self {
        let mut entries: Vec<(String, i32)> = entries.into_iter().collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        let by_suffix = entries.iter().cloned().collect();
        Self { entries, by_suffix }
    }

    pub fn entries(&self) -> &[(String, i32)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Distinct priorities, highest first.
    pub fn priorities(&self) -> Vec<i32> {
        let mut out: Vec<i32> = Vec::new();
        for &(_, p) in &self.entries {
            if out.last() != Some(&p) {
                out.push(p);
            }
        }
        out
    }

    pub fn priority_of_suffix(&self, suffix: &str) -> i32 {
        if let Some(&p) = self.by_suffix.get(suffix) {
            return p;
        }
        let sentinel = if suffix.contains(is_separator) {
            DIR_SENTINEL
        } else {
            DEFAULT_SENTINEL
        };
        match self.by_suffix.get(sentinel) {
            Some(&p) => p,
            None if sentinel == DIR_SENTINEL => DIR_PRIORITY,
            None => DEFAULT_PRIORITY,
        }
    }

    pub fn priority_for_path(&self, path: &str) -> i32 {
        self.priority_of_suffix(&suffix_of(path))
    }

    /// Priority for a path whose type is already known.
    pub fn priority_for(&self, path: &str, is_dir: bool) -> i32 {
        if is_dir {
            self.priority_of_suffix(DIR_SENTINEL)
        } else {
            self.priority_for_path(path)
        }
    }
}

/// Per-shard usage weights. They only decide scan order.
#[derive(Debug)]
pub struct ShardWeights {
    weights: [AtomicU64; SHARD_COUNT],
}

impl Default for ShardWeights {
    fn default() -> Self {
        Self {
            weights: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

impl ShardWeights {
    /// Build from persisted values. Returns the weights and whether they
    /// were halved to get back under the high-water mark.
    pub fn from_persisted(
        values: impl IntoIterator<Item = (u8, u64)>,
    ) -> (Self, bool) {
        let weights = Self::default();
        let halved = weights.restore(values);
        (weights, halved)
    }

    /// Overwrite with persisted values; shards not listed drop to 0.
    /// Returns whether the result had to be halved.
    pub fn restore(&self, values: impl IntoIterator<Item = (u8, u64)>) -> bool {
        for w in &self.weights {
            w.store(0, Ordering::Relaxed);
        }
        for (shard, weight) in values {
            if let Some(slot) = self.weights.get(shard as usize) {
                slot.store(weight, Ordering::Relaxed);
            }
        }
        self.halve_if_over_high_water()
    }

    pub fn get(&self, shard: u8) -> u64 {
        self.weights
            .get(shard as usize)
            .map_or(0, |w| w.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> Vec<(u8, u64)> {
        (0..SHARD_COUNT as u8).map(|s| (s, self.get(s))).collect()
    }

    /// Shards by descending weight, ties broken by shard index.
    pub fn scan_order(&self) -> Vec<u8> {
        let mut order: Vec<(u8, u64)> = self.snapshot();
        order.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        order.into_iter().map(|(s, _)| s).collect()
    }

    /// Weight order with `first` moved to the front.
    pub fn scan_order_from(&self, first: u8) -> Vec<u8> {
        let mut order = vec![first];
        order.extend(self.scan_order().into_iter().filter(|&s| s != first));
        order
    }

    /// Credit `matched` results to `shard`. Returns the new weight when it
    /// changed.
    pub fn record_matches(&self, shard: u8, matched: u64) -> Option<u64> {
        let step = matched.min(MAX_WEIGHT_STEP);
        if step == 0 {
            return None;
        }
        let slot = self.weights.get(shard as usize)?;
        let weight = slot.fetch_add(step, Ordering::Relaxed) + step;
        if weight > WEIGHT_HIGH_WATER {
            self.halve_if_over_high_water();
            return Some(self.get(shard));
        }
        Some(weight)
    }

    fn halve_if_over_high_water(&self) -> bool {
        let over = self
            .weights
            .iter()
            .any(|w| w.load(Ordering::Relaxed) > WEIGHT_HIGH_WATER);
        if over {
            for w in &self.weights {
                let halved = w.load(Ordering::Relaxed) / 2;
                w.store(halved, Ordering::Relaxed);
            }
            tracing::info!("shard weights halved");
        }
        over
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_is_byte_sum_over_100_clamped() {
        assert_eq!(shard_for(""), 0);
        // 'b' + '.' + 't' + 'x' + 't' = 98 + 46 + 116 + 120 + 116
        assert_eq!(utf8_sum("b.txt"), 496);
        assert_eq!(shard_for("b.txt"), 4);
        assert_eq!(shard_for(&"z".repeat(100)), 40);
    }

    #[test]
    fn name_and_parent_accept_both_separators() {
        assert_eq!(file_name(r"C:\a\b.txt"), "b.txt");
        assert_eq!(parent_path(r"C:\a\b.txt"), r"C:\a");
        assert_eq!(file_name("/home/u/notes.md"), "notes.md");
        assert_eq!(parent_path("/home/u/notes.md"), "/home/u");
        assert_eq!(file_name("/home/u/dir/"), "dir");
    }

    #[test]
    fn disk_ids() {
        assert_eq!(disk_id(Path::new(r"C:\")), "C");
        assert_eq!(disk_id(Path::new("d:")), "D");
        assert_eq!(disk_id(Path::new("/")), "root");
        assert_eq!(disk_id(Path::new("/home/u")), "home_u");
    }

    #[test]
    fn disk_of_prefers_longest_root() {
        let disks = Disks::new(&["/", "/home"]);
        assert_eq!(disks.disk_of("/home/u/a.txt").as_deref(), Some("home"));
        assert_eq!(disks.disk_of("/etc/hosts").as_deref(), Some("root"));
        assert_eq!(disks.disk_of("/homework/a").as_deref(), Some("root"));

        let none = Disks::default();
        assert_eq!(none.disk_of(r"c:\a\b.txt").as_deref(), Some("C"));
    }

    #[test]
    fn shard_key_display() {
        assert_eq!(ShardKey::new("C", 7, 5).to_string(), "C,list7,5");
    }

    #[test]
    fn suffix_priority_resolution() {
        let table = SuffixPriorities::from_entries([
            ("defaultPriority".to_string(), 0),
            ("dirPriority".to_string(), -1),
            ("txt".to_string(), 5),
            ("exe".to_string(), 9),
        ]);

        assert_eq!(table.priorities(), vec![9, 5, 0, -1]);
        assert_eq!(table.priority_for_path(r"C:\a\b.TXT"), 5);
        assert_eq!(table.priority_for_path(r"C:\a\b.rs"), 0);
        // No dot in the file name: treated as a directory.
        assert_eq!(table.priority_for_path(r"C:\a\folder"), -1);
        assert_eq!(table.priority_for("/x/y.txt", true), -1);
    }

    #[test]
    fn default_table_holds_only_sentinels() {
        let table = SuffixPriorities::default();
        assert_eq!(table.priorities(), vec![0, -1]);
        assert_eq!(table.entries().len(), 2);
    }

    #[test]
    fn weight_step_is_capped() {
        let weights = ShardWeights::default();
        assert_eq!(weights.record_matches(7, 9), Some(5));
        assert_eq!(weights.get(7), 5);
        assert_eq!(weights.record_matches(7, 1), Some(6));
        assert_eq!(weights.record_matches(7, 0), None);
    }

    #[test]
    fn scan_order_sorts_by_weight_then_index() {
        let weights = ShardWeights::default();
        weights.record_matches(3, 2);
        weights.record_matches(10, 5);
        let order = weights.scan_order();
        assert_eq!(&order[..4], &[10, 3, 0, 1]);
        assert_eq!(order.len(), SHARD_COUNT);

        let order = weights.scan_order_from(1);
        assert_eq!(&order[..3], &[1, 10, 3]);
        assert_eq!(order.len(), SHARD_COUNT);
    }

    #[test]
    fn persisted_weights_are_halved_over_high_water() {
        let (weights, halved) = ShardWeights::from_persisted([
            (0, WEIGHT_HIGH_WATER + 2),
            (1, 10),
        ]);
        assert!(halved);
        assert_eq!(weights.get(0), WEIGHT_HIGH_WATER / 2 + 1);
        assert_eq!(weights.get(1), 5);

        let (_, halved) = ShardWeights::from_persisted([(0, 10)]);
        assert!(!halved);
    }
}
