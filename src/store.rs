//! Table layout of every shard-group and the typed statements applied to
//! them.
//!
//! A disk shard-group holds `list0`..`list40`, keyed by `(priority, path)`
//! and storing the file name's byte sum. The `cache` group holds the
//! frequently-used set, its use statistics and the suffix priority table.
//! The `weight` group holds one weight per shard table.

use std::ops::Bound;

use redb::{
    Database,
    ReadableDatabase,
    ReadableTable,
    ReadableTableMetadata,
    TableDefinition,
    WriteTransaction,
};

use crate::{
    error::Result,
    shard::{self, SHARD_COUNT, ShardKey},
};

type ShardTable<'a> = TableDefinition<'a, (i32, &'static str), u32>;

const CACHE: TableDefinition<&str, ()> = TableDefinition::new("cache");
const STATISTICS: TableDefinition<&str, u32> =
    TableDefinition::new("statistics");
const PRIORITY: TableDefinition<&str, i32> = TableDefinition::new("priority");
const WEIGHT: TableDefinition<&str, u64> = TableDefinition::new("weight");

/// Statistics counts are halved once one of them gets this close to the
/// maximum.
const STATISTICS_HEADROOM: u32 = 100_000;

fn shard_table(name: &str) -> ShardTable<'_> {
    TableDefinition::new(name)
}

fn priority_range(
    priority: i32,
) -> (Bound<(i32, &'static str)>, Bound<(i32, &'static str)>) {
    let end = match priority.checked_add(1) {
        Some(next) => Bound::Excluded((next, "")),
        None => Bound::Unbounded,
    };
    (Bound::Included((priority, "")), end)
}

/// What a queued command was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskTag {
    InsertToList,
    DeleteFromList,
    InsertToCache,
    DeleteFromCache,
    InsertStatistics,
    DeleteStatistics,
    UpdateStatistics,
    CreateIndex,
    UpdateSuffix,
    UpdateWeight,
}

/// One mutation. Two equal statements are duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Statement {
    InsertPath {
        shard: u8,
        ascii: u32,
        path: String,
        priority: i32,
    },
    DeletePath {
        shard: u8,
        path: String,
        priority: i32,
    },
    InsertCache {
        path: String,
    },
    DeleteCache {
        path: String,
    },
    BumpStatistics {
        path: String,
    },
    DeleteStatistics {
        path: String,
    },
    ResetStatistics {
        path: String,
    },
    HalveStatistics,
    SetSuffix {
        suffix: String,
        priority: i32,
    },
    DeleteSuffix {
        suffix: String,
    },
    ClearSuffixes,
    SetWeight {
        shard: u8,
        weight: u64,
    },
    /// Make sure every shard table of a disk exists.
    EnsureTables,
}

impl Statement {
    pub fn tag(&self) -> TaskTag {
        match self {
            Self::InsertPath { .. } => TaskTag::InsertToList,
            Self::DeletePath { .. } => TaskTag::DeleteFromList,
            Self::InsertCache { .. } => TaskTag::InsertToCache,
            Self::DeleteCache { .. } => TaskTag::DeleteFromCache,
            Self::BumpStatistics { .. } => TaskTag::InsertStatistics,
            Self::DeleteStatistics { .. } => TaskTag::DeleteStatistics,
            Self::ResetStatistics { .. } | Self::HalveStatistics => {
                TaskTag::UpdateStatistics
            }
            Self::SetSuffix { .. }
            | Self::DeleteSuffix { .. }
            | Self::ClearSuffixes => TaskTag::UpdateSuffix,
            Self::SetWeight { .. } => TaskTag::UpdateWeight,
            Self::EnsureTables => TaskTag::CreateIndex,
        }
    }

    /// Path this statement inserts into a shard, if any.
    pub fn inserted_path(&self) -> Option<&str> {
        match self {
            Self::InsertPath { path, .. } => Some(path),
            _ => None,
        }
    }

    /// Apply within `txn`, returning the number of rows affected.
    pub fn apply(&self, txn: &WriteTransaction) -> Result<u64> {
        let affected = match self {
            Self::InsertPath {
                shard,
                ascii,
                path,
                priority,
            } => {
                let name = shard::table_name(*shard);
                let mut table = txn.open_table(shard_table(&name))?;
                if table.get((*priority, path.as_str()))?.is_some() {
                    0
                } else {
                    table.insert((*priority, path.as_str()), *ascii)?;
                    1
                }
            }
            Self::DeletePath {
                shard,
                path,
                priority,
            } => {
                let name = shard::table_name(*shard);
                let mut table = txn.open_table(shard_table(&name))?;
                u64::from(table.remove((*priority, path.as_str()))?.is_some())
            }
            Self::InsertCache { path } => {
                let mut table = txn.open_table(CACHE)?;
                u64::from(table.insert(path.as_str(), ())?.is_none())
            }
            Self::DeleteCache { path } => {
                let mut table = txn.open_table(CACHE)?;
                u64::from(table.remove(path.as_str())?.is_some())
            }
            Self::BumpStatistics { path } => {
                let mut table = txn.open_table(STATISTICS)?;
                let count =
                    table.get(path.as_str())?.map_or(0, |v| v.value());
                table.insert(path.as_str(), count.saturating_add(1))?;
                1
            }
            Self::DeleteStatistics { path } => {
                let mut table = txn.open_table(STATISTICS)?;
                u64::from(table.remove(path.as_str())?.is_some())
            }
            Self::ResetStatistics { path } => {
                let mut table = txn.open_table(STATISTICS)?;
                table.insert(path.as_str(), 1)?;
                1
            }
            Self::HalveStatistics => {
                let mut table = txn.open_table(STATISTICS)?;
                let mut rows = Vec::new();
                for entry in table.iter()? {
                    let (k, v) = entry?;
                    rows.push((k.value().to_string(), v.value()));
                }
                for (path, count) in &rows {
                    table.insert(path.as_str(), count / 2)?;
                }
                rows.len() as u64
            }
            Self::SetSuffix { suffix, priority } => {
                let mut table = txn.open_table(PRIORITY)?;
                table.insert(suffix.as_str(), *priority)?;
                1
            }
            Self::DeleteSuffix { suffix } => {
                let mut table = txn.open_table(PRIORITY)?;
                u64::from(table.remove(suffix.as_str())?.is_some())
            }
            Self::ClearSuffixes => {
                let mut table = txn.open_table(PRIORITY)?;
                let removed = table.len()?;
                table.retain(|_, _| false)?;
                removed
            }
            Self::SetWeight { shard, weight } => {
                let name = shard::table_name(*shard);
                let mut table = txn.open_table(WEIGHT)?;
                table.insert(name.as_str(), *weight)?;
                1
            }
            Self::EnsureTables => {
                for shard in 0..SHARD_COUNT as u8 {
                    let name = shard::table_name(shard);
                    txn.open_table(shard_table(&name))?;
                }
                0
            }
        };
        Ok(affected)
    }
}

// -- Disk shard-groups --

/// Rows stored under one `(shard, priority)` key.
pub fn count_rows(db: &Database, shard: u8, priority: i32) -> Result<u64> {
    let txn = db.begin_read()?;
    let name = shard::table_name(shard);
    let table = match txn.open_table(shard_table(&name)) {
        Ok(t) => t,
        Err(redb::TableError::TableDoesNotExist(_)) => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let mut count = 0;
    for entry in table.range(priority_range(priority))? {
        entry?;
        count += 1;
    }
    Ok(count)
}

/// Visit the paths stored under one key until `visit` returns false.
pub fn scan_paths(
    db: &Database,
    shard: u8,
    priority: i32,
    mut visit: impl FnMut(&str) -> bool,
) -> Result<()> {
    let txn = db.begin_read()?;
    let name = shard::table_name(shard);
    let table = match txn.open_table(shard_table(&name)) {
        Ok(t) => t,
        Err(redb::TableError::TableDoesNotExist(_)) => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in table.range(priority_range(priority))? {
        let (key, _) = entry?;
        let (_, path) = key.value();
        if !visit(path) {
            break;
        }
    }
    Ok(())
}

pub fn load_paths(
    db: &Database,
    shard: u8,
    priority: i32,
) -> Result<Vec<String>> {
    let mut out = Vec::new();
    scan_paths(db, shard, priority, |p| {
        out.push(p.to_string());
        true
    })?;
    Ok(out)
}

/// Row totals of every shard table.
pub fn table_sizes(db: &Database) -> Result<Vec<u64>> {
    let txn = db.begin_read()?;
    let mut sizes = Vec::with_capacity(SHARD_COUNT);
    for shard in 0..SHARD_COUNT as u8 {
        let name = shard::table_name(shard);
        let len = match txn.open_table(shard_table(&name)) {
            Ok(t) => t.len()?,
            Err(redb::TableError::TableDoesNotExist(_)) => 0,
            Err(e) => return Err(e.into()),
        };
        sizes.push(len);
    }
    Ok(sizes)
}

/// Insert a batch of rows for one disk in a single transaction. Used by
/// scanners writing a fresh dataset.
pub fn insert_rows(
    db: &Database,
    rows: &[(ShardKey, u32, String)],
) -> Result<u64> {
    let txn = db.begin_write()?;
    let mut inserted = 0;
    for (key, ascii, path) in rows {
        inserted += Statement::InsertPath {
            shard: key.shard,
            ascii: *ascii,
            path: path.clone(),
            priority: key.priority,
        }
        .apply(&txn)?;
    }
    txn.commit()?;
    Ok(inserted)
}

// -- Cache shard-group --

/// Cached paths with their use counts. A path without statistics reads
/// as 0.
pub fn cached_paths(db: &Database) -> Result<Vec<(String, u32)>> {
    let txn = db.begin_read()?;
    let cache = match txn.open_table(CACHE) {
        Ok(t) => t,
        Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let statistics = match txn.open_table(STATISTICS) {
        Ok(t) => Some(t),
        Err(redb::TableError::TableDoesNotExist(_)) => None,
        Err(e) => return Err(e.into()),
    };
    let mut out = Vec::new();
    for entry in cache.iter()? {
        let (k, _) = entry?;
        let path = k.value().to_string();
        let count = match &statistics {
            Some(t) => t.get(path.as_str())?.map_or(0, |v| v.value()),
            None => 0,
        };
        out.push((path, count));
    }
    Ok(out)
}

/// Whether `count` is close enough to overflow that all counts should be
/// halved.
pub fn statistics_near_max(count: u32) -> bool {
    count > u32::MAX - STATISTICS_HEADROOM
}

pub fn suffix_priorities(db: &Database) -> Result<Vec<(String, i32)>> {
    let txn = db.begin_read()?;
    let table = match txn.open_table(PRIORITY) {
        Ok(t) => t,
        Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut out = Vec::new();
    for entry in table.iter()? {
        let (k, v) = entry?;
        out.push((k.value().to_string(), v.value()));
    }
    Ok(out)
}

// -- Weight shard-group --

pub fn shard_weights(db: &Database) -> Result<Vec<(u8, u64)>> {
    let txn = db.begin_read()?;
    let table = match txn.open_table(WEIGHT) {
        Ok(t) => t,
        Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut out = Vec::new();
    for entry in table.iter()? {
        let (k, v) = entry?;
        if let Some(shard) = k
            .value()
            .strip_prefix("list")
            .and_then(|n| n.parse::<u8>().ok())
        {
            out.push((shard, v.value()));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (tempfile::TempDir, Database) {
        let tmp = tempfile::tempdir().unwrap();
        let db = Database::create(tmp.path().join("C.redb")).unwrap();
        (tmp, db)
    }

    fn apply(db: &Database, stmt: Statement) -> u64 {
        let txn = db.begin_write().unwrap();
        let affected = stmt.apply(&txn).unwrap();
        txn.commit().unwrap();
        affected
    }

    fn insert(path: &str, priority: i32) -> Statement {
        let name = shard::file_name(path);
        Statement::InsertPath {
            shard: shard::shard_for(name),
            ascii: shard::utf8_sum(name),
            path: path.to_string(),
            priority,
        }
    }

    #[test]
    fn insert_is_ignored_when_present() {
        let (_tmp, db) = test_db();
        assert_eq!(apply(&db, insert(r"C:\a\b.txt", 5)), 1);
        assert_eq!(apply(&db, insert(r"C:\a\b.txt", 5)), 0);
        assert_eq!(count_rows(&db, 4, 5).unwrap(), 1);
    }

    #[test]
    fn insert_then_delete_leaves_nothing() {
        let (_tmp, db) = test_db();
        apply(&db, insert(r"C:\a\b.txt", 5));
        let deleted = apply(
            &db,
            Statement::DeletePath {
                shard: 4,
                path: r"C:\a\b.txt".into(),
                priority: 5,
            },
        );
        assert_eq!(deleted, 1);
        assert_eq!(table_sizes(&db).unwrap().iter().sum::<u64>(), 0);
    }

    #[test]
    fn scans_are_per_priority() {
        let (_tmp, db) = test_db();
        apply(&db, insert("/x/a.txt", 5));
        apply(&db, insert("/x/a.rs", 0));
        apply(&db, insert("/y/a.txt", 5));

        let mut paths = load_paths(&db, shard::shard_for("a.txt"), 5).unwrap();
        paths.sort();
        assert_eq!(paths, vec!["/x/a.txt".to_string(), "/y/a.txt".into()]);
        assert_eq!(count_rows(&db, shard::shard_for("a.rs"), 0).unwrap(), 1);
        assert_eq!(count_rows(&db, 0, -1).unwrap(), 0);
    }

    #[test]
    fn ensure_tables_creates_all_shards() {
        let (_tmp, db) = test_db();
        apply(&db, Statement::EnsureTables);
        assert_eq!(table_sizes(&db).unwrap().len(), SHARD_COUNT);
    }

    #[test]
    fn cache_and_statistics() {
        let (_tmp, db) = test_db();
        assert_eq!(apply(&db, Statement::InsertCache { path: "/a".into() }), 1);
        apply(&db, Statement::BumpStatistics { path: "/a".into() });
        apply(&db, Statement::BumpStatistics { path: "/a".into() });
        apply(&db, Statement::InsertCache { path: "/b".into() });

        let mut cached = cached_paths(&db).unwrap();
        cached.sort();
        assert_eq!(cached, vec![("/a".to_string(), 2), ("/b".to_string(), 0)]);

        apply(&db, Statement::HalveStatistics);
        assert_eq!(cached_paths(&db).unwrap()[0].1, 1);
    }

    #[test]
    fn suffix_table_clear() {
        let (_tmp, db) = test_db();
        apply(&db, Statement::SetSuffix {
            suffix: "txt".into(),
            priority: 5,
        });
        apply(&db, Statement::SetSuffix {
            suffix: "exe".into(),
            priority: 9,
        });
        assert_eq!(apply(&db, Statement::ClearSuffixes), 2);
        assert!(suffix_priorities(&db).unwrap().is_empty());
    }

    #[test]
    fn weights_round_trip_through_table_names() {
        let (_tmp, db) = test_db();
        apply(&db, Statement::SetWeight {
            shard: 7,
            weight: 5,
        });
        assert_eq!(shard_weights(&db).unwrap(), vec![(7, 5)]);
    }

    #[test]
    fn missing_tables_read_as_empty() {
        let (_tmp, db) = test_db();
        assert!(cached_paths(&db).unwrap().is_empty());
        assert!(shard_weights(&db).unwrap().is_empty());
        assert_eq!(count_rows(&db, 3, 0).unwrap(), 0);
    }
}
