//! Dataset files on disk: creation dates, pruning before a rebuild, damage
//! detection and snapshot copies.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use chrono::{Local, NaiveDate};

use crate::{
    error::Result,
    pool::{ConnectionPool, group_file},
    store,
};

/// A disk database larger than this is dropped before a rebuild.
pub const MAX_DATASET_BYTES: u64 = 800 * 1024 * 1024;
/// A disk database older than this many days is dropped before a rebuild.
pub const MAX_DATASET_AGE_DAYS: i64 = 5;

const DAMAGE_SAMPLE: u64 = 10;
const DAMAGED_TABLE_LIMIT: usize = 10;

/// JSON map of disk id → dataset creation date.
#[derive(Debug, Clone)]
pub struct CreateDates {
    path: PathBuf,
}

impl CreateDates {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn read(&self) -> Result<BTreeMap<String, NaiveDate>> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(BTreeMap::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn write(&self, dates: &BTreeMap<String, NaiveDate>) -> Result<()> {
        std::fs::write(&self.path, serde_json::to_string_pretty(dates)?)?;
        Ok(())
    }
}

fn should_drop(
    file: &Path,
    created: NaiveDate,
    today: NaiveDate,
    drop_previous: bool,
) -> bool {
    if drop_previous {
        return true;
    }
    let too_big = std::fs::metadata(file)
        .is_ok_and(|m| m.len() > MAX_DATASET_BYTES);
    too_big || (today - created).num_days() > MAX_DATASET_AGE_DAYS
}

/// Delete the disk databases in `dir` that are too large, too old, or all
/// of them when `drop_previous` is set. Disks without a recorded date count
/// as created today. Returns the dropped disk ids.
pub fn prune(
    dir: &Path,
    disks: &[String],
    dates: &CreateDates,
    drop_previous: bool,
) -> Result<Vec<String>> {
    let today = Local::now().date_naive();
    let mut recorded = match dates.read() {
        Ok(recorded) => recorded,
        Err(e) => {
            tracing::warn!(error = %e, "unreadable dataset dates");
            BTreeMap::new()
        }
    };
    let mut dropped = Vec::new();
    for disk in disks {
        let created = *recorded.entry(disk.clone()).or_insert(today);
        let file = group_file(dir, disk);
        if !file.exists() || !should_drop(&file, created, today, drop_previous)
        {
            continue;
        }
        match std::fs::remove_file(&file) {
            Ok(()) => {
                tracing::info!(disk, "dropped previous dataset");
                recorded.insert(disk.clone(), today);
                dropped.push(disk.clone());
            }
            Err(e) => tracing::error!(disk, error = %e, "cannot drop dataset"),
        }
    }
    dates.write(&recorded)?;
    Ok(dropped)
}

/// More than ten shard tables across all disks with fewer than ten rows.
/// An unreadable disk counts as damaged.
pub fn is_damaged(pool: &ConnectionPool, disks: &[String]) -> bool {
    let mut sparse = 0;
    for disk in disks {
        let sizes = pool
            .get(disk)
            .and_then(|session| store::table_sizes(&session));
        match sizes {
            Ok(sizes) => {
                sparse += sizes.iter().filter(|&&n| n < DAMAGE_SAMPLE).count();
            }
            Err(e) => {
                tracing::error!(disk, error = %e, "cannot inspect dataset");
                return true;
            }
        }
    }
    sparse > DAMAGED_TABLE_LIMIT
}

/// Replace the database files in `to` with copies of those in `from`.
/// Returns how many files were copied.
pub fn copy_dataset(from: &Path, to: &Path) -> Result<usize> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(to)? {
        let path = entry?.path();
        if is_database(&path) {
            std::fs::remove_file(&path)?;
        }
    }
    let mut copied = 0;
    for entry in std::fs::read_dir(from)? {
        let path = entry?.path();
        if let Some(name) = path.file_name()
            && is_database(&path)
        {
            std::fs::copy(&path, to.join(name))?;
            copied += 1;
        }
    }
    Ok(copied)
}

fn is_database(path: &Path) -> bool {
    path.is_file() && path.extension().is_some_and(|e| e == "redb")
}
