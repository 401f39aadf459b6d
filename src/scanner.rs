//! Full-volume scanners that write a fresh dataset.

use std::{
    io::{BufRead, BufReader, Read},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::{Duration, Instant},
};

use globset::{Glob, GlobSet, GlobSetBuilder};
use redb::Database;

use crate::{
    error::{Error, Result},
    pool::group_file,
    shard::{self, Disks, ShardKey, SuffixPriorities},
    store::{self, Statement},
};

pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(60 * 60);
const BATCH_ROWS: usize = 10_000;

pub struct ScanRequest<'a> {
    pub roots: &'a [String],
    /// Dataset directory the shard-groups are written to.
    pub output: &'a Path,
    /// Lowercased ignore prefixes or globs.
    pub ignore: &'a [String],
    pub disks: &'a Disks,
    pub priorities: &'a SuffixPriorities,
}

pub trait VolumeScanner: Send + Sync {
    fn scan(&self, request: &ScanRequest<'_>) -> Result<()>;
}

/// Runs an external scanner executable and waits for it to exit.
#[derive(Debug, Clone)]
pub struct ProcessScanner {
    exe: PathBuf,
    timeout: Duration,
}

impl ProcessScanner {
    pub fn new(exe: impl Into<PathBuf>) -> Self {
        Self {
            exe: exe.into(),
            timeout: DEFAULT_SCAN_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

fn log_lines(stream: impl Read + Send + 'static, name: &'static str) {
    std::thread::spawn(move || {
        for line in BufReader::new(stream).lines().map_while(|l| l.ok()) {
            tracing::info!(stream = name, "scanner: {line}");
        }
    });
}

impl VolumeScanner for ProcessScanner {
    fn scan(&self, request: &ScanRequest<'_>) -> Result<()> {
        let mut child = Command::new(&self.exe)
            .arg("--roots")
            .arg(request.roots.join(";"))
            .arg("--output")
            .arg(request.output)
            .arg("--ignore")
            .arg(request.ignore.join(","))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                Error::Scanner(format!("{}: {e}", self.exe.display()))
            })?;
        if let Some(out) = child.stdout.take() {
            log_lines(out, "stdout");
        }
        if let Some(err) = child.stderr.take() {
            log_lines(err, "stderr");
        }

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                // Already exited if kill fails.
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::Timeout("scanner"));
            }
            std::thread::sleep(Duration::from_millis(100));
        };
        if !status.success() {
            return Err(Error::Scanner(format!("exited with {status}")));
        }
        Ok(())
    }
}

/// In-process scanner that walks each root and writes rows directly.
#[derive(Debug, Default, Clone, Copy)]
pub struct WalkScanner;

fn ignore_set(ignore: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for entry in ignore {
        let entry = entry.trim_end_matches(['/', '\\']);
        if entry.is_empty() {
            continue;
        }
        for pattern in [entry.to_string(), format!("{entry}/**")] {
            let glob = Glob::new(&pattern).map_err(|e| {
                Error::Config(format!("bad ignore path {entry}: {e}"))
            })?;
            builder.add(glob);
        }
    }
    builder
        .build()
        .map_err(|e| Error::Config(format!("bad ignore paths: {e}")))
}

/// Open (or create) the shard-group for `disk` under `output`, with all of
/// its tables present.
fn open_group(output: &Path, disk: &str) -> Result<Database> {
    let db = Database::create(group_file(output, disk))?;
    let txn = db.begin_write()?;
    Statement::EnsureTables.apply(&txn)?;
    txn.commit()?;
    Ok(db)
}

impl WalkScanner {
    fn walk_root(
        &self,
        root: &str,
        ignore: &GlobSet,
        request: &ScanRequest<'_>,
    ) -> Result<u64> {
        let Some(disk) = request.disks.disk_of(root) else {
            return Ok(0);
        };
        let db = open_group(request.output, &disk)?;
        let mut rows: Vec<(ShardKey, u32, String)> = Vec::new();
        let mut written = 0;
        let mut stack = vec![PathBuf::from(root)];
        while let Some(dir) = stack.pop() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::debug!(dir = %dir.display(), error = %e, "skip");
                    continue;
                }
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let text = path.to_string_lossy().into_owned();
                if ignore.is_match(text.to_lowercase()) {
                    continue;
                }
                let is_dir = entry.file_type().is_ok_and(|t| t.is_dir());
                if is_dir {
                    stack.push(path);
                }
                let ascii = shard::utf8_sum(shard::file_name(&text));
                let priority = request.priorities.priority_for(&text, is_dir);
                let id = shard::shard_of_sum(ascii);
                let key = ShardKey::new(disk.clone(), id, priority);
                rows.push((key, ascii, text));
                if rows.len() >= BATCH_ROWS {
                    written += store::insert_rows(&db, &rows)?;
                    rows.clear();
                }
            }
        }
        if !rows.is_empty() {
            written += store::insert_rows(&db, &rows)?;
        }
        Ok(written)
    }
}

impl VolumeScanner for WalkScanner {
    fn scan(&self, request: &ScanRequest<'_>) -> Result<()> {
        std::fs::create_dir_all(request.output)?;
        let ignore = ignore_set(request.ignore)?;
        for root in request.roots {
            let started = Instant::now();
            let written = self.walk_root(root, &ignore, request)?;
            tracing::info!(
                root,
                written,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "volume scanned"
            );
        }
        Ok(())
    }
}
