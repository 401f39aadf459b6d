//! One lazily-opened redb connection per shard-group.
//!
//! Each connection is guarded by its own lock and tracks how many sessions
//! are using it, so idle connections can be closed without a pool-wide lock.

use std::{
    collections::{BTreeMap, HashMap},
    ops::Deref,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex, RwLock};
use rand::Rng;
use redb::Database;

use crate::{
    error::{Error, Result},
    state::StopSignal,
};

/// Shard-group holding the frequently-used cache, statistics and suffix
/// priorities.
pub const CACHE_GROUP: &str = "cache";
/// Shard-group holding shard weights.
pub const WEIGHT_GROUP: &str = "weight";

const DB_EXTENSION: &str = "redb";

pub fn group_file(dir: &Path, group: &str) -> PathBuf {
    dir.join(format!("{group}.{DB_EXTENSION}"))
}

struct Slot {
    db: Option<Arc<Database>>,
    last_used: Instant,
}

struct PooledConnection {
    group: String,
    slot: Mutex<Slot>,
    in_flight: AtomicUsize,
    /// Notified whenever a session is returned.
    returned: Condvar,
    /// Added to the idle timeout so connections don't all close at once.
    idle_jitter: Duration,
}

impl PooledConnection {
    fn new(group: &str, idle_timeout: Duration) -> Self {
        let max_jitter = (idle_timeout.as_millis() as u64 / 2).max(1);
        let jitter = rand::thread_rng().gen_range(0..max_jitter);
        Self {
            group: group.to_string(),
            slot: Mutex::new(Slot {
                db: None,
                last_used: Instant::now(),
            }),
            in_flight: AtomicUsize::new(0),
            returned: Condvar::new(),
            idle_jitter: Duration::from_millis(jitter),
        }
    }

    fn is_busy(&self, db: &Arc<Database>) -> bool {
        self.in_flight.load(Ordering::Acquire) > 0 || Arc::strong_count(db) > 1
    }
}

/// A borrowed connection. The pool will not close it while this is alive.
pub struct Session {
    db: Arc<Database>,
    // Declared after `db` so the reference is gone before waiters wake.
    lease: Lease,
}

impl Deref for Session {
    type Target = Database;

    fn deref(&self) -> &Database {
        &self.db
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("group", &self.lease.0.group)
            .finish_non_exhaustive()
    }
}

struct Lease(Arc<PooledConnection>);

impl Drop for Lease {
    fn drop(&mut self) {
        let conn = &self.0;
        let mut slot = conn.slot.lock();
        slot.last_used = Instant::now();
        conn.in_flight.fetch_sub(1, Ordering::AcqRel);
        drop(slot);
        conn.returned.notify_all();
    }
}

pub struct ConnectionPool {
    dir: RwLock<PathBuf>,
    connections: RwLock<HashMap<String, Arc<PooledConnection>>>,
    initialized: AtomicBool,
    idle_timeout: Duration,
    malformed: Mutex<Vec<String>>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("dir", &*self.dir.read())
            .field("initialized", &self.is_initialized())
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            dir: RwLock::new(PathBuf::new()),
            connections: RwLock::new(HashMap::new()),
            initialized: AtomicBool::new(false),
            idle_timeout,
            malformed: Mutex::new(Vec::new()),
        }
    }

    /// Point the pool at `dir`. Groups flagged in `integrity` are checked
    /// (and repaired) before first use; the flags are then cleared.
    pub fn init(&self, dir: &Path, integrity: &IntegrityLog) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        *self.dir.write() = dir.to_path_buf();

        let flagged = integrity.flagged()?;
        for group in &flagged {
            self.check_group(dir, group);
        }
        if !flagged.is_empty() {
            integrity.clear()?;
        }

        self.initialized.store(true, Ordering::Release);
        tracing::debug!(dir = %dir.display(), "connection pool initialized");
        Ok(())
    }

    fn check_group(&self, dir: &Path, group: &str) {
        let path = group_file(dir, group);
        if !path.exists() {
            return;
        }
        let verdict = Database::create(&path)
            .map_err(Error::from)
            .and_then(|mut db| db.check_integrity().map_err(Error::from));
        match verdict {
            Ok(true) => tracing::info!(group, "integrity check passed"),
            Ok(false) => tracing::warn!(group, "database repaired"),
            Err(e) => {
                tracing::error!(group, error = %e, "database is malformed");
                self.malformed.lock().push(group.to_string());
                if let Err(e) = std::fs::remove_file(&path) {
                    tracing::error!(group, error = %e, "failed to remove");
                }
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Shard-groups found malformed at init and removed.
    pub fn malformed_groups(&self) -> Vec<String> {
        self.malformed.lock().clone()
    }

    pub fn dir(&self) -> PathBuf {
        self.dir.read().clone()
    }

    pub fn db_path(&self, group: &str) -> PathBuf {
        group_file(&self.dir.read(), group)
    }

    fn connection(&self, group: &str) -> Arc<PooledConnection> {
        if let Some(conn) = self.connections.read().get(group) {
            return conn.clone();
        }
        self.connections
            .write()
            .entry(group.to_string())
            .or_insert_with(|| {
                Arc::new(PooledConnection::new(group, self.idle_timeout))
            })
            .clone()
    }

    /// Borrow the connection for `group`, opening it when needed.
    pub fn get(&self, group: &str) -> Result<Session> {
        if !self.is_initialized() {
            return Err(Error::PoolNotInitialized);
        }
        let conn = self.connection(group);
        let db = {
            let mut slot = conn.slot.lock();
            let db = match &slot.db {
                Some(db) => db.clone(),
                None => {
                    let db = Arc::new(Database::create(self.db_path(group))?);
                    tracing::trace!(group, "connection opened");
                    slot.db = Some(db.clone());
                    db
                }
            };
            slot.last_used = Instant::now();
            conn.in_flight.fetch_add(1, Ordering::AcqRel);
            db
        };
        Ok(Session {
            db,
            lease: Lease(conn),
        })
    }

    /// Run `f` with exclusive access to the group's database. Waits up to
    /// `timeout` for other sessions to be returned.
    pub fn with_exclusive<T>(
        &self,
        group: &str,
        timeout: Duration,
        f: impl FnOnce(&mut Database) -> Result<T>,
    ) -> Result<T> {
        if !self.is_initialized() {
            return Err(Error::PoolNotInitialized);
        }
        let conn = self.connection(group);
        let deadline = Instant::now() + timeout;
        let mut slot = conn.slot.lock();
        loop {
            if slot.db.is_none() {
                let db = Database::create(self.db_path(group))?;
                slot.db = Some(Arc::new(db));
            }
            if conn.in_flight.load(Ordering::Acquire) == 0
                && let Some(db) = slot.db.as_mut().and_then(Arc::get_mut)
            {
                let out = f(db);
                slot.last_used = Instant::now();
                return out;
            }
            if conn.returned.wait_until(&mut slot, deadline).timed_out() {
                return Err(Error::Timeout("exclusive connection"));
            }
        }
    }

    /// Close connections idle for longer than their timeout. Returns how
    /// many were closed.
    pub fn close_idle(&self) -> usize {
        let conns: Vec<Arc<PooledConnection>> =
            self.connections.read().values().cloned().collect();
        let mut closed = 0;
        for conn in conns {
            let mut slot = conn.slot.lock();
            let Some(db) = &slot.db else {
                continue;
            };
            let idle_for = slot.last_used.elapsed();
            let limit = self.idle_timeout + conn.idle_jitter;
            if !conn.is_busy(db) && idle_for > limit {
                slot.db = None;
                closed += 1;
                tracing::trace!(group = %conn.group, "idle connection closed");
            }
        }
        closed
    }

    /// Close every connection and mark the pool uninitialized. Waits up to
    /// `timeout` for in-flight sessions; connections still in use after
    /// that are released anyway and reported as a timeout.
    pub fn close_all(&self, timeout: Duration) -> Result<()> {
        self.initialized.store(false, Ordering::Release);
        let deadline = Instant::now() + timeout;
        let conns: Vec<Arc<PooledConnection>> =
            self.connections.read().values().cloned().collect();
        let mut timed_out = false;
        for conn in conns {
            let mut slot = conn.slot.lock();
            while slot.db.as_ref().is_some_and(|db| conn.is_busy(db)) {
                if conn.returned.wait_until(&mut slot, deadline).timed_out() {
                    if slot.db.as_ref().is_some_and(|db| conn.is_busy(db)) {
                        timed_out = true;
                        tracing::warn!(
                            group = %conn.group,
                            "closing connection still in use"
                        );
                    }
                    break;
                }
            }
            slot.db = None;
        }
        self.connections.write().clear();
        if timed_out {
            return Err(Error::Timeout("connections to close"));
        }
        Ok(())
    }

    /// Periodically close idle connections until `stop` fires.
    pub fn spawn_idle_reaper(
        self: &Arc<Self>,
        stop: Arc<StopSignal>,
    ) -> Result<std::thread::JoinHandle<()>> {
        let pool = Arc::downgrade(self);
        let interval = (self.idle_timeout / 2)
            .clamp(Duration::from_millis(10), Duration::from_secs(10));
        let handle = std::thread::Builder::new()
            .name("pool-reaper".into())
            .spawn(move || {
                while !stop.wait_timeout(interval) {
                    let Some(pool) = pool.upgrade() else {
                        return;
                    };
                    if pool.is_initialized() {
                        pool.close_idle();
                    }
                }
            })?;
        Ok(handle)
    }
}

/// JSON map of shard-group → integrity-ok, merged on every failure.
#[derive(Debug, Clone)]
pub struct IntegrityLog {
    path: PathBuf,
}

impl IntegrityLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn read(&self) -> Result<BTreeMap<String, bool>> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(BTreeMap::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Groups whose last recorded state is not ok.
    pub fn flagged(&self) -> Result<Vec<String>> {
        Ok(self
            .read()?
            .into_iter()
            .filter(|(_, ok)| !ok)
            .map(|(group, _)| group)
            .collect())
    }

    /// Merge `updates` over the recorded map. New values win.
    pub fn merge(&self, updates: &BTreeMap<String, bool>) -> Result<()> {
        let mut map = self.read()?;
        for (group, ok) in updates {
            map.insert(group.clone(), *ok);
        }
        std::fs::write(&self.path, serde_json::to_string(&map)?)?;
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use redb::{ReadableDatabase, TableDefinition};

    use super::*;

    const T: TableDefinition<&str, &str> = TableDefinition::new("t");

    fn test_pool(idle: Duration) -> (tempfile::TempDir, ConnectionPool) {
        let tmp = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(idle);
        let log = IntegrityLog::new(tmp.path().join("integrity.json"));
        pool.init(&tmp.path().join("data"), &log).unwrap();
        (tmp, pool)
    }

    #[test]
    fn get_before_init_fails() {
        let pool = ConnectionPool::new(Duration::from_secs(10));
        assert!(matches!(pool.get("C"), Err(Error::PoolNotInitialized)));
    }

    #[test]
    fn get_opens_lazily_and_reuses() {
        let (_tmp, pool) = test_pool(Duration::from_secs(10));
        {
            let session = pool.get("C").unwrap();
            let txn = session.begin_write().unwrap();
            txn.open_table(T).unwrap().insert("k", "v").unwrap();
            txn.commit().unwrap();
        }
        assert!(pool.db_path("C").exists());

        let session = pool.get("C").unwrap();
        let txn = session.begin_read().unwrap();
        let table = txn.open_table(T).unwrap();
        assert_eq!(table.get("k").unwrap().unwrap().value(), "v");
    }

    #[test]
    fn idle_connections_close_and_reopen() {
        let (_tmp, pool) = test_pool(Duration::from_millis(1));
        drop(pool.get("C").unwrap());
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(pool.close_idle(), 1);
        assert_eq!(pool.close_idle(), 0);

        // Transparently reopened.
        assert!(pool.get("C").is_ok());
    }

    #[test]
    fn busy_connection_is_not_closed() {
        let (_tmp, pool) = test_pool(Duration::from_millis(1));
        let session = pool.get("C").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(pool.close_idle(), 0);
        drop(session);
    }

    #[test]
    fn close_all_times_out_on_held_session() {
        let (_tmp, pool) = test_pool(Duration::from_secs(10));
        let session = pool.get("C").unwrap();
        let result = pool.close_all(Duration::from_millis(20));
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert!(!pool.is_initialized());
        drop(session);
    }

    #[test]
    fn exclusive_access_waits_for_returned_session() {
        let (_tmp, pool) = test_pool(Duration::from_secs(10));
        let session = pool.get("C").unwrap();
        std::thread::scope(|s| {
            s.spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                drop(session);
            });
            pool.with_exclusive("C", Duration::from_secs(5), |_| Ok(()))
                .unwrap();
        });
    }

    #[test]
    fn close_all_waits_for_returned_session() {
        let (_tmp, pool) = test_pool(Duration::from_secs(10));
        let session = pool.get("C").unwrap();
        std::thread::scope(|s| {
            s.spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                drop(session);
            });
            pool.close_all(Duration::from_secs(5)).unwrap();
        });
        assert!(!pool.is_initialized());
    }

    #[test]
    fn exclusive_access_compacts() {
        let (_tmp, pool) = test_pool(Duration::from_secs(10));
        drop(pool.get("weight").unwrap());
        pool.with_exclusive("weight", Duration::from_secs(1), |db| {
            db.compact()?;
            Ok(())
        })
        .unwrap();
        assert!(pool.get("weight").is_ok());
    }

    #[test]
    fn exclusive_access_times_out_on_held_session() {
        let (_tmp, pool) = test_pool(Duration::from_secs(10));
        let session = pool.get("weight").unwrap();
        let wait = Duration::from_millis(20);
        let result = pool.with_exclusive("weight", wait, |_| Ok(()));
        assert!(matches!(result, Err(Error::Timeout(_))));
        drop(session);
    }

    #[test]
    fn integrity_log_merges_and_clears() {
        let tmp = tempfile::tempdir().unwrap();
        let log = IntegrityLog::new(tmp.path().join("integrity.json"));
        assert!(log.flagged().unwrap().is_empty());

        log.merge(&BTreeMap::from([("C".to_string(), false)])).unwrap();
        log.merge(&BTreeMap::from([("D".to_string(), true)])).unwrap();
        assert_eq!(log.flagged().unwrap(), vec!["C".to_string()]);
        assert_eq!(log.read().unwrap().len(), 2);

        log.clear().unwrap();
        assert!(log.read().unwrap().is_empty());
    }

    #[test]
    fn init_checks_flagged_groups_and_clears_log() {
        let tmp = tempfile::tempdir().unwrap();
        let data = tmp.path().join("data");
        std::fs::create_dir_all(&data).unwrap();
        std::fs::write(group_file(&data, "C"), b"not a database").unwrap();

        let log = IntegrityLog::new(tmp.path().join("integrity.json"));
        log.merge(&BTreeMap::from([("C".to_string(), false)])).unwrap();

        let pool = ConnectionPool::new(Duration::from_secs(10));
        pool.init(&data, &log).unwrap();

        assert_eq!(pool.malformed_groups(), vec!["C".to_string()]);
        assert!(!group_file(&data, "C").exists());
        assert!(log.read().unwrap().is_empty());
    }
}
