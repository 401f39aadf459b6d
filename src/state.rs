//! The database status cell.
//!
//! Every transition is a compare-and-swap. Waiters block on a condition
//! variable instead of polling the flag.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DatabaseStatus {
    Normal,
    /// Serving from a temporary copy while the live files are rebuilt.
    Snapshot,
    Rebuilding,
    Compacting,
}

impl DatabaseStatus {
    /// `Snapshot` serves queries exactly like `Normal`.
    pub fn is_serving(self) -> bool {
        matches!(self, Self::Normal | Self::Snapshot)
    }

    pub fn accepts_writes(self) -> bool {
        self.is_serving()
    }
}

#[derive(Debug)]
pub struct StatusCell {
    status: Mutex<DatabaseStatus>,
    changed: Condvar,
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new(DatabaseStatus::Normal)
    }
}

impl StatusCell {
    pub fn new(initial: DatabaseStatus) -> Self {
        Self {
            status: Mutex::new(initial),
            changed: Condvar::new(),
        }
    }

    pub fn get(&self) -> DatabaseStatus {
        *self.status.lock()
    }

    /// Returns false when another writer already moved the status.
    pub fn compare_and_set(
        &self,
        expected: DatabaseStatus,
        next: DatabaseStatus,
    ) -> bool {
        let mut status = self.status.lock();
        if *status != expected {
            return false;
        }
        *status = next;
        self.changed.notify_all();
        true
    }

    /// Like [`compare_and_set`](Self::compare_and_set), but a lost race is
    /// reported as an error for the caller to abort on.
    pub fn transition(
        &self,
        from: DatabaseStatus,
        to: DatabaseStatus,
    ) -> Result<()> {
        let mut status = self.status.lock();
        if *status != from {
            return Err(Error::StateTransition {
                from,
                to,
                actual: *status,
            });
        }
        *status = to;
        self.changed.notify_all();
        tracing::debug!(?from, ?to, "database status changed");
        Ok(())
    }

    /// Block until `pred` holds or `timeout` elapses. Returns whether the
    /// predicate held.
    pub fn wait_until(
        &self,
        timeout: Duration,
        pred: impl Fn(DatabaseStatus) -> bool,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        let mut status = self.status.lock();
        while !pred(*status) {
            if self.changed.wait_until(&mut status, deadline).timed_out() {
                return pred(*status);
            }
        }
        true
    }
}

/// A one-way stop flag that sleeping loops can wait on.
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: Mutex<bool>,
    changed: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        *self.stopped.lock() = true;
        self.changed.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }

    /// Sleep for up to `timeout`. Returns true once stopped.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut stopped = self.stopped.lock();
        while !*stopped {
            if self.changed.wait_until(&mut stopped, deadline).timed_out() {
                break;
            }
        }
        *stopped
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn transition_rejects_stale_expectation() {
        let cell = StatusCell::default();
        cell.transition(DatabaseStatus::Normal, DatabaseStatus::Rebuilding)
            .unwrap();

        let err = cell
            .transition(DatabaseStatus::Normal, DatabaseStatus::Compacting)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::StateTransition {
                actual: DatabaseStatus::Rebuilding,
                ..
            }
        ));
        assert_eq!(cell.get(), DatabaseStatus::Rebuilding);
    }

    #[test]
    fn snapshot_serves_like_normal() {
        assert!(DatabaseStatus::Snapshot.is_serving());
        assert!(DatabaseStatus::Normal.is_serving());
        assert!(!DatabaseStatus::Rebuilding.accepts_writes());
        assert!(!DatabaseStatus::Compacting.accepts_writes());
    }

    #[test]
    fn wait_until_wakes_on_change() {
        let cell = Arc::new(StatusCell::new(DatabaseStatus::Rebuilding));
        let waiter = {
            let cell = cell.clone();
            std::thread::spawn(move || {
                cell.wait_until(Duration::from_secs(5), |s| {
                    s == DatabaseStatus::Normal
                })
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(cell.compare_and_set(
            DatabaseStatus::Rebuilding,
            DatabaseStatus::Normal
        ));
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn stop_signal_interrupts_sleep() {
        let signal = Arc::new(StopSignal::new());
        let sleeper = {
            let signal = signal.clone();
            std::thread::spawn(move || {
                signal.wait_timeout(Duration::from_secs(30))
            })
        };
        signal.stop();
        assert!(sleeper.join().unwrap());
        assert!(signal.is_stopped());
    }

    #[test]
    fn wait_until_times_out() {
        let cell = StatusCell::new(DatabaseStatus::Compacting);
        assert!(!cell.wait_until(Duration::from_millis(10), |s| {
            s == DatabaseStatus::Normal
        }));
    }
}
