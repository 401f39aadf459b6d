//! Filesystem change ingestion.
//!
//! A [`FileWatcher`] reports paths added or removed under the roots it
//! monitors. [`DiskMonitors`] runs one polling thread per monitored root and
//! turns those reports into `AddPath`/`RemovePath` events.

use std::{collections::HashSet, sync::Arc, thread::JoinHandle, time::Duration};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;

use crate::{
    error::Result,
    event_bus::EventBus,
    events::IndexEvent,
    shard,
};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub trait FileWatcher: Send + Sync {
    fn start_monitoring(&self, root: &str) -> Result<()>;
    fn stop_monitoring(&self, root: &str);
    fn is_stopped(&self, root: &str) -> bool;
    /// Next added path, without blocking.
    fn pop_added(&self) -> Option<String>;
    /// Next removed path, without blocking.
    fn pop_removed(&self) -> Option<String>;
}

/// In-process watcher fed by the caller. Reports for roots that are not
/// being monitored are discarded.
#[derive(Debug)]
pub struct QueueWatcher {
    running: Mutex<HashSet<String>>,
    added: (Sender<String>, Receiver<String>),
    removed: (Sender<String>, Receiver<String>),
}

impl Default for QueueWatcher {
    fn default() -> Self {
        Self {
            running: Mutex::new(HashSet::new()),
            added: channel::unbounded(),
            removed: channel::unbounded(),
        }
    }
}

impl QueueWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_watched(&self, path: &str) -> bool {
        self.running
            .lock()
            .iter()
            .any(|root| shard::is_under(path, root))
    }

    /// Report a new path. Returns false when no running root covers it.
    pub fn notify_added(&self, path: &str) -> bool {
        if !self.is_watched(path) {
            return false;
        }
        self.added.0.send(path.to_string()).is_ok()
    }

    pub fn notify_removed(&self, path: &str) -> bool {
        if !self.is_watched(path) {
            return false;
        }
        self.removed.0.send(path.to_string()).is_ok()
    }
}

impl FileWatcher for QueueWatcher {
    fn start_monitoring(&self, root: &str) -> Result<()> {
        self.running.lock().insert(root.to_string());
        Ok(())
    }

    fn stop_monitoring(&self, root: &str) {
        self.running.lock().remove(root);
    }

    fn is_stopped(&self, root: &str) -> bool {
        !self.running.lock().contains(root)
    }

    fn pop_added(&self) -> Option<String> {
        self.added.1.try_recv().ok()
    }

    fn pop_removed(&self) -> Option<String> {
        self.removed.1.try_recv().ok()
    }
}

pub struct DiskMonitors {
    watcher: Arc<dyn FileWatcher>,
    bus: EventBus<IndexEvent>,
    threads: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl std::fmt::Debug for DiskMonitors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskMonitors")
            .field("roots", &self.roots())
            .finish_non_exhaustive()
    }
}

impl DiskMonitors {
    pub fn new(
        watcher: Arc<dyn FileWatcher>,
        bus: EventBus<IndexEvent>,
    ) -> Self {
        Self {
            watcher,
            bus,
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn watcher(&self) -> &Arc<dyn FileWatcher> {
        &self.watcher
    }

    /// Roots with a running monitor thread.
    pub fn roots(&self) -> Vec<String> {
        self.threads
            .lock()
            .iter()
            .filter(|(_, h)| !h.is_finished())
            .map(|(root, _)| root.clone())
            .collect()
    }

    /// Start monitoring every root in `roots` that is not already running.
    pub fn start(&self, roots: &[String]) -> Result<()> {
        let mut threads = self.threads.lock();
        threads.retain(|(_, h)| !h.is_finished());
        for root in roots {
            if threads.iter().any(|(r, _)| r == root) {
                continue;
            }
            if let Err(e) = self.watcher.start_monitoring(root) {
                tracing::warn!(root, error = %e, "cannot monitor disk");
                continue;
            }
            let watcher = self.watcher.clone();
            let bus = self.bus.clone();
            let thread_root = root.clone();
            let handle = std::thread::Builder::new()
                .name(format!("monitor-{}", shard::disk_id(root.as_ref())))
                .spawn(move || poll(&*watcher, &bus, &thread_root))?;
            tracing::info!(root, "disk monitor started");
            threads.push((root.clone(), handle));
        }
        Ok(())
    }

    /// Stop every monitor and wait for its thread to exit.
    pub fn stop(&self) {
        let threads: Vec<(String, JoinHandle<()>)> =
            self.threads.lock().drain(..).collect();
        for (root, _) in &threads {
            self.watcher.stop_monitoring(root);
        }
        for (root, handle) in threads {
            if handle.join().is_err() {
                tracing::error!(root, "disk monitor panicked");
            }
        }
    }

    pub fn restart(&self, roots: &[String]) -> Result<()> {
        self.stop();
        self.start(roots)
    }
}

fn poll(watcher: &dyn FileWatcher, bus: &EventBus<IndexEvent>, root: &str) {
    while !watcher.is_stopped(root) && !bus.is_exiting() {
        let mut idle = true;
        while let Some(path) = watcher.pop_added() {
            idle = false;
            bus.publish(IndexEvent::AddPath(path));
        }
        while let Some(path) = watcher.pop_removed() {
            idle = false;
            bus.publish(IndexEvent::RemovePath(path));
        }
        if idle {
            std::thread::sleep(POLL_INTERVAL);
        }
    }
    tracing::debug!(root, "disk monitor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::Registry;
    use crate::events::EventKind;

    #[test]
    fn unwatched_paths_are_discarded() {
        let watcher = QueueWatcher::new();
        assert!(!watcher.notify_added("/data/a"));
        watcher.start_monitoring("/data").unwrap();
        assert!(watcher.notify_added("/data/a"));
        assert!(!watcher.notify_added("/database/a"));
        assert_eq!(watcher.pop_added(), Some("/data/a".to_string()));
        assert_eq!(watcher.pop_added(), None);
        watcher.stop_monitoring("/data");
        assert!(watcher.is_stopped("/data"));
    }

    #[test]
    fn monitor_publishes_changes() {
        let watcher = Arc::new(QueueWatcher::new());
        let bus = EventBus::new(0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry: Registry<IndexEvent> = Registry::new();
        let added = seen.clone();
        registry
            .handler(EventKind::AddPath, move |event| {
                added.lock().push(event.message().clone());
                Ok(None)
            })
            .unwrap();
        let removed = seen.clone();
        registry
            .handler(EventKind::RemovePath, move |event| {
                removed.lock().push(event.message().clone());
                Ok(None)
            })
            .unwrap();
        bus.start(registry, 1).unwrap();

        let monitors = DiskMonitors::new(watcher.clone(), bus.clone());
        monitors.start(&["/vol".to_string()]).unwrap();
        watcher.notify_added("/vol/new.txt");
        watcher.notify_removed("/vol/old.txt");

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while seen.lock().len() < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        monitors.stop();
        assert!(monitors.roots().is_empty());
        let seen = seen.lock();
        assert!(seen.contains(&IndexEvent::AddPath("/vol/new.txt".into())));
        assert!(seen.contains(&IndexEvent::RemovePath("/vol/old.txt".into())));

        bus.publish(IndexEvent::Close);
        bus.join();
    }
}
