//! Typed service configuration, persisted as `settings.json`.
//!
//! Every recognized option carries a default, so a partial (or empty) file
//! loads cleanly. Unknown keys are ignored.

use std::{
    ops::RangeInclusive,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Upper bound for search workers per disk queue.
pub fn max_search_threads() -> usize {
    num_cpus::get() * 2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Capacity of the frequently-used cache table.
    pub cache_num_limit: usize,
    /// Seconds of write quiet before queued commands are flushed.
    pub update_time_limit_secs: u64,
    pub ignore_paths: Vec<String>,
    pub priority_folder: Option<PathBuf>,
    /// Monitored volume roots.
    pub disks: Vec<PathBuf>,
    pub enable_accelerator: bool,
    pub accelerator_device: String,
    /// Workers started for each disk's job queue.
    pub search_thread_number: usize,
    pub max_results: usize,
    pub event_workers: usize,
    pub max_event_retries: u32,
    /// Global record budget of the memory cache tier.
    pub cache_record_budget: usize,
    /// Row-count band a key must fall in to be cached in memory.
    pub cache_band: (usize, usize),
    /// External full-volume scanner. The in-process walker is used when unset.
    pub scanner: Option<PathBuf>,
    pub advanced: AdvancedConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvancedConfig {
    pub wait_for_search_tasks_timeout_ms: u64,
    pub restart_monitor_disk_timeout_ms: u64,
    pub connection_idle_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_num_limit: 1000,
            update_time_limit_secs: 5,
            ignore_paths: Vec::new(),
            priority_folder: None,
            disks: Vec::new(),
            enable_accelerator: false,
            accelerator_device: String::new(),
            search_thread_number: max_search_threads(),
            max_results: 200,
            event_workers: num_cpus::get(),
            max_event_retries: 5,
            cache_record_budget: 51_200,
            cache_band: (100, 5000),
            scanner: None,
            advanced: AdvancedConfig::default(),
        }
    }
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        Self {
            wait_for_search_tasks_timeout_ms: 5 * 60 * 1000,
            restart_monitor_disk_timeout_ms: 10 * 60 * 1000,
            connection_idle_timeout_ms: 10 * 1000,
        }
    }
}

impl Config {
    /// Load from `path`, falling back to defaults when the file is missing.
    pub fn load(path: &Path) -> Result<Self> {
        let config = match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str::<Config>(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Config::default()
            }
            Err(e) => return Err(e.into()),
        };
        config.validate()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Normalize values that have a legal range and reject the ones that
    /// cannot be repaired.
    pub fn validate(mut self) -> Result<Self> {
        let (min, max) = self.cache_band;
        if min > max {
            return Err(Error::Config(format!(
                "cache_band lower bound {min} exceeds upper bound {max}"
            )));
        }
        self.search_thread_number =
            self.search_thread_number.clamp(1, max_search_threads());
        self.event_workers = self.event_workers.max(1);
        if self.update_time_limit_secs == 0 {
            self.update_time_limit_secs = 1;
        }
        Ok(self)
    }

    pub fn cache_band(&self) -> RangeInclusive<usize> {
        self.cache_band.0..=self.cache_band.1
    }

    pub fn update_time_limit(&self) -> Duration {
        Duration::from_secs(self.update_time_limit_secs)
    }

    pub fn ignore_paths_lowercase(&self) -> Vec<String> {
        self.ignore_paths.iter().map(|p| p.to_lowercase()).collect()
    }
}

impl AdvancedConfig {
    pub fn wait_for_search_tasks_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_for_search_tasks_timeout_ms)
    }

    pub fn restart_monitor_disk_timeout(&self) -> Duration {
        Duration::from_millis(self.restart_monitor_disk_timeout_ms)
    }

    pub fn connection_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_idle_timeout_ms)
    }
}
