//! pathdex - an always-on file path index with live, sharded search.
//!
//! Paths on each monitored volume are spread over 41 shard tables of a redb
//! file by the checksum of their file name, and sub-partitioned by a
//! suffix-derived priority. Searches fan out over those shards on per-disk
//! worker pools, with small shards answered from memory and large ones
//! optionally from an accelerator.
//!
//! # Quick start
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use pathdex::{Config, DataDir, Service, service::Collaborators};
//!
//! let data_dir = DataDir::resolve(None).unwrap();
//! let config = Config::load(&data_dir.settings_file()).unwrap();
//! let parts = Collaborators::from_config(&config);
//! let service = Service::open(data_dir, config, parts).unwrap();
//!
//! let task = service.search("report|f", Duration::from_secs(10)).unwrap();
//! for path in task.all_results() {
//!     println!("{path}");
//! }
//! service.close().unwrap();
//! ```

pub mod accelerator;
pub mod cache;
pub mod command_queue;
pub mod config;
pub mod data_dir;
pub mod dataset;
pub mod error;
pub mod event_bus;
pub mod events;
pub mod frequent;
pub mod index;
pub mod matcher;
pub mod pool;
pub mod query;
pub mod scanner;
pub mod scheduler;
pub mod serve;
pub mod service;
pub mod shard;
pub mod state;
pub mod store;
pub mod task;
pub mod watcher;

pub use config::Config;
pub use data_dir::DataDir;
pub use error::{Error, Result};
pub use query::SearchQuery;
pub use service::Service;
pub use state::DatabaseStatus;
