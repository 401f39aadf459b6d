use std::path::PathBuf;

use crate::state::DatabaseStatus;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("database open error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("database storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("database transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("database table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("database commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("database compaction error: {0}")]
    RedbCompaction(#[from] redb::CompactionError),

    #[error("search pool error: {0}")]
    SearchPool(#[from] rayon::ThreadPoolBuildError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),

    #[error("connection pool must be initialized first")]
    PoolNotInitialized,

    #[error(
        "invalid status transition {from:?} -> {to:?} (status is {actual:?})"
    )]
    StateTransition {
        from: DatabaseStatus,
        to: DatabaseStatus,
        actual: DatabaseStatus,
    },

    #[error("a handler is already registered for event {0}")]
    DuplicateHandler(String),

    #[error("event {0} is terminal and cannot have a handler")]
    TerminalHandler(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("scanner failed: {0}")]
    Scanner(String),

    #[error("accelerator error: {0}")]
    Accelerator(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("event bus has shut down")]
    BusClosed,

    #[error("{0}")]
    Handler(String),
}
