//! Path matching rules and the storage-engine fallback matcher.

use std::path::Path;

use redb::Database;

use crate::{
    error::Result,
    query::{Flag, SearchQuery},
    shard::{self, ShardKey},
    store,
};

/// Keyword and pattern rules only; the filesystem is not consulted.
pub fn text_matches(path: &str, query: &SearchQuery) -> bool {
    if path.is_empty() {
        return false;
    }
    if let Some(pattern) = &query.pattern {
        return pattern.is_match(path);
    }
    let ignore_case = query.is_ignore_case();
    let name = shard::file_name(path);
    let parent = shard::parent_path(path);
    let (name_lower, parent_lower) = if ignore_case {
        (name.to_lowercase(), parent.to_lowercase())
    } else {
        (String::new(), String::new())
    };
    query.keywords.iter().all(|keyword| {
        let (target, needle) = match (keyword.is_path, ignore_case) {
            (true, true) => (parent_lower.as_str(), &*keyword.lowercase),
            (false, true) => (name_lower.as_str(), &*keyword.lowercase),
            (true, false) => (parent, keyword.text.as_str()),
            (false, false) => (name, keyword.text.as_str()),
        };
        needle.is_empty() || target.contains(needle)
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Rejected,
    Matched,
    /// The text matched but nothing exists at the path any more.
    Vanished,
}

/// Text rules, then existence on disk, then the type filters.
pub fn verdict(path: &str, query: &SearchQuery) -> Verdict {
    if !text_matches(path, query) {
        return Verdict::Rejected;
    }
    let meta = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(_) => return Verdict::Vanished,
    };
    if query.has_flag(Flag::Files) && !meta.is_file() {
        return Verdict::Rejected;
    }
    if query.has_flag(Flag::Dirs) && !meta.is_dir() {
        return Verdict::Rejected;
    }
    if query.has_flag(Flag::Full)
        && query.search_text.to_lowercase()
            != shard::file_name(path).to_lowercase()
    {
        return Verdict::Rejected;
    }
    Verdict::Matched
}

pub struct MatchRequest<'a> {
    /// Open connection to the shard-group.
    pub db: &'a Database,
    /// File backing `db`, for matchers that read it themselves.
    pub db_path: &'a Path,
    pub key: &'a ShardKey,
    pub query: &'a SearchQuery,
    pub max_results: usize,
    /// Told about stored paths that text-match but are gone from disk.
    pub on_vanished: &'a dyn Fn(&str),
}

/// Storage-engine fallback used when no cache tier can answer for a key.
pub trait PathMatcher: Send + Sync {
    /// Matching paths stored under `request.key`, at most
    /// `request.max_results`. `None` when the key could not be read.
    fn match_key(
        &self,
        request: &MatchRequest<'_>,
    ) -> Result<Option<Vec<String>>>;
}

/// Scans the key's rows in the shard-group directly.
#[derive(Debug, Default, Clone, Copy)]
pub struct StoreMatcher;

impl PathMatcher for StoreMatcher {
    fn match_key(
        &self,
        request: &MatchRequest<'_>,
    ) -> Result<Option<Vec<String>>> {
        let mut matched = Vec::new();
        store::scan_paths(
            request.db,
            request.key.shard,
            request.key.priority,
            |path| {
                match verdict(path, request.query) {
                    Verdict::Matched => matched.push(path.to_string()),
                    Verdict::Vanished => (request.on_vanished)(path),
                    Verdict::Rejected => {}
                }
                matched.len() < request.max_results
            },
        )?;
        Ok(Some(matched))
    }
}
