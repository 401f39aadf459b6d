//! Query parsing.
//!
//! Raw input has the form `keyword1;keyword2|flag1;flag2`. The text after
//! the last `|` holds the flags; the rest is split on `;` into keywords. A
//! keyword starting with a path separator filters on the parent path instead
//! of the file name.

use std::path::MAIN_SEPARATOR;

use regex::Regex;

use crate::{
    error::{Error, Result},
    shard,
};

pub const MAX_SEARCH_TEXT_LENGTH: usize = 300;

const FLAG_DELIMITER: char = '|';
const LIST_DELIMITER: char = ';';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flag {
    /// Only regular files.
    Files,
    /// Only directories.
    Dirs,
    /// The whole file name must equal the search text.
    Full,
    CaseSensitive,
    /// The search text is a regular expression over the whole path.
    Pattern,
}

impl Flag {
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "f" => Some(Self::Files),
            "d" => Some(Self::Dirs),
            "full" => Some(Self::Full),
            "case" => Some(Self::CaseSensitive),
            "p" => Some(Self::Pattern),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Keyword {
    pub text: String,
    pub lowercase: String,
    /// Match against the parent path rather than the file name.
    pub is_path: bool,
}

#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub raw: String,
    pub search_text: String,
    pub keywords: Vec<Keyword>,
    pub flags: Vec<Flag>,
    pub pattern: Option<Regex>,
}

impl SearchQuery {
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.chars().count() > MAX_SEARCH_TEXT_LENGTH {
            return Err(Error::InvalidQuery(format!(
                "longer than {MAX_SEARCH_TEXT_LENGTH} characters"
            )));
        }

        let (search_text, flag_text) = match raw.rfind(FLAG_DELIMITER) {
            Some(idx) => (&raw[..idx], Some(&raw[idx + 1..])),
            None => (raw, None),
        };

        let mut flags = Vec::new();
        let items = flag_text.into_iter().flat_map(|f| f.split(LIST_DELIMITER));
        for item in items {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            match Flag::parse(item) {
                Some(flag) if !flags.contains(&flag) => flags.push(flag),
                Some(_) => {}
                None => tracing::debug!(flag = item, "ignoring unknown flag"),
            }
        }

        let keywords = search_text
            .split(LIST_DELIMITER)
            .filter(|k| !k.is_empty())
            .map(parse_keyword)
            .collect();

        let pattern = if flags.contains(&Flag::Pattern) {
            Some(Regex::new(search_text).map_err(|e| {
                Error::InvalidQuery(format!("bad pattern: {e}"))
            })?)
        } else {
            None
        };

        Ok(Self {
            raw: raw.to_string(),
            search_text: search_text.to_string(),
            keywords,
            flags,
            pattern,
        })
    }

    pub fn has_flag(&self, flag: Flag) -> bool {
        self.flags.contains(&flag)
    }

    pub fn is_ignore_case(&self) -> bool {
        !self.has_flag(Flag::CaseSensitive)
    }

    pub fn is_pattern(&self) -> bool {
        self.pattern.is_some()
    }

    pub fn dirs_only(&self) -> bool {
        self.has_flag(Flag::Dirs)
    }

    /// Tasks are shared between identical queries within their validity
    /// window.
    pub fn normalized_key(&self) -> String {
        let mut flags: Vec<String> =
            self.flags.iter().map(|f| format!("{f:?}")).collect();
        flags.sort();
        format!("{}|{}", self.search_text, flags.join(";"))
    }

    /// Shard scanned first: the one the keywords themselves would hash to.
    pub fn first_shard(&self) -> u8 {
        let sum: u32 =
            self.keywords.iter().map(|k| shard::utf8_sum(&k.text)).sum();
        shard::shard_of_sum(sum)
    }
}

fn parse_keyword(raw: &str) -> Keyword {
    let stripped = raw
        .strip_prefix('/')
        .or_else(|| raw.strip_prefix(MAIN_SEPARATOR));
    let (text, is_path) = match stripped {
        Some(rest) => (rest.replace('/', &MAIN_SEPARATOR.to_string()), true),
        None => (raw.to_string(), false),
    };
    Keyword {
        lowercase: text.to_lowercase(),
        text,
        is_path,
    }
}
