//! Rule compilation and evaluation for native sandbox instances.

use std::collections::HashMap;
use std::path::Path;

use ignore::gitignore::{Gitignore, GitignoreBuilder};

/// Outcome codes returned by `is_match`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchCode {
    None = 0,
    Ignore = 1,
    Whitelist = 2,
}

/// Compile `\n`-separated gitignore lines. Lines that fail to parse or are
/// not valid UTF-8 are skipped.
pub fn build(patterns: &[u8]) -> Result<Gitignore, ignore::Error> {
    let mut builder = GitignoreBuilder::new(Path::new("/"));
    for line in patterns.split(|&b| b == b'\n') {
        if let Ok(line) = std::str::from_utf8(line) {
            if let Err(e) = builder.add_line(None, line) {
                tracing::trace!("skipping rule line {:?}: {}", line, e);
            }
        }
    }
    builder.build()
}

/// Evaluate one path, honouring rules that match any of its parents.
pub fn match_path(rules: &Gitignore, path: &str, is_dir: bool) -> MatchCode {
    match rules.matched_path_or_any_parents(Path::new(path), is_dir) {
        ignore::Match::None => MatchCode::None,
        ignore::Match::Ignore(_) => MatchCode::Ignore,
        ignore::Match::Whitelist(_) => MatchCode::Whitelist,
    }
}

/// Keep the lines of `paths` that are not ignored. A trailing `/` marks a
/// directory; empty lines are dropped.
pub fn filter_paths<'a>(rules: &Gitignore, paths: &'a str) -> Vec<&'a str> {
    paths
        .split('\n')
        .filter(|line| !line.is_empty())
        .filter(|line| {
            let (path, is_dir) = match line.strip_suffix('/') {
                Some(stripped) => (stripped, true),
                None => (*line, false),
            };
            match_path(rules, path, is_dir) != MatchCode::Ignore
        })
        .collect()
}

/// Per-instance table of compiled rule sets.
#[derive(Debug)]
pub struct RuleTable {
    next_id: u32,
    entries: HashMap<u32, Gitignore>,
}

impl Default for RuleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleTable {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            entries: HashMap::new(),
        }
    }

    /// Store a rule set and return its handle, always in `1..=i32::MAX`.
    pub fn insert(&mut self, rules: Gitignore) -> u32 {
        loop {
            let id = self.next_id;
            self.next_id = if id >= i32::MAX as u32 { 1 } else { id + 1 };
            if !self.entries.contains_key(&id) {
                self.entries.insert(id, rules);
                return id;
            }
        }
    }

    pub fn get(&self, handle: u32) -> Option<&Gitignore> {
        self.entries.get(&handle)
    }

    pub fn remove(&mut self, handle: u32) -> Option<Gitignore> {
        self.entries.remove(&handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
