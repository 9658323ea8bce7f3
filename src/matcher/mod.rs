//! User-facing compiled rule sets.
//!
//! A [`Matcher`] borrows one instance from a pool for its whole lifetime and
//! keeps one compiled rule set on it. It is not meant for concurrent use:
//! every operation takes `&mut self`. Threads that need to match at the same
//! time should each compile their own `Matcher`; the pool behind them is
//! shared.
//!
//! Rule syntax is gitignore's: `*`, `?`, `**`, character classes, a trailing
//! `/` for directories, a leading `/` to anchor, `!` to negate, `#` for
//! comments. Later rules win.

pub mod handle;
mod parallel;

use std::sync::Arc;

use crate::error::Result;
use crate::pool::{global_pool, InstancePool, PooledInstance};

pub use handle::{
    batch_filter_on, compile_on, destroy_on, join_lines, match_on, MatchOutcome, MatcherHandle,
    ScopedHandle, LINE_SEPARATOR,
};

/// A compiled rule set bound to one leased sandbox instance.
pub struct Matcher {
    pool: Arc<InstancePool>,
    /// `None` once closed.
    lease: Option<PooledInstance>,
    handle: MatcherHandle,
    rules: String,
}

impl std::fmt::Debug for Matcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Matcher")
            .field("handle", &self.handle)
            .field("rules", &self.rules)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Matcher {
    /// Compile `rules` on an instance from the global pool.
    pub fn new<S: AsRef<str>>(rules: &[S]) -> Result<Self> {
        Self::with_pool(global_pool()?, rules)
    }

    /// Compile `rules` on an instance from `pool`.
    ///
    /// On failure the instance goes straight back to the pool.
    pub fn with_pool<S: AsRef<str>>(pool: Arc<InstancePool>, rules: &[S]) -> Result<Self> {
        let rules = join_lines(rules);
        let mut lease = pool.acquire()?;
        let handle = compile_on(&mut lease, &rules)?;

        Ok(Self {
            pool,
            lease: Some(lease),
            handle,
            rules,
        })
    }

    /// The rule text as compiled, lines joined with `\n`.
    pub fn rules(&self) -> &str {
        &self.rules
    }

    pub fn pool(&self) -> &Arc<InstancePool> {
        &self.pool
    }

    pub fn is_closed(&self) -> bool {
        self.lease.is_none()
    }

    /// Destroy the rule set and return the instance to its pool.
    ///
    /// Idempotent. Any other method called afterwards panics.
    pub fn close(&mut self) {
        let Some(mut lease) = self.lease.take() else {
            return;
        };
        if let Err(e) = destroy_on(&mut lease, self.handle) {
            tracing::debug!("{}: destroy on close failed: {}", lease.name(), e);
        }
    }

    fn open(&mut self) -> &mut PooledInstance {
        match self.lease.as_mut() {
            Some(lease) => lease,
            None => panic!("use of closed Matcher"),
        }
    }

    /// Test one path and report exactly what happened.
    pub fn match_result(&mut self, path: &str, is_dir: bool) -> Result<MatchOutcome> {
        self.match_result_bytes(path.as_bytes(), is_dir)
    }

    /// Like [`match_result`](Self::match_result) for paths that may not be UTF-8.
    pub fn match_result_bytes(&mut self, path: &[u8], is_dir: bool) -> Result<MatchOutcome> {
        let handle = self.handle;
        match_on(self.open(), handle, path, is_dir)
    }

    /// Whether a file path is ignored.
    ///
    /// Errors read as "not ignored", as does a path re-included by a
    /// negation rule. Use [`match_result`](Self::match_result) to tell them
    /// apart.
    pub fn is_ignored(&mut self, path: &str) -> bool {
        self.ignored(path, false)
    }

    /// Whether a directory path is ignored. Errors read as "not ignored".
    pub fn is_ignored_dir(&mut self, path: &str) -> bool {
        self.ignored(path, true)
    }

    fn ignored(&mut self, path: &str, is_dir: bool) -> bool {
        match self.match_result(path, is_dir) {
            Ok(outcome) => outcome.is_ignored(),
            Err(e) => {
                tracing::debug!("treating {:?} as not ignored: {}", path, e);
                false
            }
        }
    }

    /// Return the paths that are not ignored, in input order, using a single
    /// call into the instance. A trailing `/` marks a directory.
    pub fn filter<S: AsRef<str>>(&mut self, paths: &[S]) -> Result<Vec<String>> {
        let handle = self.handle;
        let instance = self.open();
        if paths.is_empty() {
            return Ok(Vec::new());
        }
        batch_filter_on(instance, handle, paths)
    }
}

impl Drop for Matcher {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::error::IgnoreError;

    fn pool() -> Arc<InstancePool> {
        InstancePool::with_native(EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_new_matcher_basic() {
        let mut m = Matcher::with_pool(pool(), &["*.log", "build/", "!important.log"]).unwrap();
        assert!(m.is_ignored("debug.log"));
        assert!(!m.is_ignored("important.log"));
        assert!(!m.is_ignored("src/main.rs"));
        assert!(m.is_ignored_dir("build"));
        assert_eq!(m.rules(), "*.log\nbuild/\n!important.log");
    }

    #[test]
    fn test_global_pool_matcher() {
        let mut m = Matcher::new(&["*.tmp"]).unwrap();
        assert!(m.is_ignored("a.tmp"));
    }

    #[test]
    fn test_empty_rules_match_nothing() {
        let mut m = Matcher::with_pool(pool(), &[] as &[&str]).unwrap();
        assert_eq!(
            m.match_result("anything", false).unwrap(),
            MatchOutcome::NotMatched
        );
        assert!(!m.is_ignored_dir("anydir"));
    }

    #[test]
    fn test_match_result_distinguishes_whitelist() {
        let mut m = Matcher::with_pool(pool(), &["*.log", "!keep.log"]).unwrap();
        assert_eq!(
            m.match_result("keep.log", false).unwrap(),
            MatchOutcome::Whitelisted
        );
        assert_eq!(
            m.match_result("other.txt", false).unwrap(),
            MatchOutcome::NotMatched
        );
        assert!(!m.is_ignored("keep.log"));
        assert!(!m.is_ignored("other.txt"));
    }

    #[test]
    fn test_non_utf8_path_reports_encoding_error() {
        let mut m = Matcher::with_pool(pool(), &["*"]).unwrap();
        assert!(matches!(
            m.match_result_bytes(b"\xff", false),
            Err(IgnoreError::PathEncoding)
        ));
        assert!(m.is_ignored("anything"));
    }

    #[test]
    fn test_close_idempotent() {
        let pool = pool();
        let mut m = Matcher::with_pool(Arc::clone(&pool), &["*.log"]).unwrap();
        assert_eq!(pool.stats().leased, 1);
        m.close();
        assert!(m.is_closed());
        assert_eq!(pool.stats().leased, 0);
        m.close();
        assert_eq!(pool.stats().leased, 0);
        assert_eq!(pool.stats().idle, 1);
    }

    #[test]
    #[should_panic(expected = "use of closed Matcher")]
    fn test_use_after_close_panics() {
        let mut m = Matcher::with_pool(pool(), &["*.log"]).unwrap();
        m.close();
        m.is_ignored("debug.log");
    }

    #[test]
    #[should_panic(expected = "use of closed Matcher")]
    fn test_filter_after_close_panics() {
        let mut m = Matcher::with_pool(pool(), &["*.log"]).unwrap();
        m.close();
        let _ = m.filter(&[] as &[&str]);
    }

    #[test]
    fn test_drop_returns_instance() {
        let pool = pool();
        {
            let _m = Matcher::with_pool(Arc::clone(&pool), &["*.log"]).unwrap();
            assert_eq!(pool.stats().leased, 1);
        }
        assert_eq!(pool.stats().leased, 0);
    }

    #[test]
    fn test_close_destroys_handle_before_reuse() {
        let pool = pool();
        let (instance_id, handle) = {
            let m = Matcher::with_pool(Arc::clone(&pool), &["*.log"]).unwrap();
            (m.lease.as_ref().map(|l| l.id()), m.handle)
        };
        let mut lease = pool.acquire().unwrap();
        assert_eq!(Some(lease.id()), instance_id);
        let err = match_on(&mut lease, handle, b"a.log", false).unwrap_err();
        assert!(matches!(err, IgnoreError::HandleNotFound));
    }

    #[test]
    fn test_filter_empty_input() {
        let mut m = Matcher::with_pool(pool(), &["*.log"]).unwrap();
        assert!(m.filter(&[] as &[&str]).unwrap().is_empty());
    }

    #[test]
    fn test_filter_directory_marker() {
        let mut m = Matcher::with_pool(pool(), &["build/"]).unwrap();
        let kept = m.filter(&["build/", "build", "src/main.rs"]).unwrap();
        assert_eq!(kept, vec!["build", "src/main.rs"]);
    }
}
