//! Parallel batch filtering across several instances.
//!
//! Chunk 0 runs on the matcher's own instance. Every other chunk leases a
//! fresh instance and compiles the same rule text there, since handles and
//! compiled rule sets never cross instances. Results are merged by chunk
//! position, not completion order.

use std::ops::Range;
use std::sync::Arc;

use crate::error::{IgnoreError, Result, WorkerError};
use crate::matcher::handle::{batch_filter_on, ScopedHandle};
use crate::matcher::Matcher;
use crate::pool::InstancePool;

impl Matcher {
    /// Like [`filter`](Matcher::filter), but splits `paths` across up to
    /// `parallelism` instances and filters the chunks concurrently.
    ///
    /// Every failed worker is reported; temporary instances are returned to
    /// the pool whether or not their chunk succeeded. Worth it for large
    /// inputs only: each extra worker recompiles the rules.
    pub fn filter_parallel<S>(&mut self, paths: &[S]) -> Result<Vec<String>>
    where
        S: AsRef<str> + Sync,
    {
        let handle = self.handle;
        let workers = self.pool.config().effective_parallelism().min(paths.len());
        let Matcher {
            pool, lease, rules, ..
        } = self;
        let instance = match lease.as_mut() {
            Some(lease) => lease,
            None => panic!("use of closed Matcher"),
        };

        if paths.is_empty() {
            return Ok(Vec::new());
        }
        if workers <= 1 {
            return batch_filter_on(instance, handle, paths);
        }

        let chunks = partition(paths.len(), workers);
        tracing::debug!(
            "filtering {} paths across {} instances",
            paths.len(),
            chunks.len()
        );

        let pool: &Arc<InstancePool> = pool;
        let rules: &str = rules;
        let results = crossbeam::thread::scope(|s| {
            let spawned: Vec<_> = chunks[1..]
                .iter()
                .map(|range| {
                    let chunk = &paths[range.clone()];
                    s.spawn(move |_| filter_on_fresh_instance(pool, rules, chunk))
                })
                .collect();

            let mut results = Vec::with_capacity(chunks.len());
            results.push(batch_filter_on(
                &mut **instance,
                handle,
                &paths[chunks[0].clone()],
            ));
            for worker in spawned {
                results.push(worker.join().unwrap_or(Err(IgnoreError::WorkerPanicked)));
            }
            results
        })
        .map_err(|_| IgnoreError::WorkerPanicked)?;

        merge(results)
    }
}

/// Lease an instance, compile `rules` on it, filter `chunk`, and clean up.
fn filter_on_fresh_instance<S: AsRef<str>>(
    pool: &Arc<InstancePool>,
    rules: &str,
    chunk: &[S],
) -> Result<Vec<String>> {
    let mut lease = pool.acquire()?;
    let mut compiled = ScopedHandle::compile(&mut lease, rules)?;
    compiled.filter(chunk)
}

/// Split `len` items into `workers` contiguous ranges of near-equal size.
/// The last range absorbs the remainder.
fn partition(len: usize, workers: usize) -> Vec<Range<usize>> {
    let workers = workers.clamp(1, len.max(1));
    let base = len / workers;
    (0..workers)
        .map(|i| {
            let start = i * base;
            let end = if i + 1 == workers { len } else { start + base };
            start..end
        })
        .collect()
}

/// Concatenate per-chunk results in chunk order, or aggregate every failure.
fn merge(results: Vec<Result<Vec<String>>>) -> Result<Vec<String>> {
    let mut kept = Vec::new();
    let mut failures = Vec::new();

    for (worker, result) in results.into_iter().enumerate() {
        match result {
            Ok(chunk) => kept.extend(chunk),
            Err(error) => {
                tracing::debug!("parallel filter worker {} failed: {}", worker, error);
                failures.push(WorkerError { worker, error });
            }
        }
    }

    if failures.is_empty() {
        Ok(kept)
    } else {
        Err(IgnoreError::Parallel(failures))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn pool_with(parallelism: usize) -> Arc<InstancePool> {
        let config = EngineConfig {
            parallelism: Some(parallelism),
            ..Default::default()
        };
        InstancePool::with_native(config).unwrap()
    }

    #[test]
    fn test_partition_even() {
        assert_eq!(partition(9, 3), vec![0..3, 3..6, 6..9]);
    }

    #[test]
    fn test_partition_last_absorbs_remainder() {
        assert_eq!(partition(10, 4), vec![0..2, 2..4, 4..6, 6..10]);
    }

    #[test]
    fn test_partition_caps_workers() {
        assert_eq!(partition(2, 8), vec![0..1, 1..2]);
        assert_eq!(partition(5, 1), vec![0..5]);
    }

    #[test]
    fn test_merge_keeps_chunk_order() {
        let merged = merge(vec![
            Ok(vec!["a".to_string()]),
            Ok(vec![]),
            Ok(vec!["b".to_string(), "c".to_string()]),
        ])
        .unwrap();
        assert_eq!(merged, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_merge_aggregates_all_failures() {
        let err = merge(vec![
            Ok(vec!["a".to_string()]),
            Err(IgnoreError::CompileFailed),
            Err(IgnoreError::HandleNotFound),
        ])
        .unwrap_err();

        match err {
            IgnoreError::Parallel(failures) => {
                let workers: Vec<_> = failures.iter().map(|f| f.worker).collect();
                assert_eq!(workers, vec![1, 2]);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let pool = pool_with(4);
        let mut m = Matcher::with_pool(
            Arc::clone(&pool),
            &["*.log", "*.tmp", "build/", "!important.log"],
        )
        .unwrap();

        let paths: Vec<String> = (0..1000)
            .map(|i| match i % 7 {
                0 => format!("dir_{}/file.log", i),
                1 => format!("dir_{}/file.tmp", i),
                2 => "build/".to_string(),
                3 => format!("dir_{}/important.log", i),
                _ => format!("dir_{}/file_{}.rs", i, i),
            })
            .collect();

        let sequential = m.filter(&paths).unwrap();
        let parallel = m.filter_parallel(&paths).unwrap();
        assert_eq!(parallel, sequential);

        // Temporary instances went back to the pool; only the matcher's is out.
        let stats = pool.stats();
        assert_eq!(stats.leased, 1);
        assert!(stats.created >= 2 && stats.created <= 4);
        assert_eq!(stats.idle, stats.created - 1);
    }

    #[test]
    fn test_single_worker_uses_own_instance() {
        let pool = pool_with(1);
        let mut m = Matcher::with_pool(Arc::clone(&pool), &["*.log"]).unwrap();
        let kept = m.filter_parallel(&["a.log", "b.rs", "c.rs"]).unwrap();
        assert_eq!(kept, vec!["b.rs", "c.rs"]);
        assert_eq!(pool.stats().created, 1);
    }

    #[test]
    fn test_parallel_empty_input() {
        let mut m = Matcher::with_pool(pool_with(4), &["*.log"]).unwrap();
        assert!(m.filter_parallel(&[] as &[&str]).unwrap().is_empty());
    }

    #[test]
    #[should_panic(expected = "use of closed Matcher")]
    fn test_parallel_after_close_panics() {
        let mut m = Matcher::with_pool(pool_with(2), &["*.log"]).unwrap();
        m.close();
        let _ = m.filter_parallel(&["a.log"]);
    }
}
