//! Pool of bare sandbox instances.
//!
//! The pool compiles nothing itself: it is handed a compiled
//! [`SandboxModule`] and lends out instances created from it. Leases are
//! RAII guards, so an instance goes back to the pool on every exit path.
//! Tainted instances are dropped on release instead of being reused.
//!
//! Instance ids come from one process-wide counter, so a handle minted on
//! one instance can never pass the ownership check on another, even one
//! owned by a different pool.

pub mod global;
pub mod instance;

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::sandbox::{NativeModule, SandboxModule};

pub use global::{configure_global_pool, global_pool, install_global_pool, reset_global_pool};
pub use instance::Instance;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Instances waiting for reuse.
    pub idle: usize,
    /// Instances currently held outside the pool.
    pub leased: usize,
    /// Instances ever instantiated.
    pub created: usize,
    /// Instances dropped instead of recycled.
    pub discarded: usize,
}

/// Thread-safe pool of sandbox instances.
pub struct InstancePool {
    id: u64,
    module: Arc<dyn SandboxModule>,
    config: EngineConfig,
    idle: Mutex<Vec<Instance>>,
    leased: AtomicUsize,
    created: AtomicUsize,
    discarded: AtomicUsize,
}

impl std::fmt::Debug for InstancePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstancePool")
            .field("id", &self.id)
            .field("module", &self.module.name())
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl InstancePool {
    /// Create a pool over an already compiled module.
    pub fn new(module: Arc<dyn SandboxModule>, config: EngineConfig) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            module,
            config,
            idle: Mutex::new(Vec::new()),
            leased: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
            discarded: AtomicUsize::new(0),
        })
    }

    /// Compile the native module and build a pool around it.
    pub fn with_native(config: EngineConfig) -> Result<Arc<Self>> {
        let module = NativeModule::compile(&config)?;
        Ok(Self::new(Arc::new(module), config))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn module_name(&self) -> &str {
        self.module.name()
    }

    /// Lease an idle instance, instantiating a new one on a miss.
    pub fn acquire(self: &Arc<Self>) -> Result<PooledInstance> {
        let reused = self.idle.lock().pop();
        let instance = match reused {
            Some(instance) => {
                tracing::trace!("reusing {}", instance.name());
                instance
            }
            None => self.instantiate()?,
        };

        self.leased.fetch_add(1, Ordering::SeqCst);
        Ok(PooledInstance {
            instance: Some(instance),
            pool: Arc::clone(self),
        })
    }

    fn instantiate(&self) -> Result<Instance> {
        let id = NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed);
        let name = format!("matcher_{}", id);
        let inner = self.module.instantiate(&name)?;
        self.created.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("instantiated {} from {} module", name, self.module.name());
        Ok(Instance::new(id, self.id, name, inner))
    }

    /// Return a leased instance. Tainted instances are discarded.
    ///
    /// An instance that was not created by this pool is dropped without
    /// touching the counters.
    pub fn release(&self, instance: Instance) {
        if instance.pool_id() != self.id {
            tracing::warn!(
                "dropping {} released to pool {} but owned by pool {}",
                instance.name(),
                self.id,
                instance.pool_id()
            );
            return;
        }

        self.leased.fetch_sub(1, Ordering::SeqCst);

        if instance.is_tainted() {
            tracing::warn!("discarding tainted instance {}", instance.name());
            self.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.idle.lock().push(instance);
    }

    /// Drop idle instances beyond `keep`. Returns how many were dropped.
    pub fn shrink_to(&self, keep: usize) -> usize {
        let dropped = {
            let mut idle = self.idle.lock();
            if idle.len() <= keep {
                return 0;
            }
            idle.split_off(keep)
        };
        self.discarded.fetch_add(dropped.len(), Ordering::Relaxed);
        tracing::debug!("shrank pool by {} idle instance(s)", dropped.len());
        dropped.len()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.idle.lock().len(),
            leased: self.leased.load(Ordering::SeqCst),
            created: self.created.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

/// An instance on loan from an [`InstancePool`]. Returned on drop.
pub struct PooledInstance {
    instance: Option<Instance>,
    pool: Arc<InstancePool>,
}

impl std::fmt::Debug for PooledInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PooledInstance").field(&self.instance).finish()
    }
}

impl PooledInstance {
    pub fn pool(&self) -> &Arc<InstancePool> {
        &self.pool
    }

    /// Take the instance out of the guard. The caller must hand it back
    /// with [`InstancePool::release`].
    pub fn into_inner(mut self) -> Instance {
        match self.instance.take() {
            Some(instance) => instance,
            None => unreachable!("lease holds its instance until dropped"),
        }
    }

    /// Drop the instance without returning it to the pool.
    pub fn discard(mut self) {
        if let Some(mut instance) = self.instance.take() {
            instance.taint();
            self.pool.release(instance);
        }
    }
}

impl Deref for PooledInstance {
    type Target = Instance;

    fn deref(&self) -> &Instance {
        match self.instance.as_ref() {
            Some(instance) => instance,
            None => unreachable!("lease holds its instance until dropped"),
        }
    }
}

impl DerefMut for PooledInstance {
    fn deref_mut(&mut self) -> &mut Instance {
        match self.instance.as_mut() {
            Some(instance) => instance,
            None => unreachable!("lease holds its instance until dropped"),
        }
    }
}

impl Drop for PooledInstance {
    fn drop(&mut self) {
        if let Some(instance) = self.instance.take() {
            self.pool.release(instance);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> Arc<InstancePool> {
        InstancePool::with_native(EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_acquire_creates_then_reuses() {
        let pool = pool();
        let first_id = {
            let lease = pool.acquire().unwrap();
            assert_eq!(pool.stats().leased, 1);
            lease.id()
        };
        assert_eq!(pool.stats().idle, 1);

        let lease = pool.acquire().unwrap();
        assert_eq!(lease.id(), first_id);
        assert_eq!(pool.stats().created, 1);
    }

    #[test]
    fn test_concurrent_leases_are_distinct() {
        let pool = pool();
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.name(), format!("matcher_{}", a.id()));
        assert_eq!(a.pool_id(), pool.id());
        drop((a, b));
        assert_eq!(
            pool.stats(),
            PoolStats {
                idle: 2,
                leased: 0,
                created: 2,
                discarded: 0
            }
        );
    }

    #[test]
    fn test_tainted_instance_is_discarded() {
        let pool = pool();
        let mut lease = pool.acquire().unwrap();
        lease.taint();
        drop(lease);

        let stats = pool.stats();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.leased, 0);
    }

    #[test]
    fn test_trap_taints_instance() {
        let pool = pool();
        let mut lease = pool.acquire().unwrap();
        let err = lease.dealloc(4096, 8).unwrap_err();
        assert!(err.is_transport());
        assert!(lease.is_tainted());

        let again = lease.alloc(8).unwrap_err();
        assert!(again.is_transport());
    }

    #[test]
    fn test_discard_does_not_recycle() {
        let pool = pool();
        pool.acquire().unwrap().discard();
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.stats().discarded, 1);
    }

    #[test]
    fn test_into_inner_and_release() {
        let pool = pool();
        let instance = pool.acquire().unwrap().into_inner();
        assert_eq!(pool.stats().leased, 1);
        pool.release(instance);
        assert_eq!(pool.stats().leased, 0);
        assert_eq!(pool.stats().idle, 1);
    }

    #[test]
    fn test_release_keeps_every_healthy_instance() {
        let pool = pool();
        let leases: Vec<_> = (0..16).map(|_| pool.acquire().unwrap()).collect();
        drop(leases);

        let stats = pool.stats();
        assert_eq!(stats.idle, 16);
        assert_eq!(stats.discarded, 0);
    }

    #[test]
    fn test_instance_ids_unique_across_pools() {
        let a = pool();
        let b = pool();
        assert_ne!(a.id(), b.id());

        let from_a = a.acquire().unwrap();
        let from_b = b.acquire().unwrap();
        assert_ne!(from_a.id(), from_b.id());
        assert_ne!(from_a.name(), from_b.name());
    }

    #[test]
    fn test_release_to_wrong_pool_is_dropped() {
        let a = pool();
        let b = pool();
        let _held_by_b = b.acquire().unwrap();
        let stray = a.acquire().unwrap().into_inner();

        b.release(stray);
        assert_eq!(
            b.stats(),
            PoolStats {
                idle: 0,
                leased: 1,
                created: 1,
                discarded: 0
            }
        );
        // Still counted as out on the pool that created it.
        assert_eq!(a.stats().leased, 1);
        assert_eq!(a.stats().idle, 0);
    }

    #[test]
    fn test_shrink_to() {
        let pool = pool();
        let leases: Vec<_> = (0..4).map(|_| pool.acquire().unwrap()).collect();
        drop(leases);
        assert_eq!(pool.shrink_to(1), 3);
        assert_eq!(pool.shrink_to(5), 0);
        assert_eq!(pool.stats().idle, 1);
    }

    #[test]
    fn test_parallel_acquire_release() {
        let pool = pool();
        crossbeam::thread::scope(|s| {
            for _ in 0..8 {
                let pool = &pool;
                s.spawn(move |_| {
                    for _ in 0..50 {
                        let mut lease = pool.acquire().unwrap();
                        let ptr = lease.alloc(16).unwrap();
                        assert_ne!(ptr, 0);
                        lease.dealloc(ptr, 16).unwrap();
                    }
                });
            }
        })
        .unwrap();

        let stats = pool.stats();
        assert_eq!(stats.leased, 0);
        assert!(stats.created <= 8);
        assert_eq!(stats.idle, stats.created);
    }
}
