//! Process-wide default pool.
//!
//! The native module is compiled on first use and the resulting pool is
//! shared until the process exits or a test swaps it out. Replacing the
//! global pool does not affect matchers already holding the old one.

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::pool::InstancePool;

static GLOBAL_POOL: Lazy<RwLock<Option<Arc<InstancePool>>>> = Lazy::new(|| RwLock::new(None));

/// Get the global pool, compiling the native module on first call.
///
/// A compile failure is returned and retried on the next call.
pub fn global_pool() -> Result<Arc<InstancePool>> {
    if let Some(pool) = GLOBAL_POOL.read().as_ref() {
        return Ok(Arc::clone(pool));
    }

    let mut slot = GLOBAL_POOL.write();
    if let Some(pool) = slot.as_ref() {
        return Ok(Arc::clone(pool));
    }

    let pool = InstancePool::with_native(EngineConfig::default())?;
    tracing::info!("initialized global {} instance pool", pool.module_name());
    *slot = Some(Arc::clone(&pool));
    Ok(pool)
}

/// Build a native pool from `config` and make it the global pool.
pub fn configure_global_pool(config: EngineConfig) -> Result<Arc<InstancePool>> {
    let pool = InstancePool::with_native(config)?;
    install_global_pool(Arc::clone(&pool));
    Ok(pool)
}

/// Install `pool` as the global pool, returning the previous one.
pub fn install_global_pool(pool: Arc<InstancePool>) -> Option<Arc<InstancePool>> {
    GLOBAL_POOL.write().replace(pool)
}

/// Clear the global pool so the next use rebuilds it.
pub fn reset_global_pool() -> Option<Arc<InstancePool>> {
    GLOBAL_POOL.write().take()
}
