//! Sandboxed Ignore - gitignore-style path matching inside isolated instances.
//!
//! Rule sets are compiled and evaluated inside sandbox instances, each with a
//! private linear memory and handle table:
//! - `pool`: reusable instances, leased one caller at a time
//! - `memory`: copying bytes in and out of an instance's memory
//! - `matcher`: compiled rule sets, single-path queries and batch filtering

pub mod config;
pub mod error;
pub mod matcher;
pub mod memory;
pub mod pool;
pub mod sandbox;
pub mod utils;

pub use config::EngineConfig;
pub use error::{ConfigError, IgnoreError, Result, Trap, WorkerError};
pub use matcher::{MatchOutcome, Matcher, MatcherHandle};
pub use pool::{
    configure_global_pool, global_pool, install_global_pool, reset_global_pool, Instance,
    InstancePool, PoolStats, PooledInstance,
};
pub use sandbox::{NativeModule, SandboxInstance, SandboxModule};

/// Re-export commonly used items.
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::error::{IgnoreError, Result};
    pub use crate::matcher::{MatchOutcome, Matcher};
    pub use crate::pool::{global_pool, InstancePool};
}
