//! Configuration module.

pub mod loader;
pub mod schema;

pub use loader::{load_config, load_config_from_string, parse_config};
pub use schema::{EngineConfig, MAX_ADDRESSABLE_PAGES, PAGE_SIZE};
