//! Configuration schema for the sandbox engine and its instance pool.

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, IgnoreError};

/// Size of one linear-memory page.
pub const PAGE_SIZE: usize = 64 * 1024;

/// Pages reachable through a 32-bit pointer.
pub const MAX_ADDRESSABLE_PAGES: u32 = 65536;

const DEFAULT_INITIAL_PAGES: u32 = 1;
const DEFAULT_MAX_PAGES: u32 = 4096;

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EngineConfig {
    /// Pages mapped when an instance is created.
    #[serde(default = "default_initial_pages")]
    pub initial_memory_pages: u32,

    /// Ceiling on the memory a single instance may grow to.
    #[serde(default = "default_max_pages")]
    pub max_memory_pages: u32,

    /// Upper bound on parallel filter workers (default: CPU count).
    #[serde(default)]
    pub parallelism: Option<usize>,
}

fn default_initial_pages() -> u32 {
    DEFAULT_INITIAL_PAGES
}

fn default_max_pages() -> u32 {
    DEFAULT_MAX_PAGES
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            initial_memory_pages: DEFAULT_INITIAL_PAGES,
            max_memory_pages: DEFAULT_MAX_PAGES,
            parallelism: None,
        }
    }
}

impl EngineConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), IgnoreError> {
        if self.initial_memory_pages == 0 {
            return Err(invalid("initialMemoryPages must be at least 1"));
        }
        if self.max_memory_pages > MAX_ADDRESSABLE_PAGES {
            return Err(invalid(format!(
                "maxMemoryPages {} exceeds the 32-bit address space ({} pages)",
                self.max_memory_pages, MAX_ADDRESSABLE_PAGES
            )));
        }
        if self.initial_memory_pages > self.max_memory_pages {
            return Err(invalid(format!(
                "initialMemoryPages ({}) is larger than maxMemoryPages ({})",
                self.initial_memory_pages, self.max_memory_pages
            )));
        }
        if self.parallelism == Some(0) {
            return Err(invalid("parallelism must be at least 1"));
        }
        Ok(())
    }

    /// Worker cap for parallel filtering.
    pub fn effective_parallelism(&self) -> usize {
        self.parallelism.unwrap_or_else(num_cpus::get).max(1)
    }

    /// Memory ceiling of one instance, in bytes.
    pub fn max_memory_bytes(&self) -> usize {
        self.max_memory_pages as usize * PAGE_SIZE
    }
}

fn invalid(reason: impl Into<String>) -> IgnoreError {
    ConfigError::ValidationError(reason.into()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_memory_bytes(), 4096 * PAGE_SIZE);
        assert!(config.effective_parallelism() >= 1);
    }

    #[test]
    fn test_rejects_inverted_page_limits() {
        let config = EngineConfig {
            initial_memory_pages: 8,
            max_memory_pages: 4,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_initial_pages() {
        let config = EngineConfig {
            initial_memory_pages: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_oversized_memory() {
        let config = EngineConfig {
            max_memory_pages: MAX_ADDRESSABLE_PAGES + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_parallelism() {
        let config = EngineConfig {
            parallelism: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parallelism_override() {
        let config = EngineConfig {
            parallelism: Some(3),
            ..Default::default()
        };
        assert_eq!(config.effective_parallelism(), 3);
    }
}
