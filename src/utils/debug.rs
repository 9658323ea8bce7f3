//! Debug logging utilities.

use tracing_subscriber::EnvFilter;

/// Environment variable for debug mode.
pub const DEBUG_ENV: &str = "SANDBOXED_IGNORE_DEBUG";

/// Install a `tracing` subscriber for this crate's events.
///
/// Debug output is enabled by `force_debug` or by setting
/// `SANDBOXED_IGNORE_DEBUG`. Safe to call more than once; only the first
/// subscriber sticks. Returns whether debug output was requested.
pub fn init_debug_logging(force_debug: bool) -> bool {
    let debug_enabled = force_debug || std::env::var_os(DEBUG_ENV).is_some();

    let directive = if debug_enabled {
        "sandboxed_ignore=debug,warn"
    } else {
        "sandboxed_ignore=info,warn"
    };

    let installed = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(directive))
        .with_target(debug_enabled)
        .with_thread_names(debug_enabled)
        .try_init()
        .is_ok();
    if installed {
        tracing::debug!("logging initialized ({})", directive);
    }

    debug_enabled
}
