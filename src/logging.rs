//! OF-019: Tracing subscriber setup.
//!
//! Library code only emits `tracing` events. Binaries and tests that want to
//! see them call [`init`]; the filter comes from `ONEFORM_LOG` and falls back
//! to `oneform=info` (or `oneform=debug,info` when verbose).

use tracing_subscriber::EnvFilter;

/// Environment variable holding the filter directives.
pub const LOG_ENV: &str = "ONEFORM_LOG";

pub const DEFAULT_FILTER: &str = "oneform=info";
pub const VERBOSE_FILTER: &str = "oneform=debug,info";

/// Build the filter from `ONEFORM_LOG`, or the default directives.
pub fn env_filter(verbose: bool) -> EnvFilter {
    let fallback = if verbose { VERBOSE_FILTER } else { DEFAULT_FILTER };
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(fallback))
}

/// Install the global fmt subscriber. Returns false if one was already set.
pub fn try_init(verbose: bool) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(verbose))
        .with_target(false)
        .try_init()
        .is_ok()
}

/// Install the global subscriber, ignoring a previously installed one.
pub fn init() {
    try_init(false);
}
