//! Tracing setup.

use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter.
pub const LOG_ENV: &str = "ICL_LOG";

/// Initialize a stderr tracing subscriber.
///
/// Respects `ICL_LOG`; otherwise logs at `debug` when `verbose` is set and at
/// `info` by default.
pub fn init_tracing(verbose: bool) {
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level(verbose)));

    // A subscriber may already be installed (tests, embedding); keep it.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Filter used when `ICL_LOG` is unset or invalid.
fn default_level(verbose: bool) -> &'static str {
    if verbose { "debug" } else { "info" }
}
