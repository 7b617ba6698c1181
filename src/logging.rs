//! `tracing` subscriber set-up for host programs and worker processes.

use tracing_subscriber::EnvFilter;

fn filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install a fmt subscriber writing to stderr. `RUST_LOG` wins over
/// `default_filter`. Calling it twice is harmless.
pub fn init(default_filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(default_filter))
        .with_writer(std::io::stderr)
        .try_init();
}

/// Worker processes keep stdout for frames, so everything goes to stderr
/// with the worker's pid attached
pub fn init_worker() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter("warn"))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
    tracing::debug!(pid = std::process::id(), "worker tracing initialized");
}
