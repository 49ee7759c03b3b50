//! Tracing initialization: JSON lines filtered by `RUST_LOG`.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";

/// Build the filter from `RUST_LOG`, falling back to [`DEFAULT_FILTER`]
/// when the variable is unset or unparsable.
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .json()
        .with_current_span(true)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .try_init();
}
