//! Process-wide tracing setup shared by binaries.

/// Initialize process-wide tracing.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (filters, layers).
pub mod tracing;
