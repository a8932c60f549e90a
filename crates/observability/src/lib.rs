//! Tracing and logging setup shared by the back office binaries.

/// Initialize process-wide tracing.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (filters, output format).
pub mod tracing;
