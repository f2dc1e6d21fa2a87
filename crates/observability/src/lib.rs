//! Process-wide tracing/logging setup for jobscope hosts.

/// Initialize tracing with JSON output, filtered by `RUST_LOG` (default `info`).
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(tracing::DEFAULT_DIRECTIVE);
}

/// Like [`init`], but with a caller-chosen fallback directive when `RUST_LOG`
/// is unset (e.g. `"jobscope=debug,info"`).
pub fn init_with_default(directive: &str) {
    tracing::init(directive);
}

/// Tracing configuration (filters, layers).
pub mod tracing;
