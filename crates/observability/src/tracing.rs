//! Tracing subscriber installation.

use tracing_subscriber::EnvFilter;

/// Fallback filter used when `RUST_LOG` is not set.
pub const DEFAULT_DIRECTIVE: &str = "info";

/// Install the global subscriber.
///
/// Logs are JSON lines with system-time timestamps. The `jobscope::anomaly`
/// target carries internal-consistency anomalies and is never filtered below
/// `error`, so operators can route it separately.
pub fn init(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    let filter = match "jobscope::anomaly=error".parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(true)
        .try_init();
}
