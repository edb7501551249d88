//! Shared helpers for the integration tests.

use std::sync::Once;

static INIT_LOGGING: Once = Once::new();

/// Route `tracing` output through the test harness. Honours `RUST_LOG`,
/// defaulting to warnings.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .with_thread_names(true)
            .with_ansi(false)
            .try_init();
    });
}
