//! Log output for tests.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Installs a test-friendly `tracing` subscriber.
///
/// Honors `RUST_LOG` and defaults to `warn`. Output goes through the test
/// harness capture. Safe to call from every test; only the first call
/// installs anything.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_test_writer().with_target(true))
        .try_init();
}
