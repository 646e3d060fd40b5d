//! Tracing setup.

use tracing_subscriber::EnvFilter;

/// Install a compact `tracing` subscriber filtered by `RUST_LOG`
/// (default `info`).
///
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // A subscriber may already be installed by the host process or another test.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).compact().try_init();
}
