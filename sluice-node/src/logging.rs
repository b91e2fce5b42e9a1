//! Tracing subscriber setup.
//!
//! - WARN: failing listeners, transfers that end short or fail
//! - INFO: offers, decisions, completed transfers
//! - DEBUG: dropped offers, negotiation failures, config loading
//! - TRACE: individual frames

use tracing_subscriber::EnvFilter;

/// Install the subscriber. Level comes from `RUST_LOG`, default `info`.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Test variant: captured output, safe to call more than once.
pub fn init_for_tests() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
