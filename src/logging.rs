//! Tracing bootstrap.
//!
//! The library only emits `tracing` events; it never installs a subscriber
//! on its own. Embedders that have no subscriber can call [`init`].

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a global subscriber.
///
/// Reads `RUST_LOG`, defaulting to `warn`. Output: stderr, compact format.
/// Does nothing if a global subscriber is already set.
///
/// # Example
/// ```bash
/// RUST_LOG=stardust=debug cargo test --test runtime_e2e
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
