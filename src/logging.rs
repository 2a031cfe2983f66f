//! `tracing` subscriber setup for the command-line front end.

use tracing_subscriber::{fmt, EnvFilter};

/// Install a fmt subscriber writing to stderr.
///
/// `RUST_LOG` selects the filter (default `info`), e.g. `RUST_LOG=geo_ingest=debug`.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}
