//! Helpers related to tracing, used by main entrypoints

use tracing_subscriber::filter::LevelFilter;

/// Initialize tracing with the default configuration.
///
/// Progress of the tool is reported at `INFO`, so that is the default
/// level; `RUST_LOG` overrides it.
pub fn initialize_tracing() {
    // Don't include timestamps and such because they're not really useful and
    // too verbose, and plus several log targets such as journald will already
    // include timestamps.
    let format = tracing_subscriber::fmt::format()
        .without_time()
        .with_target(false)
        .compact();
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    // Log to stderr by default
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(format)
        .with_writer(std::io::stderr)
        .init();
}
