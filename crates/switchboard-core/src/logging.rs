//! `tracing` subscriber setup.

use tracing_subscriber::EnvFilter;

/// Output format for the stderr subscriber.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable single-line output.
    #[default]
    Compact,
    /// One JSON object per event.
    Json,
}

/// Build the level filter, letting `RUST_LOG` take precedence over `level`.
pub fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Initialize the global tracing subscriber writing to stderr.
///
/// Call once at application startup. Subsequent calls are no-ops.
///
/// # Arguments
///
/// * `level` - Minimum log level (e.g. `"info"`, `"switchboard_server=debug"`).
/// * `format` - Compact text or JSON lines.
pub fn init_subscriber(level: &str, format: LogFormat) {
    let filter = build_filter(level);

    // try_init is a no-op if a global subscriber is already set
    let _ = match format {
        LogFormat::Compact => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .compact()
            .try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .json()
            .try_init(),
    };
}
