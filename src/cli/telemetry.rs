use anyhow::{Result, anyhow};
use tracing::Level;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Map the `-v` count to a level, warnings only by default
#[must_use]
pub const fn level_for(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Install the global subscriber writing to stderr, `RUST_LOG` wins over `level`
///
/// stdout is left to the JSON signal stream.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed
pub fn init(level: Level) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init()
        .map_err(|e| anyhow!("failed to initialize tracing: {e}"))
}
