//! Tracing subscriber setup for convoy binaries.
//!
//! Call [`init_tracing`] once at program start. Later calls are ignored,
//! since the global subscriber can only be set once per process.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber.
///
/// * `json`: emit newline-delimited JSON instead of human-readable lines.
/// * `level`: default verbosity when `RUST_LOG` is not set.
///
/// Logs go to stderr so command output on stdout stays machine-readable.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr)
                    .json(),
            )
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
            .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_is_idempotent() {
        init_tracing(false, Level::WARN);
        init_tracing(true, Level::DEBUG);
    }
}
