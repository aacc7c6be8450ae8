//! Shared tracing/logging initialization.
//!
//! Log lines go to stderr so they never interleave with anything the binary
//! prints on stdout.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Build the default filter directive for the given level, covering every
/// `Burrow` crate.
pub fn default_filter(level: &str) -> String {
    format!("burrow={level},burrow_core={level}")
}

/// Initialise the global tracing subscriber.
///
/// * `log_level` -- level applied to the `Burrow` crates when `RUST_LOG` is
///   not set (e.g. `"info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
pub fn init_tracing(log_level: &str, log_json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(log_level)));
    let registry = tracing_subscriber::registry().with(env_filter);
    if log_json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
