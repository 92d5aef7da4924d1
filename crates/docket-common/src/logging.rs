//! Tracing subscriber setup

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Environment variable consulted before the fallback level.
pub const LOG_ENV: &str = "DOCKET_LOG";

/// Install a global `fmt` subscriber.
///
/// The filter comes from `DOCKET_LOG`, then `RUST_LOG`, then `level`.
/// Calling this more than once is harmless; later calls are ignored.
pub fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init()
        .ok(); // Ignore error if already initialized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_twice() {
        init_tracing("debug");
        init_tracing("warn");
        tracing::info!("subscriber installed");
    }
}
