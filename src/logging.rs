//! Diagnostic logging setup.
//!
//! `RUST_LOG` takes precedence. Otherwise the filter is `[log].level`
//! from the config, or `debug` with `--verbose`. Logs go to stderr so that
//! command output on stdout stays machine-readable.

use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

/// Build the filter for the given config and verbosity.
pub fn env_filter(config: &LogConfig, verbose: bool) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = if verbose { "debug" } else { config.level.as_str() };
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init(config: &LogConfig, verbose: bool) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(config, verbose))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow!("installing log subscriber: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_reports_error() {
        let config = LogConfig::default();
        let _ = init(&config, false);
        let err = init(&config, true).unwrap_err();
        assert!(err.to_string().contains("installing log subscriber"));
    }
}
