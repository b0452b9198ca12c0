//! Logging setup (tracing-subscriber)

use crate::error::{BqError, Result};
use tracing_subscriber::EnvFilter;

/// Build the filter: RUST_LOG when set, otherwise `level` with noisy crates muted
fn build_env_filter(level: &str) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    let mut directives = vec![level.to_string()];
    for (target, lvl) in [("hyper", "warn"), ("reqwest", "warn"), ("sqlparser", "warn")] {
        directives.push(format!("{}={}", target, lvl));
    }
    let filter_str = directives.join(",");
    EnvFilter::try_new(&filter_str)
        .map_err(|e| BqError::Config(format!("invalid log filter '{}': {}", filter_str, e)))
}

/// Install the global fmt subscriber
///
/// Calling it again after a subscriber is installed is a no-op.
pub fn init(level: &str) -> Result<()> {
    let filter = build_env_filter(level)?;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
    Ok(())
}
