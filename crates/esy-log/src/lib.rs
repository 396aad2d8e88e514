//! Tracing subscriber initialization, shared by every entry point that
//! embeds the build core. Level comes from `ESY__LOG`; the default matches
//! the environment variable documented for the planner and scheduler.

use std::str::FromStr;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt as _, util::SubscriberInitExt as _};

const ENV_VAR: &str = "ESY__LOG";

/// Initialize a global `tracing` subscriber writing to stderr.
///
/// Reads `ESY__LOG` if `level` is `None`; falls back to `warn` when unset or
/// unparsable.
pub fn init(level: Option<LevelFilter>) {
    let level = level.unwrap_or_else(level_from_env);

    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn level_from_env() -> LevelFilter {
    std::env::var(ENV_VAR)
        .ok()
        .and_then(|s| LevelFilter::from_str(&s).ok())
        .unwrap_or(LevelFilter::WARN)
}
