//! Logging bootstrap.
//!
//! The filter comes from `RUST_LOG`, falling back to `dynmapper=info`. Set
//! `DYNMAPPER_LOG_JSON=true` for JSON output in container environments.

use tracing_subscriber::EnvFilter;

use crate::config::{defaults, env_vars};

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(defaults::LOG_FILTER).add_directive(tracing::Level::WARN.into())
    })
}

fn json_logging() -> bool {
    std::env::var(env_vars::LOG_JSON)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false)
}

/// Install the global subscriber. Panics if one is already installed.
pub fn init_logging() {
    if json_logging() {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter())
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .with_target(false)
            .with_thread_ids(false)
            .compact()
            .init();
    }
}

/// Install the global subscriber unless one is already set.
pub fn try_init_logging() -> bool {
    let result = if json_logging() {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter())
            .with_target(true)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .with_target(false)
            .compact()
            .with_test_writer()
            .try_init()
    };
    result.is_ok()
}
