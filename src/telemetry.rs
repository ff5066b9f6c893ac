//! Tracing subscriber setup.
//!
//! Filter comes from `RELAY_LOG`, then `RUST_LOG`, defaulting to `relay=info`.
//! `RELAY_LOG_FORMAT=json` switches to newline-delimited JSON. Output always
//! goes to stderr so stdout stays clean for `relay schema` and friends.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

const DEFAULT_FILTER: &str = "relay=info";

/// Install the global subscriber. Safe to call more than once; later calls are no-ops.
pub fn init() {
    let filter = std::env::var("RELAY_LOG")
        .ok()
        .or_else(|| std::env::var("RUST_LOG").ok())
        .and_then(|spec| EnvFilter::try_new(spec).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER));

    let json = std::env::var("RELAY_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
    };

    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
