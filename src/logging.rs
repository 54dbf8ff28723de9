//! `tracing` subscriber setup for binaries and demos.
//!
//! The filter comes from `RUST_LOG` when set, otherwise from the directive
//! passed in (e.g. `"info"` or `"xled=debug"`). Calling either function more
//! than once is harmless; later calls leave the first subscriber in place.

use tracing_subscriber::{fmt, EnvFilter};

fn filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| directive_filter(default_directive))
}

fn directive_filter(directive: &str) -> EnvFilter {
    EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Human-readable output.
pub fn init(default_directive: &str) -> bool {
    fmt()
        .with_env_filter(filter(default_directive))
        .with_target(true)
        .try_init()
        .is_ok()
}

/// One JSON object per event.
pub fn init_json(default_directive: &str) -> bool {
    fmt()
        .json()
        .with_env_filter(filter(default_directive))
        .with_target(true)
        .with_current_span(true)
        .try_init()
        .is_ok()
}
