//! Logging initialization for etude.
//!
//! The engine logs through `tracing`; nothing is printed until a subscriber is
//! installed. The level is controlled by `RUST_LOG`:
//!
//! ```bash
//! # Per-request lines
//! RUST_LOG=etude_core=debug etude 8080 4
//!
//! # Only warnings and errors (production)
//! RUST_LOG=warn etude
//! ```

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Initialize human-readable logging, defaulting to `info`.
///
/// # Panics
///
/// Panics if a global subscriber is already installed. Call it once at startup.
pub fn init_logging() {
    init_logging_with_level("info");
}

/// Initialize human-readable logging with a specific default level.
///
/// `RUST_LOG`, when set, still wins.
pub fn init_logging_with_level(level: &str) {
    tracing_subscriber::registry()
        .with(filter(level))
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .init();
}

/// Initialize JSON-formatted logging (recommended for production).
pub fn init_logging_json() {
    tracing_subscriber::registry()
        .with(filter("info"))
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}
