//! Tracing subscriber setup.
//!
//! The runtime only emits `tracing` events; nothing is printed until one
//! of these initializers installs a subscriber. `RUST_LOG` always wins over
//! the level passed in code:
//!
//! ```bash
//! # scheduler transitions, suspend/resume, readiness waits
//! RUST_LOG=etude_core=debug cargo run --example long_poll
//!
//! # production
//! RUST_LOG=warn cargo run --release
//! ```

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Human-readable logs to stdout at `info` unless `RUST_LOG` says otherwise.
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_logging() {
    init_logging_with_level("info");
}

/// Like [`init_logging`] with a different default level (`"debug"`,
/// `"warn"`, or a full directive such as `"etude_core=debug,info"`).
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_logging_with_level(level: &str) {
    tracing_subscriber::registry()
        .with(filter(level))
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .init();
}

/// One JSON object per event, for log shippers.
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_logging_json() {
    tracing_subscriber::registry()
        .with(filter("info"))
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}
