//! Diagnostic logging.
//!
//! The engine reports through the `tracing` macros only. Nothing is printed
//! until a subscriber is installed, so leaving logging disabled turns every
//! event into a no-op.
//!
//! The filter can always be overridden with `RUST_LOG`:
//!
//! ```bash
//! RUST_LOG=etude=debug etude
//! ```

use crate::config::LogConfig;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber described by `config`.
///
/// Returns false if logging is disabled or a subscriber was already
/// installed; calling it more than once is harmless.
pub fn init_logging(config: &LogConfig) -> bool {
    if !config.enabled {
        return false;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .is_ok()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_thread_names(true)
                    .with_target(false),
            )
            .try_init()
            .is_ok()
    }
}
