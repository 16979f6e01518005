//! Structured logging initialization.
//!
//! The filter comes from `RS_LOG` (or `RUST_LOG`) when set; otherwise the
//! configured log level applies, raised by the verbosity setting.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::schema::ObservabilityConfig;

/// Initialize the tracing subscriber. Safe to call more than once; later
/// calls are ignored.
pub fn init(config: &ObservabilityConfig, verbosity: u8) {
    let default = match verbosity {
        0 => config.log_level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };

    let filter = tracing_subscriber::EnvFilter::try_from_env("RS_LOG")
        .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
