//! Tracing subscriber bootstrap.

use crate::config::{LogFormat, ObservabilityConfig};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Install the global `fmt` subscriber.
///
/// `RUST_LOG` wins over `config.log_level`. Returns `false` (and logs a
/// warning through the existing subscriber) if one was already installed.
pub fn init_tracing(config: &ObservabilityConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = match config.log_format {
        LogFormat::Full => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init(),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init(),
    };

    match installed {
        Ok(()) => {
            tracing::debug!(level = %config.log_level, "Tracing initialised");
            true
        },
        Err(error) => {
            tracing::warn!(error = %error, "Tracing subscriber already installed, keeping it");
            false
        },
    }
}
