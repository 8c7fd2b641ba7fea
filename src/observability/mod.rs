//! Observability
//!
//! Structured logging through `tracing`. Library code only emits events;
//! binaries call [`init_tracing`] once at startup.

mod config;

pub use config::{LogFormat, TracingConfig};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over `config.default_directive`. Returns an
/// error when a global subscriber is already installed.
pub fn init_tracing(
    config: &TracingConfig,
) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_directive));

    let registry = tracing_subscriber::registry().with(filter);

    match config.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_target(config.with_targets))
            .try_init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(config.with_targets))
            .try_init(),
    }
}
