//! Tracing subscriber setup for the command line tool

use std::sync::Once;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Default filter for a number of `-v` flags
fn default_level(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Initialize the global tracing subscriber, writing to stderr
///
/// `RUST_LOG` takes precedence over the verbosity. Subsequent calls are ignored.
pub fn init_tracing(verbosity: u8) {
    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_level(verbosity)));

        let fmt_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(verbosity > 2);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();

        tracing::debug!("tracing initialized");
    });
}
