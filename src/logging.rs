//! Tracing subscriber setup shared by both binaries.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::{LogFormat, LogLevel};

/// Initialize the global tracing subscriber. `RUST_LOG` still takes
/// precedence over the configured level, so a one-off debug run does not
/// need a config change.
///
/// Must be called once per process; a second call panics, which is the
/// right behavior for a bin entry point.
pub fn init(level: LogLevel, format: LogFormat) {
    let filter =
        EnvFilter::from_default_env().add_directive(tracing::Level::from(level).into());

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(
                    fmt::layer()
                        .json()
                        .flatten_event(true)
                        .with_current_span(true),
                )
                .with(filter)
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry().with(fmt::layer()).with(filter).init();
        }
    }
}
