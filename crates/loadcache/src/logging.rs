//! Logging setup for applications embedding the loader.
//!
//! The library itself only emits [`tracing`] events; installing a subscriber
//! is the host's job. [`init`] is a convenience that configures one from the
//! [`Logging`] config section.

use std::io::IsTerminal;

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;

use crate::config::{LogFormat, Logging};

/// Initializes a global `tracing` subscriber from the logging config.
///
/// Honors `RUST_LOG` when set, falling back to the configured level. Calling
/// this more than once is a no-op, which keeps it safe in tests.
pub fn init(config: &Logging) {
    let filter = EnvFilter::builder()
        .with_default_directive(config.level.into())
        .from_env_lossy();

    let format = match config.format {
        LogFormat::Auto => {
            if std::io::stderr().is_terminal() {
                LogFormat::Pretty
            } else {
                LogFormat::Simplified
            }
        }
        other => other,
    };

    let builder = fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(true);

    match format {
        LogFormat::Pretty => builder.pretty().try_init().ok(),
        LogFormat::Simplified => builder.compact().with_ansi(false).try_init().ok(),
        LogFormat::Json => builder
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_file(true)
            .with_line_number(true)
            .try_init()
            .ok(),
        LogFormat::Auto => unreachable!("resolved above"),
    };
}
