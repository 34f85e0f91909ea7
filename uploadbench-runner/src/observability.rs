use std::env;
use std::io::IsTerminal;

use tracing::Level;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, Layer, prelude::*};

use crate::config::{LogFormat, Logging};

/// Installs the global tracing subscriber writing to stderr.
pub fn init_tracing(logging: &Logging) {
    let (rust_log, env_filter) = parse_rust_log();

    // An explicit level in `RUST_LOG` takes precedence over the configured one.
    let level = match rust_log {
        Some(level) => LevelFilter::from(level),
        None => logging.level,
    };

    let format = match logging.format {
        LogFormat::Auto if std::io::stderr().is_terminal() => LogFormat::Pretty,
        LogFormat::Auto => LogFormat::Simplified,
        format => format,
    };

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true);
    let layer = match format {
        LogFormat::Json => layer.json().flatten_event(true).boxed(),
        LogFormat::Simplified => layer.with_ansi(false).boxed(),
        LogFormat::Pretty | LogFormat::Auto => layer.compact().with_ansi(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(level))
        .with(env_filter)
        .init();
}

/// Reads `RUST_LOG`.
///
/// A plain level such as `debug` is returned as a level with the default per-crate filter.
/// Anything else is used literally as the filter.
fn parse_rust_log() -> (Option<Level>, EnvFilter) {
    let level = match env::var(EnvFilter::DEFAULT_ENV) {
        Ok(value) => match value.parse::<Level>() {
            Ok(level) => Some(level),
            Err(_) => return (Some(Level::TRACE), EnvFilter::new(value)),
        },
        Err(_) => None,
    };

    // This is the maximum verbosity that will be logged, we filter this down to `level`.
    let env_filter = EnvFilter::new(
        "INFO,\
        uploadbench=TRACE,\
        uploadbench_runner=TRACE,\
        uploadbench_storage=TRACE,\
        ",
    );

    (level, env_filter)
}
