//! Logging bootstrap using tracing.

use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    filter::Directive, fmt, layer::SubscriberExt, util::SubscriberInitExt,
    util::TryInitError, EnvFilter,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable format
    Pretty,
    /// JSON format for log aggregation
    Json,
    /// Compact format
    Compact,
}

const QUIET_TARGETS: [&str; 3] = ["hyper=warn", "reqwest=warn", "duckdb=warn"];

/// `RUST_LOG` when set, otherwise `info` with noisy dependencies at `warn`.
fn env_filter(rust_log: Option<&str>) -> EnvFilter {
    let builder = EnvFilter::builder().with_default_directive(LevelFilter::INFO.into());

    match rust_log.map(str::trim).filter(|raw| !raw.is_empty()) {
        Some(raw) => builder.parse_lossy(raw),
        None => QUIET_TARGETS
            .iter()
            .filter_map(|directive| directive.parse::<Directive>().ok())
            .fold(builder.parse_lossy(""), EnvFilter::add_directive),
    }
}

/// Install the global subscriber. Logs go to stderr so stdout stays JSON.
pub fn init_logging(format: LogFormat) -> Result<(), TryInitError> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let registry = tracing_subscriber::registry().with(env_filter(rust_log.as_deref()));

    match format {
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .with_thread_ids(false),
            )
            .try_init(),
    }
}
