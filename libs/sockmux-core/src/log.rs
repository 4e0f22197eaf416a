//! Logging utilities
//!
//! Thin initialization layer over the `log` facade so hosts and tests share
//! one logger setup.

pub use log::{debug, error, info, trace, warn};

/// Parse a textual level name, defaulting to `Info`
pub fn parse_level(name: &str) -> log::LevelFilter {
    match name.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "info" => log::LevelFilter::Info,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        "off" | "none" => log::LevelFilter::Off,
        _ => log::LevelFilter::Info,
    }
}

/// Initialize logging from the `RUST_LOG` environment variable. Safe to call
/// more than once; later calls are no-ops.
pub fn init_default() {
    let _ = env_logger::Builder::from_default_env().try_init();
}

/// Initialize logging with an explicit level and color choice. Safe to call
/// more than once; later calls are no-ops.
pub fn init_logging(level: &str, no_color: bool) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(parse_level(level));
    builder.format_timestamp_millis();
    if no_color {
        builder.write_style(env_logger::WriteStyle::Never);
    }
    let _ = builder.try_init();
}
