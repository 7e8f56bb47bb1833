//! Logger setup for the command-line front end

use env_logger::Env;
use log::LevelFilter;

/// Initialize the logger with the given [LevelFilter]; `RUST_LOG` overrides it
pub fn initialize_logger(filter: LevelFilter) {
    env_logger::Builder::from_env(Env::default().default_filter_or(filter.as_str()))
        .format_target(false)
        .init();
}
