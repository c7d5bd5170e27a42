//! Logging module
//!
//! Module-tagged logging macros on top of the `log` facade, with
//! `env_logger` as the backend.

use std::io::Write;

use env_logger::{Builder, Env};
use log::LevelFilter;

/// Initialize the logger
///
/// Honors `RUST_LOG` when set, otherwise logs at INFO.
pub fn init() {
    let result = Builder::from_env(Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] [{:<5}] [{}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .try_init();

    if result.is_err() {
        // Already initialized (tests, embedding applications)
        log::debug!("logger already initialized");
    }
}

/// Switch between DEBUG (verbose) and INFO log levels at runtime
pub fn set_log_level(verbose: bool) {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    log::set_max_level(level);
}

/// Log at INFO level with a module tag: `log_info!(MODULE, "fmt", args..)`
#[macro_export]
macro_rules! log_info {
    ($module:expr, $($arg:tt)+) => {
        match ::std::convert::AsRef::<str>::as_ref(&$module) {
            target => ::log::info!(target: target, $($arg)+),
        }
    };
}

/// Log at WARN level with a module tag
#[macro_export]
macro_rules! log_warn {
    ($module:expr, $($arg:tt)+) => {
        match ::std::convert::AsRef::<str>::as_ref(&$module) {
            target => ::log::warn!(target: target, $($arg)+),
        }
    };
}

/// Log at ERROR level with a module tag
#[macro_export]
macro_rules! log_error {
    ($module:expr, $($arg:tt)+) => {
        match ::std::convert::AsRef::<str>::as_ref(&$module) {
            target => ::log::error!(target: target, $($arg)+),
        }
    };
}

/// Log at DEBUG level with a module tag (only shown with `--verbose`)
#[macro_export]
macro_rules! log_debug {
    ($module:expr, $($arg:tt)+) => {
        match ::std::convert::AsRef::<str>::as_ref(&$module) {
            target => ::log::debug!(target: target, $($arg)+),
        }
    };
}
