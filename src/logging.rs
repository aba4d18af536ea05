//! # Logging
//!
//! Sends the `log` records of a run to a plain text file next to the plugin.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use env_logger::{Builder, Env, Logger, Target, WriteStyle};
use log::{LevelFilter, SetLoggerError};
use thiserror::Error;

/// Environment variable that overrides the configured level, in `env_logger` filter syntax
pub const LOG_ENV: &str = "AOBPATCH_LOG";

/// Errors when installing the file logger
#[derive(Debug, Error)]
pub enum LogInitError {
    /// Log file could not be created
    #[error("failed to create log file: {0}")]
    Io(#[from] io::Error),
    /// Some logger was installed before us
    #[error("a logger is already installed")]
    AlreadyInstalled(#[from] SetLoggerError),
}

/// Log file for a plugin at `module_path`: same path, `.log` extension
pub fn log_path_for(module_path: &Path) -> PathBuf {
    module_path.with_extension("log")
}

/// Builds a logger that writes uncolored lines to `file`
pub fn file_logger(file: File, level: LevelFilter) -> Logger {
    Builder::new()
        .filter_level(level)
        .parse_env(Env::new().filter(LOG_ENV))
        .format_timestamp_secs()
        .format_module_path(false)
        .write_style(WriteStyle::Never)
        .target(Target::Pipe(Box::new(file)))
        .build()
}

/// Installs a logger writing to `path` as the global `log` backend, then truncates the file.
///
/// When another logger is already installed, neither the file nor the global level is touched.
pub fn init_file_logger(path: &Path, level: LevelFilter) -> Result<(), LogInitError> {
    let file = OpenOptions::new().create(true).write(true).truncate(false).open(path)?;
    let handle = file.try_clone()?;
    let logger = file_logger(file, level);
    let filter = logger.filter();

    log::set_boxed_logger(Box::new(logger))?;
    handle.set_len(0)?;
    log::set_max_level(filter);
    Ok(())
}
