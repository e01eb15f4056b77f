#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

use std::{
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
};

pub use log;
use pulseform_env_utils::{default_env, option_env};
use thiserror::Error;

#[cfg(feature = "macros")]
mod macros;

#[cfg(debug_assertions)]
pub const DEFAULT_LOG_LEVEL: &str = "pulseform=debug,actix_web=info";
#[cfg(not(debug_assertions))]
pub const DEFAULT_LOG_LEVEL: &str = "pulseform=info,actix_web=info";

#[derive(Debug, Error)]
pub enum InitError {
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error(transparent)]
    SetLogger(#[from] log::SetLoggerError),
}

/// The filter applied to the logger: `PULSEFORM_LOG`, then `RUST_LOG`, then
/// [`DEFAULT_LOG_LEVEL`].
#[must_use]
pub fn log_filter() -> String {
    option_env("PULSEFORM_LOG").unwrap_or_else(|| default_env("RUST_LOG", DEFAULT_LOG_LEVEL))
}

/// Resolves where a log file named `filename` is written: `LOG_DIR`, or
/// `logs` relative to the working directory.
#[must_use]
pub fn log_file_path(filename: &str) -> PathBuf {
    Path::new(&default_env("LOG_DIR", "logs")).join(filename)
}

fn open_log_file(path: &Path) -> Result<fs::File, std::io::Error> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    OpenOptions::new().create(true).append(true).open(path)
}

/// Installs the global logger.
///
/// With a `filename`, records are appended to that file under the log
/// directory instead of stderr.
///
/// # Errors
///
/// * If the log file cannot be created or opened
/// * If a global logger was already installed
pub fn init(filename: Option<&str>) -> Result<(), InitError> {
    let mut builder = env_logger::Builder::new();
    builder.parse_filters(&log_filter());

    if let Some(filename) = filename {
        let path = log_file_path(filename);
        let file = open_log_file(&path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
        eprintln!("Logging to {}", path.display());
    }

    builder.try_init()?;

    Ok(())
}
