//! Server configuration read from the environment.

use std::{num::ParseIntError, path::PathBuf, time::Duration};

use pulseform_env_utils::{
    OptionEnvError, default_env, default_env_u16, default_env_u64, option_env, option_env_usize,
};
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0";
pub const DEFAULT_DATA_DIR: &str = "data";
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 1000;

/// Origins always accepted by CORS, on top of `CORS_ORIGIN`.
pub const DEV_ORIGINS: [&str; 2] = ["http://localhost:5173", "http://localhost:3000"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Env(#[from] OptionEnvError),
    #[error("Invalid port argument '{value}': {source}")]
    PortArg {
        value: String,
        source: ParseIntError,
    },
    #[error("PROGRESS_INTERVAL_MS must be greater than 0")]
    ZeroProgressInterval,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
    pub cors_origin: Option<String>,
    pub data_dir: PathBuf,
    pub progress_interval: Duration,
    pub actix_workers: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            port: DEFAULT_PORT,
            cors_origin: None,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            progress_interval: Duration::from_millis(DEFAULT_PROGRESS_INTERVAL_MS),
            actix_workers: None,
        }
    }
}

impl ServerConfig {
    /// Reads `PORT`, `BIND_ADDR`, `CORS_ORIGIN`, `DATA_DIR`,
    /// `PROGRESS_INTERVAL_MS` and `ACTIX_WORKERS`.
    ///
    /// # Errors
    ///
    /// * If a numeric variable is set but cannot be parsed
    /// * If `PROGRESS_INTERVAL_MS` is `0`
    pub fn from_env() -> Result<Self, ConfigError> {
        let progress_interval_ms =
            default_env_u64("PROGRESS_INTERVAL_MS", DEFAULT_PROGRESS_INTERVAL_MS)?;

        if progress_interval_ms == 0 {
            return Err(ConfigError::ZeroProgressInterval);
        }

        Ok(Self {
            bind_addr: default_env("BIND_ADDR", DEFAULT_BIND_ADDR),
            port: default_env_u16("PORT", DEFAULT_PORT)?,
            cors_origin: option_env("CORS_ORIGIN"),
            data_dir: PathBuf::from(default_env("DATA_DIR", DEFAULT_DATA_DIR)),
            progress_interval: Duration::from_millis(progress_interval_ms),
            actix_workers: option_env_usize("ACTIX_WORKERS")?,
        })
    }

    /// Overrides the port with a command line argument, if one was given.
    ///
    /// # Errors
    ///
    /// * If the argument is not a valid port number
    pub fn with_port_arg(mut self, arg: Option<String>) -> Result<Self, ConfigError> {
        if let Some(value) = arg {
            self.port = value
                .trim()
                .parse::<u16>()
                .map_err(|source| ConfigError::PortArg { value, source })?;
        }

        Ok(self)
    }

    #[must_use]
    pub fn allowed_origins(&self) -> Vec<String> {
        let mut origins = self.cors_origin.iter().cloned().collect::<Vec<_>>();

        for origin in DEV_ORIGINS {
            if !origins.iter().any(|x| x == origin) {
                origins.push(origin.to_string());
            }
        }

        origins
    }
}
