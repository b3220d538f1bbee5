//! Installs the global `tracing` subscriber.
//!
//! The engine itself only emits events through `tracing`. Socket lifecycle
//! and connection setup log at `debug`, protocol violations at `warn` and
//! failures that abort the scheduler at `error`.

use crate::config::LogConfig;
use std::{fs::OpenOptions, io, sync::Arc};
use thiserror::Error as ThisError;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Debug, ThisError)]
pub enum LogError {
    #[error("Failed to open the log file: {0}")]
    File(#[from] io::Error),
    #[error("Invalid log level: {0}")]
    Level(String),
    #[error("A global subscriber has already been installed")]
    AlreadyInstalled,
}

/// Sets up the global subscriber. Only should be called once per process.
/// With a directory configured, events go to `debug-<timestamp>.log` inside
/// it, otherwise to stderr.
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    let filter =
        EnvFilter::try_new(&config.level).map_err(|_| LogError::Level(config.level.clone()))?;
    let builder = FmtSubscriber::builder().with_env_filter(filter);

    let result = match (&config.directory, config.json) {
        (Some(directory), json) => {
            let file_path = directory.join(format!(
                "debug-{}.log",
                chrono::offset::Local::now().format("%y-%m-%d_%H-%M-%S")
            ));
            let file = OpenOptions::new()
                .write(true)
                .append(true)
                .create(true)
                .open(file_path)?;
            let builder = builder.with_writer(Arc::new(file)).with_ansi(false);
            if json {
                tracing::subscriber::set_global_default(builder.json().finish())
            } else {
                tracing::subscriber::set_global_default(builder.finish())
            }
        }
        (None, true) => {
            tracing::subscriber::set_global_default(builder.with_writer(io::stderr).json().finish())
        }
        (None, false) => {
            tracing::subscriber::set_global_default(builder.with_writer(io::stderr).finish())
        }
    };
    result.map_err(|_| LogError::AlreadyInstalled)
}
