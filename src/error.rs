//! Crate-level error type.

use crate::config::ConfigError;
use thiserror::Error;

/// Fatal errors that stop the server.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
