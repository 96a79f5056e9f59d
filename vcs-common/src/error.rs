//! Error type for loading shared vcstream settings

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by `vcs-common`
#[derive(Error, Debug)]
pub enum Error {
    /// Config file could not be read or parsed, or a required
    /// environment variable is missing or malformed
    #[error("Configuration error: {0}")]
    Config(String),
}
