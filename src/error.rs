//! Error types for the vethernet client engine.
//!
//! The packet fast path reports failure as `bool`/`Option` and never
//! allocates an error; this enum covers construction, configuration and
//! open/teardown failures where context is worth carrying.

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the vethernet client.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The exchanger (or switcher) was already opened
    #[error("Component is already open")]
    AlreadyOpen,

    /// Operation on a disposed component
    #[error("Component has been disposed")]
    Disposed,

    /// Remote endpoint resolution failed
    #[error("Endpoint resolution failed: {0}")]
    Resolve(String),

    /// Transmission could not be established
    #[error("Transmission failed: {0}")]
    Transmission(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a new resolution error.
    pub fn resolve<S: Into<String>>(msg: S) -> Self {
        Self::Resolve(msg.into())
    }

    /// Create a new transmission error.
    pub fn transmission<S: Into<String>>(msg: S) -> Self {
        Self::Transmission(msg.into())
    }
}

/// Convert from anyhow::Error for convenience.
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Config(err.to_string())
    }
}
