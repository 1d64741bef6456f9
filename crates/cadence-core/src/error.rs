//! Cadence error taxonomy.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, CadenceError>;

/// All errors surfaced by the Cadence engine.
#[derive(Debug, Error)]
pub enum CadenceError {
    /// Configuration could not be read or parsed.
    #[error("config error: {0}")]
    Config(String),

    /// The action store rejected or failed an operation.
    #[error("store error: {0}")]
    Store(String),

    /// A caller-supplied value failed validation (e.g. submitting an
    /// action that is not pending).
    #[error("validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
