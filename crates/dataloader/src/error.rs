use std::fmt;

use thiserror::Error;

/// An error produced while loading a resource for a cache entry.
///
/// Load failures are captured as values and stored on the entry that
/// requested them; the engine never lets them escape as panics. The enum is
/// cheap to clone so that every subscriber joined to a single in-flight call
/// can observe the same outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// The requested key is not tracked by the registry.
    #[error("key is not tracked")]
    NotTracked,
    /// The user-supplied load function failed.
    #[error("load failed: {0}")]
    Failed(String),
    /// An unexpected error inside the registry itself.
    ///
    /// This variant is not intended to be produced by load functions.
    #[error("internal error")]
    InternalError,
}

impl LoadError {
    /// Creates a [`LoadError::Failed`] from any displayable cause.
    pub fn failed(cause: impl fmt::Display) -> Self {
        Self::Failed(cause.to_string())
    }

    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }
}

impl From<std::io::Error> for LoadError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

/// Outcome of a load, either the fresh value or the reason it failed.
pub type LoadResult<T> = Result<T, LoadError>;
