use std::error::Error as StdError;
use std::sync::Arc;

use thiserror::Error;

/// Shared, clonable handle to an error produced by the upstream fetch.
pub type SharedError = Arc<dyn StdError + Send + Sync>;

/// Errors surfaced by the memoizing cache.
///
/// Every caller that joined a fetch wave receives a clone of the same value,
/// so the variants only carry reference-counted payloads.
#[derive(Debug, Clone, Error)]
pub enum MemoError {
    /// The continuation (or collecting its response body) failed.
    #[error("upstream error: {0}")]
    Upstream(#[source] SharedError),

    #[error("fetch task panicked")]
    FetchPanicked,

    /// The fetch task was aborted before it produced a result, which only
    /// happens while the runtime is shutting down.
    #[error("fetch task cancelled")]
    FetchCancelled,
}

impl MemoError {
    /// Wraps an arbitrary upstream error.
    pub fn upstream<E>(err: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        Self::Upstream(Arc::from(err.into()))
    }

    /// Returns the upstream error when this is [`MemoError::Upstream`].
    pub fn as_upstream(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        match self {
            Self::Upstream(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

/// Errors raised while loading a [`MemoConfig`](crate::config::MemoConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Parse(#[from] serde_json::Error),
}
