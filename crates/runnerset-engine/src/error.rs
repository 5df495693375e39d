//! Error types for compute backends.

use thiserror::Error;

use crate::gcp::GcpApiError;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur in engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Docker daemon API failure. Surfaced verbatim, including
    /// "No such container" on destroy.
    #[error("docker api: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// Compute Engine API failure.
    #[error("gcp api: {0}")]
    Gcp(#[from] GcpApiError),

    /// Starting a runner failed. Any partially created resource has
    /// already been removed best-effort and nothing is tracked.
    #[error("start runner {name}: {reason}")]
    StartFailed { name: String, reason: String },

    /// Destroying a runner failed. The resource may still exist in the
    /// backend.
    #[error("destroy runner {id}: {reason}")]
    DestroyFailed { id: String, reason: String },

    /// The engine could not be constructed (client connection, image
    /// pre-pull, credential resolution).
    #[error("engine construction: {0}")]
    Construction(String),

    /// The caller's cancellation token fired while a backend call was in
    /// flight.
    #[error("operation cancelled")]
    Cancelled,
}

impl EngineError {
    /// Returns true when the error is a cancellation, as opposed to a
    /// backend failure.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
