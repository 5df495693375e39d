//! Error types for the scaler.

use thiserror::Error;

use runnerset_engine::EngineError;
use runnerset_github::GithubError;

/// Errors surfaced from scaler operations. No retries happen here; the
/// listener decides whether to retry a reconciliation tick.
#[derive(Debug, Error)]
pub enum ScalerError {
    /// JIT config issuance failed; the engine was never invoked for this
    /// runner.
    #[error("generate JIT config for {name}: {source}")]
    JitConfig {
        name: String,
        #[source]
        source: GithubError,
    },

    /// The engine failed to start a runner; nothing was recorded.
    #[error("engine start {name}: {source}")]
    EngineStart {
        name: String,
        #[source]
        source: EngineError,
    },

    /// The engine failed to destroy a runner. The runner has already been
    /// removed from the inventory; the next reconciliation provisions a
    /// replacement if demand persists.
    #[error("destroy runner {name} ({id}): {source}")]
    Destroy {
        name: String,
        id: String,
        #[source]
        source: EngineError,
    },
}
