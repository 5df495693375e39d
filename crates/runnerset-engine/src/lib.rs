//! # runnerset-engine
//!
//! Compute backends for ephemeral GitHub Actions runners.
//!
//! Every backend implements the [`Engine`] trait so the rest of the system
//! stays compute-agnostic. Runners are strictly ephemeral: each one executes
//! exactly one job and is then permanently destroyed (never stopped, never
//! paused). The full lifecycle is:
//!
//! ```text
//! start_runner → idle → (job assigned) → busy → (job done) → destroy_runner
//! ```
//!
//! The returned id is opaque to callers. It may be a Docker container id, a
//! Compute Engine instance name, or whatever the backend uses natively.

pub mod docker;
pub mod error;
pub mod gcp;

pub use docker::{DockerConfig, DockerEngine};
pub use error::{EngineError, Result};
pub use gcp::{GcpConfig, GcpEngine};

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Shared engine trait object.
pub type DynEngine = Arc<dyn Engine>;

/// Contract every compute backend must satisfy.
///
/// Implementations launch a runner process with the provided JIT
/// configuration and fully destroy the backing resource when the job
/// completes. All operations take a cancellation token; in-flight backend
/// calls abort with [`EngineError::Cancelled`] when it fires. Shutdown paths
/// are expected to receive a detached token so cleanup is never truncated by
/// the request that triggered it.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Provisions and starts a new ephemeral runner.
    ///
    /// `name` is a human-readable identifier used both as the runner
    /// registration name and, where the backend allows it, as the resource
    /// name. `jit_config` is the base64-encoded JIT configuration minted by
    /// the scale-set API; the launched process must see it as
    /// `ACTIONS_RUNNER_INPUT_JITCONFIG` in its environment.
    ///
    /// On success the runner has been launched (not merely scheduled) and
    /// the returned backend id is tracked for shutdown. On failure no
    /// resource is left behind: a created-but-not-started resource is
    /// removed best-effort before the error is returned, and nothing is
    /// tracked.
    async fn start_runner(
        &self,
        cancel: &CancellationToken,
        name: &str,
        jit_config: &str,
    ) -> Result<String>;

    /// Permanently destroys the runner identified by `id`.
    ///
    /// For containers this means force-removal; for VMs it means deleting
    /// the instance, never merely stopping it.
    async fn destroy_runner(&self, cancel: &CancellationToken, id: &str) -> Result<()>;

    /// Destroys every runner this engine instance still tracks and releases
    /// backend clients. Called once during process termination. The tracked
    /// inventory is cleared even when individual destroys fail; the first
    /// failure is returned.
    async fn shutdown(&self, cancel: &CancellationToken) -> Result<()>;
}

/// Awaits `fut` unless `cancel` fires first.
///
/// Backend API calls have no native cancellation, so every suspension point
/// races the call against the caller's token.
pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = T> + Send,
) -> Result<T> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(EngineError::Cancelled),
        out = fut => Ok(out),
    }
}
