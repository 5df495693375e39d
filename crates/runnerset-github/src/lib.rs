//! # runnerset-github
//!
//! Client side of the GitHub Actions runner scale-set protocol:
//!
//! - credential resolution (personal access token or GitHub App) and the
//!   Actions service admin connection,
//! - runner scale-set CRUD and runner-group lookup,
//! - just-in-time runner config issuance,
//! - the long-polled message session, and
//! - the [`listener::Listener`] loop that maps session messages onto the
//!   [`listener::Scaler`] callbacks.
//!
//! The scale-set protocol is a thin REST surface under
//! `<actions service>/_apis/runtime/`; access is bootstrapped by exchanging
//! a runner registration token at the `actions/runner-registration`
//! endpoint for a service URL plus admin token.

pub mod auth;
pub mod client;
pub mod error;
pub mod listener;
pub mod session;
pub mod types;

pub use auth::{Credential, GitHubAppAuth};
pub use client::{ActionsClient, JitConfigIssuer};
pub use error::{GithubError, Result};
pub use listener::{Listener, Scaler};
pub use session::MessageSession;
pub use types::{
    JitRunnerConfig, JobCompleted, JobStarted, Label, RunnerGroup, RunnerScaleSet,
    RunnerScaleSetMessage, RunnerScaleSetStatistic,
};

use std::future::Future;

use tokio_util::sync::CancellationToken;

/// Name of the default runner group every installation has.
pub const DEFAULT_RUNNER_GROUP: &str = "Default";

/// Id of the default runner group; lookups for [`DEFAULT_RUNNER_GROUP`]
/// short-circuit to this.
pub const DEFAULT_RUNNER_GROUP_ID: i64 = 1;

/// Awaits `fut` unless `cancel` fires first.
pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = T> + Send,
) -> Result<T> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(GithubError::Cancelled),
        out = fut => Ok(out),
    }
}
