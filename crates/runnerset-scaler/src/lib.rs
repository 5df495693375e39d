//! # runnerset-scaler
//!
//! Engine-agnostic scaler bridging the scale-set message lifecycle to any
//! compute backend behind [`runnerset_engine::Engine`].
//!
//! The scaler tracks runner state (idle vs busy) in two maps behind a
//! single mutex and delegates provisioning and cleanup to the engine.
//! Runners are strictly ephemeral, which makes scale-down implicit: when
//! demand drops we simply stop creating runners and let the existing ones
//! drain as their jobs complete. Actively destroying idle runners would
//! race the service's next assignment.
//!
//! Critical sections only touch the maps; no network call ever happens
//! under the lock. In particular, job completion removes the runner from
//! the inventory *before* calling the engine, so a failed destroy leaves
//! the scaler free to provision a replacement on the next reconciliation.

mod error;

pub use error::ScalerError;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use metrics::{counter, gauge, histogram};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use runnerset_engine::DynEngine;
use runnerset_github::listener;
use runnerset_github::{JitConfigIssuer, JobCompleted, JobStarted};

/// Histogram of wall-clock seconds from JIT issuance to a launched runner.
/// Exposed so the exporter can install the 1/5/10/30/60/120/300 buckets.
pub const METRIC_STARTUP_DURATION: &str = "runnerset_runner_startup_duration_seconds";

const METRIC_RUNNERS_STARTED: &str = "runnerset_runners_started_total";
const METRIC_RUNNERS_DESTROYED: &str = "runnerset_runners_destroyed_total";
const METRIC_JOBS_COMPLETED: &str = "runnerset_jobs_completed_total";
const METRIC_SCALE_EVENTS: &str = "runnerset_scale_events_total";
const METRIC_RUNNERS_IDLE: &str = "runnerset_runners_idle";
const METRIC_RUNNERS_BUSY: &str = "runnerset_runners_busy";

/// Parameters the scaler needs that are not engine-specific.
pub struct ScalerConfig {
    pub scale_set_id: i64,
    /// Additive floor on how many runners to keep provisioned.
    pub min_runners: usize,
    /// Absolute ceiling on the fleet size.
    pub max_runners: usize,
    pub engine: DynEngine,
    pub issuer: Arc<dyn JitConfigIssuer>,
}

#[derive(Default)]
struct Inventory {
    /// Runner name -> engine id, for runners waiting on a job.
    idle: HashMap<String, String>,
    /// Runner name -> engine id, for runners executing a job.
    busy: HashMap<String, String>,
}

impl Inventory {
    fn count(&self) -> usize {
        self.idle.len() + self.busy.len()
    }

    /// Removes a runner by name, preferring `busy` and falling back to
    /// `idle` to tolerate a missed job-started event.
    fn remove(&mut self, name: &str) -> Option<String> {
        self.busy.remove(name).or_else(|| self.idle.remove(name))
    }

    /// Gauges are sampled here, under the inventory lock, so the exported
    /// pair is always a consistent snapshot.
    fn publish_gauges(&self) {
        gauge!(METRIC_RUNNERS_IDLE).set(self.idle.len() as f64);
        gauge!(METRIC_RUNNERS_BUSY).set(self.busy.len() as f64);
    }
}

/// Tracks runner state and delegates provisioning / cleanup to the engine.
pub struct Scaler {
    engine: DynEngine,
    issuer: Arc<dyn JitConfigIssuer>,
    scale_set_id: i64,
    min_runners: usize,
    max_runners: usize,
    inventory: Mutex<Inventory>,
}

impl Scaler {
    #[must_use]
    pub fn new(cfg: ScalerConfig) -> Self {
        Self {
            engine: cfg.engine,
            issuer: cfg.issuer,
            scale_set_id: cfg.scale_set_id,
            min_runners: cfg.min_runners,
            max_runners: cfg.max_runners,
            inventory: Mutex::new(Inventory::default()),
        }
    }

    /// Reconciles the fleet against the service's desired count.
    ///
    /// The target is `min(max_runners, min_runners + desired)`. Scaling up
    /// provisions runners one at a time and stops at the first failure;
    /// runners already started in the batch stay in the inventory, and the
    /// partial count remains observable through [`Scaler::runner_count`].
    /// A target below the current count destroys nothing.
    ///
    /// # Errors
    ///
    /// Returns the first JIT-issuance or engine error hit while scaling up.
    pub async fn handle_desired_runner_count(
        &self,
        cancel: &CancellationToken,
        desired: usize,
    ) -> Result<usize, ScalerError> {
        let current = self.runner_count();
        let target = self.max_runners.min(self.min_runners + desired);

        if target == current {
            counter!(METRIC_SCALE_EVENTS, "action" => "none").increment(1);
            tracing::debug!(current, target, "no scaling action needed");
            return Ok(current);
        }

        if target > current {
            let delta = target - current;
            counter!(METRIC_SCALE_EVENTS, "action" => "up").increment(1);
            tracing::info!(current, target, delta, "scaling up");

            for _ in 0..delta {
                self.start_one(cancel).await?;
            }
            return Ok(self.runner_count());
        }

        // Scale-down is implicit: runners are ephemeral and removed on job
        // completion, so a lower target just stops new provisioning.
        counter!(METRIC_SCALE_EVENTS, "action" => "down").increment(1);
        tracing::debug!(current, target, "scale down signalled, waiting for jobs to complete");
        Ok(current)
    }

    /// Marks a runner busy. Duplicate or unknown names are a no-op: the
    /// runner may already be busy from a duplicate message, may have been
    /// destroyed by an earlier completion, or may not be admitted yet when
    /// events arrive out of order.
    pub fn handle_job_started(&self, job: &JobStarted) {
        tracing::info!(
            runner = %job.runner_name,
            runner_request_id = job.runner_request_id,
            job_id = %job.job_id,
            job_display_name = %job.job_display_name,
            repo = %job.repository_name,
            "job started"
        );

        let mut inventory = self.lock();
        let Some(id) = inventory.idle.remove(&job.runner_name) else {
            tracing::warn!(runner = %job.runner_name, "job started for unknown/already-busy runner");
            return;
        };
        inventory.busy.insert(job.runner_name.clone(), id);
        inventory.publish_gauges();
    }

    /// Tears the runner down: the job is done and the runner is ephemeral.
    ///
    /// The runner leaves the inventory before the engine call, so even a
    /// failed destroy no longer counts against capacity.
    ///
    /// # Errors
    ///
    /// Returns the engine's destroy error, wrapped with the runner's name
    /// and backend id.
    pub async fn handle_job_completed(
        &self,
        cancel: &CancellationToken,
        job: &JobCompleted,
    ) -> Result<(), ScalerError> {
        counter!(METRIC_JOBS_COMPLETED, "result" => job.result.clone()).increment(1);
        tracing::info!(
            runner = %job.runner_name,
            runner_request_id = job.runner_request_id,
            job_id = %job.job_id,
            result = %job.result,
            repo = %job.repository_name,
            "job completed"
        );

        let Some(id) = self.remove_runner(&job.runner_name) else {
            tracing::warn!(runner = %job.runner_name, "job completed for unknown runner");
            return Ok(());
        };

        self.engine
            .destroy_runner(cancel, &id)
            .await
            .map_err(|source| ScalerError::Destroy {
                name: job.runner_name.clone(),
                id: id.clone(),
                source,
            })?;

        counter!(METRIC_RUNNERS_DESTROYED).increment(1);
        Ok(())
    }

    /// Tears down every runner via the engine and empties the inventory.
    /// Never fails from the caller's perspective; engine errors are logged.
    /// Call with a detached token so cleanup survives process cancellation.
    pub async fn shutdown(&self, cancel: &CancellationToken) {
        tracing::info!("shutting down all runners");
        if let Err(e) = self.engine.shutdown(cancel).await {
            tracing::error!(error = %e, "engine shutdown error");
        }

        let mut inventory = self.lock();
        inventory.idle.clear();
        inventory.busy.clear();
        inventory.publish_gauges();
    }

    /// Current fleet size, idle plus busy.
    #[must_use]
    pub fn runner_count(&self) -> usize {
        self.lock().count()
    }

    // -----------------------------------------------------------------
    // internal helpers
    // -----------------------------------------------------------------

    /// Provisions one runner: mint a JIT config, start it through the
    /// engine, admit it as idle. A JIT failure short-circuits before the
    /// engine is touched; an engine failure records nothing.
    async fn start_one(&self, cancel: &CancellationToken) -> Result<String, ScalerError> {
        let started_at = Instant::now();

        let name = format!("runner-{}", &Uuid::new_v4().simple().to_string()[..8]);

        let jit = self
            .issuer
            .generate_jit_runner_config(cancel, &name, self.scale_set_id)
            .await
            .map_err(|source| ScalerError::JitConfig {
                name: name.clone(),
                source,
            })?;

        let id = self
            .engine
            .start_runner(cancel, &name, &jit.encoded_jit_config)
            .await
            .map_err(|source| ScalerError::EngineStart {
                name: name.clone(),
                source,
            })?;

        histogram!(METRIC_STARTUP_DURATION).record(started_at.elapsed().as_secs_f64());
        counter!(METRIC_RUNNERS_STARTED).increment(1);

        let mut inventory = self.lock();
        inventory.idle.insert(name.clone(), id);
        inventory.publish_gauges();

        Ok(name)
    }

    fn remove_runner(&self, name: &str) -> Option<String> {
        let mut inventory = self.lock();
        let id = inventory.remove(name);
        if id.is_some() {
            inventory.publish_gauges();
        }
        id
    }

    fn lock(&self) -> MutexGuard<'_, Inventory> {
        self.inventory.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl listener::Scaler for Scaler {
    async fn handle_desired_runner_count(
        &self,
        cancel: &CancellationToken,
        count: usize,
    ) -> anyhow::Result<usize> {
        Ok(Scaler::handle_desired_runner_count(self, cancel, count).await?)
    }

    async fn handle_job_started(
        &self,
        _cancel: &CancellationToken,
        job: &JobStarted,
    ) -> anyhow::Result<()> {
        Scaler::handle_job_started(self, job);
        Ok(())
    }

    async fn handle_job_completed(
        &self,
        cancel: &CancellationToken,
        job: &JobCompleted,
    ) -> anyhow::Result<()> {
        Ok(Scaler::handle_job_completed(self, cancel, job).await?)
    }
}
