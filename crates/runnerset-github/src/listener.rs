//! Listener loop.
//!
//! Pulls messages off the session and maps them onto [`Scaler`] callbacks:
//! queue statistics drive `handle_desired_runner_count`, job batch entries
//! drive `handle_job_started` / `handle_job_completed`, and available jobs
//! are acquired so the service assigns them to this scale set.
//!
//! Errors from the scaler are not retried here; they end the loop and the
//! process decides what to do (restart, exit).

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::session::MessageSession;
use crate::types::{
    parse_job_messages, JobCompleted, JobMessage, JobStarted, RunnerScaleSetMessage,
    MESSAGE_TYPE_JOB_MESSAGES,
};

/// Callbacks the listener dispatches into. Implemented by the scaler.
///
/// All methods may be invoked concurrently and must be safe to call from
/// any task at any time.
#[async_trait]
pub trait Scaler: Send + Sync {
    /// The service reported how many runners are needed. Returns the
    /// observed runner count after reconciliation.
    async fn handle_desired_runner_count(
        &self,
        cancel: &CancellationToken,
        count: usize,
    ) -> anyhow::Result<usize>;

    /// A job started on one of our runners.
    async fn handle_job_started(
        &self,
        cancel: &CancellationToken,
        job: &JobStarted,
    ) -> anyhow::Result<()>;

    /// A job finished; its runner must be destroyed.
    async fn handle_job_completed(
        &self,
        cancel: &CancellationToken,
        job: &JobCompleted,
    ) -> anyhow::Result<()>;
}

/// Drives a message session against a [`Scaler`].
pub struct Listener {
    session: MessageSession,
}

impl Listener {
    #[must_use]
    pub fn new(session: MessageSession) -> Self {
        Self { session }
    }

    /// Runs until the token is cancelled or a dispatch fails.
    ///
    /// # Errors
    ///
    /// Returns the first session or scaler error; cancellation is a clean
    /// `Ok(())`.
    pub async fn run(
        &mut self,
        cancel: &CancellationToken,
        scaler: Arc<dyn Scaler>,
    ) -> anyhow::Result<()> {
        // Seed the first reconciliation from the session's snapshot so
        // min_runners take effect before any message arrives.
        let initial = self
            .session
            .initial_statistics()
            .map_or(0, |stats| stats.total_assigned_jobs.max(0) as usize);
        scaler.handle_desired_runner_count(cancel, initial).await?;

        loop {
            let message = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(()),
                message = self.session.next_message(cancel) => message,
            };

            let message = match message {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(crate::GithubError::Cancelled) => return Ok(()),
                Err(e) => return Err(e.into()),
            };

            self.process(cancel, &message, &scaler).await?;
        }
    }

    /// Closes the underlying message session. Call with a detached token
    /// after the run loop ends so cleanup is not truncated.
    pub async fn close(&self, cancel: &CancellationToken) -> crate::Result<()> {
        self.session.close(cancel).await
    }

    async fn process(
        &mut self,
        cancel: &CancellationToken,
        message: &RunnerScaleSetMessage,
        scaler: &Arc<dyn Scaler>,
    ) -> anyhow::Result<()> {
        if message.message_type != MESSAGE_TYPE_JOB_MESSAGES {
            tracing::warn!(
                message_type = %message.message_type,
                "skipping unknown message type"
            );
            return Ok(());
        }

        tracing::debug!(message_id = message.message_id, "processing message");

        if let Some(stats) = &message.statistics {
            let desired = stats.total_assigned_jobs.max(0) as usize;
            scaler.handle_desired_runner_count(cancel, desired).await?;
        }

        let batch = match message.body.as_deref() {
            Some(body) if !body.is_empty() => parse_job_messages(body)?,
            _ => Vec::new(),
        };

        // Claim available jobs before dispatching lifecycle events so the
        // service keeps assigning work to this scale set.
        let available: Vec<i64> = batch
            .iter()
            .filter_map(|entry| match entry {
                JobMessage::Available(job) => Some(job.runner_request_id),
                _ => None,
            })
            .collect();
        if !available.is_empty() {
            let acquired = self
                .session
                .client()
                .acquire_jobs(cancel, self.session.scale_set_id(), &available)
                .await?;
            tracing::info!(
                requested = available.len(),
                acquired = acquired.len(),
                "acquired available jobs"
            );
        }

        dispatch_jobs(cancel, scaler, batch).await
    }
}

/// Dispatches the lifecycle entries of one batch concurrently and returns
/// the first failure.
async fn dispatch_jobs(
    cancel: &CancellationToken,
    scaler: &Arc<dyn Scaler>,
    batch: Vec<JobMessage>,
) -> anyhow::Result<()> {
    let mut tasks = JoinSet::new();

    for entry in batch {
        let scaler = Arc::clone(scaler);
        let cancel = cancel.clone();
        match entry {
            JobMessage::Started(job) => {
                tasks.spawn(async move { scaler.handle_job_started(&cancel, &job).await });
            }
            JobMessage::Completed(job) => {
                tasks.spawn(async move { scaler.handle_job_completed(&cancel, &job).await });
            }
            JobMessage::Available(_) | JobMessage::Assigned(_) => {}
            JobMessage::Unknown(message_type) => {
                tracing::warn!(%message_type, "skipping unknown job message");
            }
        }
    }

    let mut first_err = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                first_err.get_or_insert(e);
            }
            Err(e) => {
                first_err.get_or_insert_with(|| anyhow::anyhow!("dispatch task panicked: {e}"));
            }
        }
    }

    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingScaler {
        desired: Mutex<Vec<usize>>,
        started: Mutex<Vec<String>>,
        completed: Mutex<Vec<(String, String)>>,
        fail_completed: bool,
    }

    #[async_trait]
    impl Scaler for RecordingScaler {
        async fn handle_desired_runner_count(
            &self,
            _cancel: &CancellationToken,
            count: usize,
        ) -> anyhow::Result<usize> {
            self.desired.lock().unwrap().push(count);
            Ok(count)
        }

        async fn handle_job_started(
            &self,
            _cancel: &CancellationToken,
            job: &JobStarted,
        ) -> anyhow::Result<()> {
            self.started.lock().unwrap().push(job.runner_name.clone());
            Ok(())
        }

        async fn handle_job_completed(
            &self,
            _cancel: &CancellationToken,
            job: &JobCompleted,
        ) -> anyhow::Result<()> {
            if self.fail_completed {
                anyhow::bail!("destroy runner {}: backend unavailable", job.runner_name);
            }
            self.completed
                .lock()
                .unwrap()
                .push((job.runner_name.clone(), job.result.clone()));
            Ok(())
        }
    }

    fn batch() -> Vec<JobMessage> {
        parse_job_messages(
            r#"[
                {"messageType":"JobStarted","runnerName":"runner-1","runnerRequestId":1},
                {"messageType":"JobStarted","runnerName":"runner-2","runnerRequestId":2},
                {"messageType":"JobCompleted","runnerName":"runner-1","result":"succeeded","runnerRequestId":1},
                {"messageType":"JobAssigned","runnerRequestId":3}
            ]"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn dispatches_started_and_completed_entries() {
        let scaler = Arc::new(RecordingScaler::default());
        let cancel = CancellationToken::new();

        let dyn_scaler: Arc<dyn Scaler> = scaler.clone();
        dispatch_jobs(&cancel, &dyn_scaler, batch()).await.unwrap();

        let mut started = scaler.started.lock().unwrap().clone();
        started.sort();
        assert_eq!(started, vec!["runner-1", "runner-2"]);
        assert_eq!(
            scaler.completed.lock().unwrap().as_slice(),
            &[("runner-1".to_string(), "succeeded".to_string())]
        );
    }

    #[tokio::test]
    async fn dispatch_surfaces_first_failure() {
        let scaler = Arc::new(RecordingScaler {
            fail_completed: true,
            ..Default::default()
        });
        let cancel = CancellationToken::new();

        let dyn_scaler: Arc<dyn Scaler> = scaler.clone();
        let err = dispatch_jobs(&cancel, &dyn_scaler, batch())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("backend unavailable"));
        // Started entries were still dispatched.
        assert_eq!(scaler.started.lock().unwrap().len(), 2);
    }
}
