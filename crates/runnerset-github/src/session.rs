//! Message session lifecycle.
//!
//! A session owns the queue URL plus its access token and the last-seen
//! message id (sending it with the next poll acks the previous message).
//! Queue tokens expire; an unauthorized poll tears the session down and
//! opens a fresh one with the same owner key.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::client::ActionsClient;
use crate::error::Result;
use crate::types::{MessageSessionInfo, RunnerScaleSetMessage, RunnerScaleSetStatistic};

/// An open message session for one scale set.
pub struct MessageSession {
    client: Arc<ActionsClient>,
    scale_set_id: i64,
    owner: String,
    info: MessageSessionInfo,
    last_message_id: i64,
}

impl MessageSession {
    /// Opens a session keyed by `owner` (typically the hostname).
    ///
    /// # Errors
    ///
    /// Returns an error if the service rejects the session request, e.g.
    /// because another listener already holds one for this scale set.
    pub async fn open(
        client: Arc<ActionsClient>,
        cancel: &CancellationToken,
        scale_set_id: i64,
        owner: &str,
    ) -> Result<Self> {
        let info = client
            .create_message_session(cancel, scale_set_id, owner)
            .await?;
        tracing::info!(session_id = %info.session_id, owner, "message session opened");
        Ok(Self {
            client,
            scale_set_id,
            owner: owner.to_string(),
            info,
            last_message_id: 0,
        })
    }

    /// Statistics captured when the session was opened, for seeding the
    /// first reconciliation before any message arrives.
    #[must_use]
    pub fn initial_statistics(&self) -> Option<RunnerScaleSetStatistic> {
        self.info.statistics
    }

    /// The id of the scale set this session listens on.
    #[must_use]
    pub fn scale_set_id(&self) -> i64 {
        self.scale_set_id
    }

    /// Client handle, for job acquisition during message processing.
    #[must_use]
    pub fn client(&self) -> &Arc<ActionsClient> {
        &self.client
    }

    /// Long-polls for the next message, acking the previous one.
    /// `Ok(None)` means an empty poll window or a session refresh; callers
    /// just poll again.
    pub async fn next_message(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<RunnerScaleSetMessage>> {
        match self
            .client
            .get_message(cancel, &self.info, self.last_message_id)
            .await
        {
            Ok(Some(message)) => {
                self.last_message_id = message.message_id;
                Ok(Some(message))
            }
            Ok(None) => Ok(None),
            Err(e) if e.is_unauthorized() => {
                tracing::info!("message queue token expired, reopening session");
                self.reopen(cancel).await?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn reopen(&mut self, cancel: &CancellationToken) -> Result<()> {
        // Best-effort delete of the stale session; the create below is what
        // matters.
        let _ = self
            .client
            .delete_message_session(cancel, self.scale_set_id, &self.info.session_id)
            .await;
        self.info = self
            .client
            .create_message_session(cancel, self.scale_set_id, &self.owner)
            .await?;
        Ok(())
    }

    /// Closes the session. Safe to call with a detached token during
    /// shutdown.
    pub async fn close(&self, cancel: &CancellationToken) -> Result<()> {
        self.client
            .delete_message_session(cancel, self.scale_set_id, &self.info.session_id)
            .await
    }
}
