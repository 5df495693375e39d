//! Actions service client.
//!
//! Bootstraps an admin connection by exchanging a runner registration token
//! at the `actions/runner-registration` endpoint, then talks to the
//! scale-set REST surface under `<service>/_apis/runtime/`. Expired admin
//! tokens (HTTP 401) trigger one transparent re-acquisition and retry.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::auth::{ConfigUrl, Credential};
use crate::cancellable;
use crate::error::{GithubError, Result};
use crate::types::{
    JitRunnerConfig, ListResponse, MessageSessionInfo, RunnerGroup, RunnerScaleSet,
    RunnerScaleSetMessage,
};
use crate::{DEFAULT_RUNNER_GROUP, DEFAULT_RUNNER_GROUP_ID};

const API_VERSION: &str = "api-version=6.0-preview.1";
const USER_AGENT: &str = concat!("runnerset/", env!("CARGO_PKG_VERSION"));

/// Ordinary REST calls get a short deadline; the message long-poll holds
/// the connection for ~50 s server-side and gets a generous one.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const LONG_POLL_TIMEOUT: Duration = Duration::from_secs(100);

#[derive(Debug, Clone, Deserialize)]
struct AdminConnection {
    url: String,
    token: String,
}

/// Issues just-in-time runner configs. The scaler depends on this seam so
/// tests can mint configs without a live service.
#[async_trait]
pub trait JitConfigIssuer: Send + Sync {
    /// Mints a JIT registration config bound to `name` and the scale set.
    async fn generate_jit_runner_config(
        &self,
        cancel: &CancellationToken,
        name: &str,
        scale_set_id: i64,
    ) -> Result<JitRunnerConfig>;
}

/// Client for the scale-set surface of the Actions service.
pub struct ActionsClient {
    http: reqwest::Client,
    config: ConfigUrl,
    credential: Credential,
    admin: RwLock<Option<AdminConnection>>,
}

impl ActionsClient {
    /// Creates a client for the given registration URL and credential. No
    /// network traffic happens until the first call.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL cannot be parsed into a registration
    /// scope.
    pub fn new(github_url: &str, credential: Credential) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::new(),
            config: ConfigUrl::parse(github_url)?,
            credential,
            admin: RwLock::new(None),
        })
    }

    // -----------------------------------------------------------------
    // Admin connection
    // -----------------------------------------------------------------

    async fn admin_connection(&self, cancel: &CancellationToken) -> Result<AdminConnection> {
        if let Some(admin) = self.admin.read().await.as_ref() {
            return Ok(admin.clone());
        }
        self.acquire_admin_connection(cancel).await
    }

    async fn acquire_admin_connection(&self, cancel: &CancellationToken) -> Result<AdminConnection> {
        let mut slot = self.admin.write().await;
        // Another task may have raced us here.
        if let Some(admin) = slot.as_ref() {
            return Ok(admin.clone());
        }

        let registration_token = self
            .credential
            .registration_token(&self.http, cancel, &self.config)
            .await?;

        let url = format!("{}/actions/runner-registration", self.config.api_base);
        let response = cancellable(
            cancel,
            self.http
                .post(&url)
                .header(reqwest::header::AUTHORIZATION, format!("RemoteAuth {registration_token}"))
                .header(reqwest::header::USER_AGENT, USER_AGENT)
                .timeout(REQUEST_TIMEOUT)
                .json(&serde_json::json!({
                    "url": self.config.url,
                    "runner_event": "register",
                }))
                .send(),
        )
        .await??;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GithubError::api("runner registration", status.as_u16(), body));
        }

        let admin: AdminConnection = response.json().await.map_err(GithubError::Http)?;
        tracing::debug!(service_url = %admin.url, "actions service admin connection acquired");
        *slot = Some(admin.clone());
        Ok(admin)
    }

    async fn invalidate_admin_connection(&self) {
        *self.admin.write().await = None;
    }

    // -----------------------------------------------------------------
    // Scale-set surface
    // -----------------------------------------------------------------

    /// Registers a new runner scale set and returns it with its id filled
    /// in.
    pub async fn create_runner_scale_set(
        &self,
        cancel: &CancellationToken,
        scale_set: &RunnerScaleSet,
    ) -> Result<RunnerScaleSet> {
        self.service_json(
            cancel,
            Method::POST,
            "runnerscalesets".to_string(),
            Some(serde_json::to_value(scale_set).map_err(|e| GithubError::Decode {
                context: "create runner scale set".to_string(),
                source: e,
            })?),
            "create runner scale set",
        )
        .await
    }

    /// Deletes a runner scale set.
    pub async fn delete_runner_scale_set(
        &self,
        cancel: &CancellationToken,
        scale_set_id: i64,
    ) -> Result<()> {
        self.service_no_content(
            cancel,
            Method::DELETE,
            format!("runnerscalesets/{scale_set_id}"),
            None,
            "delete runner scale set",
        )
        .await
    }

    /// Looks up a runner group by name. The default group short-circuits to
    /// id 1 without a round-trip.
    pub async fn get_runner_group_by_name(
        &self,
        cancel: &CancellationToken,
        name: &str,
    ) -> Result<RunnerGroup> {
        if name == DEFAULT_RUNNER_GROUP {
            return Ok(RunnerGroup {
                id: DEFAULT_RUNNER_GROUP_ID,
                name: name.to_string(),
            });
        }

        let groups: ListResponse<RunnerGroup> = self
            .service_json(
                cancel,
                Method::GET,
                format!("runnergroups?groupName={}", urlencode(name)),
                None,
                "get runner group",
            )
            .await?;

        groups
            .value
            .into_iter()
            .next()
            .ok_or_else(|| GithubError::api("get runner group", 404, format!("no runner group named {name:?}")))
    }

    /// Opens a message session against the scale set's queue.
    pub async fn create_message_session(
        &self,
        cancel: &CancellationToken,
        scale_set_id: i64,
        owner: &str,
    ) -> Result<MessageSessionInfo> {
        self.service_json(
            cancel,
            Method::POST,
            format!("runnerscalesets/{scale_set_id}/sessions"),
            Some(serde_json::json!({ "ownerName": owner })),
            "create message session",
        )
        .await
    }

    /// Closes a message session.
    pub async fn delete_message_session(
        &self,
        cancel: &CancellationToken,
        scale_set_id: i64,
        session_id: &str,
    ) -> Result<()> {
        self.service_no_content(
            cancel,
            Method::DELETE,
            format!("runnerscalesets/{scale_set_id}/sessions/{session_id}"),
            None,
            "delete message session",
        )
        .await
    }

    /// Claims available jobs for this scale set. Returns the request ids
    /// that were actually acquired.
    pub async fn acquire_jobs(
        &self,
        cancel: &CancellationToken,
        scale_set_id: i64,
        request_ids: &[i64],
    ) -> Result<Vec<i64>> {
        let acquired: ListResponse<i64> = self
            .service_json(
                cancel,
                Method::POST,
                format!("runnerscalesets/{scale_set_id}/acquirejobs"),
                Some(serde_json::json!(request_ids)),
                "acquire jobs",
            )
            .await?;
        Ok(acquired.value)
    }

    /// Long-polls the message queue. `Ok(None)` means the poll window
    /// elapsed without a message. Passing the last seen message id acks it.
    pub async fn get_message(
        &self,
        cancel: &CancellationToken,
        session: &MessageSessionInfo,
        last_message_id: i64,
    ) -> Result<Option<RunnerScaleSetMessage>> {
        let separator = if session.message_queue_url.contains('?') {
            '&'
        } else {
            '?'
        };
        let url = format!(
            "{}{separator}lastMessageId={last_message_id}",
            session.message_queue_url
        );

        let response = cancellable(
            cancel,
            self.http
                .get(&url)
                .bearer_auth(&session.message_queue_access_token)
                .header(reqwest::header::ACCEPT, "application/json")
                .header(reqwest::header::USER_AGENT, USER_AGENT)
                .timeout(LONG_POLL_TIMEOUT)
                .send(),
        )
        .await??;

        let status = response.status();
        match status.as_u16() {
            200 => {
                let message = response.json().await.map_err(GithubError::Http)?;
                Ok(Some(message))
            }
            202 | 204 => Ok(None),
            _ => {
                let body = response.text().await.unwrap_or_default();
                Err(GithubError::api("get message", status.as_u16(), body))
            }
        }
    }

    // -----------------------------------------------------------------
    // Plumbing
    // -----------------------------------------------------------------

    async fn service_json<T: DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
        method: Method,
        path: String,
        body: Option<serde_json::Value>,
        context: &str,
    ) -> Result<T> {
        let response = self
            .service_request(cancel, method, &path, body.as_ref(), context)
            .await?;
        response.json().await.map_err(GithubError::Http)
    }

    async fn service_no_content(
        &self,
        cancel: &CancellationToken,
        method: Method,
        path: String,
        body: Option<serde_json::Value>,
        context: &str,
    ) -> Result<()> {
        self.service_request(cancel, method, &path, body.as_ref(), context)
            .await
            .map(drop)
    }

    /// Sends one request to the runtime surface, refreshing the admin
    /// connection and retrying exactly once on 401.
    async fn service_request(
        &self,
        cancel: &CancellationToken,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
        context: &str,
    ) -> Result<reqwest::Response> {
        let mut refreshed = false;
        loop {
            let admin = self.admin_connection(cancel).await?;
            let separator = if path.contains('?') { '&' } else { '?' };
            let url = format!(
                "{}/_apis/runtime/{path}{separator}{API_VERSION}",
                admin.url.trim_end_matches('/')
            );

            let mut request = self
                .http
                .request(method.clone(), &url)
                .bearer_auth(&admin.token)
                .header(reqwest::header::USER_AGENT, USER_AGENT)
                .timeout(REQUEST_TIMEOUT);
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = cancellable(cancel, request.send()).await??;
            let status = response.status();

            if status.as_u16() == 401 && !refreshed {
                tracing::debug!(context, "admin token rejected, re-acquiring");
                self.invalidate_admin_connection().await;
                refreshed = true;
                continue;
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(GithubError::api(context, status.as_u16(), body));
            }
            return Ok(response);
        }
    }
}

#[async_trait]
impl JitConfigIssuer for ActionsClient {
    async fn generate_jit_runner_config(
        &self,
        cancel: &CancellationToken,
        name: &str,
        scale_set_id: i64,
    ) -> Result<JitRunnerConfig> {
        self.service_json(
            cancel,
            Method::POST,
            format!("runnerscalesets/{scale_set_id}/generatejitconfig"),
            Some(serde_json::json!({
                "name": name,
                "workFolder": "_work",
            })),
            "generate jit config",
        )
        .await
    }
}

/// Percent-encodes a query value. Only the characters that matter for
/// group names (spaces and reserved separators) need escaping.
fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urlencode_escapes_reserved_characters() {
        assert_eq!(urlencode("Default"), "Default");
        assert_eq!(urlencode("gpu runners"), "gpu%20runners");
        assert_eq!(urlencode("a&b=c"), "a%26b%3Dc");
    }

    #[tokio::test]
    async fn default_runner_group_short_circuits() {
        let client = ActionsClient::new(
            "https://github.com/octo/widgets",
            Credential::Pat("ghp_test".to_string()),
        )
        .unwrap();
        let cancel = CancellationToken::new();

        // No admin connection exists, so any network path would fail; the
        // default group must resolve locally.
        let group = client
            .get_runner_group_by_name(&cancel, DEFAULT_RUNNER_GROUP)
            .await
            .unwrap();
        assert_eq!(group.id, DEFAULT_RUNNER_GROUP_ID);
    }
}
