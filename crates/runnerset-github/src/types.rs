//! Wire types for the scale-set protocol.
//!
//! Field names follow the Actions service's camelCase JSON. Everything is
//! `#[serde(default)]`-tolerant because the service omits empty fields.

use serde::{Deserialize, Serialize};

/// Message type carried by session messages that contain job batches.
pub const MESSAGE_TYPE_JOB_MESSAGES: &str = "RunnerScaleSetJobMessages";

/// A runner scale set as registered with the Actions service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunnerScaleSet {
    pub id: i64,
    pub name: String,
    pub runner_group_id: i64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<Label>,
    pub runner_setting: RunnerSetting,
}

/// A label attached to a scale set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Label {
    pub name: String,
    #[serde(rename = "type", skip_serializing_if = "String::is_empty")]
    pub kind: String,
}

impl Label {
    /// A user label with the given name.
    #[must_use]
    pub fn user(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: "User".to_string(),
        }
    }
}

/// Settings applied to every runner the scale set registers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunnerSetting {
    pub ephemeral: bool,
    pub disable_update: bool,
}

/// A runner group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerGroup {
    pub id: i64,
    pub name: String,
}

/// Standard list envelope used by the Actions service.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListResponse<T> {
    pub count: i64,
    pub value: Vec<T>,
}

impl<T> Default for ListResponse<T> {
    fn default() -> Self {
        Self {
            count: 0,
            value: Vec::new(),
        }
    }
}

/// A just-in-time runner configuration minted for a named runner.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct JitRunnerConfig {
    #[serde(rename = "encodedJITConfig")]
    pub encoded_jit_config: String,
}

/// An open message session against a scale set's queue.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessageSessionInfo {
    pub session_id: String,
    pub owner_name: String,
    pub message_queue_url: String,
    pub message_queue_access_token: String,
    pub statistics: Option<RunnerScaleSetStatistic>,
}

/// Queue-side counters delivered with every message.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunnerScaleSetStatistic {
    pub total_available_jobs: i64,
    pub total_acquired_jobs: i64,
    pub total_assigned_jobs: i64,
    pub total_running_jobs: i64,
    pub total_registered_runners: i64,
    pub total_busy_runners: i64,
    pub total_idle_runners: i64,
}

/// One message popped from the session queue.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunnerScaleSetMessage {
    pub message_id: i64,
    pub message_type: String,
    pub body: Option<String>,
    pub statistics: Option<RunnerScaleSetStatistic>,
}

/// A job became available for acquisition.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobAvailable {
    pub runner_request_id: i64,
}

/// A job was assigned to the scale set.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobAssigned {
    pub runner_request_id: i64,
}

/// A job started on one of our runners.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobStarted {
    pub runner_name: String,
    pub runner_request_id: i64,
    pub job_id: String,
    pub job_display_name: String,
    pub repository_name: String,
}

/// A job finished and its runner is done forever.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobCompleted {
    pub runner_name: String,
    pub runner_request_id: i64,
    pub job_id: String,
    pub result: String,
    pub repository_name: String,
}

/// A single entry of a job-messages batch.
#[derive(Debug, Clone)]
pub enum JobMessage {
    Available(JobAvailable),
    Assigned(JobAssigned),
    Started(JobStarted),
    Completed(JobCompleted),
    /// Forward-compatibility: unrecognized message types are logged and
    /// skipped, never fatal.
    Unknown(String),
}

/// Parses the JSON array carried in a job-messages body.
pub fn parse_job_messages(body: &str) -> Result<Vec<JobMessage>, serde_json::Error> {
    let raw: Vec<serde_json::Value> = serde_json::from_str(body)?;
    raw.into_iter()
        .map(|value| {
            let message_type = value
                .get("messageType")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string();
            Ok(match message_type.as_str() {
                "JobAvailable" => JobMessage::Available(serde_json::from_value(value)?),
                "JobAssigned" => JobMessage::Assigned(serde_json::from_value(value)?),
                "JobStarted" => JobMessage::Started(serde_json::from_value(value)?),
                "JobCompleted" => JobMessage::Completed(serde_json::from_value(value)?),
                _ => JobMessage::Unknown(message_type),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_job_batch() {
        let body = r#"[
            {"messageType":"JobAvailable","runnerRequestId":10},
            {"messageType":"JobAssigned","runnerRequestId":10},
            {"messageType":"JobStarted","runnerRequestId":10,"runnerName":"runner-ab12cd34","jobId":"j1","jobDisplayName":"build","repositoryName":"org/repo"},
            {"messageType":"JobCompleted","runnerRequestId":10,"runnerName":"runner-ab12cd34","jobId":"j1","result":"succeeded","repositoryName":"org/repo"},
            {"messageType":"SomethingNew"}
        ]"#;

        let batch = parse_job_messages(body).unwrap();
        assert_eq!(batch.len(), 5);
        assert!(matches!(&batch[0], JobMessage::Available(j) if j.runner_request_id == 10));
        assert!(matches!(&batch[2], JobMessage::Started(j) if j.runner_name == "runner-ab12cd34"));
        assert!(matches!(&batch[3], JobMessage::Completed(j) if j.result == "succeeded"));
        assert!(matches!(&batch[4], JobMessage::Unknown(t) if t == "SomethingNew"));
    }

    #[test]
    fn jit_config_field_name_is_exact() {
        let cfg: JitRunnerConfig =
            serde_json::from_str(r#"{"encodedJITConfig":"YmFzZTY0"}"#).unwrap();
        assert_eq!(cfg.encoded_jit_config, "YmFzZTY0");
    }

    #[test]
    fn scale_set_serializes_camel_case() {
        let scale_set = RunnerScaleSet {
            name: "ci".to_string(),
            runner_group_id: 1,
            labels: vec![Label::user("ci")],
            runner_setting: RunnerSetting {
                ephemeral: true,
                disable_update: true,
            },
            ..Default::default()
        };
        let json = serde_json::to_value(&scale_set).unwrap();
        assert_eq!(json["runnerGroupId"], 1);
        assert_eq!(json["runnerSetting"]["disableUpdate"], true);
        assert_eq!(json["labels"][0]["type"], "User");
    }

    #[test]
    fn message_tolerates_missing_fields() {
        let msg: RunnerScaleSetMessage = serde_json::from_str(r#"{"messageId":3}"#).unwrap();
        assert_eq!(msg.message_id, 3);
        assert!(msg.body.is_none());
        assert!(msg.statistics.is_none());
    }
}
