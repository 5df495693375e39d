//! Minimal Compute Engine v1 REST surface: instance insert/delete and zone
//! long-running operations polled to completion.

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gcp::auth::TokenProvider;

const COMPUTE_BASE: &str = "https://compute.googleapis.com/compute/v1";

/// An error returned by the Compute Engine API or the auth layer.
///
/// `message` retains the backend's own error text ("Error 404: ...,
/// notFound") because the not-found classification contract is a substring
/// match against it.
#[derive(Debug, Error)]
#[error("{context}: {message}")]
pub struct GcpApiError {
    pub(crate) context: String,
    pub(crate) status: Option<u16>,
    pub(crate) message: String,
}

impl GcpApiError {
    pub(crate) fn new(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            status: None,
            message: message.into(),
        }
    }

    /// Reports whether this error means the resource is already gone.
    ///
    /// Matches the typed HTTP 404 when the status survived, and otherwise
    /// falls back to the substring set that survives SDK-level wrapping:
    /// `Error 404`, `code = NotFound`, `notFound`.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        if self.status == Some(404) {
            return true;
        }
        ["Error 404", "code = NotFound", "notFound"]
            .iter()
            .any(|pattern| self.message.contains(pattern))
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Instance {
    pub name: String,
    pub machine_type: String,
    pub disks: Vec<AttachedDisk>,
    pub network_interfaces: Vec<NetworkInterface>,
    pub metadata: Metadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_accounts: Option<Vec<ServiceAccount>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AttachedDisk {
    pub auto_delete: bool,
    pub boot: bool,
    pub initialize_params: InitializeParams,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InitializeParams {
    pub source_image: String,
    /// int64 fields travel as strings in the compute REST JSON.
    pub disk_size_gb: String,
    pub disk_type: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct NetworkInterface {
    pub network: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subnetwork: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_configs: Option<Vec<AccessConfig>>,
}

#[derive(Debug, Serialize)]
pub(crate) struct AccessConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct Metadata {
    pub items: Vec<MetadataItem>,
}

#[derive(Debug, Serialize)]
pub(crate) struct MetadataItem {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct ServiceAccount {
    pub email: String,
    pub scopes: Vec<String>,
}

/// A zone operation handle. Insert/delete return immediately with one of
/// these; `wait_operation` blocks until it reaches `DONE`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Operation {
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub error: Option<OperationError>,
    #[serde(default)]
    pub http_error_status_code: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OperationError {
    #[serde(default)]
    pub errors: Vec<OperationErrorDetail>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OperationErrorDetail {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ApiErrorItem>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorItem {
    #[serde(default)]
    reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// REST client scoped to one project/zone.
pub(crate) struct ComputeClient {
    http: reqwest::Client,
    auth: TokenProvider,
    project: String,
    zone: String,
}

impl ComputeClient {
    pub fn new(project: String, zone: String) -> Result<Self, GcpApiError> {
        Ok(Self {
            http: reqwest::Client::new(),
            auth: TokenProvider::from_environment()?,
            project,
            zone,
        })
    }

    fn zone_url(&self, suffix: &str) -> String {
        format!(
            "{COMPUTE_BASE}/projects/{}/zones/{}/{suffix}",
            self.project, self.zone
        )
    }

    pub async fn insert_instance(&self, instance: &Instance) -> Result<Operation, GcpApiError> {
        let context = format!("insert instance {}", instance.name);
        let body = serde_json::to_value(instance)
            .map_err(|e| GcpApiError::new(&context, e.to_string()))?;
        self.send(Method::POST, self.zone_url("instances"), Some(body), &context)
            .await
    }

    pub async fn delete_instance(&self, name: &str) -> Result<Operation, GcpApiError> {
        let context = format!("delete instance {name}");
        self.send(
            Method::DELETE,
            self.zone_url(&format!("instances/{name}")),
            None,
            &context,
        )
        .await
    }

    /// Polls the operation via its `wait` endpoint until it reaches `DONE`,
    /// then surfaces any recorded operation error.
    pub async fn wait_operation(&self, context: &str, mut op: Operation) -> Result<(), GcpApiError> {
        loop {
            if op.status == "DONE" {
                return operation_result(context, &op);
            }
            op = self
                .send(
                    Method::POST,
                    self.zone_url(&format!("operations/{}/wait", op.name)),
                    None,
                    context,
                )
                .await?;
        }
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        url: String,
        body: Option<serde_json::Value>,
        context: &str,
    ) -> Result<T, GcpApiError> {
        let token = self.auth.token(&self.http).await?;

        let mut request = self.http.request(method, &url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| GcpApiError::new(context, e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| GcpApiError::new(context, format!("decoding response: {e}")));
        }

        let body = response.text().await.unwrap_or_default();
        Err(GcpApiError {
            context: context.to_string(),
            status: Some(status.as_u16()),
            message: format_api_error(status.as_u16(), &body),
        })
    }
}

/// Formats a non-2xx response body the way the googleapis error surface
/// reads: `Error {status}: {message}, {reason}`.
fn format_api_error(status: u16, body: &str) -> String {
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(parsed) => {
            let reasons: Vec<&str> = parsed
                .error
                .errors
                .iter()
                .filter_map(|e| e.reason.as_deref())
                .collect();
            if reasons.is_empty() {
                format!("Error {status}: {}", parsed.error.message)
            } else {
                format!("Error {status}: {}, {}", parsed.error.message, reasons.join(", "))
            }
        }
        Err(_) => format!("Error {status}: {body}"),
    }
}

fn operation_result(context: &str, op: &Operation) -> Result<(), GcpApiError> {
    let Some(error) = &op.error else {
        return Ok(());
    };
    let detail = error
        .errors
        .iter()
        .map(|e| {
            format!(
                "{}: {}",
                e.code.as_deref().unwrap_or("UNKNOWN"),
                e.message.as_deref().unwrap_or("")
            )
        })
        .collect::<Vec<_>>()
        .join("; ");
    Err(GcpApiError {
        context: context.to_string(),
        status: op.http_error_status_code,
        message: format!("operation {} failed: {detail}", op.name),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_matches_http_status() {
        let err = GcpApiError {
            context: "delete instance vm-1".to_string(),
            status: Some(404),
            message: "Error 404: The resource was not found".to_string(),
        };
        assert!(err.is_not_found());
    }

    #[test]
    fn not_found_matches_substring_patterns() {
        for message in [
            "googleapi: Error 404: not found",
            "rpc error: code = NotFound desc = instance missing",
            "operation op-1 failed: RESOURCE_NOT_FOUND: notFound",
        ] {
            let err = GcpApiError::new("delete instance vm-1", message);
            assert!(err.is_not_found(), "expected not-found for {message:?}");
        }
    }

    #[test]
    fn other_errors_are_not_classified_not_found() {
        let err = GcpApiError {
            context: "delete instance vm-1".to_string(),
            status: Some(403),
            message: "Error 403: quota exceeded".to_string(),
        };
        assert!(!err.is_not_found());
    }

    #[test]
    fn api_error_formatting_includes_reasons() {
        let body = r#"{"error":{"code":404,"message":"The resource 'vm-1' was not found","errors":[{"reason":"notFound"}]}}"#;
        let formatted = format_api_error(404, body);
        assert_eq!(
            formatted,
            "Error 404: The resource 'vm-1' was not found, notFound"
        );
    }

    #[test]
    fn operation_error_surfaces_detail() {
        let op = Operation {
            name: "op-1".to_string(),
            status: "DONE".to_string(),
            error: Some(OperationError {
                errors: vec![OperationErrorDetail {
                    code: Some("QUOTA_EXCEEDED".to_string()),
                    message: Some("out of CPUs".to_string()),
                }],
            }),
            http_error_status_code: Some(403),
        };
        let err = operation_result("insert instance vm-1", &op).unwrap_err();
        assert!(err.to_string().contains("QUOTA_EXCEEDED"));
        assert!(!err.is_not_found());
    }
}
