//! Error types for the scale-set client.

use thiserror::Error;

/// Result type alias for scale-set client operations.
pub type Result<T> = std::result::Result<T, GithubError>;

/// Errors that can occur talking to GitHub or the Actions service.
#[derive(Debug, Error)]
pub enum GithubError {
    /// The configured GitHub URL could not be parsed or carries an
    /// unsupported scope.
    #[error("invalid github url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Transport-level HTTP failure.
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    /// The API answered with a non-success status.
    #[error("{context}: HTTP {status}: {message}")]
    Api {
        context: String,
        status: u16,
        message: String,
    },

    /// Credential resolution failed.
    #[error("auth: {0}")]
    Auth(String),

    /// GitHub App token signing failed.
    #[error("app jwt: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// A response body could not be decoded.
    #[error("{context}: decoding response: {source}")]
    Decode {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    /// The caller's cancellation token fired while a request was in flight.
    #[error("operation cancelled")]
    Cancelled,
}

impl GithubError {
    pub(crate) fn api(context: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            context: context.into(),
            status,
            message: message.into(),
        }
    }

    /// True when the API rejected our token; the caller should refresh its
    /// admin connection or message session and retry.
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Api { status: 401, .. })
    }
}
