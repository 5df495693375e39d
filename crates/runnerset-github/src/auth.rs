//! Credential resolution.
//!
//! Two ways in: a personal access token, or a GitHub App (client id +
//! installation id + RS256 private key). Both end at the same place: a
//! short-lived runner registration token for the configured URL scope,
//! which [`crate::client::ActionsClient`] exchanges for an Actions service
//! admin connection.

use std::time::{SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::cancellable;
use crate::error::{GithubError, Result};

const USER_AGENT: &str = concat!("runnerset/", env!("CARGO_PKG_VERSION"));
const GITHUB_ACCEPT: &str = "application/vnd.github+json";

/// GitHub App credentials.
#[derive(Debug, Clone)]
pub struct GitHubAppAuth {
    pub client_id: String,
    pub installation_id: i64,
    /// PEM-encoded RSA private key.
    pub private_key: String,
}

/// How we authenticate against GitHub.
#[derive(Debug, Clone)]
pub enum Credential {
    /// Personal access token.
    Pat(String),
    /// GitHub App installation (recommended).
    App(GitHubAppAuth),
}

/// The scope a config URL registers runners under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum UrlScope {
    Repository { owner: String, repo: String },
    Organization { org: String },
    Enterprise { enterprise: String },
}

impl UrlScope {
    /// REST path prefix for runner administration under this scope.
    fn admin_path(&self) -> String {
        match self {
            Self::Repository { owner, repo } => format!("repos/{owner}/{repo}"),
            Self::Organization { org } => format!("orgs/{org}"),
            Self::Enterprise { enterprise } => format!("enterprises/{enterprise}"),
        }
    }
}

/// A parsed GitHub config URL: API base plus registration scope.
#[derive(Debug, Clone)]
pub(crate) struct ConfigUrl {
    pub url: String,
    pub api_base: String,
    pub scope: UrlScope,
}

impl ConfigUrl {
    /// Parses a scale-set registration URL such as
    /// `https://github.com/org`, `https://github.com/org/repo`, or
    /// `https://github.com/enterprises/name` (GHES hosts get
    /// `<host>/api/v3` as the API base).
    pub fn parse(url: &str) -> Result<Self> {
        let parsed = Url::parse(url).map_err(|e| GithubError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let host = parsed.host_str().ok_or_else(|| GithubError::InvalidUrl {
            url: url.to_string(),
            reason: "missing host".to_string(),
        })?;

        let api_base = if host == "github.com" {
            "https://api.github.com".to_string()
        } else {
            format!("{}://{host}/api/v3", parsed.scheme())
        };

        let segments: Vec<&str> = parsed
            .path_segments()
            .map(|s| s.filter(|seg| !seg.is_empty()).collect())
            .unwrap_or_default();

        let scope = match segments.as_slice() {
            ["enterprises", enterprise] => UrlScope::Enterprise {
                enterprise: (*enterprise).to_string(),
            },
            [org] => UrlScope::Organization {
                org: (*org).to_string(),
            },
            [owner, repo] => UrlScope::Repository {
                owner: (*owner).to_string(),
                repo: (*repo).to_string(),
            },
            _ => {
                return Err(GithubError::InvalidUrl {
                    url: url.to_string(),
                    reason: "expected /org, /owner/repo, or /enterprises/name".to_string(),
                })
            }
        };

        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            api_base,
            scope,
        })
    }
}

#[derive(Debug, Serialize)]
struct AppJwtClaims<'a> {
    iss: &'a str,
    iat: u64,
    exp: u64,
}

#[derive(Debug, Deserialize)]
struct InstallationToken {
    token: String,
}

#[derive(Debug, Deserialize)]
struct RegistrationToken {
    token: String,
}

impl Credential {
    /// Mints a runner registration token for the config URL's scope.
    pub(crate) async fn registration_token(
        &self,
        http: &reqwest::Client,
        cancel: &CancellationToken,
        config: &ConfigUrl,
    ) -> Result<String> {
        let bearer = match self {
            Self::Pat(token) => token.clone(),
            Self::App(app) => installation_token(http, cancel, config, app).await?,
        };

        let url = format!(
            "{}/{}/actions/runners/registration-token",
            config.api_base,
            config.scope.admin_path()
        );

        let response = cancellable(
            cancel,
            http.post(&url)
                .bearer_auth(&bearer)
                .header(reqwest::header::ACCEPT, GITHUB_ACCEPT)
                .header(reqwest::header::USER_AGENT, USER_AGENT)
                .send(),
        )
        .await??;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GithubError::api(
                "runner registration token",
                status.as_u16(),
                body,
            ));
        }

        let token: RegistrationToken = response
            .json()
            .await
            .map_err(GithubError::Http)?;
        Ok(token.token)
    }
}

/// GitHub App flow: sign a short-lived app JWT, then trade it for an
/// installation access token.
async fn installation_token(
    http: &reqwest::Client,
    cancel: &CancellationToken,
    config: &ConfigUrl,
    app: &GitHubAppAuth,
) -> Result<String> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    // Backdate iat to absorb clock skew; GitHub caps exp at 10 minutes.
    let claims = AppJwtClaims {
        iss: &app.client_id,
        iat: now.saturating_sub(60),
        exp: now + 540,
    };

    let key = EncodingKey::from_rsa_pem(app.private_key.as_bytes())?;
    let jwt = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)?;

    let url = format!(
        "{}/app/installations/{}/access_tokens",
        config.api_base, app.installation_id
    );

    let response = cancellable(
        cancel,
        http.post(&url)
            .bearer_auth(&jwt)
            .header(reqwest::header::ACCEPT, GITHUB_ACCEPT)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .send(),
    )
    .await??;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(GithubError::api(
            "app installation token",
            status.as_u16(),
            body,
        ));
    }

    let token: InstallationToken = response.json().await.map_err(GithubError::Http)?;
    Ok(token.token)
}
