//! Application Default Credentials.
//!
//! Two sources, resolved once at engine construction:
//!
//! 1. `GOOGLE_APPLICATION_CREDENTIALS` pointing at a service-account key
//!    file: an RS256 JWT-bearer grant against the key's token endpoint.
//! 2. The GCE metadata server, for runners of the autoscaler itself that
//!    live on GCP with an attached service account.
//!
//! No credential fields exist in the engine config; auth is handled by the
//! environment.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::gcp::compute::GcpApiError;

const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Access tokens are refreshed this long before their reported expiry.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    token_uri: String,
}

enum TokenSource {
    ServiceAccount(ServiceAccountKey),
    Metadata,
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

#[derive(Debug, Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: u64,
    exp: u64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

/// Caching access-token provider.
pub(crate) struct TokenProvider {
    source: TokenSource,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenProvider {
    /// Resolves the credential source from the environment.
    pub fn from_environment() -> Result<Self, GcpApiError> {
        let source = match std::env::var("GOOGLE_APPLICATION_CREDENTIALS") {
            Ok(path) => {
                let data = std::fs::read_to_string(&path).map_err(|e| {
                    GcpApiError::new("gcp credentials", format!("reading {path}: {e}"))
                })?;
                let key: ServiceAccountKey = serde_json::from_str(&data).map_err(|e| {
                    GcpApiError::new("gcp credentials", format!("parsing {path}: {e}"))
                })?;
                TokenSource::ServiceAccount(key)
            }
            Err(_) => TokenSource::Metadata,
        };
        Ok(Self {
            source,
            cached: Mutex::new(None),
        })
    }

    /// Returns a valid access token, fetching a fresh one when the cached
    /// token is absent or within [`EXPIRY_MARGIN`] of expiry.
    pub async fn token(&self, http: &reqwest::Client) -> Result<String, GcpApiError> {
        let mut cached = self.cached.lock().await;
        if let Some(current) = cached.as_ref() {
            if current.expires_at > Instant::now() + EXPIRY_MARGIN {
                return Ok(current.token.clone());
            }
        }

        let response = match &self.source {
            TokenSource::ServiceAccount(key) => Self::service_account_token(http, key).await?,
            TokenSource::Metadata => Self::metadata_token(http).await?,
        };

        let token = response.access_token.clone();
        *cached = Some(CachedToken {
            token: response.access_token,
            expires_at: Instant::now() + Duration::from_secs(response.expires_in),
        });
        Ok(token)
    }

    async fn service_account_token(
        http: &reqwest::Client,
        key: &ServiceAccountKey,
    ) -> Result<TokenResponse, GcpApiError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let claims = JwtClaims {
            iss: &key.client_email,
            scope: CLOUD_PLATFORM_SCOPE,
            aud: &key.token_uri,
            iat: now,
            exp: now + 3600,
        };

        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| GcpApiError::new("gcp credentials", format!("private key: {e}")))?;
        let assertion = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &encoding_key)
            .map_err(|e| GcpApiError::new("gcp credentials", format!("signing jwt: {e}")))?;

        let response = http
            .post(&key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", &assertion)])
            .send()
            .await
            .map_err(|e| GcpApiError::new("gcp token exchange", e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GcpApiError::new(
                "gcp token exchange",
                format!("Error {}: {body}", status.as_u16()),
            ));
        }
        response
            .json()
            .await
            .map_err(|e| GcpApiError::new("gcp token exchange", e.to_string()))
    }

    async fn metadata_token(http: &reqwest::Client) -> Result<TokenResponse, GcpApiError> {
        let response = http
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| GcpApiError::new("gcp metadata server", e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GcpApiError::new(
                "gcp metadata server",
                format!("Error {}", status.as_u16()),
            ));
        }
        response
            .json()
            .await
            .map_err(|e| GcpApiError::new("gcp metadata server", e.to_string()))
    }
}
