//! Firebase Cloud Messaging (HTTP v1) delivery.
//!
//! Authenticates with a Google service account: an RS256-signed assertion is
//! exchanged for an OAuth access token, which is cached until shortly before
//! it expires.

use std::{
    fmt,
    path::Path,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{PushError, PushNotifier, PushReceipt};

const MESSAGING_SCOPE: &str = "https://www.googleapis.com/auth/firebase.messaging";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const DEFAULT_API_BASE: &str = "https://fcm.googleapis.com";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
/// Refresh the access token this long before Google says it expires.
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ServiceAccountError {
    #[error("failed to read service account {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid service account json: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("service account private key is not a valid RSA PEM: {0}")]
    InvalidKey(#[from] jsonwebtoken::errors::Error),
    #[error("failed to build FCM HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),
}

/// The fields of a Google service-account key file that FCM needs.
#[derive(Clone, Deserialize)]
pub struct ServiceAccount {
    pub project_id: String,
    pub client_email: String,
    private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl fmt::Debug for ServiceAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccount")
            .field("project_id", &self.project_id)
            .field("client_email", &self.client_email)
            .field("token_uri", &self.token_uri)
            .finish_non_exhaustive()
    }
}

impl ServiceAccount {
    pub fn from_json(json: &str) -> Result<Self, ServiceAccountError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ServiceAccountError> {
        let json = std::fs::read_to_string(path).map_err(|source| ServiceAccountError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&json)
    }

    fn encoding_key(&self) -> Result<EncodingKey, ServiceAccountError> {
        Ok(EncodingKey::from_rsa_pem(self.private_key.as_bytes())?)
    }
}

/// Notification content and endpoint settings.
#[derive(Debug, Clone)]
pub struct FcmConfig {
    /// Overrides the service account's project.
    pub project_id: Option<String>,
    pub title: String,
    pub body: String,
    pub api_base: String,
    pub request_timeout: Duration,
}

impl Default for FcmConfig {
    fn default() -> Self {
        Self {
            project_id: None,
            title: "Incoming call".to_string(),
            body: "Someone is calling you".to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    ASSERTION_LIFETIME_SECS as u64
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    name: Option<String>,
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

impl CachedToken {
    fn fresh(&self) -> bool {
        Instant::now() + REFRESH_MARGIN < self.expires_at
    }
}

pub struct FcmNotifier {
    account: ServiceAccount,
    project_id: String,
    config: FcmConfig,
    encoding_key: EncodingKey,
    client: Client,
    cached_token: RwLock<Option<CachedToken>>,
}

impl fmt::Debug for FcmNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FcmNotifier")
            .field("project_id", &self.project_id)
            .field("client_email", &self.account.client_email)
            .finish_non_exhaustive()
    }
}

impl FcmNotifier {
    pub fn new(account: ServiceAccount, config: FcmConfig) -> Result<Self, ServiceAccountError> {
        let encoding_key = account.encoding_key()?;
        let project_id = config
            .project_id
            .clone()
            .unwrap_or_else(|| account.project_id.clone());
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(ServiceAccountError::HttpClient)?;

        info!(
            project_id = %project_id,
            client_email = %account.client_email,
            "FCM notifier initialized"
        );

        Ok(Self {
            account,
            project_id,
            config,
            encoding_key,
            client,
            cached_token: RwLock::new(None),
        })
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    fn send_url(&self) -> String {
        format!(
            "{}/v1/projects/{}/messages:send",
            self.config.api_base.trim_end_matches('/'),
            self.project_id
        )
    }

    fn build_message(&self, token: &str) -> serde_json::Value {
        json!({
            "message": {
                "token": token,
                "notification": {
                    "title": self.config.title,
                    "body": self.config.body,
                },
                "data": {
                    "type": "incoming-call",
                },
                "android": {
                    "priority": "high",
                },
                "apns": {
                    "headers": {
                        "apns-priority": "10",
                    },
                },
            }
        })
    }

    async fn access_token(&self) -> Result<String, PushError> {
        {
            let cache = self.cached_token.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.fresh() {
                    return Ok(cached.token.clone());
                }
            }
        }

        let mut cache = self.cached_token.write().await;
        if let Some(cached) = cache.as_ref() {
            if cached.fresh() {
                return Ok(cached.token.clone());
            }
        }

        let fetched = self.fetch_access_token().await?;
        let token = fetched.token.clone();
        *cache = Some(fetched);
        Ok(token)
    }

    fn sign_assertion(&self) -> Result<String, PushError> {
        let now = chrono::Utc::now().timestamp();
        let claims = AssertionClaims {
            iss: &self.account.client_email,
            scope: MESSAGING_SCOPE,
            aud: &self.account.token_uri,
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        };
        Ok(jsonwebtoken::encode(
            &Header::new(Algorithm::RS256),
            &claims,
            &self.encoding_key,
        )?)
    }

    async fn fetch_access_token(&self) -> Result<CachedToken, PushError> {
        let assertion = self.sign_assertion()?;
        let response = self
            .client
            .post(&self.account.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PushError::TokenExchange {
                status: status.as_u16(),
                body,
            });
        }

        let body: TokenResponse = response.json().await?;
        debug!(expires_in = body.expires_in, "fetched FCM access token");
        Ok(CachedToken {
            token: body.access_token,
            expires_at: Instant::now() + Duration::from_secs(body.expires_in),
        })
    }
}

#[async_trait]
impl PushNotifier for FcmNotifier {
    async fn send_push_notification(&self, token: &str) -> Result<PushReceipt, PushError> {
        let access_token = self.access_token().await?;
        let response = self
            .client
            .post(self.send_url())
            .bearer_auth(access_token)
            .json(&self.build_message(token))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PushError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let body: SendResponse = response.json().await?;
        Ok(PushReceipt {
            message_id: body.name,
        })
    }
}
