//! OAuth2 service-account flow.
//!
//! A signed RS256 assertion is exchanged for a bearer token at the key's
//! `token_uri`. Tokens are cached and reused until shortly before expiry.

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{GoogleError, check_status};

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
/// Refresh this many seconds before the token actually expires.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// Source of bearer tokens for Google APIs.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String, GoogleError>;
}

/// Fixed token, for tests and short-lived tooling.
pub struct StaticToken(pub String);

#[async_trait]
impl TokenProvider for StaticToken {
    async fn access_token(&self) -> Result<String, GoogleError> {
        Ok(self.0.clone())
    }
}

/// The fields we need from a downloaded service-account JSON key.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub scope: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

struct CachedToken {
    access_token: String,
    expires_at: i64,
}

pub struct ServiceAccount {
    key: ServiceAccountKey,
    encoding_key: EncodingKey,
    scopes: Vec<String>,
    http: reqwest::Client,
    cache: Mutex<Option<CachedToken>>,
}

impl ServiceAccount {
    pub fn from_file(path: &Path, scopes: &[&str]) -> Result<Self, GoogleError> {
        let json = std::fs::read_to_string(path).map_err(|e| GoogleError::Credentials {
            path: path.display().to_string(),
            source: e,
        })?;
        let key: ServiceAccountKey =
            serde_json::from_str(&json).map_err(|e| GoogleError::InvalidKey(e.to_string()))?;
        Self::new(key, scopes)
    }

    pub fn new(key: ServiceAccountKey, scopes: &[&str]) -> Result<Self, GoogleError> {
        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| GoogleError::InvalidKey(e.to_string()))?;
        info!("Using service account {}", key.client_email);
        Ok(Self {
            key,
            encoding_key,
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            http: reqwest::Client::new(),
            cache: Mutex::new(None),
        })
    }

    pub fn client_email(&self) -> &str {
        &self.key.client_email
    }

    /// Build the signed JWT assertion for the given issue time.
    pub fn assertion(&self, issued_at: i64) -> Result<String, GoogleError> {
        let claims = Claims {
            iss: self.key.client_email.clone(),
            scope: self.scopes.join(" "),
            aud: self.key.token_uri.clone(),
            iat: issued_at,
            exp: issued_at + ASSERTION_LIFETIME_SECS,
        };
        Ok(jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.encoding_key)?)
    }

    async fn fetch_token(&self, now: i64) -> Result<CachedToken, GoogleError> {
        let assertion = self.assertion(now)?;
        let response = self
            .http
            .post(&self.key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await?;
        let token: TokenResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| GoogleError::Parse(format!("token response: {e}")))?;

        debug!("Fetched Google access token (expires in {}s)", token.expires_in);
        Ok(CachedToken {
            access_token: token.access_token,
            expires_at: now + token.expires_in - EXPIRY_MARGIN_SECS,
        })
    }
}

#[async_trait]
impl TokenProvider for ServiceAccount {
    async fn access_token(&self) -> Result<String, GoogleError> {
        let now = Utc::now().timestamp();
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref()
            && cached.expires_at > now
        {
            return Ok(cached.access_token.clone());
        }

        let fresh = self.fetch_token(now).await?;
        let token = fresh.access_token.clone();
        *cache = Some(fresh);
        Ok(token)
    }
}
