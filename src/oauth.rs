use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::errors::ServiceError;

/// Safety margin before the advertised expiry at which a token is
/// considered stale.
const EXPIRY_SKEW_SECS: i64 = 60;

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

/// Process-wide OAuth2 client-credentials token cache for one external
/// system. Refresh is single-flight: the mutex is held across the token
/// request, so concurrent refreshes coalesce onto one HTTP call.
pub struct OAuthTokenCache {
    system: &'static str,
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    timeout: Duration,
    state: Mutex<Option<CachedToken>>,
}

impl OAuthTokenCache {
    pub fn new(
        system: &'static str,
        http: reqwest::Client,
        token_url: String,
        client_id: String,
        client_secret: String,
        timeout: Duration,
    ) -> Self {
        Self {
            system,
            http,
            token_url,
            client_id,
            client_secret,
            timeout,
            state: Mutex::new(None),
        }
    }

    /// Returns a live access token, refreshing on demand.
    pub async fn bearer(&self) -> Result<String, ServiceError> {
        let mut state = self.state.lock().await;

        if let Some(cached) = state.as_ref() {
            if cached.expires_at > Utc::now() {
                debug!(system = self.system, "reusing cached access token");
                return Ok(cached.access_token.clone());
            }
        }

        let token = self.fetch_token().await?;
        let bearer = token.access_token.clone();
        *state = Some(token);
        Ok(bearer)
    }

    /// Drops the cached token so the next call re-authenticates. Used
    /// after an unexpected 401 from the external system.
    pub async fn invalidate(&self) {
        let mut state = self.state.lock().await;
        if state.take().is_some() {
            warn!(system = self.system, "cached access token invalidated");
        }
    }

    async fn fetch_token(&self) -> Result<CachedToken, ServiceError> {
        let response = self
            .http
            .post(&self.token_url)
            .timeout(self.timeout)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| self.map_request_error(e))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(ServiceError::ExternalServiceError(format!(
                "{} token endpoint returned {}",
                self.system, status
            )));
        }

        let body: TokenResponse = response.json().await.map_err(|e| {
            ServiceError::ExternalServiceError(format!(
                "{} token endpoint returned an unreadable body: {}",
                self.system, e
            ))
        })?;

        let expires_at =
            Utc::now() + ChronoDuration::seconds((body.expires_in - EXPIRY_SKEW_SECS).max(0));
        info!(system = self.system, "access token refreshed");

        Ok(CachedToken {
            access_token: body.access_token,
            expires_at,
        })
    }

    fn map_request_error(&self, err: reqwest::Error) -> ServiceError {
        if err.is_timeout() {
            ServiceError::ProviderTimeout(format!("{} token request timed out", self.system))
        } else {
            ServiceError::ServiceUnavailable(format!(
                "{} token request failed: {}",
                self.system, err
            ))
        }
    }
}
