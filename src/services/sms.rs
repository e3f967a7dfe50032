//! SMS gateway client for order confirmation messages.
//!
//! Mirrors the Billz client's token handling: a dedicated [`TokenCache`]
//! instance, double-checked refresh, and a single refresh-and-retry on 401.
//! The gateway is optional; a disabled client rejects sends so callers can
//! decide whether to log or ignore.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use crate::services::billz_client::TokenCache;

const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// Fallback token lifetime when the login response omits `expires_in`.
/// The gateway's sessions last an hour.
const FALLBACK_TOKEN_TTL: Duration = Duration::from_secs(55 * 60);

#[derive(Debug, thiserror::Error)]
pub enum SmsError {
    #[error("sms gateway is disabled")]
    Disabled,

    #[error("sms login failed with {status}: {body}")]
    AuthFailed { status: u16, body: String },

    #[error("sms login response carried no token")]
    MissingToken,

    #[error("sms send failed with {status}: {body}")]
    SendFailed { status: u16, body: String },

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct SmsConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(default)]
    token: String,
    #[serde(default)]
    expires_in: i64,
}

#[derive(Clone)]
pub struct SmsClient {
    http: reqwest::Client,
    config: Arc<SmsConfig>,
    token_cache: Arc<TokenCache>,
}

impl SmsClient {
    pub fn new(config: SmsConfig) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .unwrap_or_default(),
            config: Arc::new(config),
            token_cache: Arc::new(TokenCache::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Send one message, refreshing the token and retrying once on 401.
    pub async fn send_sms(&self, phone: &str, message: &str) -> Result<(), SmsError> {
        if !self.config.enabled {
            return Err(SmsError::Disabled);
        }

        let token = self.token(false).await?;
        let status = self.post_send(&token, phone, message).await?;

        if status.0 == 401 {
            let token = self.token(true).await?;
            let (code, body) = self.post_send(&token, phone, message).await?;
            if code == 401 {
                return Err(SmsError::SendFailed { status: code, body });
            }
            if !(200..300).contains(&code) {
                return Err(SmsError::SendFailed { status: code, body });
            }
            return Ok(());
        }

        let (code, body) = status;
        if !(200..300).contains(&code) {
            return Err(SmsError::SendFailed { status: code, body });
        }

        Ok(())
    }

    async fn post_send(
        &self,
        token: &str,
        phone: &str,
        message: &str,
    ) -> Result<(u16, String), SmsError> {
        let url = format!("{}/sms/send", self.config.base_url.trim_end_matches('/'));

        let response = self
            .http
            .post(&url)
            .timeout(HTTP_TIMEOUT)
            .bearer_auth(token)
            .json(&json!({ "phone": phone, "message": message }))
            .send()
            .await?;

        let code = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Ok((code, body))
    }

    async fn token(&self, force: bool) -> Result<String, SmsError> {
        if !force {
            if let Some(token) = self.token_cache.fresh().await {
                return Ok(token);
            }
        }
        self.token_cache.refresh_with(force, || self.login()).await
    }

    async fn login(&self) -> Result<(String, Duration), SmsError> {
        let url = format!("{}/auth/login", self.config.base_url.trim_end_matches('/'));

        let response = self
            .http
            .post(&url)
            .timeout(HTTP_TIMEOUT)
            .json(&json!({
                "username": self.config.username,
                "password": self.config.password,
            }))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(SmsError::AuthFailed {
                status: status.as_u16(),
                body,
            });
        }

        let login: LoginResponse = serde_json::from_str(&body).map_err(|_| SmsError::MissingToken)?;
        if login.token.is_empty() {
            return Err(SmsError::MissingToken);
        }

        let ttl = if login.expires_in > 0 {
            Duration::from_secs(login.expires_in as u64)
        } else {
            FALLBACK_TOKEN_TTL
        };

        Ok((login.token, ttl))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base_url: String, enabled: bool) -> SmsClient {
        SmsClient::new(SmsConfig {
            base_url,
            username: "merchant".into(),
            password: "secret".into(),
            enabled,
        })
    }

    #[tokio::test]
    async fn disabled_client_rejects_sends_without_network() {
        let sms = client("http://127.0.0.1:1".into(), false);
        let err = sms.send_sms("+998901234567", "hi").await.unwrap_err();
        assert!(matches!(err, SmsError::Disabled));
    }

    #[tokio::test]
    async fn token_is_cached_across_sends() {
        let mut server = mockito::Server::new_async().await;

        let login = server
            .mock("POST", "/auth/login")
            .with_status(200)
            .with_body(r#"{"token": "sms-token", "expires_in": 3600}"#)
            .expect(1)
            .create_async()
            .await;
        let send = server
            .mock("POST", "/sms/send")
            .match_header("authorization", "Bearer sms-token")
            .with_status(200)
            .with_body(r#"{"success": true}"#)
            .expect(2)
            .create_async()
            .await;

        let sms = client(server.url(), true);
        sms.send_sms("+998901234567", "first").await.unwrap();
        sms.send_sms("+998901234567", "second").await.unwrap();

        login.assert_async().await;
        send.assert_async().await;
    }

    #[tokio::test]
    async fn fallback_ttl_keeps_the_token_cached_when_login_omits_expiry() {
        let mut server = mockito::Server::new_async().await;

        let login = server
            .mock("POST", "/auth/login")
            .with_status(200)
            .with_body(r#"{"token": "sms-token"}"#)
            .expect(1)
            .create_async()
            .await;
        server
            .mock("POST", "/sms/send")
            .with_status(200)
            .with_body(r#"{"success": true}"#)
            .expect(2)
            .create_async()
            .await;

        let sms = client(server.url(), true);
        sms.send_sms("+998901234567", "first").await.unwrap();
        sms.send_sms("+998901234567", "second").await.unwrap();

        login.assert_async().await;
    }

    #[tokio::test]
    async fn unauthorized_send_refreshes_and_retries_once() {
        let mut server = mockito::Server::new_async().await;

        server
            .mock("POST", "/auth/login")
            .with_status(200)
            .with_body(r#"{"token": "sms-token"}"#)
            .expect(2)
            .create_async()
            .await;
        let send = server
            .mock("POST", "/sms/send")
            .with_status(401)
            .with_body(r#"{"error": "expired"}"#)
            .expect(2)
            .create_async()
            .await;

        let sms = client(server.url(), true);
        let err = sms.send_sms("+998901234567", "hi").await.unwrap_err();
        assert!(matches!(err, SmsError::SendFailed { status: 401, .. }));

        send.assert_async().await;
    }

    #[tokio::test]
    async fn failed_login_surfaces_status_and_body() {
        let mut server = mockito::Server::new_async().await;

        server
            .mock("POST", "/auth/login")
            .with_status(403)
            .with_body("bad credentials")
            .create_async()
            .await;

        let sms = client(server.url(), true);
        let err = sms.send_sms("+998901234567", "hi").await.unwrap_err();
        assert!(matches!(err, SmsError::AuthFailed { status: 403, .. }));
    }
}
