//! Per-request authentication mechanisms.
//!
//! Each mechanism augments a plain header map before a request goes on the
//! wire. Mechanisms are applied on every attempt — a token refreshed
//! between retries is picked up automatically. The OAuth variant owns a
//! token state machine; its mutex covers both the state and the
//! acquisition, so concurrent requesters coalesce on a single token fetch.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use ocfetch_core::credentials::CredentialProvider;
use tracing::{debug, info};

use crate::error::HttpError;

/// Plain header map, applied to the protocol request at send time.
pub type Headers = BTreeMap<String, String>;

/// Adds authentication to outgoing request headers.
#[async_trait::async_trait]
pub trait AuthenticationMechanism: Send + Sync {
    /// Augment `headers` in place.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError`] when credentials cannot be resolved or a token
    /// cannot be acquired.
    async fn authenticate_request(
        &self,
        headers: &mut Headers,
        provider: &Arc<dyn CredentialProvider>,
    ) -> Result<(), HttpError>;

    /// Stable identity for pool fingerprinting. Two configs with the same
    /// identity may share a pool.
    fn identity(&self) -> String;
}

/// Pass-through mechanism.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAuthentication;

#[async_trait::async_trait]
impl AuthenticationMechanism for NoAuthentication {
    async fn authenticate_request(
        &self,
        _headers: &mut Headers,
        _provider: &Arc<dyn CredentialProvider>,
    ) -> Result<(), HttpError> {
        Ok(())
    }

    fn identity(&self) -> String {
        "none".to_owned()
    }
}

/// HTTP Basic authentication. The credential tuple is cached after the
/// first resolution.
#[derive(Debug)]
pub struct BasicAuthentication {
    config_name: String,
    username_key: String,
    password_key: String,
    cached: tokio::sync::Mutex<Option<(String, String)>>,
}

impl BasicAuthentication {
    /// Create a mechanism resolving `username`/`password` under
    /// `config_name`.
    #[must_use]
    pub fn new(config_name: impl Into<String>) -> Self {
        Self {
            config_name: config_name.into(),
            username_key: "username".to_owned(),
            password_key: "password".to_owned(),
            cached: tokio::sync::Mutex::new(None),
        }
    }

    /// Override the credential key names.
    #[must_use]
    pub fn with_keys(mut self, username_key: impl Into<String>, password_key: impl Into<String>) -> Self {
        self.username_key = username_key.into();
        self.password_key = password_key.into();
        self
    }
}

fn basic_header(user: &str, pass: &str) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
    format!("Basic {encoded}")
}

#[async_trait::async_trait]
impl AuthenticationMechanism for BasicAuthentication {
    async fn authenticate_request(
        &self,
        headers: &mut Headers,
        provider: &Arc<dyn CredentialProvider>,
    ) -> Result<(), HttpError> {
        let mut cached = self.cached.lock().await;
        if cached.is_none() {
            let username = provider
                .get_credential(&self.config_name, &self.username_key)
                .await?;
            let password = provider
                .get_credential(&self.config_name, &self.password_key)
                .await?;
            *cached = Some((username, password));
        }
        if let Some((user, pass)) = cached.as_ref() {
            headers.insert("Authorization".to_owned(), basic_header(user, pass));
        }
        Ok(())
    }

    fn identity(&self) -> String {
        format!("basic:{}", self.config_name)
    }
}

/// Static bearer-token authentication. The token is cached after the first
/// resolution.
#[derive(Debug)]
pub struct BearerTokenAuthentication {
    config_name: String,
    token_key: String,
    cached: tokio::sync::Mutex<Option<String>>,
}

impl BearerTokenAuthentication {
    /// Create a mechanism resolving `token` under `config_name`.
    #[must_use]
    pub fn new(config_name: impl Into<String>) -> Self {
        Self {
            config_name: config_name.into(),
            token_key: "token".to_owned(),
            cached: tokio::sync::Mutex::new(None),
        }
    }
}

#[async_trait::async_trait]
impl AuthenticationMechanism for BearerTokenAuthentication {
    async fn authenticate_request(
        &self,
        headers: &mut Headers,
        provider: &Arc<dyn CredentialProvider>,
    ) -> Result<(), HttpError> {
        let mut cached = self.cached.lock().await;
        if cached.is_none() {
            let token = provider
                .get_credential(&self.config_name, &self.token_key)
                .await?;
            *cached = Some(token);
        }
        if let Some(token) = cached.as_ref() {
            headers.insert("Authorization".to_owned(), format!("Bearer {token}"));
        }
        Ok(())
    }

    fn identity(&self) -> String {
        format!("bearer:{}", self.config_name)
    }
}

#[derive(Debug, Default)]
struct TokenState {
    access_token: Option<String>,
    expires_at: Option<Instant>,
}

/// OAuth 2.0 client-credentials mechanism.
///
/// Token lifecycle: none → acquiring → valid(expires_at) → expiring →
/// acquiring → ... The state mutex is held across acquisition, so at most
/// one token request is in flight per mechanism instance and concurrent
/// requesters reuse the token it produces.
pub struct OAuthClientCredentials {
    token_url: String,
    config_name: String,
    grant_type: String,
    /// Refresh this long before the token actually expires.
    expiry_skew: Duration,
    http: reqwest::Client,
    state: tokio::sync::Mutex<TokenState>,
}

impl OAuthClientCredentials {
    /// Create a mechanism acquiring tokens from `token_url` with the
    /// `consumer_key`/`consumer_secret` pair under `config_name`.
    #[must_use]
    pub fn new(token_url: impl Into<String>, config_name: impl Into<String>) -> Self {
        Self {
            token_url: token_url.into(),
            config_name: config_name.into(),
            grant_type: "client_credentials".to_owned(),
            expiry_skew: Duration::from_secs(60),
            http: reqwest::Client::new(),
            state: tokio::sync::Mutex::new(TokenState::default()),
        }
    }

    /// Acquire a fresh token. Called with the state mutex held.
    async fn acquire(
        &self,
        state: &mut TokenState,
        provider: &Arc<dyn CredentialProvider>,
    ) -> Result<(), HttpError> {
        let consumer_key = provider
            .get_credential(&self.config_name, "consumer_key")
            .await?;
        let consumer_secret = provider
            .get_credential(&self.config_name, "consumer_secret")
            .await?;

        debug!(config_name = %self.config_name, token_url = %self.token_url, "acquiring oauth token");

        let response = self
            .http
            .post(&self.token_url)
            .header("Authorization", basic_header(&consumer_key, &consumer_secret))
            .form(&[("grant_type", self.grant_type.as_str())])
            .send()
            .await
            .map_err(|e| HttpError::Request {
                url: self.token_url.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            // Do not touch existing state on failure.
            return Err(HttpError::Status {
                url: self.token_url.clone(),
                status: status.as_u16(),
            });
        }

        let body: serde_json::Value = response.json().await.map_err(|e| HttpError::Request {
            url: self.token_url.clone(),
            reason: format!("undecodable token response: {e}"),
        })?;

        let access_token = body
            .get("access_token")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| HttpError::Auth {
                reason: "token response has no access_token".to_owned(),
            })?
            .to_owned();
        // Providers that omit expires_in get one hour.
        let expires_in = body
            .get("expires_in")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(3600);

        state.access_token = Some(access_token);
        state.expires_at = Some(Instant::now() + Duration::from_secs(expires_in));
        info!(config_name = %self.config_name, expires_in, "oauth token acquired");
        Ok(())
    }

    #[cfg(test)]
    async fn expires_at(&self) -> Option<Instant> {
        self.state.lock().await.expires_at
    }
}

#[async_trait::async_trait]
impl AuthenticationMechanism for OAuthClientCredentials {
    async fn authenticate_request(
        &self,
        headers: &mut Headers,
        provider: &Arc<dyn CredentialProvider>,
    ) -> Result<(), HttpError> {
        let mut state = self.state.lock().await;

        let valid = state.access_token.is_some()
            && state
                .expires_at
                .is_some_and(|at| Instant::now() + self.expiry_skew < at);
        if !valid {
            self.acquire(&mut state, provider).await?;
        }

        if let Some(token) = state.access_token.as_ref() {
            headers.insert("Authorization".to_owned(), format!("Bearer {token}"));
        }
        Ok(())
    }

    fn identity(&self) -> String {
        format!("oauth:{}:{}", self.config_name, self.token_url)
    }
}

impl std::fmt::Debug for OAuthClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthClientCredentials")
            .field("token_url", &self.token_url)
            .field("config_name", &self.config_name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocfetch_core::credentials::EnvCredentialProvider;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn env_provider(prefix: &str) -> Arc<dyn CredentialProvider> {
        Arc::new(EnvCredentialProvider::new(prefix))
    }

    #[tokio::test]
    async fn basic_auth_injects_and_caches() {
        std::env::set_var("OCT_BASIC_SVC_USERNAME", "alice");
        std::env::set_var("OCT_BASIC_SVC_PASSWORD", "wonder");
        let provider = env_provider("OCT_BASIC_");
        let auth = BasicAuthentication::new("svc");

        let mut headers = Headers::new();
        auth.authenticate_request(&mut headers, &provider).await.unwrap();
        assert_eq!(
            headers.get("Authorization").map(String::as_str),
            Some("Basic YWxpY2U6d29uZGVy")
        );

        // Cached: removing the variables does not break subsequent calls.
        std::env::remove_var("OCT_BASIC_SVC_USERNAME");
        std::env::remove_var("OCT_BASIC_SVC_PASSWORD");
        let mut headers = Headers::new();
        auth.authenticate_request(&mut headers, &provider).await.unwrap();
        assert!(headers.contains_key("Authorization"));
    }

    #[tokio::test]
    async fn bearer_auth_injects_token() {
        std::env::set_var("OCT_BEARER_SVC_TOKEN", "tok-123");
        let provider = env_provider("OCT_BEARER_");
        let auth = BearerTokenAuthentication::new("svc");

        let mut headers = Headers::new();
        auth.authenticate_request(&mut headers, &provider).await.unwrap();
        assert_eq!(
            headers.get("Authorization").map(String::as_str),
            Some("Bearer tok-123")
        );
        std::env::remove_var("OCT_BEARER_SVC_TOKEN");
    }

    #[tokio::test]
    async fn oauth_concurrent_requesters_coalesce_on_one_acquisition() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=client_credentials"))
            .and(header("Authorization", "Basic a2V5OnNlY3JldA=="))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "coalesced-token",
                "expires_in": 1800,
            })))
            .expect(1)
            .mount(&server)
            .await;

        std::env::set_var("OCT_OAUTH_FR_CONSUMER_KEY", "key");
        std::env::set_var("OCT_OAUTH_FR_CONSUMER_SECRET", "secret");
        let provider = env_provider("OCT_OAUTH_");
        let auth = Arc::new(OAuthClientCredentials::new(
            format!("{}/token", server.uri()),
            "fr",
        ));

        let mut tasks = Vec::new();
        for _ in 0..2 {
            let auth = Arc::clone(&auth);
            let provider = Arc::clone(&provider);
            tasks.push(tokio::spawn(async move {
                let mut headers = Headers::new();
                auth.authenticate_request(&mut headers, &provider)
                    .await
                    .map(|()| headers.remove("Authorization"))
            }));
        }

        let mut tokens = Vec::new();
        for task in tasks {
            tokens.push(task.await.unwrap().unwrap().unwrap());
        }
        // Both requests carry the same token; the mock verified a single
        // token-endpoint call on drop.
        assert_eq!(tokens[0], "Bearer coalesced-token");
        assert_eq!(tokens[0], tokens[1]);

        std::env::remove_var("OCT_OAUTH_FR_CONSUMER_KEY");
        std::env::remove_var("OCT_OAUTH_FR_CONSUMER_SECRET");
    }

    #[tokio::test]
    async fn oauth_missing_expires_in_defaults_to_an_hour() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "no-expiry-token",
            })))
            .mount(&server)
            .await;

        std::env::set_var("OCT_OAUTH2_FR_CONSUMER_KEY", "key");
        std::env::set_var("OCT_OAUTH2_FR_CONSUMER_SECRET", "secret");
        let provider = env_provider("OCT_OAUTH2_");
        let auth = OAuthClientCredentials::new(format!("{}/token", server.uri()), "fr");

        let mut headers = Headers::new();
        auth.authenticate_request(&mut headers, &provider).await.unwrap();

        let expires_at = auth.expires_at().await.unwrap();
        let remaining = expires_at.saturating_duration_since(Instant::now());
        assert!(remaining > Duration::from_secs(3500));
        assert!(remaining <= Duration::from_secs(3600));

        std::env::remove_var("OCT_OAUTH2_FR_CONSUMER_KEY");
        std::env::remove_var("OCT_OAUTH2_FR_CONSUMER_SECRET");
    }

    #[tokio::test]
    async fn oauth_failure_leaves_state_untouched() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        std::env::set_var("OCT_OAUTH3_FR_CONSUMER_KEY", "key");
        std::env::set_var("OCT_OAUTH3_FR_CONSUMER_SECRET", "secret");
        let provider = env_provider("OCT_OAUTH3_");
        let auth = OAuthClientCredentials::new(format!("{}/token", server.uri()), "fr");

        let mut headers = Headers::new();
        let err = auth
            .authenticate_request(&mut headers, &provider)
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(500));
        assert!(headers.get("Authorization").is_none());
        assert!(auth.expires_at().await.is_none());

        std::env::remove_var("OCT_OAUTH3_FR_CONSUMER_KEY");
        std::env::remove_var("OCT_OAUTH3_FR_CONSUMER_SECRET");
    }
}
