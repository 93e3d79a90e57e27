//! # Token Provider
//!
//! Owns the bearer credential for the REST upstream. A credential is obtained
//! through an OAuth2 client-credentials exchange, replaced wholesale on every
//! refresh and dropped on forced reconnect. Callers invoke
//! [`TokenProvider::ensure_valid`] before each upstream request; it only talks
//! to the authorization server when the credential is missing or about to
//! expire.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use reqwest::Method;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::configs::TokenConfig;
use crate::core::health_monitor::Component;
use crate::errors::{ErrorTracker, Severity};
use crate::retrieve::{ApiClient, ApiError, Auth, RequestBody};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum AuthError {
    /// The token endpoint was unreachable or rejected the client credentials.
    #[error("authentication failed: {0}")]
    AuthFailure(String),
}

/// A bearer token and the instant it stops being valid.
#[derive(Debug, Clone, PartialEq)]
pub struct Credential {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// What the authorization server hands back.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IssuedToken {
    pub access_token: String,
    /// Lifetime in seconds.
    pub expires_in: u64,
}

/// The credential exchange with the authorization endpoint.
#[async_trait]
pub trait TokenExchange: Send + Sync {
    async fn exchange(&self) -> Result<IssuedToken, AuthError>;
}

/// Client-credentials grant over HTTPS with HTTP Basic client authentication.
pub struct HttpTokenExchange {
    client: ApiClient,
    auth: Auth,
}

impl HttpTokenExchange {
    pub fn new(
        token_url: &str,
        client_id: &str,
        client_secret: &str,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        Ok(Self {
            client: ApiClient::new(token_url, timeout)?,
            auth: Auth::Basic {
                username: client_id.to_string(),
                password: client_secret.to_string(),
            },
        })
    }
}

#[async_trait]
impl TokenExchange for HttpTokenExchange {
    async fn exchange(&self) -> Result<IssuedToken, AuthError> {
        let body = RequestBody::Form(vec![(
            "grant_type".to_string(),
            "client_credentials".to_string(),
        )]);
        let response = self
            .client
            .request::<IssuedToken>(Method::POST, "", Some(&self.auth), Some(body))
            .await
            .map_err(|e| AuthError::AuthFailure(e.to_string()))?;

        match response.data {
            Some(issued) if response.success => Ok(issued),
            _ => Err(AuthError::AuthFailure(format!(
                "token endpoint returned {}: {}",
                response.status,
                response.error_body.unwrap_or_default()
            ))),
        }
    }
}

/// # Token Provider
///
/// Thread-safe owner of the current [`Credential`].
pub struct TokenProvider {
    exchange: Arc<dyn TokenExchange>,
    tracker: Arc<ErrorTracker>,
    refresh_margin: chrono::Duration,
    credential: RwLock<Option<Credential>>,
    /// Serialises `ensure_valid` so concurrent callers trigger one exchange.
    refresh: Mutex<()>,
}

impl TokenProvider {
    pub fn new(
        exchange: Arc<dyn TokenExchange>,
        tracker: Arc<ErrorTracker>,
        config: &TokenConfig,
    ) -> Self {
        Self {
            exchange,
            tracker,
            refresh_margin: config.refresh_margin(),
            credential: RwLock::new(None),
            refresh: Mutex::new(()),
        }
    }

    /// Exchanges the client credentials for a fresh token.
    ///
    /// On failure the previous credential, if any, is left untouched.
    pub async fn authenticate(&self) -> Result<(), AuthError> {
        self.authenticate_reporting(Severity::Error).await
    }

    async fn authenticate_reporting(&self, severity: Severity) -> Result<(), AuthError> {
        match self.exchange.exchange().await {
            Ok(issued) => {
                let expires_at = expiry_after(Utc::now(), issued.expires_in);
                *self.credential.write().await = Some(Credential {
                    token: issued.access_token,
                    expires_at,
                });
                log::info!("Obtained bearer token valid until {}", expires_at.to_rfc3339());
                Ok(())
            }
            Err(e) => {
                self.tracker.log_error(
                    Component::TokenSource.as_str(),
                    severity,
                    e.to_string(),
                    None,
                );
                Err(e)
            }
        }
    }

    /// Authenticates when no credential exists or the current one expires
    /// within the refresh margin; otherwise does nothing.
    pub async fn ensure_valid(&self) -> Result<(), AuthError> {
        let _guard = self.refresh.lock().await;
        if self.needs_refresh(Utc::now()).await {
            log::debug!("Bearer token missing or near expiry, refreshing");
            self.authenticate().await
        } else {
            Ok(())
        }
    }

    async fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        match &*self.credential.read().await {
            Some(credential) => now
                .checked_add_signed(self.refresh_margin)
                .is_none_or(|deadline| credential.expires_at <= deadline),
            None => true,
        }
    }

    /// Returns a token that is valid for at least the refresh margin.
    pub async fn bearer(&self) -> Result<String, AuthError> {
        self.ensure_valid().await?;
        self.credential
            .read()
            .await
            .as_ref()
            .map(|c| c.token.clone())
            .ok_or_else(|| AuthError::AuthFailure("no credential after refresh".to_string()))
    }

    /// Discards the current credential.
    pub async fn invalidate(&self) {
        *self.credential.write().await = None;
    }

    /// Discards the credential and authenticates again. Failures are reported
    /// as critical since they come from an operator-initiated reconnect.
    pub async fn force_reauthenticate(&self) -> Result<(), AuthError> {
        let _guard = self.refresh.lock().await;
        self.invalidate().await;
        self.authenticate_reporting(Severity::Critical).await
    }

    pub async fn current(&self) -> Option<Credential> {
        self.credential.read().await.clone()
    }
}

/// `now + lifetime`, saturating at the latest representable instant when the
/// upstream reports an absurdly long lifetime.
fn expiry_after(now: DateTime<Utc>, expires_in: u64) -> DateTime<Utc> {
    i64::try_from(expires_in)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
