//! Token endpoint calls: authorization-code exchange and refresh

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::tokens::{buffered_expiry, now_secs, TokenRecord, TokenStore};
use super::AuthError;
use crate::config::{AppCredentials, Config};

/// Longest body excerpt kept in `AuthError::Http`.
const MAX_ERROR_BODY: usize = 512;

#[derive(Serialize)]
#[serde(tag = "grant_type", rename_all = "snake_case")]
enum TokenRequest<'a> {
    AuthorizationCode {
        client_id: &'a str,
        client_secret: &'a str,
        code: &'a str,
        redirect_uri: &'a str,
    },
    RefreshToken {
        client_id: &'a str,
        client_secret: &'a str,
        refresh_token: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        scope: Option<&'a str>,
    },
}

/// Token endpoint response envelope; `code == 0` means success.
#[derive(Debug, Deserialize)]
struct TokenEnvelope {
    #[serde(default)]
    code: i64,
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    refresh_token_expires_in: Option<i64>,
    scope: Option<String>,
    token_type: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
    msg: Option<String>,
}

/// Successful token grant
#[derive(Debug, Clone, PartialEq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: i64,
    pub refresh_token_expires_in: Option<i64>,
    pub scope: Option<String>,
    pub token_type: Option<String>,
}

impl TokenGrant {
    /// Turn the grant into a cache record, applying the expiry buffer.
    pub fn into_record(
        self,
        owner_id: &str,
        client_secret_ref: Option<String>,
        buffer_secs: i64,
        issued_at: i64,
    ) -> TokenRecord {
        let mut record = TokenRecord::new(
            owner_id,
            self.access_token,
            buffered_expiry(issued_at, self.expires_in, buffer_secs),
        );
        record.refresh_token = self.refresh_token;
        record.refresh_expires_at = self
            .refresh_token_expires_in
            .map(|ttl| buffered_expiry(issued_at, ttl, buffer_secs));
        record.scopes = self
            .scope
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        record.client_secret_ref = client_secret_ref;
        if let Some(token_type) = self.token_type.filter(|t| !t.is_empty()) {
            record.token_type = token_type;
        }
        record
    }
}

impl TokenEnvelope {
    fn into_grant(self, status: reqwest::StatusCode, raw: &str) -> Result<TokenGrant, AuthError> {
        if self.code != 0 {
            let message = self
                .error_description
                .or(self.msg)
                .or(self.error)
                .unwrap_or_else(|| "unknown error".to_string());
            return Err(AuthError::Provider {
                code: self.code,
                message,
            });
        }
        if !status.is_success() {
            return Err(http_error(status, raw));
        }
        let access_token = self.access_token.filter(|t| !t.is_empty()).ok_or_else(|| {
            AuthError::Provider {
                code: 0,
                message: "token response has no access_token".to_string(),
            }
        })?;
        let expires_in = self.expires_in.filter(|ttl| *ttl > 0).ok_or_else(|| {
            AuthError::Provider {
                code: 0,
                message: "token response has no usable expires_in".to_string(),
            }
        })?;
        Ok(TokenGrant {
            access_token,
            refresh_token: self.refresh_token.filter(|t| !t.is_empty()),
            expires_in,
            refresh_token_expires_in: self.refresh_token_expires_in,
            scope: self.scope,
            token_type: self.token_type,
        })
    }
}

fn http_error(status: reqwest::StatusCode, body: &str) -> AuthError {
    let mut body = body.to_string();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    AuthError::Http {
        status: status.as_u16(),
        body,
    }
}

async fn post_token_request(
    http: &reqwest::Client,
    token_url: &str,
    request: &TokenRequest<'_>,
) -> Result<TokenGrant, AuthError> {
    let resp = http.post(token_url).json(request).send().await?;
    let status = resp.status();
    let body = resp.text().await?;

    match serde_json::from_str::<TokenEnvelope>(&body) {
        Ok(envelope) => envelope.into_grant(status, &body),
        Err(_) if !status.is_success() => Err(http_error(status, &body)),
        Err(e) => Err(AuthError::Provider {
            code: -1,
            message: format!("malformed token response: {}", e),
        }),
    }
}

/// Parameters for a refresh-token grant
#[derive(Debug, Clone)]
pub struct RefreshParams {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    pub scope: Option<String>,
}

/// Exchange a refresh token, reporting the failure cause.
pub async fn request_refresh(
    http: &reqwest::Client,
    token_url: &str,
    params: &RefreshParams,
) -> Result<TokenGrant, AuthError> {
    let request = TokenRequest::RefreshToken {
        client_id: &params.client_id,
        client_secret: &params.client_secret,
        refresh_token: &params.refresh_token,
        scope: params.scope.as_deref(),
    };
    post_token_request(http, token_url, &request).await
}

/// Exchange a refresh token for a new access token.
///
/// Never fails: any problem is logged and reported as `None`, so background
/// refresh paths can call it without error plumbing.
#[allow(dead_code)]
pub async fn refresh_user_access_token(
    http: &reqwest::Client,
    token_url: &str,
    params: &RefreshParams,
) -> Option<TokenGrant> {
    match request_refresh(http, token_url, params).await {
        Ok(grant) => Some(grant),
        Err(e) => {
            tracing::warn!("Refreshing user access token failed: {}", e);
            None
        }
    }
}

/// Token endpoint client bound to one application and a shared token store.
pub struct OAuthClient {
    http: reqwest::Client,
    token_url: String,
    credentials: AppCredentials,
    store: Arc<TokenStore>,
    buffer_secs: i64,
    invalid_grant_codes: Vec<i64>,
}

impl OAuthClient {
    pub fn new(
        config: &Config,
        credentials: AppCredentials,
        store: Arc<TokenStore>,
    ) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()?;

        Ok(Self {
            http,
            token_url: config.token_endpoint(),
            credentials,
            store,
            buffer_secs: config.token_buffer_secs,
            invalid_grant_codes: config.invalid_grant_codes.clone(),
        })
    }

    /// Application id, which is also the owner id of its tokens.
    pub fn owner_id(&self) -> &str {
        &self.credentials.app_id
    }

    pub fn store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    /// Exchange an authorization code. The caller persists the result.
    pub async fn exchange_code_for_token(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenRecord, AuthError> {
        let request = TokenRequest::AuthorizationCode {
            client_id: &self.credentials.app_id,
            client_secret: &self.credentials.app_secret,
            code,
            redirect_uri,
        };
        let issued_at = now_secs();
        let grant = post_token_request(&self.http, &self.token_url, &request).await?;
        tracing::info!("Authorization code exchanged");

        Ok(grant.into_record(
            &self.credentials.app_id,
            Some(self.credentials.app_secret.clone()),
            self.buffer_secs,
            issued_at,
        ))
    }

    /// Refresh the stored token for `owner` and persist the new record.
    ///
    /// Every failure is reported as `AuthExhausted`. When the provider rejects the
    /// refresh token itself, or none is available, the stored record is removed.
    pub async fn refresh_owner(&self, owner: Option<&str>) -> Result<TokenRecord, AuthError> {
        let owner = owner.unwrap_or(self.store.default_owner()).to_string();
        let current = self
            .store
            .get_token(Some(&owner))
            .ok_or_else(|| AuthError::AuthExhausted("no stored credentials".to_string()))?;

        let now = now_secs();
        let refresh_token = match current.refresh_token.clone() {
            Some(rt) if current.can_refresh_at(now) => rt,
            _ => {
                self.invalidate(&owner);
                return Err(AuthError::AuthExhausted(
                    "no usable refresh token".to_string(),
                ));
            }
        };

        let client_secret = current
            .client_secret_ref
            .clone()
            .unwrap_or_else(|| self.credentials.app_secret.clone());
        let params = RefreshParams {
            client_id: owner.clone(),
            client_secret: client_secret.clone(),
            refresh_token,
            scope: None,
        };

        tracing::info!(owner = %owner, "Refreshing user access token...");
        let grant = match request_refresh(&self.http, &self.token_url, &params).await {
            Ok(grant) => grant,
            Err(e) => {
                if e.is_invalid_grant(&self.invalid_grant_codes) {
                    tracing::warn!(owner = %owner, "Refresh token rejected: {}", e);
                    self.invalidate(&owner);
                } else {
                    tracing::warn!(owner = %owner, "Token refresh failed: {}", e);
                }
                return Err(AuthError::AuthExhausted(e.to_string()));
            }
        };

        let mut record = grant.into_record(&owner, Some(client_secret), self.buffer_secs, now);
        if record.refresh_token.is_none() {
            record.refresh_token = current.refresh_token;
            record.refresh_expires_at = current.refresh_expires_at;
        }
        if record.scopes.is_empty() {
            record.scopes = current.scopes;
        }

        self.store.store_token(record.clone()).map_err(|e| {
            AuthError::AuthExhausted(format!("refreshed token could not be saved: {}", e))
        })?;
        tracing::info!(owner = %owner, "Token refreshed");
        Ok(record)
    }

    /// Refresh for `owner`, reporting failure as `None`.
    #[allow(dead_code)]
    pub async fn refresh_user_access_token(&self, owner: Option<&str>) -> Option<TokenRecord> {
        self.refresh_owner(owner).await.ok()
    }

    fn invalidate(&self, owner: &str) {
        if let Err(e) = self.store.remove_token(Some(owner)) {
            tracing::warn!(owner = %owner, "Could not remove stale credentials: {}", e);
        }
    }
}
