//! Authenticated HTTP client for Open Platform APIs
//!
//! Wraps reqwest::Client with bearer token injection and transparent refresh.

use reqwest::{Method, StatusCode};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use super::refresh::RefreshCoordinator;
use crate::auth::{AuthError, TokenStore};
use crate::config::Config;

/// Decides whether a response means "access token expired".
/// Receives the HTTP status and the envelope `code`, if any.
pub type ExpiryPredicate = Arc<dyn Fn(StatusCode, Option<i64>) -> bool + Send + Sync>;

/// HTTP 401, or one of `codes` in the response envelope.
pub fn expiry_predicate(codes: &[i64]) -> ExpiryPredicate {
    let codes: HashSet<i64> = codes.iter().copied().collect();
    Arc::new(move |status, code| {
        status == StatusCode::UNAUTHORIZED || code.is_some_and(|c| codes.contains(&c))
    })
}

/// Authenticated client shared by every wrapped API call.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    store: Arc<TokenStore>,
    owner: String,
    coordinator: Arc<RefreshCoordinator>,
    is_expired: ExpiryPredicate,
}

impl ApiClient {
    /// Build a client whose refreshes go through `coordinator`.
    ///
    /// Everything sharing the coordinator shares one in-flight refresh.
    pub fn new(config: &Config, coordinator: Arc<RefreshCoordinator>) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()?;
        let oauth = coordinator.oauth();

        Ok(Self {
            http,
            base_url: config.api_base(),
            store: oauth.store().clone(),
            owner: oauth.owner_id().to_string(),
            coordinator,
            is_expired: expiry_predicate(&config.expired_codes),
        })
    }

    #[allow(dead_code)]
    pub fn with_expiry_predicate(mut self, predicate: ExpiryPredicate) -> Self {
        self.is_expired = predicate;
        self
    }

    /// Current access token, refreshing first if the cached one is stale.
    async fn bearer_token(&self) -> Result<String, AuthError> {
        if let Some(record) = self.store.get_valid_token(Some(&self.owner)) {
            return Ok(record.access_token);
        }
        if self.store.get_token(Some(&self.owner)).is_none() {
            return Err(AuthError::NotAuthenticated);
        }
        tracing::info!("Cached token expired, refreshing before request");
        self.coordinator.refreshed_token(None).await
    }

    pub async fn get(&self, path: &str) -> Result<Value, AuthError> {
        self.request(Method::GET, path, None).await
    }

    /// Send an authenticated request and return the JSON body.
    ///
    /// A response classified as expired triggers one refresh and one retry.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, AuthError> {
        let url = format!("{}{}", self.base_url, path);
        let token = self.bearer_token().await?;

        match self.send(&method, &url, body, &token).await {
            Err(AuthError::AuthExpired) => {}
            other => return other,
        }

        tracing::info!("Access token rejected for {}, refreshing...", url);
        let token = self.coordinator.refreshed_token(Some(&token)).await?;
        match self.send(&method, &url, body, &token).await {
            Err(AuthError::AuthExpired) => Err(AuthError::AuthExhausted(format!(
                "access token rejected after refresh ({} {})",
                method, url
            ))),
            other => other,
        }
    }

    /// One attempt. `AuthExpired` means the token was rejected.
    async fn send(
        &self,
        method: &Method,
        url: &str,
        body: Option<&Value>,
        token: &str,
    ) -> Result<Value, AuthError> {
        tracing::debug!("{} {}", method, url);
        let mut req = self.http.request(method.clone(), url).bearer_auth(token);
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await?;

        let status = resp.status();
        let text = resp.text().await?;
        let json: Option<Value> = serde_json::from_str(&text).ok();
        let code = json.as_ref().and_then(|v| v.get("code")).and_then(Value::as_i64);

        if (self.is_expired)(status, code) {
            return Err(AuthError::AuthExpired);
        }
        check_response(status, code, json, text)
    }
}

/// Map a non-auth response to either its JSON body or a normalized error.
fn check_response(
    status: StatusCode,
    code: Option<i64>,
    json: Option<Value>,
    text: String,
) -> Result<Value, AuthError> {
    if let Some(code) = code.filter(|c| *c != 0) {
        let message = json
            .as_ref()
            .and_then(|v| v.get("msg").or_else(|| v.get("message")))
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        return Err(AuthError::Provider { code, message });
    }
    if !status.is_success() {
        return Err(AuthError::Http {
            status: status.as_u16(),
            body: text,
        });
    }
    Ok(json.unwrap_or(Value::String(text)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::oauth::OAuthClient;
    use crate::auth::tokens::{now_secs, TokenRecord};
    use crate::config::AppCredentials;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};
    use wiremock::matchers::{bearer_token, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const OWNER: &str = "cli_test";
    const TOKEN_PATH: &str = "/open-apis/authen/v2/oauth/token";
    const USER_INFO: &str = "/open-apis/authen/v1/user_info";

    fn setup(mock: &MockServer, dir: &tempfile::TempDir, access: Option<(&str, i64)>) -> ApiClient {
        let config = Config {
            domain: mock.uri(),
            ..Config::default()
        };
        let store = Arc::new(TokenStore::new(dir.path().join("tokens.json"), OWNER));
        if let Some((access, expires_at)) = access {
            let mut record = TokenRecord::new(OWNER, access, expires_at);
            record.refresh_token = Some("r1".to_string());
            store.store_token(record).unwrap();
        }
        let credentials = AppCredentials {
            app_id: OWNER.to_string(),
            app_secret: "secret".to_string(),
        };
        let oauth = Arc::new(OAuthClient::new(&config, credentials, store).unwrap());
        ApiClient::new(&config, Arc::new(RefreshCoordinator::new(oauth))).unwrap()
    }

    async fn mount_refresh(mock: &MockServer, new_token: &str, expected_calls: u64) {
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({
                        "code": 0,
                        "access_token": new_token,
                        "refresh_token": "r2",
                        "expires_in": 7200,
                    }))
                    .set_delay(Duration::from_millis(50)),
            )
            .expect(expected_calls)
            .mount(mock)
            .await;
    }

    async fn mount_user_info(mock: &MockServer) {
        Mock::given(method("GET"))
            .and(path(USER_INFO))
            .and(bearer_token("old"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "code": 99991677,
                "msg": "token expired",
            })))
            .mount(mock)
            .await;
        Mock::given(method("GET"))
            .and(path(USER_INFO))
            .and(bearer_token("new"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 0,
                "data": {"name": "Ada", "open_id": "ou_1"},
            })))
            .mount(mock)
            .await;
    }

    #[tokio::test]
    async fn test_two_concurrent_401s_refresh_once() {
        let mock = MockServer::start().await;
        mount_user_info(&mock).await;
        mount_refresh(&mock, "new", 1).await;
        let dir = tempfile::tempdir().unwrap();
        let client = setup(&mock, &dir, Some(("old", now_secs() + 3600)));

        let (a, b) = tokio::join!(client.get(USER_INFO), client.get(USER_INFO));
        let a = assert_ok!(a);
        let b = assert_ok!(b);
        assert_eq!(a["data"]["name"], "Ada");
        assert_eq!(b["data"]["open_id"], "ou_1");
        assert_eq!(client.coordinator.refresh_count(), 1);

        // Both retries carried the new token
        let requests = mock.received_requests().await.unwrap();
        let retried = requests
            .iter()
            .filter(|r| r.url.path() == USER_INFO)
            .filter(|r| {
                r.headers
                    .get("authorization")
                    .is_some_and(|v| v.to_str().unwrap_or_default() == "Bearer new")
            })
            .count();
        assert_eq!(retried, 2);
    }

    #[tokio::test]
    async fn test_many_concurrent_calls_single_refresh() {
        let mock = MockServer::start().await;
        mount_user_info(&mock).await;
        mount_refresh(&mock, "new", 1).await;
        let dir = tempfile::tempdir().unwrap();
        let client = setup(&mock, &dir, Some(("old", now_secs() + 3600)));

        let results = futures::future::join_all((0..10).map(|_| client.get(USER_INFO))).await;
        assert!(results.iter().all(|r| r.is_ok()));
    }

    #[tokio::test]
    async fn test_provider_expiry_code_triggers_refresh() {
        let mock = MockServer::start().await;
        // Expiry reported in the envelope with HTTP 400
        Mock::given(method("GET"))
            .and(path("/open-apis/wiki/v2/spaces"))
            .and(bearer_token("old"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "code": 99991668,
                "msg": "Invalid access token for authorization",
            })))
            .mount(&mock)
            .await;
        Mock::given(method("GET"))
            .and(path("/open-apis/wiki/v2/spaces"))
            .and(bearer_token("new"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": 0, "data": {}})))
            .mount(&mock)
            .await;
        mount_refresh(&mock, "new", 1).await;
        let dir = tempfile::tempdir().unwrap();
        let client = setup(&mock, &dir, Some(("old", now_secs() + 3600)));

        assert_ok!(client.get("/open-apis/wiki/v2/spaces").await);
    }

    #[tokio::test]
    async fn test_refresh_failure_fails_every_caller() {
        let mock = MockServer::start().await;
        mount_user_info(&mock).await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"code": 20037, "error": "invalid_grant"}))
                    .set_delay(Duration::from_millis(50)),
            )
            .expect(1)
            .mount(&mock)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let client = setup(&mock, &dir, Some(("old", now_secs() + 3600)));

        let (a, b) = tokio::join!(client.get(USER_INFO), client.get(USER_INFO));
        assert!(matches!(assert_err!(a), AuthError::AuthExhausted(_)));
        assert!(matches!(assert_err!(b), AuthError::AuthExhausted(_)));
        assert!(client.store.get_token(None).is_none());
    }

    #[tokio::test]
    async fn test_other_errors_pass_through() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/open-apis/docx/v1/documents/x"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&mock)
            .await;
        Mock::given(method("POST"))
            .and(path("/open-apis/docx/v1/documents"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 1770002,
                "msg": "not found",
            })))
            .mount(&mock)
            .await;
        mount_refresh(&mock, "unused", 0).await;
        let dir = tempfile::tempdir().unwrap();
        let client = setup(&mock, &dir, Some(("old", now_secs() + 3600)));

        let err = client.get("/open-apis/docx/v1/documents/x").await.unwrap_err();
        assert!(matches!(err, AuthError::Http { status: 500, .. }));

        let err = client
            .request(
                Method::POST,
                "/open-apis/docx/v1/documents",
                Some(&json!({"title": "t"})),
            )
            .await
            .unwrap_err();
        match err {
            AuthError::Provider { code, message } => {
                assert_eq!(code, 1770002);
                assert_eq!(message, "not found");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejected_after_refresh_is_not_retried_again() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(USER_INFO))
            .respond_with(ResponseTemplate::new(401))
            .expect(2)
            .mount(&mock)
            .await;
        mount_refresh(&mock, "new", 1).await;
        let dir = tempfile::tempdir().unwrap();
        let client = setup(&mock, &dir, Some(("old", now_secs() + 3600)));

        let err = client.get(USER_INFO).await.unwrap_err();
        assert!(matches!(err, AuthError::AuthExhausted(_)));
    }

    #[tokio::test]
    async fn test_stale_cache_refreshes_before_sending() {
        let mock = MockServer::start().await;
        mount_user_info(&mock).await;
        mount_refresh(&mock, "new", 1).await;
        let dir = tempfile::tempdir().unwrap();
        let client = setup(&mock, &dir, Some(("old", now_secs() - 5)));

        assert_ok!(client.get(USER_INFO).await);
        let old_sent = mock
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.url.path() == USER_INFO)
            .count();
        assert_eq!(old_sent, 1);
    }

    #[tokio::test]
    async fn test_not_logged_in() {
        let mock = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let client = setup(&mock, &dir, None);

        let err = client.get(USER_INFO).await.unwrap_err();
        assert!(matches!(err, AuthError::NotAuthenticated));
    }

    #[tokio::test]
    async fn test_custom_expiry_predicate() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/x"))
            .and(bearer_token("old"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&mock)
            .await;
        Mock::given(method("GET"))
            .and(path("/x"))
            .and(bearer_token("new"))
            .respond_with(ResponseTemplate::new(200).set_body_string("plain"))
            .mount(&mock)
            .await;
        mount_refresh(&mock, "new", 1).await;
        let dir = tempfile::tempdir().unwrap();
        let client = setup(&mock, &dir, Some(("old", now_secs() + 3600)))
            .with_expiry_predicate(Arc::new(|status, _| status == StatusCode::FORBIDDEN));

        assert_eq!(client.get("/x").await.unwrap(), Value::String("plain".to_string()));
    }

    #[test]
    fn test_default_predicate() {
        let predicate = expiry_predicate(&[99991677]);
        assert!(predicate(StatusCode::UNAUTHORIZED, None));
        assert!(predicate(StatusCode::BAD_REQUEST, Some(99991677)));
        assert!(!predicate(StatusCode::BAD_REQUEST, Some(1)));
        assert!(!predicate(StatusCode::OK, Some(0)));
    }
}
