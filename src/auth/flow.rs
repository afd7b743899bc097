//! Login orchestration: cached token, then refresh, then browser consent

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use super::oauth::OAuthClient;
use super::server::LoopbackAuthServer;
use super::tokens::TokenStore;
use super::AuthError;
use crate::api::{ApiClient, RefreshCoordinator};
use crate::config::{validate_app_id, validate_app_secret, Config};

/// How `login` obtained its token
#[derive(Debug, Clone, PartialEq)]
pub enum LoginOutcome {
    AlreadyAuthenticated(String),
    Refreshed(String),
    Authorized(String),
}

impl LoginOutcome {
    pub fn access_token(&self) -> &str {
        match self {
            Self::AlreadyAuthenticated(t) | Self::Refreshed(t) | Self::Authorized(t) => t,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessState {
    Valid,
    Expired,
    Missing,
}

/// Offline view of the cached credentials
#[derive(Debug, Clone)]
pub struct TokenStatus {
    pub owner: Option<String>,
    pub token_file: PathBuf,
    pub access: AccessState,
    pub expires_at: Option<i64>,
    pub has_refresh_token: bool,
    pub refresh_expires_at: Option<i64>,
    pub scopes: Vec<String>,
}

pub struct AuthFlow {
    config: Config,
    token_path: PathBuf,
    /// Shared by every refresh this flow and its API clients perform
    coordinator: OnceLock<Arc<RefreshCoordinator>>,
}

impl AuthFlow {
    pub fn new(config: Config, token_path: impl Into<PathBuf>) -> Self {
        Self {
            config,
            token_path: token_path.into(),
            coordinator: OnceLock::new(),
        }
    }

    /// Use the token location named by the configuration.
    pub fn from_config(config: Config) -> Result<Self, AuthError> {
        let token_path = config
            .token_path()
            .map_err(|e| AuthError::Config(e.to_string()))?;
        Ok(Self::new(config, token_path))
    }

    /// Refresh coordinator for the configured application, built on first use.
    fn coordinator(&self) -> Result<Arc<RefreshCoordinator>, AuthError> {
        if let Some(coordinator) = self.coordinator.get() {
            return Ok(coordinator.clone());
        }
        let credentials = self.config.credentials()?;
        let store = Arc::new(TokenStore::new(
            self.token_path.clone(),
            credentials.app_id.clone(),
        ));
        let oauth = Arc::new(OAuthClient::new(&self.config, credentials, store)?);
        let coordinator = Arc::new(RefreshCoordinator::new(oauth));
        Ok(self.coordinator.get_or_init(|| coordinator).clone())
    }

    fn oauth(&self) -> Result<Arc<OAuthClient>, AuthError> {
        Ok(self.coordinator()?.oauth().clone())
    }

    pub fn store(&self) -> Result<Arc<TokenStore>, AuthError> {
        Ok(self.oauth()?.store().clone())
    }

    /// API transport sharing this flow's refresh coordinator.
    pub fn api_client(&self) -> Result<ApiClient, AuthError> {
        ApiClient::new(&self.config, self.coordinator()?)
    }

    /// Make sure app_id and app_secret are configured, prompting once if allowed.
    pub async fn ensure_credentials(&mut self, interactive: bool) -> Result<(), AuthError> {
        if self.config.credentials().is_ok() {
            return Ok(());
        }
        if !interactive {
            return Err(AuthError::Config(
                "app_id and app_secret are not configured".to_string(),
            ));
        }

        let current_id = self.config.app_id.clone();
        let (app_id, app_secret) =
            tokio::task::spawn_blocking(move || prompt_credentials(current_id))
                .await
                .map_err(|_| AuthError::Cancelled)??;

        self.config.app_id = Some(validate_app_id(&app_id)?);
        self.config.app_secret = Some(validate_app_secret(&app_secret)?);
        self.coordinator = OnceLock::new();
        if let Err(e) = self.config.save() {
            tracing::warn!("Could not save credentials: {:#}", e);
        } else {
            tracing::info!("Credentials saved");
        }
        Ok(())
    }

    pub async fn login(&mut self, force: bool) -> Result<LoginOutcome, AuthError> {
        self.ensure_credentials(true).await?;
        self.login_with(force, present_authorize_url).await
    }

    /// Run the login, handing the authorization URL to `present`.
    pub async fn login_with(
        &self,
        force: bool,
        present: impl FnOnce(&str),
    ) -> Result<LoginOutcome, AuthError> {
        let coordinator = self.coordinator()?;
        let oauth = coordinator.oauth().clone();

        if !force {
            let store = oauth.store();
            if let Some(record) = store.get_valid_token(None) {
                tracing::info!("Cached token is still valid");
                return Ok(LoginOutcome::AlreadyAuthenticated(record.access_token));
            }
            if store.get_token(None).is_some() {
                match coordinator.refreshed_token(None).await {
                    Ok(token) => return Ok(LoginOutcome::Refreshed(token)),
                    Err(e) => {
                        tracing::info!("Refresh failed ({}), falling back to browser sign-in", e)
                    }
                }
            }
        }

        let server = LoopbackAuthServer::new(&self.config, oauth);
        server.start_server().await?;
        let result = self.authorize_in_browser(&server, force, present).await;
        server.stop_server().await;
        result
    }

    async fn authorize_in_browser(
        &self,
        server: &LoopbackAuthServer,
        force: bool,
        present: impl FnOnce(&str),
    ) -> Result<LoginOutcome, AuthError> {
        let authorization = if force {
            server.begin_authorization()?
        } else {
            server.authorize()?
        };

        if !authorization.needs_authorization {
            let token = authorization.access_token.ok_or(AuthError::NotAuthenticated)?;
            return Ok(LoginOutcome::AlreadyAuthenticated(token));
        }

        let (Some(url), Some(state)) = (authorization.authorize_url, authorization.state) else {
            return Err(AuthError::InvalidCallback(
                "authorization was not started".to_string(),
            ));
        };
        present(&url);

        let timeout = Duration::from_secs(self.config.authorization_timeout_secs);
        let token = server.wait_for_authorization(&state, timeout).await?;
        Ok(LoginOutcome::Authorized(token))
    }

    /// Access token from cache, refresh, or an interactive login.
    pub async fn authenticate(&mut self) -> Result<String, AuthError> {
        let outcome = self.login(false).await?;
        Ok(outcome.access_token().to_string())
    }

    /// Authorization header for scripted callers. Never prompts.
    pub async fn auth_headers(&self) -> Result<HeaderMap, AuthError> {
        let coordinator = self.coordinator()?;
        let store = coordinator.oauth().store().clone();
        let token = match store.get_valid_token(None) {
            Some(record) => record.access_token,
            None => {
                if store.get_token(None).is_none() {
                    return Err(AuthError::NotAuthenticated);
                }
                coordinator.refreshed_token(None).await?
            }
        };

        let value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|_| {
            AuthError::AuthExhausted("access token is not a valid header value".to_string())
        })?;
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, value);
        Ok(headers)
    }

    /// Remove cached tokens. Returns how many owners were removed.
    pub fn logout(&self, all: bool) -> Result<usize, AuthError> {
        let store = self.store()?;
        if all {
            let count = store.owners().len();
            store.remove_all()?;
            return Ok(count);
        }
        Ok(usize::from(store.remove_token(None)?))
    }

    /// Report token state without touching the network.
    pub fn status(&self) -> TokenStatus {
        let mut status = TokenStatus {
            owner: None,
            token_file: self.token_path.clone(),
            access: AccessState::Missing,
            expires_at: None,
            has_refresh_token: false,
            refresh_expires_at: None,
            scopes: Vec::new(),
        };
        let Ok(store) = self.store() else {
            return status;
        };
        status.owner = Some(store.default_owner().to_string());

        if let Some(record) = store.get_token(None) {
            status.access = if record.is_expired() {
                AccessState::Expired
            } else {
                AccessState::Valid
            };
            status.expires_at = Some(record.expires_at);
            status.has_refresh_token = record.refresh_token.is_some();
            status.refresh_expires_at = record.refresh_expires_at;
            status.scopes = record.scopes.into_iter().collect();
        }
        status
    }
}

fn prompt_credentials(current_id: Option<String>) -> Result<(String, String), AuthError> {
    use dialoguer::{Input, Password};

    println!("No application credentials configured.");
    println!("Create an app in the Open Platform developer console and enter its credentials.");

    let mut input = Input::<String>::new().with_prompt("App ID");
    if let Some(id) = current_id {
        input = input.with_initial_text(id);
    }
    let app_id = input
        .validate_with(|s: &String| validate_app_id(s).map(|_| ()).map_err(|e| e.to_string()))
        .interact_text()
        .map_err(|_| AuthError::Cancelled)?;

    let app_secret = Password::new()
        .with_prompt("App Secret")
        .validate_with(|s: &String| validate_app_secret(s).map(|_| ()).map_err(|e| e.to_string()))
        .interact()
        .map_err(|_| AuthError::Cancelled)?;

    Ok((app_id, app_secret))
}

fn present_authorize_url(url: &str) {
    println!();
    println!("To sign in, visit: {}", url);
    println!();
    if let Err(e) = open::that(url) {
        tracing::warn!("Could not open a browser: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tokens::{now_secs, TokenRecord};
    use serde_json::json;
    use std::sync::Mutex;
    use tokio_test::assert_ok;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const OWNER: &str = "cli_test";
    const TOKEN_PATH: &str = "/open-apis/authen/v2/oauth/token";

    fn flow(domain: &str, dir: &tempfile::TempDir) -> AuthFlow {
        let config = Config {
            app_id: Some(OWNER.to_string()),
            app_secret: Some("secret".to_string()),
            domain: domain.to_string(),
            host: "127.0.0.1".to_string(),
            port: 0,
            authorization_timeout_secs: 1,
            ..Config::default()
        };
        AuthFlow::new(config, dir.path().join("tokens.json"))
    }

    fn seed(flow: &AuthFlow, access: &str, expires_at: i64) {
        let mut record = TokenRecord::new(OWNER, access, expires_at);
        record.refresh_token = Some("r1".to_string());
        flow.store().unwrap().store_token(record).unwrap();
    }

    fn query_param(url: &str, name: &str) -> String {
        url::Url::parse(url)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
            .unwrap()
    }

    #[tokio::test]
    async fn test_cached_token_skips_browser() {
        let dir = tempfile::tempdir().unwrap();
        let flow = flow("http://127.0.0.1:9", &dir);
        seed(&flow, "cached", now_secs() + 3600);

        let outcome = flow
            .login_with(false, |_| panic!("browser should not be needed"))
            .await
            .unwrap();
        assert_eq!(outcome, LoginOutcome::AlreadyAuthenticated("cached".to_string()));
    }

    #[tokio::test]
    async fn test_expired_token_is_refreshed() {
        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 0,
                "access_token": "refreshed",
                "refresh_token": "r2",
                "expires_in": 7200,
            })))
            .expect(1)
            .mount(&mock)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let flow = flow(&mock.uri(), &dir);
        seed(&flow, "old", now_secs() - 10);

        let outcome = flow
            .login_with(false, |_| panic!("browser should not be needed"))
            .await
            .unwrap();
        assert_eq!(outcome, LoginOutcome::Refreshed("refreshed".to_string()));
    }

    #[tokio::test]
    async fn test_browser_login_end_to_end() {
        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 0,
                "access_token": "fresh",
                "refresh_token": "r1",
                "expires_in": 7200,
                "scope": "offline_access wiki:wiki:readonly",
            })))
            .expect(1)
            .mount(&mock)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let flow = flow(&mock.uri(), &dir);

        let outcome = flow
            .login_with(false, |url| {
                assert!(url.starts_with(&format!("{}/open-apis/authen/v1/authorize", mock.uri())));
                assert_eq!(query_param(url, "client_id"), OWNER);
                let callback = format!(
                    "{}?code=abc&state={}",
                    query_param(url, "redirect_uri"),
                    query_param(url, "state")
                );
                tokio::spawn(async move {
                    let resp = reqwest::get(&callback).await.unwrap();
                    assert_eq!(resp.status(), 200);
                });
            })
            .await
            .unwrap();

        assert_eq!(outcome, LoginOutcome::Authorized("fresh".to_string()));
        let stored = flow.store().unwrap().get_valid_token(None).unwrap();
        assert_eq!(stored.access_token, "fresh");
        assert!(stored.scopes.contains("wiki:wiki:readonly"));
    }

    #[tokio::test]
    async fn test_server_stopped_after_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let flow = flow("http://127.0.0.1:9", &dir);
        let seen = Arc::new(Mutex::new(None));

        let captured = seen.clone();
        let result = flow
            .login_with(true, move |url| {
                *captured.lock().unwrap() = Some(query_param(url, "redirect_uri"));
            })
            .await;
        assert!(matches!(result, Err(AuthError::AuthorizationTimeout(_))));

        let redirect = seen.lock().unwrap().clone().unwrap();
        let port = url::Url::parse(&redirect).unwrap().port().unwrap();
        assert_ok!(std::net::TcpListener::bind(("127.0.0.1", port)));
    }

    #[tokio::test]
    async fn test_auth_headers() {
        let dir = tempfile::tempdir().unwrap();
        let flow = flow("http://127.0.0.1:9", &dir);
        assert!(matches!(
            flow.auth_headers().await,
            Err(AuthError::NotAuthenticated)
        ));

        seed(&flow, "abc", now_secs() + 3600);
        let headers = flow.auth_headers().await.unwrap();
        assert_eq!(headers[AUTHORIZATION], "Bearer abc");
    }

    async fn mount_rotating_refresh(mock: &MockServer) {
        // The provider rotates refresh tokens: only the first refresh succeeds
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({
                        "code": 0,
                        "access_token": "rotated",
                        "refresh_token": "r2",
                        "expires_in": 7200,
                    }))
                    .set_delay(Duration::from_millis(100)),
            )
            .up_to_n_times(1)
            .expect(1)
            .with_priority(1)
            .mount(mock)
            .await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 20064,
                "error": "invalid_grant",
                "error_description": "refresh token already used",
            })))
            .expect(0)
            .mount(mock)
            .await;
    }

    #[tokio::test]
    async fn test_concurrent_auth_headers_refresh_once() {
        let mock = MockServer::start().await;
        mount_rotating_refresh(&mock).await;
        let dir = tempfile::tempdir().unwrap();
        let flow = flow(&mock.uri(), &dir);
        seed(&flow, "old", now_secs() - 10);

        let (a, b, c) = tokio::join!(flow.auth_headers(), flow.auth_headers(), flow.auth_headers());
        for headers in [a, b, c] {
            assert_eq!(headers.unwrap()[AUTHORIZATION], "Bearer rotated");
        }

        let stored = flow.store().unwrap().get_valid_token(None).unwrap();
        assert_eq!(stored.access_token, "rotated");
        assert_eq!(stored.refresh_token.as_deref(), Some("r2"));
    }

    #[tokio::test]
    async fn test_api_client_shares_refresh_with_auth_headers() {
        let mock = MockServer::start().await;
        mount_rotating_refresh(&mock).await;
        Mock::given(method("GET"))
            .and(path("/open-apis/authen/v1/user_info"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": 0, "data": {}})))
            .mount(&mock)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let flow = flow(&mock.uri(), &dir);
        seed(&flow, "old", now_secs() - 10);
        let client = flow.api_client().unwrap();

        let (headers, resp) = tokio::join!(
            flow.auth_headers(),
            client.get("/open-apis/authen/v1/user_info")
        );
        assert_eq!(headers.unwrap()[AUTHORIZATION], "Bearer rotated");
        assert_ok!(resp);
        assert!(flow.store().unwrap().get_token(None).is_some());
    }

    #[tokio::test]
    async fn test_authenticate_uses_cache_then_refresh() {
        let mock = MockServer::start().await;
        mount_rotating_refresh(&mock).await;
        let dir = tempfile::tempdir().unwrap();
        let mut flow = flow(&mock.uri(), &dir);

        seed(&flow, "cached", now_secs() + 3600);
        assert_eq!(flow.authenticate().await.unwrap(), "cached");

        seed(&flow, "old", now_secs() - 10);
        assert_eq!(flow.authenticate().await.unwrap(), "rotated");
    }

    #[tokio::test]
    async fn test_auth_headers_never_prompts_when_refresh_fails() {
        let dir = tempfile::tempdir().unwrap();
        // Nothing listens on port 9
        let flow = flow("http://127.0.0.1:9", &dir);
        seed(&flow, "old", now_secs() - 10);

        assert!(matches!(
            flow.auth_headers().await,
            Err(AuthError::AuthExhausted(_))
        ));
    }

    #[tokio::test]
    async fn test_ensure_credentials_non_interactive() {
        let dir = tempfile::tempdir().unwrap();
        let mut flow = AuthFlow::new(Config::default(), dir.path().join("tokens.json"));
        assert!(matches!(
            flow.ensure_credentials(false).await,
            Err(AuthError::Config(_))
        ));
    }

    #[test]
    fn test_logout_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let flow = flow("http://127.0.0.1:9", &dir);
        assert_eq!(flow.status().access, AccessState::Missing);

        seed(&flow, "abc", now_secs() + 3600);
        let status = flow.status();
        assert_eq!(status.access, AccessState::Valid);
        assert_eq!(status.owner.as_deref(), Some(OWNER));
        assert!(status.has_refresh_token);

        assert_eq!(flow.logout(false).unwrap(), 1);
        assert_eq!(flow.logout(false).unwrap(), 0);
        assert_eq!(flow.status().access, AccessState::Missing);
    }

    #[test]
    fn test_status_without_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let flow = AuthFlow::new(Config::default(), dir.path().join("tokens.json"));
        let status = flow.status();
        assert!(status.owner.is_none());
        assert_eq!(status.access, AccessState::Missing);
    }
}
