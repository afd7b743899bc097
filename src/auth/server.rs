//! Loopback HTTP listener for the authorization-code redirect
//!
//! `authorize()` hands out an authorization URL carrying a random `state`;
//! the provider later redirects the browser to `http://host:port<callback_path>`,
//! where the matching pending wait is resolved exactly once.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use oauth2::basic::BasicClient;
use oauth2::{AuthUrl, ClientId, CsrfToken, RedirectUrl, Scope};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::oauth::OAuthClient;
use super::AuthError;
use crate::config::Config;

/// How long `stop_server` waits for open connections before aborting.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type Outcome = Result<String, AuthError>;

/// Result of `authorize()`
#[derive(Debug, Clone, PartialEq)]
pub struct Authorization {
    pub needs_authorization: bool,
    pub access_token: Option<String>,
    pub authorize_url: Option<String>,
    pub state: Option<String>,
}

struct PendingAuthorization {
    tx: oneshot::Sender<Outcome>,
    /// Client whose credentials redeem the code
    oauth: Arc<OAuthClient>,
    /// Present until a waiter picks it up
    rx: Option<oneshot::Receiver<Outcome>>,
    deadline: Instant,
}

#[derive(Default)]
struct PendingSet {
    waiting: HashMap<String, PendingAuthorization>,
    /// Claimed by a callback before anyone started waiting
    early: HashMap<String, (oneshot::Receiver<Outcome>, Instant)>,
}

impl PendingSet {
    fn sweep(&mut self, now: Instant) {
        self.waiting.retain(|_, pending| {
            let live = pending.deadline > now;
            if !live {
                tracing::debug!("Pending authorization expired");
            }
            live
        });
        self.early.retain(|_, (_, deadline)| *deadline > now);
    }

    fn register(&mut self, state: String, deadline: Instant, oauth: Arc<OAuthClient>) {
        let (tx, rx) = oneshot::channel();
        self.waiting.insert(
            state,
            PendingAuthorization {
                tx,
                oauth,
                rx: Some(rx),
                deadline,
            },
        );
    }

    /// Remove `state` on behalf of a callback, handing back its sender and client.
    fn claim(
        &mut self,
        state: &str,
        now: Instant,
    ) -> Option<(oneshot::Sender<Outcome>, Arc<OAuthClient>)> {
        self.sweep(now);
        let pending = self.waiting.remove(state)?;
        if let Some(rx) = pending.rx {
            self.early.insert(state.to_string(), (rx, pending.deadline));
        }
        Some((pending.tx, pending.oauth))
    }
}

struct CallbackState {
    redirect_uri: String,
    pending: Arc<Mutex<PendingSet>>,
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

struct RunningServer {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Short-lived local HTTP listener receiving the authorization redirect.
pub struct LoopbackAuthServer {
    oauth: Arc<OAuthClient>,
    host: String,
    port: u16,
    callback_path: String,
    authorize_endpoint: String,
    scopes: Vec<String>,
    default_timeout: Duration,
    pending: Arc<Mutex<PendingSet>>,
    running: Mutex<Option<RunningServer>>,
    /// Serializes `start_server` so concurrent starts share one listener
    starting: tokio::sync::Mutex<()>,
}

impl LoopbackAuthServer {
    pub fn new(config: &Config, oauth: Arc<OAuthClient>) -> Self {
        Self {
            oauth,
            host: config.host.clone(),
            port: config.port,
            callback_path: config.callback_path.clone(),
            authorize_endpoint: config.authorize_endpoint(),
            scopes: config.scopes.clone(),
            default_timeout: Duration::from_secs(config.authorization_timeout_secs),
            pending: Arc::new(Mutex::new(PendingSet::default())),
            running: Mutex::new(None),
            starting: tokio::sync::Mutex::new(()),
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, PendingSet> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<RunningServer>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bound address while listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock_running().as_ref().map(|r| r.addr)
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.local_addr().is_some()
    }

    /// Redirect URI registered with the provider.
    pub fn redirect_uri(&self) -> String {
        let port = self.local_addr().map_or(self.port, |addr| addr.port());
        format!("http://{}:{}{}", self.host, port, self.callback_path)
    }

    /// Start listening. Calling it again while running is a no-op.
    pub async fn start_server(&self) -> Result<SocketAddr, AuthError> {
        let _starting = self.starting.lock().await;
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }

        let listener = TcpListener::bind((self.host.as_str(), self.port))
            .await
            .map_err(|e| {
                AuthError::Config(format!(
                    "could not listen on {}:{}: {}",
                    self.host, self.port, e
                ))
            })?;
        let addr = listener
            .local_addr()
            .map_err(|e| AuthError::Config(format!("callback listener has no address: {}", e)))?;

        let state = Arc::new(CallbackState {
            redirect_uri: format!("http://{}:{}{}", self.host, addr.port(), self.callback_path),
            pending: self.pending.clone(),
        });
        let app = Router::new()
            .route("/health", get(health))
            .route(&self.callback_path, get(handle_callback))
            .fallback(not_found)
            .with_state(state);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        });
        let task = tokio::spawn(async move {
            if let Err(e) = server.await {
                tracing::warn!("Callback server error: {}", e);
            }
        });

        *self.lock_running() = Some(RunningServer {
            addr,
            shutdown: shutdown_tx,
            task,
        });
        tracing::info!("Callback server listening on http://{}", addr);
        Ok(addr)
    }

    /// Stop listening and release the port. Safe to call at any time.
    pub async fn stop_server(&self) {
        let running = self.lock_running().take();
        let Some(running) = running else {
            return;
        };

        let _ = running.shutdown.send(());
        let mut task = running.task;
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
            tracing::warn!("Callback server did not drain in time, aborting");
            task.abort();
        }

        let outstanding = self.lock_pending().waiting.len();
        tracing::info!(outstanding, "Callback server stopped");
    }

    /// Return the cached token if one is valid, otherwise start an authorization.
    pub fn authorize(&self) -> Result<Authorization, AuthError> {
        let owner = self.oauth.owner_id();
        if let Some(record) = self.oauth.store().get_valid_token(Some(owner)) {
            tracing::debug!("Cached token still valid, no authorization needed");
            return Ok(Authorization {
                needs_authorization: false,
                access_token: Some(record.access_token),
                authorize_url: None,
                state: None,
            });
        }
        self.begin_authorization()
    }

    /// Build an authorization URL with a fresh state and register the pending wait.
    /// Does not block.
    pub fn begin_authorization(&self) -> Result<Authorization, AuthError> {
        self.begin_authorization_for(self.oauth.clone())
    }

    /// Like `begin_authorization`, for another application. Its callback is
    /// redeemed with `oauth` and stored under that application's owner id.
    pub fn begin_authorization_for(
        &self,
        oauth: Arc<OAuthClient>,
    ) -> Result<Authorization, AuthError> {
        let auth_url = AuthUrl::new(self.authorize_endpoint.clone())
            .map_err(|e| AuthError::Config(format!("invalid authorize endpoint: {}", e)))?;
        let redirect_url = RedirectUrl::new(self.redirect_uri())
            .map_err(|e| AuthError::Config(format!("invalid redirect URI: {}", e)))?;

        let client = BasicClient::new(
            ClientId::new(oauth.owner_id().to_string()),
            None,
            auth_url,
            None,
        )
        .set_redirect_uri(redirect_url);

        let (url, csrf) = client
            .authorize_url(CsrfToken::new_random)
            .add_scopes(self.scopes.iter().cloned().map(Scope::new))
            .url();
        let state = csrf.secret().clone();

        let now = Instant::now();
        let mut pending = self.lock_pending();
        pending.sweep(now);
        pending.register(state.clone(), now + self.default_timeout, oauth);
        drop(pending);

        tracing::info!("Authorization required, waiting for browser consent");
        Ok(Authorization {
            needs_authorization: true,
            access_token: None,
            authorize_url: Some(url.to_string()),
            state: Some(state),
        })
    }

    /// Suspend until the callback for `state` arrives or `timeout` elapses.
    ///
    /// Registers the state if `authorize()` did not. On timeout the pending entry
    /// is removed, so a late callback is answered with 400.
    pub async fn wait_for_authorization(&self, state: &str, timeout: Duration) -> Outcome {
        let mut rx = {
            let now = Instant::now();
            let mut pending = self.lock_pending();
            pending.sweep(now);
            if let Some((rx, _)) = pending.early.remove(state) {
                rx
            } else if let Some(entry) = pending.waiting.get_mut(state) {
                entry.deadline = now + timeout;
                entry.rx.take().ok_or_else(|| {
                    AuthError::InvalidCallback("authorization is already being awaited".to_string())
                })?
            } else {
                let (tx, rx) = oneshot::channel();
                pending.waiting.insert(
                    state.to_string(),
                    PendingAuthorization {
                        tx,
                        oauth: self.oauth.clone(),
                        rx: None,
                        deadline: now + timeout,
                    },
                );
                rx
            }
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped by a deadline sweep
            Ok(Err(_)) => Err(AuthError::AuthorizationTimeout(timeout)),
            Err(_) => {
                let removed = self.lock_pending().waiting.remove(state).is_some();
                if removed {
                    tracing::warn!("Timed out waiting for authorization callback");
                    Err(AuthError::AuthorizationTimeout(timeout))
                } else {
                    // A callback claimed the state at the deadline and is finishing the exchange
                    rx.await
                        .unwrap_or(Err(AuthError::AuthorizationTimeout(timeout)))
                }
            }
        }
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "Not found").into_response()
}

async fn handle_callback(
    State(shared): State<Arc<CallbackState>>,
    Query(params): Query<CallbackParams>,
) -> Response {
    let Some(state) = params.state.as_deref().filter(|s| !s.is_empty()) else {
        tracing::warn!("Callback without state parameter");
        return error_page(StatusCode::BAD_REQUEST, "Missing state parameter.");
    };

    let claimed = shared
        .pending
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .claim(state, Instant::now());
    let Some((tx, oauth)) = claimed else {
        tracing::warn!("Callback for unknown or expired state");
        return error_page(
            StatusCode::BAD_REQUEST,
            "This authorization request is unknown or has expired. Start the login again.",
        );
    };

    if let Some(error) = params.error {
        let reason = params.error_description.unwrap_or(error);
        tracing::warn!("Authorization denied: {}", reason);
        let page = error_page(StatusCode::BAD_REQUEST, &format!("Authorization failed: {}", reason));
        let _ = tx.send(Err(AuthError::AuthorizationDenied(reason)));
        return page;
    }

    let Some(code) = params.code.filter(|c| !c.is_empty()) else {
        tracing::warn!("Callback without authorization code");
        let _ = tx.send(Err(AuthError::InvalidCallback(
            "missing authorization code".to_string(),
        )));
        return error_page(StatusCode::BAD_REQUEST, "Missing authorization code.");
    };

    let exchanged = match oauth
        .exchange_code_for_token(&code, &shared.redirect_uri)
        .await
    {
        Ok(record) => oauth
            .store()
            .store_token(record.clone())
            .map(|_| record),
        Err(e) => Err(e),
    };

    match exchanged {
        Ok(record) => {
            tracing::info!("Authorization complete, token stored");
            let _ = tx.send(Ok(record.access_token));
            success_page()
        }
        Err(e) => {
            tracing::error!("Authorization code exchange failed: {}", e);
            let page = error_page(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("Could not complete sign-in: {}", e),
            );
            let _ = tx.send(Err(e));
            page
        }
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn page(title: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="utf-8"><title>{title}</title>
<style>body{{font-family:sans-serif;display:flex;align-items:center;justify-content:center;min-height:100vh;margin:0}}main{{max-width:420px;text-align:center}}</style>
</head>
<body><main><h1>{title}</h1><p>{body}</p></main></body>
</html>"#
    )
}

fn success_page() -> Response {
    Html(page(
        "Authorization complete",
        "You can close this window and return to the terminal.",
    ))
    .into_response()
}

fn error_page(status: StatusCode, message: &str) -> Response {
    (status, Html(page("Authorization failed", &escape_html(message)))).into_response()
}
