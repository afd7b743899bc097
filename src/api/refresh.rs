//! Single-flight token refresh
//!
//! When several requests discover an expired token at once, the first one
//! performs the refresh and everyone else queues behind it. Queued callers are
//! released in FIFO order with the same outcome once the refresh settles.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;

use crate::auth::oauth::OAuthClient;
use crate::auth::AuthError;

/// Outcome shared with every waiter: the new access token or the failure reason.
type Shared = Result<String, String>;

#[derive(Default)]
struct RefreshState {
    in_flight: bool,
    waiters: VecDeque<oneshot::Sender<Shared>>,
}

pub struct RefreshCoordinator {
    oauth: Arc<OAuthClient>,
    owner: String,
    state: Mutex<RefreshState>,
    refreshes: AtomicU64,
}

impl RefreshCoordinator {
    pub fn new(oauth: Arc<OAuthClient>) -> Self {
        let owner = oauth.owner_id().to_string();
        Self {
            oauth,
            owner,
            state: Mutex::new(RefreshState::default()),
            refreshes: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn oauth(&self) -> &Arc<OAuthClient> {
        &self.oauth
    }

    /// Number of refresh calls this coordinator has issued.
    #[cfg(test)]
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    /// Get a usable access token after `stale` was rejected.
    ///
    /// If another caller already replaced `stale` with a valid token, that token is
    /// returned without a refresh. Otherwise at most one refresh runs at a time and
    /// concurrent callers share its result.
    pub async fn refreshed_token(&self, stale: Option<&str>) -> Result<String, AuthError> {
        let queued = {
            let mut state = self.lock();
            if state.in_flight {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Some(rx)
            } else {
                let current = self.oauth.store().get_valid_token(Some(&self.owner));
                if let Some(current) = current.filter(|t| Some(t.access_token.as_str()) != stale) {
                    return Ok(current.access_token);
                }
                state.in_flight = true;
                None
            }
        };

        if let Some(rx) = queued {
            tracing::debug!("Waiting for in-flight token refresh");
            return match rx.await {
                Ok(Ok(token)) => Ok(token),
                Ok(Err(reason)) => Err(AuthError::AuthExhausted(reason)),
                Err(_) => Err(AuthError::AuthExhausted(
                    "token refresh was abandoned".to_string(),
                )),
            };
        }

        let flight = InFlight {
            coordinator: self,
            settled: false,
        };
        let attempt = self.refreshes.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(attempt, "Starting token refresh");
        let outcome: Shared = match self.oauth.refresh_owner(Some(&self.owner)).await {
            Ok(record) => Ok(record.access_token),
            Err(AuthError::AuthExhausted(reason)) => Err(reason),
            Err(other) => Err(other.to_string()),
        };
        flight.settle(&outcome);

        outcome.map_err(AuthError::AuthExhausted)
    }

    /// Clear the in-flight flag and release every waiter with `outcome`.
    fn release(&self, outcome: &Shared) {
        let waiters = {
            let mut state = self.lock();
            state.in_flight = false;
            std::mem::take(&mut state.waiters)
        };
        if !waiters.is_empty() {
            tracing::debug!(waiters = waiters.len(), "Releasing refresh waiters");
        }
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }
}

/// Releases waiters even if the refreshing future is dropped mid-flight.
struct InFlight<'a> {
    coordinator: &'a RefreshCoordinator,
    settled: bool,
}

impl InFlight<'_> {
    fn settle(mut self, outcome: &Shared) {
        self.settled = true;
        self.coordinator.release(outcome);
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.coordinator
                .release(&Err("token refresh was cancelled".to_string()));
        }
    }
}
