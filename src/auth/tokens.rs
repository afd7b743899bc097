//! Token storage and management
//!
//! Tokens are cached per owner (the application id) in a single JSON document.
//! The file is read lazily on first access and rewritten atomically on every change.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::AuthError;
use crate::config::write_private;

/// Seconds subtracted from every token lifetime.
pub const DEFAULT_TOKEN_BUFFER_SECS: i64 = 300;

pub(crate) fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Absolute expiry for a token issued at `issued_at` with lifetime `ttl`.
pub fn buffered_expiry(issued_at: i64, ttl: i64, buffer_secs: i64) -> i64 {
    issued_at.saturating_add(ttl).saturating_sub(buffer_secs)
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Cached user access token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Epoch seconds, already reduced by the safety buffer
    pub expires_at: i64,
    /// Epoch seconds after which the refresh token is useless
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_expires_at: Option<i64>,
    #[serde(default)]
    pub scopes: BTreeSet<String>,
    /// Application id the token was issued to
    pub owner_id: String,
    /// Client credential used to authenticate refresh calls
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret_ref: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

impl TokenRecord {
    pub fn new(owner_id: impl Into<String>, access_token: impl Into<String>, expires_at: i64) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expires_at,
            refresh_expires_at: None,
            scopes: BTreeSet::new(),
            owner_id: owner_id.into(),
            client_secret_ref: None,
            token_type: default_token_type(),
        }
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_secs())
    }

    /// Whether a refresh can still be attempted at `now`.
    pub fn can_refresh_at(&self, now: i64) -> bool {
        self.refresh_token.as_deref().is_some_and(|rt| !rt.is_empty())
            && self.refresh_expires_at.map_or(true, |exp| now < exp)
    }

    /// Neither the access token nor the refresh token is usable.
    fn is_dead_at(&self, now: i64) -> bool {
        self.is_expired_at(now) && !self.can_refresh_at(now)
    }
}

/// On-disk layout: one map of owner id to record.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedStore {
    #[serde(default)]
    tokens: BTreeMap<String, TokenRecord>,
}

/// Accepted on load. A bare record is the older single-owner layout.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoreDocument {
    Single(TokenRecord),
    Map(PersistedStore),
}

type Records = BTreeMap<String, TokenRecord>;

/// File-backed token cache shared by every component in the process.
pub struct TokenStore {
    path: PathBuf,
    default_owner: String,
    cache: Mutex<Option<Records>>,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>, default_owner: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            default_owner: default_owner.into(),
            cache: Mutex::new(None),
        }
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn default_owner(&self) -> &str {
        &self.default_owner
    }

    fn owner<'a>(&'a self, owner: Option<&'a str>) -> &'a str {
        owner.unwrap_or(&self.default_owner)
    }

    /// Run `f` against the cache, loading the file on first use.
    fn with_records<R>(&self, f: impl FnOnce(&mut Records) -> R) -> R {
        let mut guard = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let records = guard.get_or_insert_with(|| {
            let mut records = read_records(&self.path);
            if sweep(&mut records, now_secs()) {
                self.persist_best_effort(&records);
            }
            records
        });
        f(records)
    }

    fn persist(&self, records: &Records) -> Result<(), AuthError> {
        let doc = PersistedStore {
            tokens: records.clone(),
        };
        let json = serde_json::to_vec_pretty(&doc)
            .map_err(|e| AuthError::Storage(format!("Failed to serialize tokens: {}", e)))?;
        write_private(&self.path, &json).map_err(|e| {
            AuthError::Storage(format!(
                "Failed to write token file '{}': {}",
                self.path.display(),
                e
            ))
        })
    }

    fn persist_best_effort(&self, records: &Records) {
        if let Err(e) = self.persist(records) {
            tracing::warn!("Could not persist token sweep: {}", e);
        }
    }

    /// The record for `owner`, expired or not.
    pub fn get_token(&self, owner: Option<&str>) -> Option<TokenRecord> {
        let owner = self.owner(owner);
        self.with_records(|records| records.get(owner).cloned())
    }

    /// The record for `owner` only while `now < expires_at`.
    pub fn get_valid_token(&self, owner: Option<&str>) -> Option<TokenRecord> {
        let owner = self.owner(owner);
        let now = now_secs();
        self.with_records(|records| {
            let record = records.get(owner)?;
            if !record.is_expired_at(now) {
                return Some(record.clone());
            }
            tracing::debug!(owner, "Cached access token is stale");
            if sweep(records, now) {
                self.persist_best_effort(records);
            }
            None
        })
    }

    /// Insert or replace the record for `record.owner_id` and persist.
    ///
    /// The in-memory cache only changes once the file write succeeded.
    pub fn store_token(&self, record: TokenRecord) -> Result<(), AuthError> {
        self.with_records(|records| {
            let mut next = records.clone();
            next.insert(record.owner_id.clone(), record);
            self.persist(&next)?;
            *records = next;
            Ok(())
        })
    }

    /// Remove the record for `owner`. Returns whether one existed.
    pub fn remove_token(&self, owner: Option<&str>) -> Result<bool, AuthError> {
        let owner = self.owner(owner);
        self.with_records(|records| {
            if !records.contains_key(owner) {
                return Ok(false);
            }
            let mut next = records.clone();
            next.remove(owner);
            self.persist(&next)?;
            *records = next;
            Ok(true)
        })
    }

    pub fn remove_all(&self) -> Result<(), AuthError> {
        self.with_records(|records| {
            let next = Records::new();
            self.persist(&next)?;
            *records = next;
            Ok(())
        })
    }

    pub fn owners(&self) -> Vec<String> {
        self.with_records(|records| records.keys().cloned().collect())
    }
}

/// Drop records that can neither be used nor refreshed. Returns whether any were dropped.
fn sweep(records: &mut Records, now: i64) -> bool {
    let before = records.len();
    records.retain(|owner, record| {
        let keep = !record.is_dead_at(now);
        if !keep {
            tracing::info!(owner = %owner, "Dropping expired credentials");
        }
        keep
    });
    records.len() != before
}

/// Read the token file, degrading to an empty cache on any problem.
fn read_records(path: &Path) -> Records {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::debug!("No token file at {}", path.display());
            return Records::new();
        }
        Err(e) => {
            tracing::warn!(
                "Could not read token file '{}', starting empty: {}",
                path.display(),
                e
            );
            return Records::new();
        }
    };

    if content.trim().is_empty() {
        return Records::new();
    }

    match serde_json::from_str::<StoreDocument>(&content) {
        Ok(StoreDocument::Map(store)) => store.tokens,
        Ok(StoreDocument::Single(record)) => {
            let mut records = Records::new();
            records.insert(record.owner_id.clone(), record);
            records
        }
        Err(e) => {
            tracing::warn!(
                "Token file '{}' is corrupt, starting empty: {}",
                path.display(),
                e
            );
            Records::new()
        }
    }
}
