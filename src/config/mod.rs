//! Configuration and credential-file handling

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::auth::tokens::DEFAULT_TOKEN_BUFFER_SECS;
use crate::auth::AuthError;

const DEFAULT_DOMAIN: &str = "https://open.feishu.cn";
const AUTHORIZE_PATH: &str = "/open-apis/authen/v1/authorize";
const TOKEN_PATH: &str = "/open-apis/authen/v2/oauth/token";

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Open Platform application id (`cli_...`)
    pub app_id: Option<String>,
    /// Open Platform application secret
    pub app_secret: Option<String>,
    /// Open Platform base URL (feishu.cn or larksuite.com)
    pub domain: String,
    /// Loopback host the callback listener binds to
    pub host: String,
    /// Loopback port; 0 picks an ephemeral port
    pub port: u16,
    /// Path the provider redirects back to
    pub callback_path: String,
    /// Scopes requested during authorization
    pub scopes: Vec<String>,
    /// Seconds subtracted from every token lifetime
    pub token_buffer_secs: i64,
    /// How long `login` waits for the browser callback
    pub authorization_timeout_secs: u64,
    /// Timeout applied to every outbound HTTP request
    pub http_timeout_secs: u64,
    /// Provider codes meaning "access token expired" on API responses
    pub expired_codes: Vec<i64>,
    /// Provider codes meaning the refresh token is no longer usable
    pub invalid_grant_codes: Vec<i64>,
    /// Override for the token cache location
    pub token_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_id: None,
            app_secret: None,
            domain: DEFAULT_DOMAIN.to_string(),
            host: "localhost".to_string(),
            port: 3000,
            callback_path: "/callback".to_string(),
            scopes: vec![
                "offline_access".to_string(),
                "wiki:wiki:readonly".to_string(),
                "docx:document:readonly".to_string(),
                "sheets:spreadsheet:readonly".to_string(),
            ],
            token_buffer_secs: DEFAULT_TOKEN_BUFFER_SECS,
            authorization_timeout_secs: 300,
            http_timeout_secs: 30,
            expired_codes: vec![99991661, 99991668, 99991677],
            invalid_grant_codes: vec![20037, 20050, 20064, 20073],
            token_file: None,
        }
    }
}

/// Validated application credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppCredentials {
    pub app_id: String,
    pub app_secret: String,
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "larkauth", "larkauth")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get config file path
    fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from disk, then apply environment overrides
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        let mut config = if path.exists() {
            let content = fs::read_to_string(&path).context("Failed to read config file")?;
            Self::from_toml_str(&content)?
        } else {
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    /// Apply `LARK_APP_ID`, `LARK_APP_SECRET` and `LARK_DOMAIN` overrides
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(id) = non_empty("LARK_APP_ID") {
            self.app_id = Some(id);
        }
        if let Some(secret) = non_empty("LARK_APP_SECRET") {
            self.app_secret = Some(secret);
        }
        if let Some(domain) = non_empty("LARK_DOMAIN") {
            self.domain = domain;
        }
    }

    pub fn validate(&self) -> Result<(), AuthError> {
        if !self.callback_path.starts_with('/') {
            return Err(AuthError::Config(format!(
                "callback_path must start with '/': {}",
                self.callback_path
            )));
        }
        if self.callback_path == "/health" {
            return Err(AuthError::Config(
                "callback_path cannot be /health".to_string(),
            ));
        }
        if self.token_buffer_secs < 0 {
            return Err(AuthError::Config(
                "token_buffer_secs must not be negative".to_string(),
            ));
        }
        if !self.domain.starts_with("http://") && !self.domain.starts_with("https://") {
            return Err(AuthError::Config(format!(
                "domain must be an http(s) URL: {}",
                self.domain
            )));
        }
        Ok(())
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        write_private(&path, content.as_bytes()).context("Failed to write config file")
    }

    /// Where the token cache lives
    pub fn token_path(&self) -> Result<PathBuf> {
        match &self.token_file {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::config_dir()?.join("tokens.json")),
        }
    }

    /// Both credentials, validated
    pub fn credentials(&self) -> Result<AppCredentials, AuthError> {
        match (&self.app_id, &self.app_secret) {
            (Some(id), Some(secret)) => Ok(AppCredentials {
                app_id: validate_app_id(id)?,
                app_secret: validate_app_secret(secret)?,
            }),
            _ => Err(AuthError::Config(
                "app_id and app_secret are not configured".to_string(),
            )),
        }
    }

    fn base(&self) -> &str {
        self.domain.trim_end_matches('/')
    }

    pub fn authorize_endpoint(&self) -> String {
        format!("{}{}", self.base(), AUTHORIZE_PATH)
    }

    pub fn token_endpoint(&self) -> String {
        format!("{}{}", self.base(), TOKEN_PATH)
    }

    /// Base URL for wrapped API calls
    pub fn api_base(&self) -> String {
        self.base().to_string()
    }
}

pub fn validate_app_id(input: &str) -> Result<String, AuthError> {
    let id = input.trim();
    if id.is_empty() {
        return Err(AuthError::Config("app_id is empty".to_string()));
    }
    if !id.starts_with("cli_") || id.chars().any(char::is_whitespace) {
        return Err(AuthError::Config(format!(
            "app_id should look like cli_xxxxxxxx, got {:?}",
            id
        )));
    }
    Ok(id.to_string())
}

pub fn validate_app_secret(input: &str) -> Result<String, AuthError> {
    let secret = input.trim();
    if secret.is_empty() {
        return Err(AuthError::Config("app_secret is empty".to_string()));
    }
    if secret.chars().any(char::is_whitespace) {
        return Err(AuthError::Config(
            "app_secret must not contain whitespace".to_string(),
        ));
    }
    Ok(secret.to_string())
}

/// `<path>.tmp`
pub(crate) fn temp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

/// Write `contents` to `path` atomically with owner-only permissions.
///
/// The bytes go to `<path>.tmp` first (created 0600, fsynced) and are then renamed
/// over `path`, so readers only ever see the old or the new document.
pub(crate) fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        if !dir.exists() {
            fs::create_dir_all(dir)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
            }
        }
    }

    let tmp = temp_path(path);
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let written = options.open(&tmp).and_then(|mut file| {
        file.write_all(contents)?;
        file.sync_all()
    });
    if let Err(e) = written.and_then(|_| fs::rename(&tmp, path)) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }

    // A pre-existing target keeps its old mode across rename on some platforms
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}
