//! Error taxonomy for authorization, token storage and the API transport

use std::time::Duration;

use serde::Serialize;
use serde_json::json;

/// Provider codes returned when the app_id / app_secret pair is rejected.
const INVALID_CLIENT_CODES: &[i64] = &[20001, 20002, 20024];

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Connection, DNS or timeout failure talking to a remote endpoint.
    #[error("network error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Non-success HTTP status without a recognizable provider envelope.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Well-formed provider response carrying a non-zero `code`.
    #[error("provider error {code}: {message}")]
    Provider { code: i64, message: String },

    /// The access token was rejected. Never escapes `ApiClient::request`.
    #[error("access token expired")]
    AuthExpired,

    /// A refresh was attempted and failed; the user must log in again.
    #[error("re-authentication required: {0}")]
    AuthExhausted(String),

    #[error("not logged in")]
    NotAuthenticated,

    #[error("authorization was not completed within {}s", .0.as_secs_f64())]
    AuthorizationTimeout(Duration),

    #[error("authorization denied: {0}")]
    AuthorizationDenied(String),

    #[error("invalid callback: {0}")]
    InvalidCallback(String),

    #[error("token storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("authorization cancelled")]
    Cancelled,
}

/// Uniform error shape handed to calling layers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl AuthError {
    /// Short machine-readable category.
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::Transport(_) => "transport_error",
            AuthError::Http { .. } => "http_error",
            AuthError::Provider { .. } => "provider_error",
            AuthError::AuthExpired => "auth_expired",
            AuthError::AuthExhausted(_) => "reauthentication_required",
            AuthError::NotAuthenticated => "not_authenticated",
            AuthError::AuthorizationTimeout(_) => "authorization_timeout",
            AuthError::AuthorizationDenied(_) => "authorization_denied",
            AuthError::InvalidCallback(_) => "invalid_callback",
            AuthError::Storage(_) => "storage_error",
            AuthError::Config(_) => "config_error",
            AuthError::Cancelled => "cancelled",
        }
    }

    /// Normalize into `{code, message, details}`.
    pub fn shape(&self) -> ErrorShape {
        let details = match self {
            AuthError::Transport(e) => Some(json!({
                "timeout": e.is_timeout(),
                "connect": e.is_connect(),
                "url": e.url().map(|u| u.to_string()),
            })),
            AuthError::Http { status, body } => Some(json!({ "status": status, "body": body })),
            AuthError::Provider { code, .. } => Some(json!({ "provider_code": code })),
            AuthError::AuthorizationTimeout(d) => Some(json!({ "timeout_ms": d.as_millis() as u64 })),
            _ => None,
        };

        ErrorShape {
            code: self.code().to_string(),
            message: self.to_string(),
            details,
        }
    }

    /// Whether the provider rejected the client credentials themselves.
    pub fn is_invalid_client(&self) -> bool {
        match self {
            AuthError::Provider { code, message } => {
                INVALID_CLIENT_CODES.contains(code) || message.contains("invalid_client")
            }
            AuthError::Http { status, body } => *status == 401 && body.contains("invalid_client"),
            _ => false,
        }
    }

    /// Whether a refresh failure means the refresh token itself is dead.
    pub fn is_invalid_grant(&self, codes: &[i64]) -> bool {
        match self {
            AuthError::Provider { code, message } => {
                codes.contains(code) || message.contains("invalid_grant")
            }
            AuthError::Http { status, body } => *status == 400 && body.contains("invalid_grant"),
            _ => false,
        }
    }

    /// Remediation hint for interactive commands.
    pub fn hint(&self) -> Option<&'static str> {
        if self.is_invalid_client() {
            return Some(
                "The app_id/app_secret pair was rejected. Check the credentials in your config \
                 file or the LARK_APP_ID / LARK_APP_SECRET environment variables.",
            );
        }
        match self {
            AuthError::Transport(_) | AuthError::Http { status: 500..=599, .. } => Some(
                "Could not reach the Open Platform. Check your network connection, proxy and \
                 firewall settings, then retry.",
            ),
            AuthError::AuthExpired | AuthError::AuthExhausted(_) | AuthError::NotAuthenticated => {
                Some("Your session has expired or was revoked. Run `larkauth login` to sign in again.")
            }
            AuthError::AuthorizationTimeout(_) => Some(
                "The browser sign-in was not completed in time. Run `larkauth login` again and \
                 finish the consent page before the timeout.",
            ),
            AuthError::AuthorizationDenied(_) => {
                Some("Authorization was denied in the browser. Approve the requested scopes to continue.")
            }
            AuthError::Storage(_) => Some(
                "Could not read or write the token cache. Check permissions on the config directory.",
            ),
            AuthError::Config(_) => Some("Fix the configuration file and retry."),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_provider_error() {
        let err = AuthError::Provider {
            code: 20037,
            message: "refresh token expired".to_string(),
        };
        let shape = err.shape();
        assert_eq!(shape.code, "provider_error");
        assert_eq!(shape.message, "provider error 20037: refresh token expired");
        assert_eq!(shape.details, Some(json!({ "provider_code": 20037 })));
    }

    #[test]
    fn test_shape_http_error() {
        let err = AuthError::Http {
            status: 502,
            body: "bad gateway".to_string(),
        };
        let shape = err.shape();
        assert_eq!(shape.code, "http_error");
        assert_eq!(shape.details, Some(json!({ "status": 502, "body": "bad gateway" })));
    }

    #[test]
    fn test_invalid_grant_classification() {
        let codes = [20037, 20064];
        let expired = AuthError::Provider {
            code: 20037,
            message: "expired".to_string(),
        };
        assert!(expired.is_invalid_grant(&codes));

        let by_name = AuthError::Provider {
            code: 1,
            message: "invalid_grant: revoked".to_string(),
        };
        assert!(by_name.is_invalid_grant(&codes));

        let unrelated = AuthError::Provider {
            code: 99,
            message: "rate limited".to_string(),
        };
        assert!(!unrelated.is_invalid_grant(&codes));
        assert!(!AuthError::NotAuthenticated.is_invalid_grant(&codes));
    }

    #[test]
    fn test_hints_by_category() {
        let timeout = AuthError::AuthorizationTimeout(Duration::from_secs(300));
        assert!(timeout.hint().unwrap().contains("not completed in time"));

        let exhausted = AuthError::AuthExhausted("refresh token revoked".to_string());
        assert!(exhausted.hint().unwrap().contains("larkauth login"));

        let client = AuthError::Provider {
            code: 20002,
            message: "app secret invalid".to_string(),
        };
        assert!(client.hint().unwrap().contains("app_id/app_secret"));

        let server = AuthError::Http {
            status: 503,
            body: String::new(),
        };
        assert!(server.hint().unwrap().contains("network"));

        assert!(AuthError::Cancelled.hint().is_none());
    }

    #[test]
    fn test_timeout_display() {
        let err = AuthError::AuthorizationTimeout(Duration::from_millis(50));
        assert_eq!(err.to_string(), "authorization was not completed within 0.05s");
    }
}
