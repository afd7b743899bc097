//! Authenticated access to Open Platform APIs

pub mod client;
pub mod refresh;

use serde::Deserialize;
use serde_json::Value;

pub use client::ApiClient;
pub use refresh::RefreshCoordinator;

use crate::auth::AuthError;

const USER_INFO_PATH: &str = "/open-apis/authen/v1/user_info";

/// Profile of the signed-in user
#[derive(Debug, Clone, Deserialize)]
pub struct UserInfo {
    pub name: Option<String>,
    pub email: Option<String>,
    pub open_id: Option<String>,
    pub tenant_key: Option<String>,
}

/// Fetch the profile behind the current access token.
pub async fn whoami(client: &ApiClient) -> Result<UserInfo, AuthError> {
    let resp = client.get(USER_INFO_PATH).await?;
    let data = resp.get("data").cloned().unwrap_or(Value::Null);
    serde_json::from_value(data).map_err(|e| AuthError::Provider {
        code: -1,
        message: format!("unexpected user_info response: {}", e),
    })
}
