//! User authentication for the Lark / Feishu Open Platform
//!
//! Implements the OAuth2 authorization-code flow through a loopback redirect,
//! with a persisted token cache and refresh-token renewal.

mod error;
pub mod flow;
pub mod oauth;
pub mod server;
pub mod tokens;

pub use error::AuthError;
pub use flow::{AccessState, AuthFlow, LoginOutcome};
pub use tokens::TokenStore;
