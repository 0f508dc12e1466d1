pub mod auth;
pub mod handlers;
pub mod issuer;
pub mod resolver;
pub mod server;

use std::sync::Arc;

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub authorizer: auth::Authorizer,
    pub issuer: Arc<dyn issuer::TokenIssuer>,
    /// Certificate key appended to control-plane joins. `None` disables
    /// control-plane decoration.
    pub cert_key: Option<String>,
}

pub use server::{normalize_listen_addr, parse_env_bool, router, run, ServerConfig};
