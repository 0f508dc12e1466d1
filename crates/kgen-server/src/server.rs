use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    auth::{AuthPolicy, Authorizer},
    handlers::{health, join},
    issuer::KubeadmIssuer,
    resolver::DnsResolver,
    AppState,
};

pub struct ServerConfig {
    /// `[host]:port`; an empty host means every interface.
    pub listen_addr: String,
    /// Take the client address from `header` instead of the TCP peer.
    pub use_header: bool,
    pub header: String,
    /// Regex a PTR hostname of the client must match.
    pub pattern: String,
    /// Empty counts as unset; see [`ServerConfig::cert_key`].
    pub cert_key: Option<String>,
    pub kubeadm: PathBuf,
    pub kubeconfig: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }
}

impl ServerConfig {
    /// Builds the config from `KGEN_*` variables as returned by `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            listen_addr: lookup("KGEN_ADDR").unwrap_or_else(|| ":8000".into()),
            use_header: lookup("KGEN_USE_HEADER")
                .and_then(|v| parse_env_bool(&v))
                .unwrap_or(false),
            header: lookup("KGEN_HEADER").unwrap_or_else(|| "X-Forwarding-for".into()),
            pattern: lookup("KGEN_MATCH").unwrap_or_else(|| "^.*$".into()),
            cert_key: lookup("KGEN_CERT"),
            kubeadm: lookup("KGEN_KUBEADM")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("kubeadm")),
            kubeconfig: lookup("KGEN_KUBECONFIG").map(PathBuf::from),
        }
    }

    /// The control-plane certificate key, if one is actually set.
    pub fn cert_key(&self) -> Option<&str> {
        self.cert_key.as_deref().filter(|k| !k.is_empty())
    }
}

/// Boolean spellings accepted in environment variables: `1 t T TRUE true
/// True` and `0 f F FALSE false False`. Anything else is `None`.
pub fn parse_env_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    let policy = AuthPolicy::new(cfg.use_header, &cfg.header, &cfg.pattern)
        .context("invalid authorization settings")?;

    if policy.uses_header() {
        info!(header = %cfg.header, "taking client address from request header");
    }
    info!(pattern = policy.pattern(), "validating client PTR records");

    let resolver = DnsResolver::from_system_conf()?;

    let cert_key = cfg.cert_key().map(str::to_owned);
    if cert_key.is_none() {
        info!("no certificate key configured; control-plane joins disabled");
    }

    let issuer = KubeadmIssuer::new(cfg.kubeadm, cfg.kubeconfig);

    let state = AppState {
        authorizer: Authorizer::new(policy, Arc::new(resolver)),
        issuer: Arc::new(issuer),
        cert_key,
    };

    let app = router(state);

    let addr = normalize_listen_addr(&cfg.listen_addr);
    let listener = tokio::net::TcpListener::bind(addr.as_str())
        .await
        .with_context(|| format!("bind listener on {addr}"))?;

    info!(addr = %listener.local_addr()?, "kgen server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server error")
}

/// Routes and middleware, without a listener. The join handler needs
/// `ConnectInfo<SocketAddr>`, so serve it with connect info.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/join", get(join))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Accepts the `:port` shorthand for "all interfaces".
pub fn normalize_listen_addr(addr: &str) -> String {
    match addr.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => addr.to_owned(),
    }
}
