use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::{info, warn};

use crate::AppState;

/// Query key selecting a control-plane join.
const NEW_MASTER_PARAM: &str = "NEWMASTER";

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── Join ──────────────────────────────────────────────────────────────────────

pub async fn join(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<Vec<(String, String)>>,
) -> Response {
    let source = match state.authorizer.authorize(&peer.to_string(), &headers).await {
        Ok(ip) => ip,
        Err(reason) => return bad_request(reason.to_string()),
    };

    let wants_control_plane = is_new_master(&params);

    let base = match state.issuer.issue_join_token().await {
        Ok(out) => out,
        Err(e) => {
            warn!(%source, error = %e, "token issuer failed");
            return bad_request(e.to_string());
        }
    };

    let body = match (wants_control_plane, state.cert_key.as_deref()) {
        (true, Some(key)) => control_plane_command(&base, key),
        (true, None) => {
            warn!(%source, "control-plane join requested but no certificate key is configured; returning worker join");
            base
        }
        (false, _) => base,
    };

    info!(%source, control_plane = wants_control_plane && state.cert_key.is_some(), "issued join command");

    // kubeadm prints text; only fall back to raw bytes if it ever doesn't.
    match String::from_utf8(body) {
        Ok(text) => (StatusCode::OK, text).into_response(),
        Err(e) => (StatusCode::OK, e.into_bytes()).into_response(),
    }
}

/// `NEWMASTER` is honoured from its first occurrence only.
fn is_new_master(params: &[(String, String)]) -> bool {
    params
        .iter()
        .find(|(k, _)| k == NEW_MASTER_PARAM)
        .is_some_and(|(_, v)| v.eq_ignore_ascii_case("true"))
}

/// Turns a worker join command into a control-plane join.
pub fn control_plane_command(base: &[u8], cert_key: &str) -> Vec<u8> {
    let end = base
        .iter()
        .rposition(|&b| b != b'\n')
        .map_or(0, |i| i + 1);

    let mut out = base[..end].to_vec();
    out.extend_from_slice(format!(" --control-plane --certificate-key {cert_key}").as_bytes());
    out
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, message).into_response()
}
