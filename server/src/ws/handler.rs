use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::{header, HeaderMap},
    response::Response,
};
use serde::Deserialize;

use crate::state::AppState;
use crate::ws::actor;

/// Query parameters for WebSocket connection.
#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    pub token: Option<String>,
}

/// Credential from `?token=` or, failing that, `Authorization: Bearer`.
fn credential(params: WsAuthQuery, headers: &HeaderMap) -> Option<String> {
    params.token.or_else(|| {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string)
    })
}

/// GET /ws?token=JWT
/// Always upgrades; authentication happens on the socket so a rejected
/// client receives a close code (4000 missing, 4001 expired, 4002 invalid)
/// instead of an HTTP error.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsAuthQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let credential = credential(params, &headers);
    ws.on_upgrade(move |socket| actor::run_connection(socket, state, credential))
}
