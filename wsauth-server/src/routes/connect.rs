use crate::serve::AppState;
use crate::socket::serve_connection;
use axum::extract::{ConnectInfo, Query, State, WebSocketUpgrade};
use axum::response::Response;
use serde::Deserialize;
use std::net::SocketAddr;
use tracing::instrument;

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    /// Absent is the same as empty; the handshake reports it to the client.
    #[serde(default)]
    client_id: String,
}

/// Axum handler for the client WebSocket endpoint.
///
/// Responds with an `Upgrade: websocket` and runs [`serve_connection`] on the upgraded socket.
#[instrument(skip(ws, state))]
pub async fn connect(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(socket_addr): ConnectInfo<SocketAddr>,
    Query(params): Query<ConnectParams>,
) -> Response {
    let client_id = params.client_id.trim().to_string();
    let socket_config = state.config().socket.clone();
    ws.on_upgrade(move |web_socket| async move {
        let outcome = serve_connection(web_socket, client_id, socket_config, socket_addr).await;
        tracing::debug!("Connection from {socket_addr} finished: {outcome:?}");
    })
}
