//! Server side handling of client WebSocket connections.

use crate::config::SocketConfig;
use handshake::{Fault, Handshake, HandshakeError, HandshakeOutcome};
use std::net::SocketAddr;
use tracing::Instrument;
use transport::{Socket, Transport};
use uuid::Uuid;

pub mod handshake;
pub mod lifecycle;
pub mod session;
pub mod transport;

/// Own a freshly upgraded connection for its whole life: authenticate the client, hand the
/// connection to the session loop, and stop the transport when either is done.
pub async fn serve_connection<S: Socket>(
    socket: S,
    client_id: String,
    config: SocketConfig,
    remote_addr: SocketAddr,
) -> HandshakeOutcome {
    let connection_id = Uuid::new_v4();
    let span = tracing::info_span!("connection", %connection_id, %remote_addr);
    async move {
        tracing::info!("New connection from client");
        let transport = Transport::new(socket, &config);
        let outcome = drive(&transport, &client_id).await;
        transport.stop().await;
        outcome
    }
    .instrument(span)
    .await
}

async fn drive<S: Socket>(transport: &Transport<S>, client_id: &str) -> HandshakeOutcome {
    let mut inbound = match transport.inbound() {
        Ok(inbound) => inbound,
        Err(e) => {
            tracing::error!("Failed to take inbound stream of new connection: {e}");
            return HandshakeOutcome::Closed;
        }
    };

    let mut handshake = Handshake::new();
    let outcome = match handshake.run(transport, &mut inbound, client_id).await {
        Ok(outcome) => outcome,
        Err(e @ HandshakeError::Serialization(_)) => {
            tracing::error!("Handshake aborted: {e}");
            return HandshakeOutcome::Rejected(Fault::Server);
        }
        Err(e) => {
            tracing::info!("Handshake aborted: {e}");
            return HandshakeOutcome::Closed;
        }
    };

    if let HandshakeOutcome::Authenticated(_) = &outcome {
        let frames = session::run_session(&mut inbound, client_id).await;
        tracing::info!("Client closed the connection after {frames} messages. Ending the connection");
    }
    outcome
}
