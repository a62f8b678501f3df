//! What happens on a connection after the client has authenticated.
//!
//! There is no protocol here yet: text messages are logged, everything else is ignored.

use crate::socket::transport::Inbound;
use wsauth_rs::api::client_server::{kind, ClientMessage};

/// Consume `inbound` until the connection ends. Returns the number of frames seen.
pub async fn run_session(inbound: &mut Inbound, client_id: &str) -> usize {
    let mut frames = 0;
    while let Some(frame) = inbound.recv().await {
        frames += 1;
        let message: ClientMessage = match serde_json::from_slice(&frame.payload) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!("Ignoring unparseable message from client {client_id}: {e}");
                continue;
            }
        };
        if !message.is(kind::TEXT_MESSAGE) {
            tracing::info!("Got message of {} from {client_id}", message.kind);
            continue;
        }
        match message.data_as::<String>() {
            Ok(text) => tracing::info!("Got message from client {client_id}: {text}"),
            Err(e) => tracing::info!("Failed to get message body from {client_id}: {e}"),
        }
    }
    frames
}
