//! Handles authentication of incoming client connections.
//!
//! # Authentication process
//!
//! The client presents an identifier when it connects, which carries its P-256 public key. The
//! server sends the client a randomly generated challenge, which the client signs with the
//! matching private key and echoes back together with the signature. The server checks that the
//! echoed plaintext is the challenge it issued and that the signature verifies under the key from
//! the identifier.
//!
//! (See [`wsauth_rs::api::client_server`] for the relevant types)

use crate::socket::transport::{Inbound, InboundFrame, Socket, Transport, TransportError};
use serde_json::json;
use thiserror::Error;
use wsauth_rs::api::client_server::{
    kind, ChallengePayload, ChallengeResponse, ClientMessage, ErrorPayload, ServerMessage,
};
use wsauth_rs::challenge::{self, Challenge, GenerationError};
use wsauth_rs::identity::ClientIdentity;
use wsauth_rs::verify::{self, ChallengeResponseClaim};

/// Errors that end a handshake without a verdict on the client.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The connection failed underneath the handshake.
    #[error("connection failed during handshake")]
    Transport(#[source] TransportError),
    /// An outgoing message could not be serialized.
    #[error("failed to serialize message")]
    Serialization(#[source] serde_json::Error),
    /// A handshake step was invoked in a state that does not accept it.
    #[error("handshake step is not valid in state {0:?}")]
    InvalidState(ConnectionState),
}

/// Externally visible state of a connection's handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    AwaitingResponse,
    Authenticated,
    Rejected,
    Closed,
}

/// Who is to blame for a rejected handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Client,
    Server,
}

/// How a handshake ended.
#[derive(Debug)]
pub enum HandshakeOutcome {
    /// The client proved possession of the private key for this identity.
    Authenticated(ClientIdentity),
    /// The handshake failed and an error message was sent to the client.
    Rejected(Fault),
    /// The connection closed before the handshake finished.
    Closed,
}

// INTERNAL TYPES ----------------------------------------------------------------------------------

#[derive(Debug)]
enum AuthState {
    /// Waiting to decode the client's identifier
    Connecting,
    /// Challenge sent, waiting for the client to sign it
    AwaitingResponse {
        identity: ClientIdentity,
        challenge: Challenge,
    },
    Authenticated,
    Rejected,
    Closed,
}

/// Reasons an inbound frame is not a usable challenge response. These never end the handshake.
#[derive(Debug, Error)]
enum ResponseError {
    #[error("message is not a JSON envelope: {0}")]
    Envelope(#[source] serde_json::Error),
    #[error("expected a message of type {}, got {0}", kind::CHALLENGE_RESPONSE)]
    WrongKind(String),
    #[error("challenge response data is malformed: {0}")]
    Data(#[source] serde_json::Error),
}

/// State machine that authenticates one client connection.
///
/// State Diagram:
/// ```txt
///                               ┌── Network Boundary
/// ┌────────────┐                │
/// │ Connecting ├─ bad id ─────► │ ─► CLIENT_ERROR ──► Rejected
/// └─────┬──────┘                │
///       │                       │
///       ├────────────────────── │ ─► CHALLENGE
///       │                       │
/// ┌─────▼────────────┐          │
/// │ AwaitingResponse │◄──────── │ ── malformed / wrong type (CLIENT_ERROR, retry)
/// └─────┬────────────┘          │
///       │◄───────────────────── │ ── CHALLENGE_RESPONSE
///       │                       │
///       ├─ mismatch / bad sig ► │ ─► CLIENT_ERROR ──► Rejected
///       │                       │
/// ┌─────▼─────────┐             │
/// │ Authenticated │             │
/// └───────────────┘             │
/// ```
/// Any state moves to `Closed` if the inbound stream ends.
#[derive(Debug)]
pub struct Handshake {
    state: AuthState,
    challenge_source: fn() -> Result<Challenge, GenerationError>,
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

impl Handshake {
    pub fn new() -> Self {
        Self::with_challenge_source(challenge::generate)
    }

    /// Use `challenge_source` instead of the operating system's random source.
    pub fn with_challenge_source(
        challenge_source: fn() -> Result<Challenge, GenerationError>,
    ) -> Self {
        Handshake {
            state: AuthState::Connecting,
            challenge_source,
        }
    }

    pub fn state(&self) -> ConnectionState {
        match self.state {
            AuthState::Connecting => ConnectionState::Connecting,
            AuthState::AwaitingResponse { .. } => ConnectionState::AwaitingResponse,
            AuthState::Authenticated => ConnectionState::Authenticated,
            AuthState::Rejected => ConnectionState::Rejected,
            AuthState::Closed => ConnectionState::Closed,
        }
    }

    /// Drive the handshake to completion: decode `client_id`, issue a challenge, and consume
    /// `inbound` until the client answers it or the connection closes.
    ///
    /// On rejection the error message has been sent; tearing the connection down is up to the
    /// caller.
    pub async fn run<S: Socket>(
        &mut self,
        transport: &Transport<S>,
        inbound: &mut Inbound,
        client_id: &str,
    ) -> Result<HandshakeOutcome, HandshakeError> {
        if let Some(outcome) = self.begin(transport, client_id).await? {
            return Ok(outcome);
        }
        loop {
            let Some(frame) = inbound.recv().await else {
                tracing::info!(
                    "Attempted to read challenge response, but the connection was closed"
                );
                self.state = AuthState::Closed;
                return Ok(HandshakeOutcome::Closed);
            };
            if let Some(outcome) = self.handle_frame(transport, frame).await? {
                return Ok(outcome);
            }
        }
    }

    /// `Connecting` step: decode the identifier and send a challenge.
    ///
    /// Returns `Some` if the handshake ended here.
    pub async fn begin<S: Socket>(
        &mut self,
        transport: &Transport<S>,
        client_id: &str,
    ) -> Result<Option<HandshakeOutcome>, HandshakeError> {
        if !matches!(self.state, AuthState::Connecting) {
            return Err(HandshakeError::InvalidState(self.state()));
        }

        let identity = match ClientIdentity::decode(client_id) {
            Ok(identity) => identity,
            Err(e) => {
                tracing::info!("Client supplied a bad client ID: {e}");
                let payload = ErrorPayload::new("Bad client ID was supplied", e.to_string())
                    .with_code(e.code());
                return self.reject(transport, Fault::Client, payload).await;
            }
        };

        let challenge = match (self.challenge_source)() {
            Ok(challenge) => challenge,
            Err(e) => {
                tracing::error!("Failed to generate challenge: {e}");
                let payload = ErrorPayload::new("Error generating challenge payload", e.to_string());
                return self.reject(transport, Fault::Server, payload).await;
            }
        };

        self.emit(
            transport,
            &ServerMessage::Challenge(ChallengePayload::from(&challenge)),
        )
        .await?;
        tracing::debug!("Sent challenge, awaiting response");
        self.state = AuthState::AwaitingResponse {
            identity,
            challenge,
        };
        Ok(None)
    }

    /// `AwaitingResponse` step: handle one inbound frame.
    ///
    /// Frames that are not a well-formed challenge response are answered with a client error and
    /// leave the state unchanged. A well-formed response either authenticates the client or
    /// rejects it. Returns `Some` if the handshake ended here.
    pub async fn handle_frame<S: Socket>(
        &mut self,
        transport: &Transport<S>,
        frame: InboundFrame,
    ) -> Result<Option<HandshakeOutcome>, HandshakeError> {
        let AuthState::AwaitingResponse {
            identity,
            challenge,
        } = &self.state
        else {
            return Err(HandshakeError::InvalidState(self.state()));
        };

        let claim = match parse_challenge_response(&frame) {
            Ok(claim) => claim,
            Err(e) => {
                tracing::info!("Client provided a bad message: {e}. Looping");
                let payload = ErrorPayload::new(
                    "Not a challenge response",
                    "Expected a challenge response but got something else that the JSON parser \
                     was not able to parse",
                )
                .with_meta(json!({ "error": e.to_string() }));
                self.emit(transport, &ServerMessage::ClientError(payload))
                    .await?;
                return Ok(None);
            }
        };

        let rejection = if !challenge.matches(&claim.plaintext) {
            Some(("challenge_mismatch", "The signed payload is not the issued challenge"))
        } else if !verify::verify(identity, &claim) {
            Some(("invalid_signature", "The signature failed to verify"))
        } else {
            None
        };

        if let Some((reason, detail)) = rejection {
            tracing::info!(
                "Client provided a response that does not verify ({reason}). Closing the connection"
            );
            let payload = ErrorPayload::new("Signature verification failed", detail)
                .with_meta(json!({ "reason": reason }));
            return self.reject(transport, Fault::Client, payload).await;
        }

        let AuthState::AwaitingResponse { identity, .. } =
            std::mem::replace(&mut self.state, AuthState::Authenticated)
        else {
            unreachable!("state was checked above");
        };
        tracing::info!("Client authenticated");
        Ok(Some(HandshakeOutcome::Authenticated(identity)))
    }

    async fn reject<S: Socket>(
        &mut self,
        transport: &Transport<S>,
        fault: Fault,
        payload: ErrorPayload,
    ) -> Result<Option<HandshakeOutcome>, HandshakeError> {
        let message = match fault {
            Fault::Client => ServerMessage::ClientError(payload),
            Fault::Server => ServerMessage::ServerError(payload),
        };
        self.emit(transport, &message).await?;
        self.state = AuthState::Rejected;
        Ok(Some(HandshakeOutcome::Rejected(fault)))
    }

    /// Send `message`, moving to a terminal state if that fails.
    async fn emit<S: Socket>(
        &mut self,
        transport: &Transport<S>,
        message: &ServerMessage,
    ) -> Result<(), HandshakeError> {
        match transport.send(message).await {
            Ok(()) => Ok(()),
            Err(TransportError::Serialization(e)) => {
                tracing::error!("Failed to serialize outgoing message: {e}");
                self.state = AuthState::Rejected;
                let fallback = ServerMessage::ServerError(ErrorPayload::new(
                    "Internal server error",
                    "The server failed to encode a message",
                ));
                if let Err(e) = transport.send(&fallback).await {
                    tracing::error!("Failed to report serialization failure: {e}");
                }
                Err(HandshakeError::Serialization(e))
            }
            Err(e) => {
                self.state = AuthState::Closed;
                Err(HandshakeError::Transport(e))
            }
        }
    }
}

fn parse_challenge_response(frame: &InboundFrame) -> Result<ChallengeResponseClaim, ResponseError> {
    let message: ClientMessage =
        serde_json::from_slice(&frame.payload).map_err(ResponseError::Envelope)?;
    if !message.is(kind::CHALLENGE_RESPONSE) {
        return Err(ResponseError::WrongKind(message.kind));
    }
    let response: ChallengeResponse = message.data_as().map_err(ResponseError::Data)?;
    Ok(response.into())
}
