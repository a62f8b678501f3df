//! In-memory WebSocket and a signing client for driving the server side of a connection.

#![allow(dead_code)]

use axum::extract::ws::Message;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use futures_util::{Sink, Stream};
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use wsauth_rs::api::client_server::kind;
use wsauth_rs::identity::ClientIdentity;
use wsauth_server::config::SocketConfig;

pub const REMOTE_ADDR: ([u8; 4], u16) = ([127, 0, 0, 1], 40000);

pub fn remote_addr() -> SocketAddr {
    SocketAddr::from(REMOTE_ADDR)
}

/// Server side of an in-memory connection.
pub struct MockSocket {
    incoming: mpsc::UnboundedReceiver<Result<Message, axum::Error>>,
    outgoing: mpsc::UnboundedSender<Message>,
    closes: Arc<AtomicUsize>,
    closed: bool,
}

/// Client side of an in-memory connection.
pub struct MockPeer {
    to_server: Option<mpsc::UnboundedSender<Result<Message, axum::Error>>>,
    from_server: mpsc::UnboundedReceiver<Message>,
    closes: Arc<AtomicUsize>,
}

pub fn mock_socket() -> (MockSocket, MockPeer) {
    let (to_server, incoming) = mpsc::unbounded_channel();
    let (outgoing, from_server) = mpsc::unbounded_channel();
    let closes = Arc::new(AtomicUsize::new(0));
    (
        MockSocket {
            incoming,
            outgoing,
            closes: closes.clone(),
            closed: false,
        },
        MockPeer {
            to_server: Some(to_server),
            from_server,
            closes,
        },
    )
}

impl Stream for MockSocket {
    type Item = Result<Message, axum::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.incoming.poll_recv(cx)
    }
}

impl Sink<Message> for MockSocket {
    type Error = axum::Error;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.closed {
            Poll::Ready(Err(axum::Error::new("socket is closed")))
        } else {
            Poll::Ready(Ok(()))
        }
    }

    fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
        self.outgoing
            .send(item)
            .map_err(|_| axum::Error::new("peer went away"))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.closed = true;
        self.closes.fetch_add(1, Ordering::SeqCst);
        Poll::Ready(Ok(()))
    }
}

impl MockPeer {
    pub fn send_text(&self, text: impl Into<String>) {
        self.send(Ok(Message::Text(text.into())));
    }

    pub fn send(&self, message: Result<Message, axum::Error>) {
        self.to_server
            .as_ref()
            .expect("peer already hung up")
            .send(message)
            .expect("server side dropped");
    }

    /// Drop the connection without a close frame.
    pub fn hang_up(&mut self) {
        self.to_server = None;
    }

    /// Next frame from the server, or `None` once the server side is gone.
    pub async fn recv(&mut self) -> Option<Message> {
        self.from_server.recv().await
    }

    /// Next text frame from the server, parsed as JSON. Control frames are skipped.
    pub async fn recv_json(&mut self) -> Value {
        loop {
            match self.recv().await.expect("server side closed") {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("expected a text frame, got {other:?}"),
            }
        }
    }

    /// Every frame the server has sent so far.
    pub fn drain(&mut self) -> Vec<Message> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.from_server.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Number of times the server closed its side of the socket.
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

pub fn socket_config() -> SocketConfig {
    SocketConfig {
        write_timeout: Duration::from_secs(60),
        liveness_timeout: Duration::from_secs(60),
        ping_interval: None,
        inbound_buffer: 16,
    }
}

/// A client holding a P-256 key pair.
pub struct TestClient {
    signing_key: SigningKey,
}

impl TestClient {
    pub fn new() -> Self {
        TestClient {
            signing_key: SigningKey::random(&mut OsRng),
        }
    }

    pub fn client_id(&self) -> String {
        ClientIdentity::from_verifying_key(VerifyingKey::from(&self.signing_key)).to_client_id()
    }

    pub fn sign(&self, plaintext: &[u8]) -> Vec<u8> {
        let signature: Signature = self.signing_key.sign(plaintext);
        signature.to_bytes().to_vec()
    }

    /// A CHALLENGE_RESPONSE echoing `plaintext` with this client's signature over it.
    pub fn respond(&self, plaintext: &[u8]) -> String {
        challenge_response(plaintext, &self.sign(plaintext))
    }
}

pub fn challenge_response(plaintext: &[u8], signature: &[u8]) -> String {
    json!({
        "type": kind::CHALLENGE_RESPONSE,
        "data": {
            "payload": STANDARD_NO_PAD.encode(plaintext),
            "signature": STANDARD_NO_PAD.encode(signature),
        }
    })
    .to_string()
}

pub fn text_message(body: &str) -> String {
    json!({ "type": kind::TEXT_MESSAGE, "data": body }).to_string()
}

/// Decode the challenge bytes out of a CHALLENGE message.
pub fn challenge_bytes(message: &Value) -> Vec<u8> {
    assert_eq!(message["type"], "CHALLENGE", "unexpected message: {message}");
    let payload = message["data"]["payload"].as_str().unwrap();
    STANDARD.decode(payload).unwrap()
}
