//! The connection transport: owns one client WebSocket and makes it safe to use from several tasks.
//!
//! A [`Transport`] splits the socket into its two halves. The write half sits behind a mutex so
//! concurrent [`Transport::send`] calls never interleave. The read half is owned by a background
//! read task, which publishes data frames to a single-consumer [`Inbound`] stream. A second
//! background task sends a PING every `ping_interval`; if nothing at all arrives from the peer
//! within `liveness_timeout`, the read task gives up on the connection.
//!
//! Every way a connection can end (remote close, read or write failure, liveness timeout, an
//! explicit [`Transport::stop`]) converges on the same one-shot shutdown.

use crate::config::SocketConfig;
use crate::socket::lifecycle::LifecycleSignal;
use axum::extract::ws::Message;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::Instrument;

/// A duplex WebSocket connection. Implemented by axum's `WebSocket`.
pub trait Socket:
    Stream<Item = Result<Message, axum::Error>>
    + Sink<Message, Error = axum::Error>
    + Send
    + Unpin
    + 'static
{
}

impl<T> Socket for T where
    T: Stream<Item = Result<Message, axum::Error>>
        + Sink<Message, Error = axum::Error>
        + Send
        + Unpin
        + 'static
{
}

#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport has been stopped.
    #[error("connection is stopped")]
    Stopped,
    /// Failed to serialize an outgoing message.
    #[error("failed to serialize message")]
    Serialization(#[source] serde_json::Error),
    /// Failed to send a message over the websocket.
    #[error("failed to send message")]
    Send(#[source] axum::Error),
    /// A write did not complete in time.
    #[error("timed out after {0:?} writing to the connection")]
    WriteTimeout(Duration),
    /// The inbound stream has a single consumer, and it was already handed out.
    #[error("inbound stream was already taken")]
    InboundTaken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Text,
    Binary,
}

/// A data frame received from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

pub struct Transport<S: Socket> {
    inner: Arc<Inner<S>>,
}

impl<S: Socket> Clone for Transport<S> {
    fn clone(&self) -> Self {
        Transport {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<S: Socket> {
    sink: Mutex<SplitSink<S, Message>>,
    lifecycle: LifecycleSignal,
    inbound: StdMutex<Option<mpsc::Receiver<InboundFrame>>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    write_timeout: Duration,
}

impl<S: Socket> Transport<S> {
    /// Take ownership of `socket` and start the read and keepalive tasks.
    ///
    /// Must be called from within a `tokio` runtime. The background tasks inherit the current
    /// tracing span.
    pub fn new(socket: S, config: &SocketConfig) -> Self {
        let (sink, stream) = socket.split();
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_buffer.max(1));

        let inner = Arc::new(Inner {
            sink: Mutex::new(sink),
            lifecycle: LifecycleSignal::new(),
            inbound: StdMutex::new(Some(inbound_rx)),
            tasks: StdMutex::new(Vec::new()),
            write_timeout: config.write_timeout,
        });

        {
            // Held across the spawns so that a shutdown requested by a task that fails straight
            // away still finds both handles to join.
            let mut tasks = inner.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            let span = tracing::Span::current();
            tasks.push(tokio::spawn(
                read_loop(
                    Arc::downgrade(&inner),
                    stream,
                    inbound_tx,
                    config.liveness_timeout,
                    inner.lifecycle.on_stopped(),
                )
                .instrument(span.clone()),
            ));
            tasks.push(tokio::spawn(
                keepalive_loop(
                    Arc::downgrade(&inner),
                    config.ping_interval(),
                    inner.lifecycle.on_stopped(),
                )
                .instrument(span),
            ));
        }

        Transport { inner }
    }

    /// Serialize `message` as JSON and send it as a single text frame.
    ///
    /// Concurrent callers are serialized on the write lock. Any failure to write is terminal: the
    /// transport stops itself.
    pub async fn send<T: Serialize>(&self, message: &T) -> Result<(), TransportError> {
        let text = serde_json::to_string(message).map_err(TransportError::Serialization)?;
        self.inner.write(Message::Text(text)).await
    }

    /// Hand out the stream of inbound data frames. Only the first call succeeds.
    pub fn inbound(&self) -> Result<Inbound, TransportError> {
        let rx = self
            .inner
            .inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(TransportError::InboundTaken)?;
        Ok(Inbound {
            rx,
            stop: Box::pin(self.inner.lifecycle.on_stopped()),
            ended: false,
        })
    }

    /// Stop the transport: close the socket and wait for the background tasks to exit.
    ///
    /// Idempotent, and safe to call from any number of tasks at once. The shutdown sequence runs
    /// exactly once, on a task of its own, so it completes even if every caller is dropped. Every
    /// call returns only after it has finished.
    pub async fn stop(&self) {
        let inner = self.inner.clone();
        self.inner
            .lifecycle
            .stop_with(move || async move {
                inner.close_socket().await;

                let tasks = std::mem::take(
                    &mut *inner.tasks.lock().unwrap_or_else(PoisonError::into_inner),
                );
                for task in tasks {
                    if let Err(e) = task.await {
                        tracing::error!("Connection background task failed: {e}");
                    }
                }
                tracing::debug!("Connection stopped");
            }
            .instrument(tracing::Span::current()))
            .await
    }

    /// Whether [`Transport::stop`] has run to completion.
    pub fn stopped(&self) -> bool {
        self.inner.lifecycle.stopped()
    }

    /// Resolves once the transport begins stopping, for whatever reason.
    pub fn on_stopped(&self) -> impl Future<Output = ()> + Send + 'static {
        self.inner.lifecycle.on_stopped()
    }
}

impl<S: Socket> Inner<S> {
    async fn write(self: &Arc<Self>, message: Message) -> Result<(), TransportError> {
        if self.lifecycle.stop_requested() {
            return Err(TransportError::Stopped);
        }
        let result = {
            let mut sink = self.sink.lock().await;
            match tokio::time::timeout(self.write_timeout, sink.send(message)).await {
                Err(_) => Err(TransportError::WriteTimeout(self.write_timeout)),
                Ok(Err(e)) => Err(TransportError::Send(e)),
                Ok(Ok(())) => Ok(()),
            }
        };
        if let Err(e) = &result {
            tracing::info!("Write to client failed, stopping connection: {e}");
            request_stop(self.clone());
        }
        result
    }

    async fn close_socket(&self) {
        let mut sink = self.sink.lock().await;
        let close = async {
            if let Err(e) = sink.send(Message::Close(None)).await {
                tracing::debug!("Failed to send close frame: {e}");
            }
            if let Err(e) = sink.close().await {
                tracing::debug!("Failed to close connection: {e}");
            }
        };
        if tokio::time::timeout(self.write_timeout, close).await.is_err() {
            tracing::warn!("Timed out closing connection");
        }
    }
}

/// Stop the transport from a background task. Waiting on the shutdown would wait on the task
/// itself, so the request is made from a detached task.
fn request_stop<S: Socket>(inner: Arc<Inner<S>>) {
    tokio::spawn(
        async move { Transport { inner }.stop().await }.instrument(tracing::Span::current()),
    );
}

async fn read_loop<S: Socket>(
    transport: Weak<Inner<S>>,
    mut stream: SplitStream<S>,
    inbound: mpsc::Sender<InboundFrame>,
    liveness_timeout: Duration,
    stop: impl Future<Output = ()>,
) {
    tokio::pin!(stop);

    loop {
        let next = tokio::select! {
            _ = &mut stop => return,
            next = tokio::time::timeout(liveness_timeout, stream.next()) => next,
        };

        let frame = match next {
            Err(_) => {
                tracing::info!("No traffic from client in {liveness_timeout:?}, closing");
                break;
            }
            Ok(None) => {
                tracing::debug!("Client closed connection without close frame");
                break;
            }
            Ok(Some(Err(e))) => {
                tracing::info!("Error receiving from client: {e}, closing");
                break;
            }
            Ok(Some(Ok(message))) => match message {
                Message::Text(s) => InboundFrame {
                    kind: FrameKind::Text,
                    payload: s.into_bytes(),
                },
                Message::Binary(b) => InboundFrame {
                    kind: FrameKind::Binary,
                    payload: b,
                },
                // PONGs are answered automatically; both still count as traffic.
                Message::Ping(_) => {
                    tracing::trace!("websocket PING'd");
                    continue;
                }
                Message::Pong(_) => {
                    tracing::trace!("websocket PONG'd");
                    continue;
                }
                Message::Close(maybe_cf) => {
                    let cm = maybe_cf
                        .map(|cf| format!("({}) {}", cf.code, cf.reason))
                        .unwrap_or("<no close frame>".to_string());
                    tracing::info!("Websocket closed by client: {cm}");
                    break;
                }
            },
        };

        tokio::select! {
            _ = &mut stop => return,
            sent = inbound.send(frame) => {
                if sent.is_err() {
                    tracing::trace!("Inbound stream dropped, discarding frame");
                }
            }
        }
    }

    if let Some(inner) = transport.upgrade() {
        request_stop(inner);
    }
}

async fn keepalive_loop<S: Socket>(
    transport: Weak<Inner<S>>,
    ping_interval: Duration,
    stop: impl Future<Output = ()>,
) {
    tokio::pin!(stop);
    let mut interval =
        tokio::time::interval_at(tokio::time::Instant::now() + ping_interval, ping_interval);

    loop {
        tokio::select! {
            _ = &mut stop => return,
            _ = interval.tick() => {}
        }
        let Some(inner) = transport.upgrade() else {
            return;
        };
        tracing::trace!("Sending PING to client");
        if let Err(e) = inner.write(Message::Ping(Vec::new())).await {
            // `write` has already requested the shutdown.
            tracing::info!("Failed to send PING, the client probably closed the connection: {e}");
            return;
        }
    }
}

/// Sequential, single-consumer stream of data frames received from the peer.
///
/// Ends (yields `None`) once the transport starts stopping, even if frames are still buffered.
pub struct Inbound {
    rx: mpsc::Receiver<InboundFrame>,
    stop: Pin<Box<dyn Future<Output = ()> + Send>>,
    ended: bool,
}

impl Inbound {
    pub async fn recv(&mut self) -> Option<InboundFrame> {
        if self.ended {
            return None;
        }
        let frame = tokio::select! {
            biased;
            _ = &mut self.stop => None,
            frame = self.rx.recv() => frame,
        };
        if frame.is_none() {
            self.ended = true;
        }
        frame
    }
}

impl std::fmt::Debug for Inbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inbound")
            .field("ended", &self.ended)
            .finish_non_exhaustive()
    }
}
