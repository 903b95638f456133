//! Framed transport halves and the [`Session`] that owns them.
//!
//! A session is split into a [`FrameSink`] written only by the
//! device→transport pump and a [`FrameSource`] read only by the
//! transport→device pump, so neither half needs a lock.

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::fmt;
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Upper bound on sending a close frame to an unresponsive relay.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Write half of a framed transport.
pub trait FrameSink: Send + 'static {
    /// Send one binary frame carrying `frame` verbatim.
    fn send_frame(&mut self, frame: Bytes) -> impl Future<Output = io::Result<()>> + Send;

    /// Send a liveness frame that the peer never forwards as a packet.
    fn send_keepalive(&mut self) -> impl Future<Output = io::Result<()>> + Send;

    /// Close the underlying connection.
    fn close(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}

/// Read half of a framed transport.
pub trait FrameSource: Send + 'static {
    /// Next binary frame, or `None` once the peer closed the connection.
    fn next_frame(&mut self) -> impl Future<Output = io::Result<Option<Bytes>>> + Send;
}

/// Lifecycle of one transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Dialing,
    Handshaking,
    Active,
    Closed,
}

/// One live transport connection plus its state.
///
/// Owned by the supervisor. The relay borrows the halves for one run and
/// always puts them back before returning.
pub struct Session<S, R> {
    sink: Option<S>,
    source: Option<R>,
    relay_addr: String,
    ack: Option<Bytes>,
    state: SessionState,
}

impl<S: FrameSink, R: FrameSource> Session<S, R> {
    /// Wrap a freshly connected transport. No frame has been sent yet.
    pub fn new(sink: S, source: R, relay_addr: impl Into<String>) -> Self {
        Self {
            sink: Some(sink),
            source: Some(source),
            relay_addr: relay_addr.into(),
            ack: None,
            state: SessionState::Dialing,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn relay_addr(&self) -> &str {
        &self.relay_addr
    }

    /// Acknowledgement payload read during the handshake, if any.
    pub fn ack(&self) -> Option<&Bytes> {
        self.ack.as_ref()
    }

    /// Write the session-open message as one frame.
    pub async fn send_handshake(&mut self, frame: Bytes) -> io::Result<()> {
        self.state = SessionState::Handshaking;
        match self.sink.as_mut() {
            Some(sink) => sink.send_frame(frame).await,
            None => Err(closed_error()),
        }
    }

    /// Read the relay's first frame as the handshake acknowledgement.
    pub async fn read_ack(&mut self) -> io::Result<Bytes> {
        let source = self.source.as_mut().ok_or_else(closed_error)?;
        match source.next_frame().await? {
            Some(ack) => {
                self.ack = Some(ack.clone());
                Ok(ack)
            }
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "relay closed before acknowledging the handshake",
            )),
        }
    }

    /// Mark the handshake complete.
    pub fn activate(&mut self) {
        self.state = SessionState::Active;
    }

    /// Lend both halves to the relay pumps.
    pub(crate) fn take_halves(&mut self) -> Option<(S, R)> {
        match (self.sink.take(), self.source.take()) {
            (Some(sink), Some(source)) => Some((sink, source)),
            (sink, source) => {
                self.sink = sink;
                self.source = source;
                None
            }
        }
    }

    /// Return halves lent by [`Session::take_halves`].
    pub(crate) fn restore_halves(&mut self, sink: Option<S>, source: Option<R>) {
        if self.sink.is_none() {
            self.sink = sink;
        }
        if self.source.is_none() {
            self.source = source;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// Close the transport. Calling it again is a no-op.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;
        self.source.take();
        if let Some(mut sink) = self.sink.take() {
            if let Err(e) = sink.close().await {
                log::debug!("Error closing session to {}: {}", self.relay_addr, e);
            }
        }
        log::debug!("Session to {} closed", self.relay_addr);
    }
}

impl<S, R> fmt::Debug for Session<S, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("relay_addr", &self.relay_addr)
            .field("state", &self.state)
            .field("ack_len", &self.ack.as_ref().map(Bytes::len))
            .finish()
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "session is closed")
}

// ============================================================================
// WebSocket transport
// ============================================================================

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Session over a WebSocket connection.
pub type WsSession = Session<WsSink, WsSource>;

/// Write half of a WebSocket connection.
pub struct WsSink {
    inner: SplitSink<WsStream, Message>,
}

/// Read half of a WebSocket connection.
pub struct WsSource {
    inner: SplitStream<WsStream>,
}

/// Split a connected WebSocket into framed halves.
pub fn split_ws(stream: WsStream) -> (WsSink, WsSource) {
    let (sink, source) = stream.split();
    (WsSink { inner: sink }, WsSource { inner: source })
}

fn ws_io_error(err: tungstenite::Error) -> io::Error {
    match err {
        tungstenite::Error::Io(e) => e,
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            io::Error::new(io::ErrorKind::NotConnected, err)
        }
        other => io::Error::other(other),
    }
}

impl FrameSink for WsSink {
    async fn send_frame(&mut self, frame: Bytes) -> io::Result<()> {
        self.inner
            .send(Message::Binary(frame))
            .await
            .map_err(ws_io_error)
    }

    async fn send_keepalive(&mut self) -> io::Result<()> {
        self.inner
            .send(Message::Ping(Bytes::new()))
            .await
            .map_err(ws_io_error)
    }

    async fn close(&mut self) -> io::Result<()> {
        match tokio::time::timeout(CLOSE_TIMEOUT, self.inner.close()).await {
            Ok(result) => result.map_err(ws_io_error),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "timed out sending close frame",
            )),
        }
    }
}

impl FrameSource for WsSource {
    async fn next_frame(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            let msg = match self.inner.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(tungstenite::Error::ConnectionClosed)) | None => return Ok(None),
                Some(Err(e)) => return Err(ws_io_error(e)),
            };
            match msg {
                Message::Binary(data) => return Ok(Some(data)),
                Message::Ping(_) | Message::Pong(_) => {
                    log::trace!("Keepalive frame from relay");
                }
                Message::Text(text) => {
                    log::debug!("Dropping {}-byte text frame from relay", text.len());
                }
                Message::Close(frame) => {
                    log::debug!("Relay sent close frame: {:?}", frame);
                    return Ok(None);
                }
                Message::Frame(_) => {}
            }
        }
    }
}
