//! Error types for the tunnel engine.
//!
//! Errors are split by who recovers from them:
//! - [`DialError`] and [`RelayError`] are handled inside the supervisor loop
//!   (logged, followed by backoff and a new dial).
//! - [`SetupError`] comes from device, route, lock or configuration setup
//!   before the supervisor starts and is fatal for the process.

use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Boxed error type used for error chaining across crate boundaries.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Context wrapper that preserves an optional underlying source error.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ErrorContext {
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl ErrorContext {
    /// Create context-only error (no underlying source).
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Create context error with an underlying source.
    pub fn with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// The transport could not be established.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DialError {
    /// Connect + TLS + WebSocket upgrade did not finish in time.
    #[error("dial timed out after {0:?}")]
    Timeout(Duration),

    /// DNS, TCP, TLS or HTTP upgrade failure.
    #[error("connect failed: {0}")]
    ConnectFailure(#[source] ErrorContext),

    /// The session-open message could not be written.
    #[error("handshake write failed: {0}")]
    HandshakeWrite(#[source] io::Error),

    /// The relay acknowledgement could not be read (error, close or timeout).
    #[error("handshake acknowledgement failed: {0}")]
    HandshakeAck(#[source] ErrorContext),
}

impl DialError {
    /// Create a connect failure with context only.
    pub fn connect(message: impl Into<String>) -> Self {
        Self::ConnectFailure(ErrorContext::new(message))
    }

    /// Create a connect failure with preserved source.
    pub fn connect_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::ConnectFailure(ErrorContext::with_source(message, source))
    }

    /// Create an acknowledgement failure with context only.
    pub fn ack(message: impl Into<String>) -> Self {
        Self::HandshakeAck(ErrorContext::new(message))
    }
}

/// Which relay pump a [`RelayError`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Packets read from the device and written to the transport.
    DeviceToTransport,
    /// Frames read from the transport and written to the device.
    TransportToDevice,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::DeviceToTransport => f.write_str("device->transport"),
            Direction::TransportToDevice => f.write_str("transport->device"),
        }
    }
}

/// Why an active session stopped relaying.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RelayError {
    #[error("device read failed: {0}")]
    DeviceRead(#[source] io::Error),

    #[error("device write failed: {0}")]
    DeviceWrite(#[source] io::Error),

    #[error("transport read failed: {0}")]
    TransportRead(#[source] io::Error),

    #[error("transport write failed: {0}")]
    TransportWrite(#[source] io::Error),

    /// External cancellation; a clean shutdown, not a failure.
    #[error("relay canceled")]
    Canceled,
}

impl RelayError {
    /// The pump that failed, or `None` for cancellation.
    pub fn direction(&self) -> Option<Direction> {
        match self {
            RelayError::DeviceRead(_) | RelayError::TransportWrite(_) => {
                Some(Direction::DeviceToTransport)
            }
            RelayError::TransportRead(_) | RelayError::DeviceWrite(_) => {
                Some(Direction::TransportToDevice)
            }
            RelayError::Canceled => None,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, RelayError::Canceled)
    }
}

/// Host setup failed before any session was dialed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SetupError {
    /// TUN device creation or configuration failed.
    #[error("TUN device error: {0}")]
    TunDevice(#[source] ErrorContext),

    /// Routing table manipulation failed.
    #[error("Route error: {0}")]
    Route(#[source] ErrorContext),

    /// Another client instance holds the lock.
    #[error("Lock error: {0}")]
    Lock(#[source] ErrorContext),
}

impl SetupError {
    pub fn tun_device_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::TunDevice(ErrorContext::with_source(message, source))
    }

    pub fn route(message: impl Into<String>) -> Self {
        Self::Route(ErrorContext::new(message))
    }

    pub fn route_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Route(ErrorContext::with_source(message, source))
    }

    pub fn lock(message: impl Into<String>) -> Self {
        Self::Lock(ErrorContext::new(message))
    }

    pub fn lock_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Lock(ErrorContext::with_source(message, source))
    }
}

/// Result type alias for setup operations.
pub type SetupResult<T> = Result<T, SetupError>;
