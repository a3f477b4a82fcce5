//! # pooled-ws
//! WebSocket protocol client (RFC 6455) layered on a pooled, persistent HTTP/1.1 connection layer.
//!
//! The crate performs the HTTP Upgrade handshake over a connection borrowed from a
//! [`ConnectionPool`], detaches the upgraded stream from the pool, and then hands it to a
//! periodic driver that encodes outgoing messages and decodes, reassembles and answers
//! incoming frames. Results are posted back to the [`WebSocket`] facade, which is the only
//! place where the ready state changes and where events are produced.
//!
//! # Execution model
//! - The handshake runs as background work on an [`Executor`].
//! - Every open socket registers a periodic item on the same executor; each tick drains the
//!   send queue and processes at most one inbound frame.
//! - The facade is owned by a single consumer, which applies posted results when it polls
//!   for events.
//!
//! # Client Example
//! ```no_run
//! use pooled_ws::{ConnectionPool, Data, Event, Executor, WebSocket};
//!
//! #[tokio::main]
//! async fn main() -> pooled_ws::Result<()> {
//!     let executor = Executor::current();
//!     let pool = ConnectionPool::new(executor.clone());
//!
//!     let mut ws = WebSocket::new(pool, executor);
//!     ws.open("ws://localhost:8080/chat", "chat")?;
//!
//!     while let Some(event) = ws.next_event().await {
//!         match event {
//!             Event::Open => ws.send("hello")?,
//!             Event::Message(Data::Text(text)) => {
//!                 println!("{text}");
//!                 ws.close(1000, "bye")?;
//!             }
//!             Event::Close => break,
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Memory Safety
//! - Reassembled messages are capped at [`MAX_PAYLOAD_LENGTH`] (8 MiB); a declared frame length
//!   above the cap is rejected before any payload byte is read
//! - Control frames are limited to 125 bytes and are never fragmented
//! - Text messages are validated as UTF-8

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod close;
pub mod codec;
pub mod frame;
mod mask;
pub mod message;
pub mod stream;

mod driver;
mod executor;
mod handshake;
mod options;
mod pool;
mod queue;
mod websocket;

use thiserror::Error;

pub use driver::{Processed, SocketDriver};
pub use executor::{Executor, PeriodicHandle, PeriodicItem};
pub use frame::{Frame, OpCode};
pub use handshake::{Handshake, HandshakeState, Upgraded};
pub use message::{Data, Message, MAX_PAYLOAD_LENGTH};
pub use options::Options;
pub use pool::{
    ConnectionPool, PooledConnection, CHECK_INTERVAL, IDLE_TIMEOUT, MAX_CONNECTIONS_PER_HOST,
};
pub use queue::SendQueue;
pub use stream::{NetworkStream, IO_TIMEOUT};
pub use websocket::{Event, Protocols, ReadyState, WebSocket};

/// A result type for WebSocket operations, using `WebSocketError` as the error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Coarse classification of a [`WebSocketError`].
///
/// Background failures are reported to the consumer through [`Event::Error`], and callers
/// usually only need to know which stage failed rather than the exact variant.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// DNS resolution, TCP connect or TLS negotiation failed.
    ConnectionFailed,
    /// The server answered the upgrade request with something other than a valid 101.
    HandshakeFailed,
    /// The peer violated RFC 6455 framing rules.
    ProtocolViolation,
    /// Read or write failure (including timeouts) on an established connection.
    IoFailure,
    /// The operation was aborted through its cancellation token.
    Canceled,
    /// The API was called in a state or with arguments that do not allow it.
    Usage,
}

/// Represents errors that can occur during WebSocket operations.
///
/// The errors are broadly categorized into:
///
/// - Connection errors (resolution, connect, TLS)
/// - Handshake errors (status code, upgrade headers, accept key)
/// - Protocol errors (invalid frames, incorrect sequence of fragments, oversized payloads)
/// - I/O and system-level errors
/// - Usage errors raised synchronously by [`WebSocket`]
///
/// [`WebSocketError::kind`] maps every variant onto an [`ErrorKind`].
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// Occurs when receiving a new data frame before the previous fragmented message
    /// was completed.
    #[error("Invalid fragment")]
    InvalidFragment,

    /// Indicates that a text message or close frame reason contains invalid UTF-8 data.
    /// According to RFC 6455, all text payloads must be valid UTF-8.
    #[error("Invalid UTF-8")]
    InvalidUTF8,

    /// Occurs when receiving a continuation frame without a preceding initial frame.
    #[error("Invalid continuation frame")]
    InvalidContinuationFrame,

    /// Returned when the upgrade request is answered with a status other than 101.
    #[error("Invalid status code: {0}")]
    InvalidStatusCode(u16),

    /// Indicates that the HTTP "Upgrade" header is either missing or does not contain
    /// the required "websocket" value.
    #[error("Invalid upgrade header")]
    InvalidUpgradeHeader,

    /// Indicates that the HTTP "Connection" header is either missing or does not contain
    /// the required "upgrade" value.
    #[error("Invalid connection header")]
    InvalidConnectionHeader,

    /// The "Sec-WebSocket-Accept" header is missing or empty.
    #[error("Sec-WebSocket-Accept header is missing")]
    MissingAcceptKey,

    /// The "Sec-WebSocket-Accept" header does not match the key that was sent.
    #[error("Sec-WebSocket-Accept does not match the request key")]
    InvalidAcceptKey,

    /// The server answered with an extension that was never requested.
    #[error("Server negotiated an extension that was not requested: {0}")]
    UnsupportedExtension(String),

    /// Returned when reading from or writing to a connection that was closed, either by the
    /// peer (end of stream) or locally.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// The stream ended in the middle of a frame header.
    #[error("Truncated frame header")]
    TruncatedHeader,

    /// A received close frame carries a 1-byte payload, a code not allowed on the wire, or a non UTF-8 reason.
    #[error("Invalid close frame")]
    InvalidCloseFrame,

    /// A close code outside of the values an application may send (1000, 3000-4999), or a
    /// reason longer than 123 bytes.
    #[error("Invalid close code")]
    InvalidCloseCode,

    /// Indicates that reserved bits in the WebSocket frame header are set.
    #[error("Reserved bits are not zero")]
    ReservedBitsNotZero,

    /// Occurs when a control frame (ping, pong, or close) is received with the FIN bit
    /// not set. RFC 6455 requires that control frames must not be fragmented.
    #[error("Control frame must not be fragmented")]
    ControlFrameFragmented,

    /// A control frame declared more than 125 bytes of payload.
    #[error("Control frame too large")]
    ControlFrameTooLarge,

    /// A frame declared a payload larger than the configured maximum, or a fragmented
    /// message grew past it. Detected before the offending payload is read.
    #[error("Payload too large")]
    PayloadTooLarge,

    /// Indicates receipt of a frame with an invalid opcode value.
    #[error("Invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// Returned when attempting to establish a WebSocket connection with an invalid URL scheme.
    /// Only "ws://" and "wss://" schemes are valid.
    #[error("Invalid http scheme")]
    InvalidHttpScheme,

    /// The URL does not carry a host.
    #[error("URL has no host")]
    MissingHost,

    /// The facade method is not allowed in the current ready state.
    #[error("Invalid state for {0}")]
    InvalidState(&'static str),

    /// An outgoing message exceeds [`MAX_PAYLOAD_LENGTH`].
    #[error("Message of {0} bytes exceeds the maximum payload length")]
    MessageTooLarge(usize),

    /// The operation was canceled, usually because the socket was closed while connecting
    /// or because the executor was terminated.
    #[error("Operation canceled")]
    Canceled,

    /// A single read or write did not complete within [`IO_TIMEOUT`].
    #[error("I/O operation timed out")]
    Timeout,

    /// Resolving, connecting or negotiating TLS with the remote host failed.
    #[error("Connection to {host} failed: {source}")]
    ConnectionFailed {
        host: String,
        #[source]
        source: std::io::Error,
    },

    /// Wraps errors from URL parsing.
    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    /// Wraps standard I/O errors that may occur during WebSocket communication,
    /// such as connection resets.
    #[error(transparent)]
    IoError(std::io::Error),

    /// Wraps errors from the hyper HTTP library that may occur during the handshake.
    #[error(transparent)]
    HTTPError(#[from] hyper::Error),
}

impl WebSocketError {
    /// Returns the category of this error.
    pub fn kind(&self) -> ErrorKind {
        use WebSocketError::*;

        match self {
            ConnectionFailed { .. } => ErrorKind::ConnectionFailed,
            InvalidStatusCode(_)
            | InvalidUpgradeHeader
            | InvalidConnectionHeader
            | MissingAcceptKey
            | InvalidAcceptKey
            | UnsupportedExtension(_)
            | HTTPError(_) => ErrorKind::HandshakeFailed,
            InvalidFragment
            | InvalidUTF8
            | InvalidContinuationFrame
            | TruncatedHeader
            | InvalidCloseFrame
            | ReservedBitsNotZero
            | ControlFrameFragmented
            | ControlFrameTooLarge
            | PayloadTooLarge
            | InvalidOpCode(_) => ErrorKind::ProtocolViolation,
            ConnectionClosed | Timeout | IoError(_) => ErrorKind::IoFailure,
            Canceled => ErrorKind::Canceled,
            InvalidCloseCode
            | InvalidHttpScheme
            | MissingHost
            | InvalidState(_)
            | MessageTooLarge(_)
            | UrlParseError(_) => ErrorKind::Usage,
        }
    }

    /// Connection reset or aborted by the peer. A request that fails this way on a reused
    /// connection is worth one more attempt on a fresh one.
    pub(crate) fn is_connection_reset(&self) -> bool {
        use std::io::ErrorKind::*;

        match self {
            WebSocketError::IoError(err) => matches!(
                err.kind(),
                ConnectionReset | ConnectionAborted | BrokenPipe | UnexpectedEof
            ),
            WebSocketError::HTTPError(err) => {
                err.is_incomplete_message()
                    || std::error::Error::source(err)
                        .and_then(|source| source.downcast_ref::<std::io::Error>())
                        .is_some_and(|io| matches!(io.kind(), ConnectionReset | ConnectionAborted | BrokenPipe))
            }
            WebSocketError::ConnectionClosed => true,
            _ => false,
        }
    }
}

impl From<std::io::Error> for WebSocketError {
    /// Unwraps errors that [`NetworkStream`] smuggled through the `io::Error` channel
    /// (timeouts, cancellation) back into their own variants.
    fn from(err: std::io::Error) -> Self {
        if !err
            .get_ref()
            .is_some_and(|inner| inner.is::<WebSocketError>())
        {
            return WebSocketError::IoError(err);
        }

        match err.into_inner().map(|inner| inner.downcast::<WebSocketError>()) {
            Some(Ok(inner)) => *inner,
            _ => WebSocketError::ConnectionClosed,
        }
    }
}

impl From<WebSocketError> for std::io::Error {
    fn from(value: WebSocketError) -> Self {
        match value {
            WebSocketError::IoError(err) => err,
            WebSocketError::Timeout => {
                std::io::Error::new(std::io::ErrorKind::TimedOut, WebSocketError::Timeout)
            }
            WebSocketError::Canceled => {
                std::io::Error::new(std::io::ErrorKind::Interrupted, WebSocketError::Canceled)
            }
            other => std::io::Error::new(std::io::ErrorKind::Other, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            WebSocketError::InvalidStatusCode(200).kind(),
            ErrorKind::HandshakeFailed
        );
        assert_eq!(
            WebSocketError::PayloadTooLarge.kind(),
            ErrorKind::ProtocolViolation
        );
        assert_eq!(WebSocketError::Timeout.kind(), ErrorKind::IoFailure);
        assert_eq!(WebSocketError::Canceled.kind(), ErrorKind::Canceled);
        assert_eq!(
            WebSocketError::InvalidState("send").kind(),
            ErrorKind::Usage
        );
        assert_eq!(
            WebSocketError::ConnectionFailed {
                host: "localhost".into(),
                source: std::io::ErrorKind::ConnectionRefused.into(),
            }
            .kind(),
            ErrorKind::ConnectionFailed
        );
    }

    #[test]
    fn test_connection_reset_detection() {
        let reset = WebSocketError::from(std::io::Error::from(
            std::io::ErrorKind::ConnectionReset,
        ));
        assert!(reset.is_connection_reset());

        let refused = WebSocketError::from(std::io::Error::from(
            std::io::ErrorKind::ConnectionRefused,
        ));
        assert!(!refused.is_connection_reset());
        assert!(!WebSocketError::InvalidStatusCode(404).is_connection_reset());
    }

    #[test]
    fn test_io_error_round_trip_keeps_variant() {
        let io = std::io::Error::from(WebSocketError::Timeout);
        assert_eq!(io.kind(), std::io::ErrorKind::TimedOut);
        assert!(matches!(WebSocketError::from(io), WebSocketError::Timeout));

        let io = std::io::Error::from(WebSocketError::Canceled);
        assert!(matches!(WebSocketError::from(io), WebSocketError::Canceled));
    }
}
