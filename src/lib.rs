//! # wsmux
//! A WebSocket endpoint (server role, RFC 6455) that multiplexes many connections over a
//! single-threaded readiness loop, without one task or thread per connection.
//!
//! The crate is split into a synchronous protocol engine and a thin tokio driver:
//!
//! - [`codec`]: incremental frame decoder/encoder. Undecoded bytes are retained between reads.
//! - [`handshake`]: parses and validates the HTTP upgrade request and builds the `101` response.
//! - [`app`]: the [`Application`] trait and the ordered registry that routes connections by
//!   host, path, origin and sub-protocol.
//! - [`Server`]: owns the registry and the session table. Reassembles fragmented messages,
//!   answers pings, and runs the close handshake.
//! - [`EventLoop`]: waits for readiness over the listener and every session socket with a
//!   bounded tick, and feeds whatever became ready into the [`Server`].
//!
//! # Features
//!
//! - `logging`: enables connection and frame logging through the `log` crate.
//! - `simd`: validates UTF-8 text messages with `simdutf8`.
//! - `json`: enables [`Server::send_json`] and [`app::Context::send_json`].
//!
//! # Example
//! ```no_run
//! use wsmux::{app::{Application, Context, Message, Route}, EventLoop, Options, SessionId};
//!
//! struct Echo;
//!
//! impl Application for Echo {
//!     fn on_message(&mut self, ctx: &mut Context<'_>, id: SessionId, message: Message) {
//!         ctx.send(id, message);
//!     }
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> wsmux::Result<()> {
//!     let mut event_loop = EventLoop::bind("127.0.0.1:8080", Options::default()).await?;
//!     event_loop.server_mut().add_application(Route::path("/echo"), Echo)?;
//!     event_loop.run().await;
//!     Ok(())
//! }
//! ```
//!
//! # Limits
//! - Payload lengths use the 7-bit or 16-bit forms only. A 64-bit length from a client
//!   closes the session with code 1009.
//! - No extensions (no permessage-deflate) and no TLS.
//! - Idle connections are never timed out.

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod app;
pub mod close;
pub mod codec;
pub mod frame;
pub mod handshake;
mod event_loop;
mod mask;
mod server;
mod session;
mod stream;

use std::borrow::Cow;

use thiserror::Error;

pub use app::{Application, Message, Route};
pub use close::{CloseCode, CloseStatus};
pub use event_loop::EventLoop;
pub use frame::{Frame, OpCode};
pub use server::{
    Connection, Options, Server, SessionId, CLOSE_TIMEOUT, MAX_HANDSHAKE_SIZE, MAX_MESSAGE_SIZE,
    MAX_PENDING_WRITE, READ_CHUNK, TICK,
};
pub use stream::TcpConnection;

/// A result type for WebSocket operations, using `WebSocketError` as the error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Errors returned by the public API of the engine.
///
/// Protocol violations committed by a client never surface here while the event loop is
/// running: they are contained to the offending session and reported through
/// [`Application::on_disconnect`].
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// The upgrade request could not be accepted.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// A session violated the protocol.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// No live session has this id.
    #[error("Unknown session {0}")]
    UnknownSession(SessionId),

    /// An application route was rejected at registration time.
    #[error("Invalid application route: {0}")]
    InvalidRoute(String),

    /// The peer stopped reading and too much output is queued. The session was closed.
    #[error("Write buffer of session {0} is full")]
    WriteBufferFull(SessionId),

    /// The payload does not fit a 16-bit frame length.
    #[error("Payload of {0} bytes is too large for a single frame")]
    PayloadTooLarge(usize),

    /// Wraps standard I/O errors from the listener or the sockets.
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// Occurs when serialization of JSON data fails.
    /// Only available when the `json` feature is enabled.
    #[cfg(feature = "json")]
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Reasons for failing the opening handshake.
///
/// A failed handshake closes the new socket without writing any WebSocket response and
/// is never reported to an application.
#[derive(Error, Debug)]
pub enum HandshakeError {
    /// The blank line ending the request head has not arrived yet.
    #[error("Incomplete upgrade request")]
    Incomplete,

    #[error("Upgrade request exceeds {0} bytes")]
    RequestTooLarge(usize),

    #[error("Upgrade request is not ASCII text")]
    InvalidEncoding,

    #[error("Invalid HTTP request")]
    InvalidRequestLine,

    #[error("Malformed HTTP header: {0}")]
    MalformedHeader(String),

    /// The "Connection" header is missing or does not contain "upgrade".
    #[error("Invalid connection header")]
    InvalidConnectionHeader,

    /// The "Upgrade" header is missing or not "websocket".
    #[error("Invalid upgrade header")]
    InvalidUpgradeHeader,

    #[error("Sec-WebSocket-Key header is missing")]
    MissingSecWebSocketKey,

    /// "Sec-WebSocket-Version" is not 8 or 13.
    #[error("Version {} not supported", .0.as_deref().unwrap_or("(none)"))]
    UnsupportedVersion(Option<String>),

    #[error("No application available")]
    NoApplication,

    #[error("No suitable protocol")]
    NoSuitableProtocol,

    /// The peer closed the socket before the request was complete.
    #[error("Connection closed during handshake")]
    ConnectionClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A protocol violation committed by one session.
///
/// Carries the close code sent back to the peer and reported to the application.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} (close code {code})")]
pub struct ProtocolError {
    pub code: CloseCode,
    pub message: Cow<'static, str>,
}

impl ProtocolError {
    pub fn new(code: CloseCode, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The status delivered to the peer and to [`Application::on_disconnect`].
    pub fn to_status(&self) -> CloseStatus {
        CloseStatus::new(self.code).with_reason(self.message.clone())
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        Self::new(CloseCode::Error, err.to_string())
    }
}
