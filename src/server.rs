//! The protocol engine.
//!
//! [`Server`] owns the application registry and the session table. It never waits on I/O
//! itself: a driver (the [`EventLoop`](crate::EventLoop), or a test) tells it which
//! connection is ready and the server reads, decodes, dispatches and writes synchronously.
//!
//! Every way a session can end goes through the same path: the close frame (if any) is
//! queued, the session is removed, and only then does the application hear
//! [`Application::on_disconnect`](crate::Application::on_disconnect). The socket is closed
//! once everything queued for it is written, or after [`Options::close_timeout`].
use std::{
    collections::{HashMap, VecDeque},
    fmt, io,
    time::{Duration, Instant},
};

use bytes::BytesMut;
use http::HeaderMap;

use crate::{
    app::{AppId, Application, Command, Context, Message, Registry, Route},
    close::{CloseCode, CloseStatus},
    frame::Frame,
    handshake::{self, Request},
    session::{Action, Session},
    HandshakeError, Result, WebSocketError,
};

/// Default bounded readiness wait.
pub const TICK: Duration = Duration::from_secs(1);

/// Default maximum number of bytes read from a socket at once.
pub const READ_CHUNK: usize = 4096;

/// Default maximum size of a reassembled message: 2 MiB.
pub const MAX_MESSAGE_SIZE: usize = 2 * 1024 * 1024;

/// Default maximum size of an upgrade request: 8 KiB.
pub const MAX_HANDSHAKE_SIZE: usize = 8 * 1024;

/// Default maximum amount of output queued for one session: 8 MiB.
pub const MAX_PENDING_WRITE: usize = 8 * 1024 * 1024;

/// Default time a closed session has to drain its queued output.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Non-blocking byte stream the engine reads from and writes to.
pub trait Connection {
    /// Appends at most `max` bytes to `dst`.
    ///
    /// `Ok(0)` means the peer closed the connection. An error of kind
    /// [`io::ErrorKind::WouldBlock`] means nothing is available right now.
    fn receive(&mut self, dst: &mut BytesMut, max: usize) -> io::Result<usize>;

    /// Queues `src` for writing. Bytes that cannot be written now are kept until the
    /// connection becomes writable again.
    fn send(&mut self, src: &[u8]) -> io::Result<()>;

    /// Writes out anything queued by [`Connection::send`].
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Number of bytes queued by [`Connection::send`] and not written yet.
    fn pending(&self) -> usize {
        0
    }

    /// Closes the connection. Later calls to `send` fail.
    ///
    /// The server only calls this once [`Connection::pending`] is zero, or when the peer
    /// is gone or too slow to take the rest.
    fn close(&mut self);
}

/// Identifier of a live session, unique for the lifetime of a [`Server`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Configuration of a [`Server`] and its [`EventLoop`](crate::EventLoop).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    /// Upper bound on a single readiness wait. The loop wakes up at least this often.
    ///
    /// Default: 1 second, as defined in [`TICK`].
    pub tick: Duration,

    /// Maximum number of bytes read from a socket per readiness event.
    ///
    /// Default: 4096 bytes, as defined in [`READ_CHUNK`].
    pub read_chunk: usize,

    /// Maximum size of a message after reassembly. A client that exceeds it is
    /// disconnected with close code 1009.
    ///
    /// Default: 2 MiB, as defined in [`MAX_MESSAGE_SIZE`].
    pub max_message_size: usize,

    /// Maximum size of the upgrade request head. Larger requests fail the handshake.
    ///
    /// Default: 8 KiB, as defined in [`MAX_HANDSHAKE_SIZE`].
    pub max_handshake_size: usize,

    /// Maximum number of bytes queued for a session whose peer does not read. A send that
    /// would exceed it fails and the session is closed with code 1008.
    ///
    /// Default: 8 MiB, as defined in [`MAX_PENDING_WRITE`].
    pub max_pending_write: usize,

    /// How long a disconnected session may keep its socket open to write out queued
    /// output, including its close frame.
    ///
    /// Default: 5 seconds, as defined in [`CLOSE_TIMEOUT`].
    pub close_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            tick: TICK,
            read_chunk: READ_CHUNK,
            max_message_size: MAX_MESSAGE_SIZE,
            max_handshake_size: MAX_HANDSHAKE_SIZE,
            max_pending_write: MAX_PENDING_WRITE,
            close_timeout: CLOSE_TIMEOUT,
        }
    }
}

impl Options {
    pub fn with_tick(self, tick: Duration) -> Self {
        Self { tick, ..self }
    }

    pub fn with_read_chunk(self, size: usize) -> Self {
        Self {
            read_chunk: size.max(1),
            ..self
        }
    }

    pub fn with_max_message_size(self, size: usize) -> Self {
        Self {
            max_message_size: size,
            ..self
        }
    }

    pub fn with_max_handshake_size(self, size: usize) -> Self {
        Self {
            max_handshake_size: size,
            ..self
        }
    }

    pub fn with_max_pending_write(self, size: usize) -> Self {
        Self {
            max_pending_write: size,
            ..self
        }
    }

    pub fn with_close_timeout(self, timeout: Duration) -> Self {
        Self {
            close_timeout: timeout,
            ..self
        }
    }
}

/// A callback to deliver to an application.
enum Notification<'a> {
    Connect {
        headers: &'a HeaderMap,
        protocol: Option<&'a str>,
    },
    Message(Message),
    Disconnect(Option<CloseStatus>),
}

/// A disconnected session still writing out its queued output.
struct Closing<C> {
    conn: C,
    deadline: Instant,
}

/// WebSocket server engine over connections of type `C`.
pub struct Server<C> {
    registry: Registry,
    sessions: HashMap<SessionId, Session<C>>,
    /// Sockets of ended sessions that still have output queued.
    closing: HashMap<SessionId, Closing<C>>,
    next_id: u64,
    options: Options,
    /// Commands issued by callbacks, run in order after each callback.
    commands: VecDeque<Command>,
}

impl<C: Connection> Default for Server<C> {
    fn default() -> Self {
        Self::new(Options::default())
    }
}

impl<C: Connection> Server<C> {
    pub fn new(options: Options) -> Self {
        Self {
            registry: Registry::default(),
            sessions: HashMap::new(),
            closing: HashMap::new(),
            next_id: 0,
            options,
            commands: VecDeque::new(),
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Registers an application. Applications are tried in registration order.
    pub fn add_application(&mut self, route: Route, app: impl Application) -> Result<AppId> {
        self.registry.register(route, app)
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    /// Ids of the live sessions, in no particular order.
    pub fn sessions(&self) -> impl Iterator<Item = SessionId> + '_ {
        self.sessions.keys().copied()
    }

    /// The live sessions and their connections.
    pub fn connections(&self) -> impl Iterator<Item = (SessionId, &C)> + '_ {
        self.sessions.iter().map(|(id, session)| (*id, &session.conn))
    }

    /// Number of ended sessions whose sockets are still draining queued output.
    pub fn closing_count(&self) -> usize {
        self.closing.len()
    }

    pub(crate) fn closing(&self) -> impl Iterator<Item = (SessionId, &C)> + '_ {
        self.closing.iter().map(|(id, closing)| (*id, &closing.conn))
    }

    /// Runs the opening handshake for a new connection.
    ///
    /// `buf` holds everything read from `conn` so far. It must contain the complete
    /// request head; bytes after the blank line are kept and decoded as frames.
    ///
    /// On success the `101` response is written, the session is registered and the
    /// application's [`on_connect`](Application::on_connect) runs. On failure `conn` is
    /// closed without a response.
    pub fn accept(
        &mut self,
        mut conn: C,
        mut buf: BytesMut,
    ) -> std::result::Result<SessionId, HandshakeError> {
        let (head, negotiated) = match self.handshake(&mut conn, &mut buf) {
            Ok(accepted) => accepted,
            Err(err) => {
                #[cfg(feature = "logging")]
                log::debug!("handshake failed: {err}");
                conn.close();
                return Err(err);
            }
        };

        let id = SessionId::new(self.next_id);
        self.next_id += 1;

        #[cfg(feature = "logging")]
        log::debug!(
            "[{id}] connected to {} (protocol: {:?})",
            head.path,
            negotiated.protocol
        );

        let app = negotiated.app;
        self.sessions.insert(
            id,
            Session::new(conn, app, buf, self.options.max_message_size),
        );
        self.notify(
            app,
            id,
            Notification::Connect {
                headers: &head.headers,
                protocol: negotiated.protocol.as_deref(),
            },
        );

        if self.sessions.get(&id).is_some_and(Session::has_buffered) {
            self.dispatch(id);
        }

        Ok(id)
    }

    fn handshake(
        &self,
        conn: &mut C,
        buf: &mut BytesMut,
    ) -> std::result::Result<(Request, handshake::Negotiated), HandshakeError> {
        let end = handshake::header_end(buf).ok_or_else(|| {
            if buf.len() > self.options.max_handshake_size {
                HandshakeError::RequestTooLarge(self.options.max_handshake_size)
            } else {
                HandshakeError::Incomplete
            }
        })?;
        if end > self.options.max_handshake_size {
            return Err(HandshakeError::RequestTooLarge(
                self.options.max_handshake_size,
            ));
        }

        let head = buf.split_to(end);
        let request = Request::parse(&head)?;
        let negotiated = handshake::negotiate(&request, &self.registry)?;
        conn.send(&negotiated.response)?;

        Ok((request, negotiated))
    }

    /// Reads from the connection of `id` and handles every complete frame.
    ///
    /// A read of zero bytes, or a read error, ends the session with close code 1001 and
    /// no close frame. Protocol errors end it with their own code and message.
    pub fn process(&mut self, id: SessionId) {
        let read_chunk = self.options.read_chunk;
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };

        match session.receive(read_chunk) {
            Ok(0) => self.hang_up(id),
            Ok(_) => self.dispatch(id),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(_err) => {
                #[cfg(feature = "logging")]
                log::debug!("[{id}] receive failed: {_err}");
                self.hang_up(id);
            }
        }
    }

    /// Flushes bytes the connection of `id` could not write earlier.
    ///
    /// A disconnected session is closed once its output is fully written.
    pub fn flush(&mut self, id: SessionId) {
        if let Some(session) = self.sessions.get_mut(&id) {
            if let Err(_err) = session.conn.flush() {
                #[cfg(feature = "logging")]
                log::debug!("[{id}] flush failed: {_err}");
                self.hang_up(id);
            }
            return;
        }

        let Some(closing) = self.closing.get_mut(&id) else {
            return;
        };
        let flushed = closing.conn.flush();
        if flushed.is_err() || closing.conn.pending() == 0 {
            #[cfg(feature = "logging")]
            if let Err(_err) = &flushed {
                log::debug!("[{id}] flush failed while closing: {_err}");
            }
            if let Some(mut closing) = self.closing.remove(&id) {
                closing.conn.close();
            }
        }
    }

    /// Closes the sockets of ended sessions that could not write out their output
    /// before their deadline.
    pub fn close_expired(&mut self, now: Instant) {
        self.closing.retain(|_id, closing| {
            if closing.deadline > now {
                return true;
            }
            #[cfg(feature = "logging")]
            log::debug!(
                "[{_id}] dropping {} bytes of output after close timeout",
                closing.conn.pending()
            );
            closing.conn.close();
            false
        });
    }

    /// Sends a message to a session as one final, unmasked frame.
    ///
    /// # Errors
    /// - [`WebSocketError::UnknownSession`] if `id` is not live.
    /// - [`WebSocketError::PayloadTooLarge`] if the payload exceeds 65535 bytes.
    /// - [`WebSocketError::WriteBufferFull`] if the peer left more than
    ///   [`Options::max_pending_write`] bytes unread. The session is closed with code 1008.
    pub fn send(&mut self, id: SessionId, message: impl Into<Message>) -> Result<()> {
        self.write(id, message.into().into_frame())
    }

    fn write(&mut self, id: SessionId, frame: Frame) -> Result<()> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(WebSocketError::UnknownSession(id))?;

        if session.conn.pending() + frame.payload.len() > self.options.max_pending_write {
            let status = CloseStatus::new(CloseCode::Policy).with_reason("Write buffer full");
            self.disconnect(id, Some(status));
            return Err(WebSocketError::WriteBufferFull(id));
        }

        session.write(frame)
    }

    /// Serializes `data` to JSON and sends it as a text message.
    #[cfg(feature = "json")]
    #[cfg_attr(docsrs, doc(cfg(feature = "json")))]
    pub fn send_json<T: serde::Serialize>(&mut self, id: SessionId, data: &T) -> Result<()> {
        let text = serde_json::to_string(data)?;
        self.send(id, Message::Text(text))
    }

    /// Ends a session.
    ///
    /// Sends a close frame carrying `status` (empty when `None`), closes the socket,
    /// removes the session and calls [`Application::on_disconnect`] with `status`.
    /// Unknown ids are ignored.
    ///
    /// If the socket cannot take everything queued for it yet, it stays open without
    /// being read until the output, close frame last, is written or
    /// [`Options::close_timeout`] expires. The session itself is gone right away.
    pub fn disconnect(&mut self, id: SessionId, status: Option<CloseStatus>) {
        let Some(mut session) = self.sessions.remove(&id) else {
            return;
        };

        // codes that must not appear on the wire go out as an empty close frame
        let wire = status.as_ref().filter(|status| status.code.is_allowed());
        if let Err(_err) = session.write(Frame::close(wire)) {
            #[cfg(feature = "logging")]
            log::debug!("[{id}] could not send close frame: {_err}");
        }
        self.close_connection(id, session.conn);

        #[cfg(feature = "logging")]
        match &status {
            Some(status) => log::debug!("[{id}] disconnected: {status}"),
            None => log::debug!("[{id}] disconnected"),
        }

        self.notify(session.app, id, Notification::Disconnect(status));
    }

    /// Closes `conn` now, or parks it until its queued output is written.
    fn close_connection(&mut self, id: SessionId, mut conn: C) {
        if conn.flush().is_ok() && conn.pending() > 0 {
            let deadline = Instant::now() + self.options.close_timeout;
            self.closing.insert(id, Closing { conn, deadline });
        } else {
            conn.close();
        }
    }

    /// The peer went away without a close frame.
    fn hang_up(&mut self, id: SessionId) {
        let Some(mut session) = self.sessions.remove(&id) else {
            return;
        };
        session.conn.close();

        #[cfg(feature = "logging")]
        log::debug!("[{id}] connection was closed by peer");

        let status = CloseStatus::new(CloseCode::Away).with_reason("Connection was closed");
        self.notify(session.app, id, Notification::Disconnect(Some(status)));
    }

    /// Handles buffered frames, containing protocol errors to this session.
    fn dispatch(&mut self, id: SessionId) {
        if let Err(err) = self.drain(id) {
            #[cfg(feature = "logging")]
            log::debug!("[{id}] protocol error: {err}");
            self.disconnect(id, Some(err.to_status()));
        }
    }

    fn drain(&mut self, id: SessionId) -> std::result::Result<(), crate::ProtocolError> {
        loop {
            let Some(session) = self.sessions.get_mut(&id) else {
                return Ok(());
            };
            let app = session.app;

            match session.next_action()? {
                None => return Ok(()),
                Some(Action::Deliver(message)) => {
                    self.notify(app, id, Notification::Message(message));
                }
                Some(Action::Pong(payload)) => {
                    #[cfg(feature = "logging")]
                    log::trace!("[{id}] ping ({} bytes)", payload.len());
                    if let Err(_err) = self.write(id, Frame::pong(payload)) {
                        #[cfg(feature = "logging")]
                        log::debug!("[{id}] could not send pong: {_err}");
                    }
                }
                Some(Action::Close(status)) => {
                    self.disconnect(id, status);
                    return Ok(());
                }
            }
        }
    }

    fn notify(&mut self, app: AppId, id: SessionId, notification: Notification<'_>) {
        let Some(handler) = self.registry.get_mut(app) else {
            return;
        };

        let mut ctx = Context::new(&mut self.commands);
        match notification {
            Notification::Connect { headers, protocol } => {
                handler.on_connect(&mut ctx, id, headers, protocol)
            }
            Notification::Message(message) => handler.on_message(&mut ctx, id, message),
            Notification::Disconnect(status) => handler.on_disconnect(&mut ctx, id, status),
        }

        self.run_commands();
    }

    fn run_commands(&mut self) {
        while let Some(command) = self.commands.pop_front() {
            match command {
                Command::Send(id, message) => {
                    if let Err(_err) = self.send(id, message) {
                        #[cfg(feature = "logging")]
                        log::debug!("[{id}] dropped message: {_err}");
                    }
                }
                Command::Disconnect(id, status) => self.disconnect(id, status),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{cell::RefCell, collections::VecDeque, io, rc::Rc};

    use bytes::BytesMut;

    use super::Connection;

    #[derive(Debug, Default)]
    struct State {
        inbound: VecDeque<Vec<u8>>,
        outbound: Vec<u8>,
        /// Output the peer has not accepted yet.
        backlog: Vec<u8>,
        stalled: bool,
        eof: bool,
        closed: bool,
    }

    /// In-memory connection. Clones share state so a test can keep a handle after
    /// moving the connection into a server.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct MockConnection(Rc<RefCell<State>>);

    impl MockConnection {
        /// Makes `bytes` available to the next receive.
        pub(crate) fn push(&self, bytes: &[u8]) {
            self.0.borrow_mut().inbound.push_back(bytes.to_vec());
        }

        /// Makes receive return zero bytes once the inbound data is consumed.
        pub(crate) fn hang_up(&self) {
            self.0.borrow_mut().eof = true;
        }

        pub(crate) fn written(&self) -> Vec<u8> {
            self.0.borrow().outbound.clone()
        }

        pub(crate) fn take_written(&self) -> Vec<u8> {
            std::mem::take(&mut self.0.borrow_mut().outbound)
        }

        pub(crate) fn is_closed(&self) -> bool {
            self.0.borrow().closed
        }

        /// Keeps sent bytes in the backlog until [`resume`](Self::resume).
        pub(crate) fn stall(&self) {
            self.0.borrow_mut().stalled = true;
        }

        pub(crate) fn resume(&self) {
            self.0.borrow_mut().stalled = false;
        }
    }

    impl Connection for MockConnection {
        fn receive(&mut self, dst: &mut BytesMut, max: usize) -> io::Result<usize> {
            let mut state = self.0.borrow_mut();
            let Some(chunk) = state.inbound.front_mut() else {
                return if state.eof {
                    Ok(0)
                } else {
                    Err(io::ErrorKind::WouldBlock.into())
                };
            };

            let n = chunk.len().min(max);
            dst.extend_from_slice(&chunk[..n]);
            chunk.drain(..n);
            if chunk.is_empty() {
                state.inbound.pop_front();
            }
            Ok(n)
        }

        fn send(&mut self, src: &[u8]) -> io::Result<()> {
            let mut state = self.0.borrow_mut();
            if state.closed {
                return Err(io::ErrorKind::BrokenPipe.into());
            }
            state.backlog.extend_from_slice(src);
            drop(state);
            self.flush()
        }

        fn flush(&mut self) -> io::Result<()> {
            let mut state = self.0.borrow_mut();
            if !state.stalled {
                let backlog = std::mem::take(&mut state.backlog);
                state.outbound.extend_from_slice(&backlog);
            }
            Ok(())
        }

        fn pending(&self) -> usize {
            self.0.borrow().backlog.len()
        }

        fn close(&mut self) {
            let mut state = self.0.borrow_mut();
            state.backlog.clear();
            state.closed = true;
        }
    }
}
