//! Readiness loop driving a [`Server`] over TCP.
//!
//! One task waits on the listener, on every socket still sending its upgrade request and
//! on every session socket at once. Whatever is ready when the wait ends is serviced in
//! turn, synchronously. The wait is bounded by [`Options::tick`], so the loop wakes up
//! even when nothing happens.
use std::{collections::HashMap, io, net::SocketAddr, time::Instant};

use bytes::{BufMut, BytesMut};
use futures::{
    future::{select_all, LocalBoxFuture},
    FutureExt,
};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use crate::{
    handshake,
    server::{Connection, Options, Server, SessionId},
    stream::TcpConnection,
};

/// A socket whose upgrade request has not fully arrived.
struct PendingHandshake {
    stream: TcpStream,
    request: BytesMut,
    #[cfg_attr(not(feature = "logging"), allow(dead_code))]
    peer: SocketAddr,
}

/// Something that became ready during a wait.
enum Ready {
    Accepted(io::Result<(TcpStream, SocketAddr)>),
    Handshake(u64),
    Readable(SessionId),
    Writable(SessionId),
}

/// Accepts WebSocket connections and feeds their traffic to a [`Server`].
///
/// Run it on a current-thread runtime: nothing in here is `Send`, and a single task
/// services every connection.
pub struct EventLoop {
    listener: TcpListener,
    server: Server<TcpConnection>,
    pending: HashMap<u64, PendingHandshake>,
    next_pending: u64,
}

impl EventLoop {
    /// Listens on `addr`.
    pub async fn bind(addr: impl ToSocketAddrs, options: Options) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self::from_listener(listener, options))
    }

    pub fn from_listener(listener: TcpListener, options: Options) -> Self {
        #[cfg(feature = "logging")]
        if let Ok(addr) = listener.local_addr() {
            log::info!("listening on {addr}");
        }

        Self {
            listener,
            server: Server::new(options),
            pending: HashMap::new(),
            next_pending: 0,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn server(&self) -> &Server<TcpConnection> {
        &self.server
    }

    /// Use this to register applications and to send from outside a callback.
    pub fn server_mut(&mut self) -> &mut Server<TcpConnection> {
        &mut self.server
    }

    /// Runs forever.
    pub async fn run(&mut self) {
        loop {
            self.turn().await;
        }
    }

    /// Waits once, for at most one tick, and services everything that became ready.
    pub async fn turn(&mut self) {
        let ready = self.wait().await;
        for event in ready {
            self.service(event);
        }
        self.server.close_expired(Instant::now());
    }

    async fn wait(&self) -> Vec<Ready> {
        let mut waits: Vec<LocalBoxFuture<'_, Ready>> = Vec::new();

        waits.push(async { Ready::Accepted(self.listener.accept().await) }.boxed_local());

        for (key, pending) in &self.pending {
            let key = *key;
            waits.push(
                async move {
                    let _ = pending.stream.readable().await;
                    Ready::Handshake(key)
                }
                .boxed_local(),
            );
        }

        for (id, conn) in self.server.connections() {
            waits.push(
                async move {
                    let _ = conn.readable().await;
                    Ready::Readable(id)
                }
                .boxed_local(),
            );
            if conn.pending() > 0 {
                waits.push(
                    async move {
                        let _ = conn.writable().await;
                        Ready::Writable(id)
                    }
                    .boxed_local(),
                );
            }
        }

        // ended sessions are only written to
        for (id, conn) in self.server.closing() {
            waits.push(
                async move {
                    let _ = conn.writable().await;
                    Ready::Writable(id)
                }
                .boxed_local(),
            );
        }

        let tick = self.server.options().tick;
        let Ok((first, _, rest)) = tokio::time::timeout(tick, select_all(waits)).await else {
            return Vec::new();
        };

        // collect whatever else is ready without waiting again
        let mut ready = vec![first];
        ready.extend(rest.into_iter().filter_map(FutureExt::now_or_never));
        ready
    }

    fn service(&mut self, event: Ready) {
        match event {
            Ready::Accepted(Ok((stream, peer))) => {
                #[cfg(feature = "logging")]
                log::debug!("new connection from {peer}");

                let key = self.next_pending;
                self.next_pending += 1;
                self.pending.insert(
                    key,
                    PendingHandshake {
                        stream,
                        request: BytesMut::new(),
                        peer,
                    },
                );
            }
            Ready::Accepted(Err(_err)) => {
                #[cfg(feature = "logging")]
                log::error!("accept failed: {_err}");
            }
            Ready::Handshake(key) => self.read_handshake(key),
            Ready::Readable(id) => self.server.process(id),
            Ready::Writable(id) => self.server.flush(id),
        }
    }

    /// Buffers the upgrade request of a pending socket and hands it to the server once the
    /// blank line arrived.
    fn read_handshake(&mut self, key: u64) {
        let options = *self.server.options();
        let Some(pending) = self.pending.get_mut(&key) else {
            return;
        };

        pending.request.reserve(options.read_chunk);
        let read = pending
            .stream
            .try_read_buf(&mut (&mut pending.request).limit(options.read_chunk));

        match read {
            Ok(0) => {
                #[cfg(feature = "logging")]
                log::debug!(
                    "{}: {}",
                    pending.peer,
                    crate::HandshakeError::ConnectionClosed
                );
                self.pending.remove(&key);
                return;
            }
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
            Err(_err) => {
                #[cfg(feature = "logging")]
                log::debug!("{}: handshake read failed: {_err}", pending.peer);
                self.pending.remove(&key);
                return;
            }
        }

        if handshake::header_end(&pending.request).is_none() {
            if pending.request.len() > options.max_handshake_size {
                #[cfg(feature = "logging")]
                log::debug!(
                    "{}: {}",
                    pending.peer,
                    crate::HandshakeError::RequestTooLarge(options.max_handshake_size)
                );
                self.pending.remove(&key);
            }
            return;
        }

        let Some(pending) = self.pending.remove(&key) else {
            return;
        };
        match self
            .server
            .accept(TcpConnection::new(pending.stream), pending.request)
        {
            Ok(_id) => {
                #[cfg(feature = "logging")]
                log::debug!("{}: upgraded to session {_id}", pending.peer);
            }
            Err(_err) => {
                #[cfg(feature = "logging")]
                log::warn!("{}: rejected upgrade: {_err}", pending.peer);
            }
        }
    }
}
