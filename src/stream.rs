use std::{io, net::SocketAddr};

use bytes::{Buf, BufMut, BytesMut};
use tokio::net::TcpStream;

use crate::server::Connection;

/// A tokio [`TcpStream`] driven without awaiting.
///
/// Reads and writes use the `try_*` methods and never block. Bytes the socket does not
/// accept right away stay in a pending buffer until the [`EventLoop`](crate::EventLoop)
/// sees the socket writable again.
#[derive(Debug)]
pub struct TcpConnection {
    /// `None` once closed.
    stream: Option<TcpStream>,
    peer: Option<SocketAddr>,
    pending: BytesMut,
}

impl TcpConnection {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            peer: stream.peer_addr().ok(),
            stream: Some(stream),
            pending: BytesMut::new(),
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    /// Resolves when the socket may have data. Never resolves once closed.
    pub(crate) async fn readable(&self) -> io::Result<()> {
        match &self.stream {
            Some(stream) => stream.readable().await,
            None => std::future::pending().await,
        }
    }

    /// Resolves when the socket may accept more output. Never resolves once closed.
    pub(crate) async fn writable(&self) -> io::Result<()> {
        match &self.stream {
            Some(stream) => stream.writable().await,
            None => std::future::pending().await,
        }
    }

    fn write_pending(&mut self) -> io::Result<()> {
        let Some(stream) = &self.stream else {
            return Err(io::ErrorKind::NotConnected.into());
        };

        while !self.pending.is_empty() {
            match stream.try_write(&self.pending) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.pending.advance(n),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }
}

impl Connection for TcpConnection {
    fn receive(&mut self, dst: &mut BytesMut, max: usize) -> io::Result<usize> {
        let Some(stream) = &self.stream else {
            return Ok(0);
        };

        dst.reserve(max);
        stream.try_read_buf(&mut (&mut *dst).limit(max))
    }

    fn send(&mut self, src: &[u8]) -> io::Result<()> {
        if self.stream.is_none() {
            return Err(io::ErrorKind::NotConnected.into());
        }

        self.pending.extend_from_slice(src);
        self.write_pending()
    }

    fn flush(&mut self) -> io::Result<()> {
        self.write_pending()
    }

    fn pending(&self) -> usize {
        self.pending.len()
    }

    fn close(&mut self) {
        // last chance for a queued close frame
        if self.stream.is_some() {
            let _ = self.write_pending();
        }
        self.pending.clear();
        self.stream = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    async fn pair() -> (TcpConnection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (TcpConnection::new(server), client)
    }

    #[tokio::test]
    async fn test_receive_respects_limit() {
        let (mut conn, mut client) = pair().await;
        client.write_all(b"abcdefgh").await.unwrap();

        let mut buf = BytesMut::new();
        let mut read = 0;
        while read < 3 {
            conn.readable().await.unwrap();
            match conn.receive(&mut buf, 3 - read) {
                Ok(n) => read += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => panic!("{err}"),
            }
        }
        assert_eq!(&buf[..], b"abc");
    }

    #[tokio::test]
    async fn test_send_and_close() {
        let (mut conn, mut client) = pair().await;
        assert!(conn.peer_addr().is_some());

        conn.send(b"hello").unwrap();
        conn.close();
        assert!(conn.is_closed());
        assert!(conn.send(b"more").is_err());
        assert_eq!(conn.receive(&mut BytesMut::new(), 16).unwrap(), 0);

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hello");
    }

    #[tokio::test]
    async fn test_peer_close_reads_zero() {
        let (mut conn, client) = pair().await;
        drop(client);

        let mut buf = BytesMut::new();
        loop {
            conn.readable().await.unwrap();
            match conn.receive(&mut buf, 16) {
                Ok(n) => {
                    assert_eq!(n, 0);
                    break;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => panic!("{err}"),
            }
        }
    }
}
