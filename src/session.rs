use std::io;

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    app::{AppId, Message},
    close::{CloseCode, CloseStatus},
    codec::Codec,
    frame::{Frame, OpCode, MAX_FRAME_PAYLOAD},
    server::Connection,
    ProtocolError, WebSocketError,
};

/// What the server must do after a frame was decoded.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Action {
    /// A message completed and goes to the application.
    Deliver(Message),
    /// A ping arrived, answer with this payload.
    Pong(Bytes),
    /// The client sent a close frame.
    Close(Option<CloseStatus>),
}

/// A message being reassembled from fragments.
struct Fragment {
    opcode: OpCode,
    payload: BytesMut,
}

/// Server side state of one connection after a successful handshake.
pub(crate) struct Session<C> {
    pub(crate) conn: C,
    pub(crate) app: AppId,
    codec: Codec,
    /// Received bytes not consumed by the codec yet.
    read_buf: BytesMut,
    fragment: Option<Fragment>,
    max_message_size: usize,
}

impl<C: Connection> Session<C> {
    /// `read_buf` holds whatever followed the upgrade request in the same read.
    pub(crate) fn new(conn: C, app: AppId, read_buf: BytesMut, max_message_size: usize) -> Self {
        Self {
            conn,
            app,
            codec: Codec::new(),
            read_buf,
            fragment: None,
            max_message_size,
        }
    }

    pub(crate) fn has_buffered(&self) -> bool {
        !self.read_buf.is_empty()
    }

    /// Appends up to `max` bytes from the socket to the read buffer.
    pub(crate) fn receive(&mut self, max: usize) -> io::Result<usize> {
        self.conn.receive(&mut self.read_buf, max)
    }

    /// Decodes buffered frames until one requires action from the server.
    ///
    /// Returns `Ok(None)` once the buffer is exhausted, possibly mid-frame. The partial
    /// frame stays buffered for the next read.
    pub(crate) fn next_action(&mut self) -> Result<Option<Action>, ProtocolError> {
        while let Some(frame) = self.codec.decode(&mut self.read_buf)? {
            if let Some(action) = self.on_frame(frame)? {
                return Ok(Some(action));
            }
        }
        Ok(None)
    }

    fn on_frame(&mut self, frame: Frame) -> Result<Option<Action>, ProtocolError> {
        match frame.opcode {
            OpCode::Continuation => {
                let fragment = self.fragment.as_mut().ok_or_else(|| {
                    ProtocolError::new(CloseCode::Protocol, "No frame to be continued")
                })?;
                if fragment.payload.len() + frame.payload.len() > self.max_message_size {
                    return Err(ProtocolError::new(CloseCode::Size, "Message too large"));
                }
                fragment.payload.extend_from_slice(&frame.payload);

                if frame.fin {
                    self.finalize().map(Some)
                } else {
                    Ok(None)
                }
            }
            OpCode::Text | OpCode::Binary => {
                if self.fragment.is_some() {
                    return Err(ProtocolError::new(
                        CloseCode::Protocol,
                        "Frames must not interleave",
                    ));
                }
                if frame.payload.len() > self.max_message_size {
                    return Err(ProtocolError::new(CloseCode::Size, "Message too large"));
                }
                self.fragment = Some(Fragment {
                    opcode: frame.opcode,
                    payload: BytesMut::from(&frame.payload[..]),
                });

                if frame.fin {
                    self.finalize().map(Some)
                } else {
                    Ok(None)
                }
            }
            OpCode::Close => Ok(Some(Action::Close(CloseStatus::parse(&frame.payload)?))),
            OpCode::Ping => Ok(Some(Action::Pong(frame.payload))),
            OpCode::Pong | OpCode::Reserved(_) => Ok(None),
        }
    }

    /// Turns the open fragment into a message and clears it.
    fn finalize(&mut self) -> Result<Action, ProtocolError> {
        let Some(fragment) = self.fragment.take() else {
            return Err(ProtocolError::new(
                CloseCode::Protocol,
                "No frame to be continued",
            ));
        };
        let payload = fragment.payload.freeze();

        let message = match fragment.opcode {
            OpCode::Text => Message::Text(decode_utf8(payload)?),
            _ => Message::Binary(payload),
        };
        Ok(Action::Deliver(message))
    }

    /// Encodes `frame` and hands it to the connection.
    pub(crate) fn write(&mut self, frame: Frame) -> crate::Result<()> {
        if frame.payload.len() > MAX_FRAME_PAYLOAD {
            return Err(WebSocketError::PayloadTooLarge(frame.payload.len()));
        }

        let mut buf = BytesMut::new();
        self.codec.encode(frame, &mut buf)?;
        self.conn.send(&buf)?;
        Ok(())
    }
}

fn decode_utf8(payload: Bytes) -> Result<String, ProtocolError> {
    #[cfg(feature = "simd")]
    let text = simdutf8::compat::from_utf8(&payload)
        .map_err(|err| ProtocolError::new(CloseCode::Invalid, err.to_string()))?;
    #[cfg(not(feature = "simd"))]
    let text = std::str::from_utf8(&payload)
        .map_err(|err| ProtocolError::new(CloseCode::Invalid, err.to_string()))?;

    Ok(text.to_owned())
}
