//! # Frame
//!
//! WebSocket frames as defined in [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |           (16 bits)           |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |     Masking-key, if MASK set to 1     |     Payload Data      |
//! +---------------------------------------+ - - - - - - - - - - - +
//! :                     Payload Data continued ...                :
//! +---------------------------------------------------------------+
//! ```
//!
//! The engine only speaks the 7-bit and 16-bit length forms. A length code of 127
//! (64-bit length) is rejected by the decoder with close code 1009, and outgoing
//! payloads above 65535 bytes cannot be framed.
//!
//! Client frames always carry a mask, server frames never do. The server never
//! fragments what it sends, so every outgoing frame has the FIN bit set.
use bytes::Bytes;

use crate::close::CloseStatus;

/// Largest payload that fits the 16-bit extended length.
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Largest payload that fits the 7-bit length, and the limit for control frames.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Header size for an outgoing (unmasked) frame: 2 bytes plus a 16-bit length.
pub(crate) const MAX_HEAD_SIZE: usize = 4;

/// WebSocket operation code of a frame.
///
/// The numeric values are defined in [RFC 6455, Section 11.8](https://datatracker.ietf.org/doc/html/rfc6455#section-11.8):
/// - Continuation = 0x0
/// - Text = 0x1
/// - Binary = 0x2
/// - Close = 0x8
/// - Ping = 0x9
/// - Pong = 0xA
///
/// The remaining values (0x3-0x7, 0xB-0xF) are kept as [`OpCode::Reserved`]; frames
/// carrying them are decoded and then ignored, the connection stays open.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    Reserved(u8),
}

impl OpCode {
    /// Returns `true` for `Close`, `Ping` and `Pong`.
    ///
    /// Control frames cannot be fragmented and carry at most 125 bytes.
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

impl From<u8> for OpCode {
    /// Interprets the low nibble of `value`.
    fn from(value: u8) -> Self {
        match value & 0x0F {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            other => Self::Reserved(other),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(val: OpCode) -> Self {
        match val {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
            OpCode::Reserved(value) => value & 0x0F,
        }
    }
}

/// A single wire frame: opcode, FIN flag and (unmasked) payload.
///
/// Frames produced by the decoder have already been unmasked. Frames built with the
/// constructors below are final, unmasked server frames ready for the encoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Indicates if this is the final frame in a message.
    pub fin: bool,
    /// The opcode of the frame, defining its type.
    pub opcode: OpCode,
    /// The payload of the frame.
    pub payload: Bytes,
}

impl Frame {
    pub fn new(fin: bool, opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin,
            opcode,
            payload: payload.into(),
        }
    }

    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Text, payload)
    }

    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Binary, payload)
    }

    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Ping, payload)
    }

    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Pong, payload)
    }

    /// Creates a close frame. Without a status the payload is empty.
    pub fn close(status: Option<&CloseStatus>) -> Self {
        let payload = status.map(CloseStatus::to_payload).unwrap_or_default();
        Self::new(true, OpCode::Close, payload)
    }

    /// Writes the frame header into `head` and returns its size (2 or 4 bytes).
    ///
    /// The mask bit is never set. Callers must ensure the payload fits in
    /// [`MAX_FRAME_PAYLOAD`] bytes.
    pub(crate) fn fmt_head(&self, head: &mut [u8; MAX_HEAD_SIZE]) -> usize {
        head[0] = (self.fin as u8) << 7 | u8::from(self.opcode);

        let len = self.payload.len();
        if len <= MAX_CONTROL_PAYLOAD {
            head[1] = len as u8;
            2
        } else {
            head[1] = 126;
            head[2..4].copy_from_slice(&(len as u16).to_be_bytes());
            4
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::close::CloseCode;

    mod opcode_tests {
        use super::*;

        #[test]
        fn test_is_control() {
            assert!(OpCode::Close.is_control());
            assert!(OpCode::Ping.is_control());
            assert!(OpCode::Pong.is_control());

            assert!(!OpCode::Continuation.is_control());
            assert!(!OpCode::Text.is_control());
            assert!(!OpCode::Binary.is_control());
            assert!(!OpCode::Reserved(0xB).is_control());
        }

        #[test]
        fn test_from_u8() {
            assert_eq!(OpCode::from(0x0), OpCode::Continuation);
            assert_eq!(OpCode::from(0x1), OpCode::Text);
            assert_eq!(OpCode::from(0x2), OpCode::Binary);
            assert_eq!(OpCode::from(0x8), OpCode::Close);
            assert_eq!(OpCode::from(0x9), OpCode::Ping);
            assert_eq!(OpCode::from(0xA), OpCode::Pong);
            for code in [0x3, 0x4, 0x5, 0x6, 0x7, 0xB, 0xC, 0xD, 0xE, 0xF] {
                assert_eq!(OpCode::from(code), OpCode::Reserved(code));
            }
        }

        #[test]
        fn test_to_u8() {
            for code in 0u8..16 {
                assert_eq!(u8::from(OpCode::from(code)), code);
            }
        }
    }

    mod frame_tests {
        use super::*;

        #[test]
        fn test_constructors_are_final() {
            for frame in [
                Frame::text("a"),
                Frame::binary(vec![1u8]),
                Frame::ping("p"),
                Frame::pong("p"),
                Frame::close(None),
            ] {
                assert!(frame.fin);
            }
        }

        #[test]
        fn test_close_payload() {
            let status = CloseStatus::new(CloseCode::Normal).with_reason("done");
            let frame = Frame::close(Some(&status));
            assert_eq!(frame.opcode, OpCode::Close);
            assert_eq!(&frame.payload[..], b"\x03\xE8done");

            assert!(Frame::close(None).payload.is_empty());
        }

        #[test]
        fn test_fmt_head_short() {
            let frame = Frame::text("Header test");
            let mut head = [0u8; MAX_HEAD_SIZE];
            let size = frame.fmt_head(&mut head);

            assert_eq!(size, 2);
            assert_eq!(head[0], 0x81);
            assert_eq!(head[1], 11);
        }

        #[test]
        fn test_fmt_head_boundaries() {
            let mut head = [0u8; MAX_HEAD_SIZE];

            let size = Frame::binary(vec![0u8; 125]).fmt_head(&mut head);
            assert_eq!(size, 2);
            assert_eq!(head[1], 125);

            let size = Frame::binary(vec![0u8; 126]).fmt_head(&mut head);
            assert_eq!(size, 4);
            assert_eq!(head[0], 0x82);
            assert_eq!(head[1], 126);
            assert_eq!(&head[2..4], &[0x00, 0x7E]);

            let size = Frame::binary(vec![0u8; MAX_FRAME_PAYLOAD]).fmt_head(&mut head);
            assert_eq!(size, 4);
            assert_eq!(&head[2..4], &[0xFF, 0xFF]);
        }

        #[test]
        fn test_fmt_head_continuation_not_final() {
            let frame = Frame::new(false, OpCode::Continuation, "x");
            let mut head = [0u8; MAX_HEAD_SIZE];
            frame.fmt_head(&mut head);
            assert_eq!(head[0], 0x00);
        }
    }
}
