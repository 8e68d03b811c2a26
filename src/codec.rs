//! Incremental frame decoding and encoding.
//!
//! Reads from a socket arrive in arbitrary spans: less than one frame, exactly one, or
//! several frames back to back. [`FrameDecoder`] parses a single frame out of whatever is
//! available and reports how many bytes it consumed. [`Codec`] owns the current decoder and
//! works on a `BytesMut` that holds everything not yet consumed, so a partial frame left at
//! the end of one read is completed by the next.
use std::mem;

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec;

use crate::{
    close::CloseCode,
    frame::{Frame, OpCode, MAX_CONTROL_PAYLOAD, MAX_FRAME_PAYLOAD, MAX_HEAD_SIZE},
    ProtocolError,
};

/// Progress of a [`FrameDecoder`].
///
/// The state only moves forward. `WaitLength` is skipped when the 7-bit length is below
/// 126. Once `Done`, the decoder holds a complete frame and consumes nothing more.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    /// Nothing parsed yet.
    New,
    /// Waiting for the two bytes of the 16-bit extended length.
    WaitLength,
    /// Waiting for the mask key and the whole payload.
    WaitPayload,
    /// A complete frame is available.
    Done,
}

/// Decodes one client frame from successive byte spans.
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecodeState,
    fin: bool,
    opcode: OpCode,
    payload_len: usize,
    payload: Bytes,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::New,
            fin: false,
            opcode: OpCode::Continuation,
            payload_len: 0,
            payload: Bytes::new(),
        }
    }

    pub fn state(&self) -> DecodeState {
        self.state
    }

    /// Parses as much of `buf` as the current state allows and returns the number of
    /// bytes consumed.
    ///
    /// The caller must drop the consumed prefix and pass the remaining bytes, extended with
    /// newly received data, on the next call. Each stage only consumes its bytes once they
    /// are all available, so nothing is lost or read twice across calls.
    ///
    /// # Errors
    /// - 1002 if the mask bit is not set, a reserved bit is set, or a control frame is
    ///   fragmented or longer than 125 bytes.
    /// - 1009 if the frame uses a 64-bit payload length.
    pub fn decode(&mut self, buf: &[u8]) -> Result<usize, ProtocolError> {
        let mut offset = 0;

        if self.state == DecodeState::New {
            if buf.len() < 2 {
                return Ok(0);
            }

            self.fin = buf[0] & 0b1000_0000 != 0;
            if buf[0] & 0b0111_0000 != 0 {
                return Err(ProtocolError::new(
                    CloseCode::Protocol,
                    "Reserved bits are not zero",
                ));
            }
            self.opcode = OpCode::from(buf[0]);

            if buf[1] & 0b1000_0000 == 0 {
                return Err(ProtocolError::new(
                    CloseCode::Protocol,
                    "Client must mask frames",
                ));
            }

            let length_code = buf[1] & 0x7F;
            if length_code == 127 {
                return Err(ProtocolError::new(
                    CloseCode::Size,
                    "64-bit payload length not supported",
                ));
            }

            if self.opcode.is_control() {
                if !self.fin {
                    return Err(ProtocolError::new(
                        CloseCode::Protocol,
                        "Control frame must not be fragmented",
                    ));
                }
                if usize::from(length_code) > MAX_CONTROL_PAYLOAD {
                    return Err(ProtocolError::new(
                        CloseCode::Protocol,
                        "Control frame payload too large",
                    ));
                }
            }

            self.payload_len = usize::from(length_code);
            self.state = if length_code < 126 {
                DecodeState::WaitPayload
            } else {
                DecodeState::WaitLength
            };
            offset += 2;
        }

        if self.state == DecodeState::WaitLength {
            if buf.len() - offset < 2 {
                return Ok(offset);
            }

            self.payload_len = usize::from(u16::from_be_bytes([buf[offset], buf[offset + 1]]));
            self.state = DecodeState::WaitPayload;
            offset += 2;
        }

        if self.state == DecodeState::WaitPayload {
            // mask key + payload
            let needed = 4 + self.payload_len;
            if buf.len() - offset < needed {
                return Ok(offset);
            }

            let mask = [
                buf[offset],
                buf[offset + 1],
                buf[offset + 2],
                buf[offset + 3],
            ];
            let mut payload = BytesMut::from(&buf[offset + 4..offset + needed]);
            crate::mask::apply_mask(&mut payload, mask);

            self.payload = payload.freeze();
            self.state = DecodeState::Done;
            offset += needed;
        }

        Ok(offset)
    }

    /// Returns the decoded frame, or `None` if the decoder is not `Done`.
    pub fn into_frame(self) -> Option<Frame> {
        (self.state == DecodeState::Done).then(|| Frame::new(self.fin, self.opcode, self.payload))
    }
}

/// Frame codec for one session.
///
/// Decoding consumes client frames from the session read buffer; encoding writes
/// unmasked, final server frames.
#[derive(Debug, Default)]
pub struct Codec {
    current: FrameDecoder,
}

impl Codec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl codec::Decoder for Codec {
    type Item = Frame;
    type Error = ProtocolError;

    /// Feeds `src` to the current frame decoder and drops the consumed bytes.
    ///
    /// # Returns
    /// - `Ok(Some(Frame))` when a frame completed. A fresh decoder takes over for the
    ///   bytes that follow it.
    /// - `Ok(None)` when `src` ends mid-frame. The unconsumed tail stays in `src`.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let consumed = self.current.decode(&src[..])?;
        src.advance(consumed);

        if self.current.state() != DecodeState::Done {
            return Ok(None);
        }

        Ok(mem::take(&mut self.current).into_frame())
    }
}

impl codec::Encoder<Frame> for Codec {
    type Error = ProtocolError;

    /// Writes the frame header and payload to `dst`.
    ///
    /// # Errors
    /// Close code 1009 when the payload is longer than 65535 bytes.
    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if frame.payload.len() > MAX_FRAME_PAYLOAD {
            return Err(ProtocolError::new(
                CloseCode::Size,
                "64-bit payload length not supported",
            ));
        }

        let mut head = [0; MAX_HEAD_SIZE];
        let size = frame.fmt_head(&mut head);

        dst.reserve(size + frame.payload.len());
        dst.extend_from_slice(&head[..size]);
        dst.extend_from_slice(&frame.payload);

        Ok(())
    }
}

/// Builds the bytes of a masked client frame.
#[cfg(test)]
pub(crate) fn client_frame(fin: bool, opcode: OpCode, payload: &[u8], mask: [u8; 4]) -> Vec<u8> {
    let mut out = vec![(fin as u8) << 7 | u8::from(opcode)];
    if payload.len() < 126 {
        out.push(0x80 | payload.len() as u8);
    } else {
        out.push(0x80 | 126);
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    }
    out.extend_from_slice(&mask);

    let mut masked = payload.to_vec();
    crate::mask::apply_mask(&mut masked, mask);
    out.extend_from_slice(&masked);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::codec::{Decoder as _, Encoder as _};

    const MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

    fn decode_all(bytes: &[u8]) -> Result<Option<Frame>, ProtocolError> {
        let mut codec = Codec::new();
        let mut src = BytesMut::from(bytes);
        codec.decode(&mut src)
    }

    #[test]
    fn test_rfc_masked_hello() {
        // RFC 6455 section 5.7, "A single-frame masked text message"
        let bytes = [
            0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58,
        ];
        let frame = decode_all(&bytes).unwrap().unwrap();
        assert!(frame.fin);
        assert_eq!(frame.opcode, OpCode::Text);
        assert_eq!(&frame.payload[..], b"Hello");
    }

    #[test]
    fn test_data_frames_decode_exactly() {
        for opcode in [OpCode::Text, OpCode::Binary] {
            for len in [0usize, 1, 125, 126, 500] {
                let payload: Vec<u8> = (0..len).map(|i| b'a' + (i % 26) as u8).collect();
                let bytes = client_frame(true, opcode, &payload, MASK);

                let mut src = BytesMut::from(&bytes[..]);
                let frame = Codec::new().decode(&mut src).unwrap().unwrap();

                assert_eq!(frame.opcode, opcode, "len {len}");
                assert_eq!(&frame.payload[..], &payload[..], "len {len}");
                assert!(src.is_empty());
            }
        }
    }

    #[test]
    fn test_incremental_every_split() {
        let payload: Vec<u8> = (0..300).map(|i| i as u8).collect();
        let bytes = client_frame(false, OpCode::Binary, &payload, MASK);
        let expected = decode_all(&bytes).unwrap().unwrap();

        for split in 0..=bytes.len() {
            let mut codec = Codec::new();
            let mut src = BytesMut::from(&bytes[..split]);
            let first = codec.decode(&mut src).unwrap();

            src.extend_from_slice(&bytes[split..]);
            let frame = match first {
                Some(frame) => frame,
                None => codec.decode(&mut src).unwrap().unwrap(),
            };

            assert_eq!(frame, expected, "split at {split}");
            assert!(src.is_empty());
        }
    }

    #[test]
    fn test_incremental_byte_by_byte() {
        let bytes = client_frame(true, OpCode::Text, "fragmented input".as_bytes(), MASK);

        let mut codec = Codec::new();
        let mut src = BytesMut::new();
        let mut frames = Vec::new();
        for byte in &bytes {
            src.extend_from_slice(&[*byte]);
            if let Some(frame) = codec.decode(&mut src).unwrap() {
                frames.push(frame);
            }
        }

        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].payload[..], b"fragmented input");
    }

    #[test]
    fn test_concatenated_frames_keep_tail() {
        let mut bytes = client_frame(true, OpCode::Text, b"one", MASK);
        bytes.extend(client_frame(true, OpCode::Binary, b"two", MASK));
        let third = client_frame(true, OpCode::Text, b"three", MASK);
        bytes.extend_from_slice(&third[..4]);

        let mut codec = Codec::new();
        let mut src = BytesMut::from(&bytes[..]);

        assert_eq!(&codec.decode(&mut src).unwrap().unwrap().payload[..], b"one");
        assert_eq!(&codec.decode(&mut src).unwrap().unwrap().payload[..], b"two");
        assert!(codec.decode(&mut src).unwrap().is_none());

        src.extend_from_slice(&third[4..]);
        assert_eq!(&codec.decode(&mut src).unwrap().unwrap().payload[..], b"three");
        assert!(src.is_empty());
    }

    #[test]
    fn test_state_transitions() {
        let payload = vec![7u8; 200];
        let bytes = client_frame(true, OpCode::Binary, &payload, MASK);
        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.state(), DecodeState::New);

        assert_eq!(decoder.decode(&bytes[..3]).unwrap(), 2);
        assert_eq!(decoder.state(), DecodeState::WaitLength);

        assert_eq!(decoder.decode(&bytes[2..6]).unwrap(), 2);
        assert_eq!(decoder.state(), DecodeState::WaitPayload);

        assert_eq!(decoder.decode(&bytes[4..10]).unwrap(), 0);
        assert_eq!(decoder.state(), DecodeState::WaitPayload);

        assert_eq!(decoder.decode(&bytes[4..]).unwrap(), bytes.len() - 4);
        assert_eq!(decoder.state(), DecodeState::Done);

        // a finished decoder is never reused
        assert_eq!(decoder.decode(&bytes).unwrap(), 0);
        assert_eq!(&decoder.into_frame().unwrap().payload[..], &payload[..]);
    }

    #[test]
    fn test_short_frame_skips_wait_length() {
        let bytes = client_frame(true, OpCode::Text, b"hi", MASK);
        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.decode(&bytes[..2]).unwrap(), 2);
        assert_eq!(decoder.state(), DecodeState::WaitPayload);
        assert!(FrameDecoder::new().into_frame().is_none());
    }

    #[test]
    fn test_unmasked_frame_rejected() {
        let err = decode_all(&[0x81, 0x02, b'h', b'i']).unwrap_err();
        assert_eq!(err.code, CloseCode::Protocol);
    }

    #[test]
    fn test_64bit_length_rejected() {
        let err = decode_all(&[0x82, 0x80 | 127]).unwrap_err();
        assert_eq!(err.code, CloseCode::Size);
    }

    #[test]
    fn test_reserved_bits_rejected() {
        let err = decode_all(&[0xC1, 0x80]).unwrap_err();
        assert_eq!(err.code, CloseCode::Protocol);
    }

    #[test]
    fn test_control_frame_constraints() {
        let bytes = client_frame(false, OpCode::Ping, b"p", MASK);
        assert_eq!(decode_all(&bytes).unwrap_err().code, CloseCode::Protocol);

        let bytes = client_frame(true, OpCode::Ping, &[0u8; 126], MASK);
        assert_eq!(decode_all(&bytes).unwrap_err().code, CloseCode::Protocol);
    }

    #[test]
    fn test_reserved_opcode_decoded() {
        let bytes = client_frame(true, OpCode::Reserved(0x3), b"?", MASK);
        let frame = decode_all(&bytes).unwrap().unwrap();
        assert_eq!(frame.opcode, OpCode::Reserved(0x3));
    }

    #[test]
    fn test_encode_short_and_extended() {
        let mut codec = Codec::new();
        let mut dst = BytesMut::new();
        codec.encode(Frame::text("Hello"), &mut dst).unwrap();
        assert_eq!(&dst[..], b"\x81\x05Hello");

        let mut dst = BytesMut::new();
        codec.encode(Frame::binary(vec![9u8; 300]), &mut dst).unwrap();
        assert_eq!(&dst[..4], &[0x82, 126, 0x01, 0x2C]);
        assert_eq!(dst.len(), 304);
    }

    #[test]
    fn test_encode_too_large() {
        let mut dst = BytesMut::new();
        let err = Codec::new()
            .encode(Frame::binary(vec![0u8; MAX_FRAME_PAYLOAD + 1]), &mut dst)
            .unwrap_err();
        assert_eq!(err.code, CloseCode::Size);
        assert!(dst.is_empty());
    }
}
