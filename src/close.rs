//! # Close
//!
//! Status codes carried by close frames, as listed in
//! [RFC 6455 Section 7.4.1](https://datatracker.ietf.org/doc/html/rfc6455#section-7.4.1),
//! and the [`CloseStatus`] pair (code + optional reason) that travels in a close payload
//! and is reported to [`Application::on_disconnect`](crate::app::Application::on_disconnect).
//!
//! ## Close payload
//!
//! ```text
//! +--------------------+------------------------------+
//! | status (u16, BE)   |  reason (UTF-8, optional)    |
//! +--------------------+------------------------------+
//! ```
//!
//! An empty payload means no status was given. A payload of exactly one byte is a
//! protocol violation.
use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::{frame::MAX_CONTROL_PAYLOAD, ProtocolError};

/// Room left for the reason after the two byte code.
const MAX_REASON_SIZE: usize = MAX_CONTROL_PAYLOAD - 2;

/// Status code used to indicate why an endpoint is closing the WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// 1000: the purpose for which the connection was established has been fulfilled.
    Normal,
    /// 1001: an endpoint is "going away", such as a server going down or a peer
    /// closing its socket without a close frame.
    Away,
    /// 1002: an endpoint is terminating the connection due to a protocol error.
    Protocol,
    /// 1003: an endpoint received a type of data it cannot accept.
    Unsupported,
    /// 1005: reserved, no status code was present. Never sent on the wire.
    Status,
    /// 1006: reserved, the connection was closed abnormally. Never sent on the wire.
    Abnormal,
    /// 1007: received data within a message that was not consistent with its type,
    /// e.g. non-UTF-8 data within a text message.
    Invalid,
    /// 1008: received a message that violates the endpoint policy.
    Policy,
    /// 1009: received a message which is too big to process.
    Size,
    /// 1010: the client expected the server to negotiate an extension.
    Extension,
    /// 1011: the server encountered an unexpected condition.
    Error,
    /// 1012: the server is restarting.
    Restart,
    /// 1013: the server is overloaded, try again later.
    Again,
    /// 1015: TLS handshake failure. Never sent on the wire.
    Tls,
    /// 1004, 1014 and 1016..=2999: reserved for future versions of the protocol.
    Reserved(u16),
    /// 3000..=3999: registered with IANA.
    Iana(u16),
    /// 4000..=4999: private use by applications.
    Library(u16),
    /// Anything below 1000 or above 4999.
    Bad(u16),
}

impl CloseCode {
    /// Returns `true` if the code may legally be sent inside a close frame.
    pub fn is_allowed(self) -> bool {
        !matches!(
            self,
            CloseCode::Bad(_)
                | CloseCode::Reserved(_)
                | CloseCode::Status
                | CloseCode::Abnormal
                | CloseCode::Tls
        )
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::Away,
            1002 => CloseCode::Protocol,
            1003 => CloseCode::Unsupported,
            1005 => CloseCode::Status,
            1006 => CloseCode::Abnormal,
            1007 => CloseCode::Invalid,
            1008 => CloseCode::Policy,
            1009 => CloseCode::Size,
            1010 => CloseCode::Extension,
            1011 => CloseCode::Error,
            1012 => CloseCode::Restart,
            1013 => CloseCode::Again,
            1015 => CloseCode::Tls,
            1004 | 1014 | 1016..=2999 => CloseCode::Reserved(code),
            3000..=3999 => CloseCode::Iana(code),
            4000..=4999 => CloseCode::Library(code),
            _ => CloseCode::Bad(code),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::Status => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::Invalid => 1007,
            CloseCode::Policy => 1008,
            CloseCode::Size => 1009,
            CloseCode::Extension => 1010,
            CloseCode::Error => 1011,
            CloseCode::Restart => 1012,
            CloseCode::Again => 1013,
            CloseCode::Tls => 1015,
            CloseCode::Reserved(code)
            | CloseCode::Iana(code)
            | CloseCode::Library(code)
            | CloseCode::Bad(code) => code,
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u16::from(*self))
    }
}

/// A close code with an optional human readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseStatus {
    pub code: CloseCode,
    pub reason: Option<String>,
}

impl CloseStatus {
    /// Creates a status without a reason.
    pub fn new(code: CloseCode) -> Self {
        Self { code, reason: None }
    }

    /// Attaches a reason to the status.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Decodes the payload of a received close frame.
    ///
    /// # Returns
    /// - `Ok(None)` for an empty payload.
    /// - `Ok(Some(status))` when the payload holds a code and an optional UTF-8 reason.
    /// - `Err(ProtocolError)` with code 1002 for a one-byte payload, or 1007 when the
    ///   reason is not valid UTF-8.
    pub fn parse(payload: &[u8]) -> Result<Option<Self>, ProtocolError> {
        match payload {
            [] => Ok(None),
            [_] => Err(ProtocolError::new(
                CloseCode::Protocol,
                "Non-empty close frame must include status code",
            )),
            [hi, lo, reason @ ..] => {
                let code = CloseCode::from(u16::from_be_bytes([*hi, *lo]));
                let reason = if reason.is_empty() {
                    None
                } else {
                    let reason = std::str::from_utf8(reason)
                        .map_err(|err| ProtocolError::new(CloseCode::Invalid, err.to_string()))?;
                    Some(reason.to_owned())
                };
                Ok(Some(Self { code, reason }))
            }
        }
    }

    /// Serializes the status into a close frame payload.
    ///
    /// Reasons longer than 123 bytes are cut at a character boundary so the payload fits a
    /// control frame.
    pub fn to_payload(&self) -> Bytes {
        let mut reason = self.reason.as_deref().unwrap_or_default();
        if reason.len() > MAX_REASON_SIZE {
            let mut end = MAX_REASON_SIZE;
            while !reason.is_char_boundary(end) {
                end -= 1;
            }
            reason = &reason[..end];
        }
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(u16::from(self.code));
        payload.put_slice(reason.as_bytes());
        payload.freeze()
    }
}

impl From<CloseCode> for CloseStatus {
    fn from(code: CloseCode) -> Self {
        Self::new(code)
    }
}

impl fmt::Display for CloseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            Some(reason) => write!(f, "{} ({})", self.code, reason),
            None => write!(f, "{}", self.code),
        }
    }
}
