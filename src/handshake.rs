//! Opening handshake, server side ([RFC 6455 Section 4.2](https://datatracker.ietf.org/doc/html/rfc6455#section-4.2)).
//!
//! The negotiator runs once per accepted socket:
//!
//! 1. [`Request::parse`] reads the request line (`GET <path> HTTP/1.1`, case-insensitive)
//!    and the `Name: value` header lines. When a header repeats, the last one wins.
//! 2. [`Request::validate`] checks `Connection`, `Upgrade`, `Sec-WebSocket-Key` and
//!    `Sec-WebSocket-Version` (8 or 13).
//! 3. [`negotiate`] routes the request through the [`Registry`], lets the matched
//!    application pick a sub-protocol, and builds the `101 Switching Protocols` response
//!    carrying [`accept_key`].
//!
//! Any failure is a [`HandshakeError`]: the socket is closed without a response and no
//! application ever hears about it.
use base64::prelude::*;
use bytes::Bytes;
use http::{
    header::{
        CONNECTION, HOST, ORIGIN, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL,
        SEC_WEBSOCKET_VERSION, UPGRADE,
    },
    HeaderMap, HeaderName, HeaderValue,
};
use nom::{
    bytes::complete::{tag, tag_no_case, take_till1},
    character::complete::{space0, space1},
    combinator::{all_consuming, rest},
    sequence::{delimited, separated_pair},
    IResult, Parser,
};
use sha1::{Digest, Sha1};

use crate::{
    app::{AppId, Registry},
    HandshakeError,
};

/// GUID appended to the client key before hashing.
const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Legacy origin header sent by version 8 clients.
const SEC_WEBSOCKET_ORIGIN: HeaderName = HeaderName::from_static("sec-websocket-origin");

/// Computes the `Sec-WebSocket-Accept` value: `base64(SHA-1(key + GUID))`.
pub fn accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(WEBSOCKET_GUID.as_bytes());
    let result = sha1.finalize();
    BASE64_STANDARD.encode(&result[..])
}

/// Returns the length of the request head including its terminating blank line, or `None`
/// if the blank line has not arrived yet.
pub fn header_end(buf: &[u8]) -> Option<usize> {
    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some(pos + 4);
    }
    buf.windows(2).position(|w| w == b"\n\n").map(|pos| pos + 2)
}

/// A parsed upgrade request.
#[derive(Debug, Clone)]
pub struct Request {
    /// The request target, exactly as sent.
    pub path: String,
    /// All request headers. Names are case-insensitive.
    pub headers: HeaderMap,
}

impl Request {
    /// Parses the request head (request line and headers, up to the blank line).
    pub fn parse(head: &[u8]) -> Result<Self, HandshakeError> {
        if !head.is_ascii() {
            return Err(HandshakeError::InvalidEncoding);
        }
        let text = std::str::from_utf8(head).map_err(|_| HandshakeError::InvalidEncoding)?;

        let mut lines = text.lines();
        let (_, path) = lines
            .next()
            .ok_or(HandshakeError::InvalidRequestLine)
            .and_then(|line| request_line(line).map_err(|_| HandshakeError::InvalidRequestLine))?;

        let mut headers = HeaderMap::new();
        for line in lines.take_while(|line| !line.is_empty()) {
            let (_, (name, value)) =
                header_line(line).map_err(|_| HandshakeError::MalformedHeader(line.to_owned()))?;

            let name = HeaderName::from_bytes(name.trim().as_bytes())
                .map_err(|_| HandshakeError::MalformedHeader(line.to_owned()))?;
            let value = HeaderValue::from_str(value.trim_end())
                .map_err(|_| HandshakeError::MalformedHeader(line.to_owned()))?;

            // insert replaces, so the last occurrence wins
            headers.insert(name, value);
        }

        Ok(Self {
            path: path.to_owned(),
            headers,
        })
    }

    /// Returns a header value as text.
    pub fn header(&self, name: impl http::header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn host(&self) -> Option<&str> {
        self.header(HOST)
    }

    /// `Sec-WebSocket-Origin` if present, else `Origin`.
    pub fn origin(&self) -> Option<&str> {
        self.header(SEC_WEBSOCKET_ORIGIN)
            .or_else(|| self.header(ORIGIN))
    }

    /// Sub-protocols offered in `Sec-WebSocket-Protocol`, in client order.
    ///
    /// Returns `None` when the header is absent or blank.
    pub fn protocols(&self) -> Option<Vec<&str>> {
        let offered = self.header(SEC_WEBSOCKET_PROTOCOL)?;
        if offered.trim().is_empty() {
            return None;
        }
        Some(
            offered
                .split(',')
                .map(str::trim)
                .filter(|protocol| !protocol.is_empty())
                .collect(),
        )
    }

    /// Checks the upgrade headers and returns the client key.
    pub fn validate(&self) -> Result<&str, HandshakeError> {
        let connection = self
            .header(CONNECTION)
            .ok_or(HandshakeError::InvalidConnectionHeader)?;
        if !connection.to_ascii_lowercase().contains("upgrade") {
            return Err(HandshakeError::InvalidConnectionHeader);
        }

        if self.header(UPGRADE) != Some("websocket") {
            return Err(HandshakeError::InvalidUpgradeHeader);
        }

        let key = self
            .header(SEC_WEBSOCKET_KEY)
            .filter(|key| !key.is_empty())
            .ok_or(HandshakeError::MissingSecWebSocketKey)?;

        match self.header(SEC_WEBSOCKET_VERSION).map(str::trim) {
            Some("8") | Some("13") => Ok(key),
            other => Err(HandshakeError::UnsupportedVersion(other.map(str::to_owned))),
        }
    }
}

/// `GET <path> HTTP/1.1`, returns the path.
fn request_line(input: &str) -> IResult<&str, &str> {
    all_consuming(delimited(
        (tag_no_case("GET"), space1),
        take_till1(|c: char| c == ' '),
        (space1, tag_no_case("HTTP/1.1"), space0),
    ))
    .parse(input)
}

/// `Name: value`, split on the first colon.
fn header_line(input: &str) -> IResult<&str, (&str, &str)> {
    separated_pair(take_till1(|c: char| c == ':'), (tag(":"), space0), rest).parse(input)
}

/// Outcome of a successful negotiation.
#[derive(Debug)]
pub(crate) struct Negotiated {
    /// The application that will own the session.
    pub(crate) app: AppId,
    /// The sub-protocol chosen by the application, if the client offered any.
    pub(crate) protocol: Option<String>,
    /// The complete `101 Switching Protocols` response.
    pub(crate) response: Bytes,
}

/// Validates `request`, picks the application and sub-protocol, and builds the response.
pub(crate) fn negotiate(request: &Request, registry: &Registry) -> Result<Negotiated, HandshakeError> {
    let key = request.validate()?;

    let app = registry
        .find(&request.path, request.host(), request.origin())
        .ok_or(HandshakeError::NoApplication)?;

    let protocol = match request.protocols() {
        Some(offered) => {
            let chosen = registry
                .choose_protocol(app, &offered)
                .filter(|protocol| !protocol.is_empty())
                .ok_or(HandshakeError::NoSuitableProtocol)?;
            Some(chosen)
        }
        None => None,
    };

    Ok(Negotiated {
        app,
        response: response(&accept_key(key), protocol.as_deref()),
        protocol,
    })
}

/// Builds the `101 Switching Protocols` response.
pub fn response(accept: &str, protocol: Option<&str>) -> Bytes {
    let mut response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n"
    );
    if let Some(protocol) = protocol {
        response.push_str(&format!("Sec-WebSocket-Protocol: {protocol}\r\n"));
    }
    response.push_str("\r\n");
    Bytes::from(response)
}
