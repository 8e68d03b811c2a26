//! Applications and routing.
//!
//! An [`Application`] receives the lifecycle of the sessions routed to it. Every method has
//! a default, so an implementation only overrides what it needs:
//!
//! | Capability | Default |
//! |---|---|
//! | [`Application::accepts_origin`] | accept every origin |
//! | [`Application::choose_protocol`] | reject every sub-protocol offer |
//! | [`Application::on_connect`] | no-op |
//! | [`Application::on_message`] | no-op |
//! | [`Application::on_disconnect`] | no-op |
//!
//! Applications are registered with a [`Route`]. The [`Registry`] keeps them in insertion
//! order and the first application whose route and origin check accept a request wins.
//!
//! Callbacks get a [`Context`] to send messages or disconnect sessions. Those commands run
//! right after the callback returns, in the order they were issued.
use std::collections::VecDeque;

use bytes::Bytes;
use http::HeaderMap;

use crate::{close::CloseStatus, frame::Frame, server::SessionId, WebSocketError};

/// A complete, reassembled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A text message, already validated as UTF-8.
    Text(String),
    /// A binary message.
    Binary(Bytes),
}

impl Message {
    /// Returns the text if this is a text message.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(text) => Some(text),
            Message::Binary(_) => None,
        }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        match self {
            Message::Text(text) => text.len(),
            Message::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Converts into a single, final frame (opcode 1 for text, 2 for binary).
    pub fn into_frame(self) -> Frame {
        match self {
            Message::Text(text) => Frame::text(text),
            Message::Binary(data) => Frame::binary(data),
        }
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Message::Text(text)
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message::Text(text.to_owned())
    }
}

impl From<Bytes> for Message {
    fn from(data: Bytes) -> Self {
        Message::Binary(data)
    }
}

impl From<Vec<u8>> for Message {
    fn from(data: Vec<u8>) -> Self {
        Message::Binary(data.into())
    }
}

/// Deferred work requested by a callback.
#[derive(Debug)]
pub(crate) enum Command {
    Send(SessionId, Message),
    Disconnect(SessionId, Option<CloseStatus>),
}

/// Handle passed to [`Application`] callbacks.
pub struct Context<'a> {
    commands: &'a mut VecDeque<Command>,
}

impl<'a> Context<'a> {
    pub(crate) fn new(commands: &'a mut VecDeque<Command>) -> Self {
        Self { commands }
    }

    /// Queues a message for `id`. Unknown sessions are ignored.
    pub fn send(&mut self, id: SessionId, message: impl Into<Message>) {
        self.commands.push_back(Command::Send(id, message.into()));
    }

    /// Serializes `data` to JSON and queues it as a text message.
    #[cfg(feature = "json")]
    #[cfg_attr(docsrs, doc(cfg(feature = "json")))]
    pub fn send_json<T: serde::Serialize>(
        &mut self,
        id: SessionId,
        data: &T,
    ) -> crate::Result<()> {
        let text = serde_json::to_string(data)?;
        self.send(id, Message::Text(text));
        Ok(())
    }

    /// Queues a disconnect for `id`. See [`Server::disconnect`](crate::Server::disconnect).
    pub fn disconnect(&mut self, id: SessionId, status: Option<CloseStatus>) {
        self.commands.push_back(Command::Disconnect(id, status));
    }
}

/// Capabilities of a WebSocket application.
pub trait Application: 'static {
    /// Decides whether a client from `origin` may connect. `None` when the client sent no
    /// origin header.
    fn accepts_origin(&self, _origin: Option<&str>) -> bool {
        true
    }

    /// Picks one of the sub-protocols offered by the client. Returning `None` fails
    /// the handshake.
    fn choose_protocol(&self, _protocols: &[&str]) -> Option<String> {
        None
    }

    /// A session completed its handshake.
    fn on_connect(
        &mut self,
        _ctx: &mut Context<'_>,
        _id: SessionId,
        _headers: &HeaderMap,
        _protocol: Option<&str>,
    ) {
    }

    /// A complete message arrived.
    fn on_message(&mut self, _ctx: &mut Context<'_>, _id: SessionId, _message: Message) {}

    /// The session is gone. Its socket is already closed.
    ///
    /// `status` is `None` when the peer sent an empty close frame or the server was asked
    /// to disconnect without a code.
    fn on_disconnect(
        &mut self,
        _ctx: &mut Context<'_>,
        _id: SessionId,
        _status: Option<CloseStatus>,
    ) {
    }
}

/// Host and path filters for an application. An absent filter matches anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Route {
    host: Option<String>,
    path: Option<String>,
}

impl Route {
    /// Matches every request.
    pub fn any() -> Self {
        Self::default()
    }

    /// Matches requests whose target is exactly `path`.
    pub fn path(path: impl Into<String>) -> Self {
        Self::any().with_path(path)
    }

    /// Matches requests whose `Host` header is exactly `host`.
    pub fn host(host: impl Into<String>) -> Self {
        Self::any().with_host(host)
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn matches(&self, path: &str, host: Option<&str>) -> bool {
        if let Some(expected) = &self.host {
            if host != Some(expected.as_str()) {
                return false;
            }
        }
        if let Some(expected) = &self.path {
            if path != expected {
                return false;
            }
        }
        true
    }

    fn validate(&self) -> Result<(), WebSocketError> {
        if let Some(host) = &self.host {
            if host.trim().is_empty() {
                return Err(WebSocketError::InvalidRoute("host filter is empty".into()));
            }
        }
        if let Some(path) = &self.path {
            if !path.starts_with('/') {
                return Err(WebSocketError::InvalidRoute(format!(
                    "path filter {path:?} must start with '/'"
                )));
            }
        }
        Ok(())
    }
}

/// Index of a registered application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AppId(usize);

impl AppId {
    #[cfg(test)]
    pub(crate) fn for_tests(index: usize) -> Self {
        Self(index)
    }
}

struct Entry {
    route: Route,
    app: Box<dyn Application>,
}

/// Ordered set of applications. Registration order is match priority.
#[derive(Default)]
pub struct Registry {
    entries: Vec<Entry>,
}

impl Registry {
    /// Appends an application after validating its route.
    pub fn register(
        &mut self,
        route: Route,
        app: impl Application,
    ) -> Result<AppId, WebSocketError> {
        route.validate()?;
        self.entries.push(Entry {
            route,
            app: Box::new(app),
        });
        Ok(AppId(self.entries.len() - 1))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First application whose route matches and which accepts `origin`.
    pub(crate) fn find(&self, path: &str, host: Option<&str>, origin: Option<&str>) -> Option<AppId> {
        self.entries
            .iter()
            .position(|entry| entry.route.matches(path, host) && entry.app.accepts_origin(origin))
            .map(AppId)
    }

    pub(crate) fn choose_protocol(&self, id: AppId, protocols: &[&str]) -> Option<String> {
        self.entries.get(id.0)?.app.choose_protocol(protocols)
    }

    pub(crate) fn get_mut(&mut self, id: AppId) -> Option<&mut (dyn Application + 'static)> {
        self.entries.get_mut(id.0).map(|entry| entry.app.as_mut())
    }
}
