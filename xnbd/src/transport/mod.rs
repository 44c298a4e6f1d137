//! The seam to the asynchronous, connection-oriented messaging library.
//!
//! A [`Transport`] opens one [`TransportSession`] per portal, and a session opens one
//! [`TransportConnection`] per connection index. Everything a connection receives is pushed
//! into its [`EventSink`] and handled on that connection's own reactor thread, in order.
//!
//! Contract for implementors:
//! - `send` never blocks and never calls back synchronously; answers go through the sink.
//! - A [`Response`] carries the [`Request::context`] of the request it answers, unchanged.
//! - Destroying a connection after its session has been destroyed is harmless.

pub mod loopback;
pub mod store;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

/// Opaque per-request state the transport hands back with the answer.
pub type RequestContext = Box<dyn Any + Send>;

pub struct Request {
    /// Encoded command, see [`xnbd_proto::Command`].
    pub header: Bytes,
    /// Outbound bulk data, i.e. the payload of a write.
    pub data: Option<Bytes>,
    /// How much bulk data the answer may carry back.
    pub inbound_len: usize,
    pub context: Option<RequestContext>,
}

pub struct Response {
    /// Encoded answer, see [`xnbd_proto::Reply`].
    pub header: Bytes,
    pub data: Option<Bytes>,
    pub context: Option<RequestContext>,
}

pub enum TransportEvent {
    Response(Response),
    /// The whole session is going away. Terminal.
    SessionTeardown,
    /// Only the receiving connection is going away.
    ConnectionTeardown,
    Disconnected,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("session with {portal:?} refused: {reason}")]
    SessionRefused { portal: String, reason: String },
    #[error("connection {index} refused: {reason}")]
    ConnectRefused { index: usize, reason: String },
    #[error("malformed request: {0}")]
    Malformed(#[from] xnbd_proto::CodecError),
    #[error("closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A failed [`TransportConnection::send`] hands the request back.
pub struct SendError {
    pub request: Request,
    pub error: TransportError,
}

/// Where a transport delivers the events of one connection.
#[derive(Clone)]
pub struct EventSink {
    index: usize,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl EventSink {
    pub(crate) fn new(index: usize, tx: mpsc::UnboundedSender<TransportEvent>) -> Self {
        EventSink { index, tx }
    }

    /// Index of the connection this sink feeds.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Hand an event to the connection's reactor. Gives the event back if the reactor is gone.
    pub fn deliver(&self, event: TransportEvent) -> Result<(), TransportEvent> {
        self.tx.send(event).map_err(|mpsc::error::SendError(event)| event)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub trait Transport: Send + Sync {
    fn create_session(&self, portal: &str) -> Result<Arc<dyn TransportSession>, TransportError>;
}

pub trait TransportSession: Send + Sync {
    /// Establish the connection with the given index. Called on that connection's thread.
    fn connect(
        &self,
        index: usize,
        events: EventSink,
    ) -> Result<Box<dyn TransportConnection>, TransportError>;

    fn destroy(&self);
}

/// Lives on, and is only ever touched by, its connection's reactor thread.
pub trait TransportConnection {
    fn send(&mut self, request: Request) -> Result<(), SendError>;

    fn destroy(self: Box<Self>);
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("header_len", &self.header.len())
            .field("data_len", &self.data.as_ref().map(Bytes::len))
            .field("inbound_len", &self.inbound_len)
            .field("has_context", &self.context.is_some())
            .finish()
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("header_len", &self.header.len())
            .field("data_len", &self.data.as_ref().map(Bytes::len))
            .field("has_context", &self.context.is_some())
            .finish()
    }
}

impl fmt::Debug for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendError")
            .field("request", &self.request)
            .field("error", &self.error)
            .finish()
    }
}
