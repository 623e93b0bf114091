//! Error types.

use core::fmt;
use std::io;

use bytes::Bytes;

/// Transport-level errors.
#[derive(Debug)]
pub enum TransportError {
    /// The transport has been closed.
    Closed,
    /// An I/O error from the underlying byte stream.
    Io(io::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "transport closed"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Malformed frame errors.
///
/// A frame that cannot be parsed is a protocol violation and closes the
/// connection. Unknown ids are not protocol errors; they are dropped by the
/// dispatcher without touching this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// The frame ended before the named field.
    Truncated(&'static str),
    /// A NUL-terminated string was not valid modified UTF-8.
    MalformedString,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated(what) => write!(f, "frame truncated reading {what}"),
            Self::MalformedString => write!(f, "malformed protocol string"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Terminal condition pushed into a byte input.
///
/// Each variant maps onto a stable `io::ErrorKind` so that a consumer blocked
/// in a read can tell why its input was cut short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamBreak {
    /// The peer aborted the request feeding this input.
    Aborted,
    /// The peer aborted an in-flight exception reply.
    ReplyAborted,
    /// The peer signalled a stream-level exception.
    RemoteException,
    /// The connection went away underneath the input.
    ConnectionClosed,
}

impl StreamBreak {
    /// The `io::ErrorKind` a consumer observes for this break.
    pub fn io_kind(self) -> io::ErrorKind {
        match self {
            Self::Aborted => io::ErrorKind::Interrupted,
            Self::ReplyAborted => io::ErrorKind::ConnectionAborted,
            Self::RemoteException => io::ErrorKind::BrokenPipe,
            Self::ConnectionClosed => io::ErrorKind::ConnectionReset,
        }
    }

    /// Recover the break from an `io::ErrorKind`, if it is one of ours.
    pub fn from_io_kind(kind: io::ErrorKind) -> Option<Self> {
        match kind {
            io::ErrorKind::Interrupted => Some(Self::Aborted),
            io::ErrorKind::ConnectionAborted => Some(Self::ReplyAborted),
            io::ErrorKind::BrokenPipe => Some(Self::RemoteException),
            io::ErrorKind::ConnectionReset => Some(Self::ConnectionClosed),
            _ => None,
        }
    }

    pub fn to_io_error(self) -> io::Error {
        io::Error::new(self.io_kind(), self.to_string())
    }
}

impl fmt::Display for StreamBreak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aborted => write!(f, "request aborted"),
            Self::ReplyAborted => write!(f, "reply exception was aborted"),
            Self::RemoteException => write!(f, "remote stream exception"),
            Self::ConnectionClosed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for StreamBreak {}

/// Errors from the marshalling collaborator.
#[derive(Debug, Clone)]
pub enum MarshalError {
    /// The byte input failed underneath the decoder.
    Io { kind: io::ErrorKind, message: String },
    /// The bytes did not form a valid object.
    Corrupt(String),
}

impl fmt::Display for MarshalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { kind, message } => write!(f, "{kind:?}: {message}"),
            Self::Corrupt(message) => write!(f, "corrupt object: {message}"),
        }
    }
}

impl std::error::Error for MarshalError {}

impl From<io::Error> for MarshalError {
    fn from(e: io::Error) -> Self {
        Self::Io {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// Outcome of a failed remote service open.
#[derive(Debug, Clone)]
pub enum ServiceOpenError {
    /// The peer has no service registered under this type and group.
    NotFound {
        service_type: String,
        group_name: String,
    },
    /// The remote side failed to open the service.
    Failed,
    /// The connection went away before the open completed.
    ConnectionClosed,
}

impl fmt::Display for ServiceOpenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound {
                service_type,
                group_name,
            } => write!(f, "no service registered as {service_type}:{group_name}"),
            Self::Failed => write!(f, "remote side failed to open service"),
            Self::ConnectionClosed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for ServiceOpenError {}

/// Failure surfaced to a reply handler instead of a decoded reply.
#[derive(Debug, Clone)]
pub enum RequestError {
    /// The request was aborted before a reply arrived.
    Aborted,
    /// The peer aborted its exception reply mid-stream.
    ReplyAborted,
    /// The connection closed with the request in flight.
    ConnectionClosed,
    /// The reply bytes did not decode.
    Decode(MarshalError),
    /// The peer answered with an exception object.
    Remote(Bytes),
}

impl RequestError {
    pub(crate) fn from_marshal(error: MarshalError) -> Self {
        if let MarshalError::Io { kind, .. } = &error {
            match StreamBreak::from_io_kind(*kind) {
                Some(StreamBreak::Aborted) => return Self::Aborted,
                Some(StreamBreak::ReplyAborted) => return Self::ReplyAborted,
                Some(StreamBreak::ConnectionClosed) => return Self::ConnectionClosed,
                _ => {}
            }
        }
        Self::Decode(error)
    }
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aborted => write!(f, "request aborted"),
            Self::ReplyAborted => write!(f, "reply exception was aborted"),
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::Decode(e) => write!(f, "reply did not decode: {e}"),
            Self::Remote(payload) => write!(f, "remote exception ({} bytes)", payload.len()),
        }
    }
}

impl std::error::Error for RequestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Decode(e) => Some(e),
            _ => None,
        }
    }
}

/// Errors from locally originated sends.
#[derive(Debug)]
pub enum SendError {
    Marshal(MarshalError),
    Transport(TransportError),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Marshal(e) => write!(f, "marshalling failed: {e}"),
            Self::Transport(e) => write!(f, "send failed: {e}"),
        }
    }
}

impl std::error::Error for SendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Marshal(e) => Some(e),
            Self::Transport(e) => Some(e),
        }
    }
}

impl From<MarshalError> for SendError {
    fn from(e: MarshalError) -> Self {
        Self::Marshal(e)
    }
}

impl From<TransportError> for SendError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}
