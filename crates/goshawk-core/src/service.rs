//! Local collaborator contracts.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::RequestError;

/// Boxed future type for object-safe async callbacks.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// An application exception carried back to the peer as a reply exception.
#[derive(Debug, Clone)]
pub struct Fault {
    pub payload: Bytes,
}

impl Fault {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }
}

/// A local service endpoint handling requests from one inbound client.
pub trait ServiceHandler: Send + Sync {
    /// Handle one decoded request object and produce the reply object, or a
    /// fault to travel back as an exception.
    fn handle_request(&self, request: Bytes) -> BoxFuture<'static, Result<Bytes, Fault>>;

    /// The peer closed the client; release whatever the handler holds.
    fn close(&self);
}

/// The registry of locally exposed services.
pub trait ServiceRegistry: Send + Sync {
    /// Look up a service by type and group. `None` means not found and is
    /// answered on the wire accordingly.
    fn open_service(&self, service_type: &str, group_name: &str)
    -> Option<Arc<dyn ServiceHandler>>;
}

/// Receiver for the outcome of one outbound request.
pub trait ReplyHandler: Send + Sync {
    /// The peer answered with a decoded reply object.
    fn handle_reply(&self, reply: Bytes);

    /// The request failed: locally, on the wire, or with a remote exception.
    fn handle_exception(&self, error: RequestError);
}
