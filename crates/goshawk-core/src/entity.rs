//! Per-id protocol entities.
//!
//! Each entity is shared between its registry and whatever worker still
//! holds a reference; removal from the registry just drops one owner. Field
//! mutations happen under the entity's own lock, which is always taken after
//! any registry lock has been released.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::{Notify, oneshot};

use crate::byte_input::ByteSink;
use crate::error::ServiceOpenError;
use crate::service::{ReplyHandler, ServiceHandler};

/// Result published to whoever asked for a remote service open.
pub type OpenResult = Result<ClientHandle, ServiceOpenError>;

/// Handle to an established remote service client.
///
/// Carries the id requests must name to reach the peer's service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientHandle {
    pub id: u32,
}

/// Counter of ack frames received for one entity, with wakeups for senders
/// waiting on the peer's window.
pub struct AckCounter {
    count: AtomicU32,
    notify: Notify,
}

impl AckCounter {
    pub fn new() -> Self {
        Self {
            count: AtomicU32::new(0),
            notify: Notify::new(),
        }
    }

    pub fn ack(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
        self.notify.notify_waiters();
    }

    pub fn acked(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// Suspend until at least `target` acks have arrived.
    pub async fn wait_for(&self, target: u32) {
        loop {
            let notified = self.notify.notified();
            if self.acked() >= target {
                return;
            }
            notified.await;
        }
    }
}

impl Default for AckCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle of a locally opened client for a remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPhase {
    /// Open request sent, no answer yet.
    Waiting,
    /// Peer accepted; requests may be submitted.
    Established,
    /// Terminal. No further local or remote event mutates the entity.
    Closed,
}

pub struct OutboundClientState {
    pub phase: ClientPhase,
    pub result: Option<oneshot::Sender<OpenResult>>,
}

/// A client this side opened on the peer.
pub struct OutboundClient {
    id: u32,
    service_type: String,
    group_name: String,
    state: Mutex<OutboundClientState>,
}

impl OutboundClient {
    pub fn new(
        id: u32,
        service_type: &str,
        group_name: &str,
        result: oneshot::Sender<OpenResult>,
    ) -> Self {
        Self {
            id,
            service_type: service_type.to_string(),
            group_name: group_name.to_string(),
            state: Mutex::new(OutboundClientState {
                phase: ClientPhase::Waiting,
                result: Some(result),
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    pub fn state(&self) -> MutexGuard<'_, OutboundClientState> {
        self.state.lock()
    }

    /// Fail the pending open and close the entity.
    pub fn fail(&self, error: ServiceOpenError) {
        let sender = {
            let mut st = self.state.lock();
            st.phase = ClientPhase::Closed;
            st.result.take()
        };
        if let Some(tx) = sender {
            let _ = tx.send(Err(error));
        }
    }
}

/// A client the peer opened against a local service.
pub struct InboundClient {
    id: u32,
    handler: Arc<dyn ServiceHandler>,
}

impl InboundClient {
    pub fn new(id: u32, handler: Arc<dyn ServiceHandler>) -> Self {
        Self { id, handler }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn handler(&self) -> &Arc<dyn ServiceHandler> {
        &self.handler
    }

    pub fn close(&self) {
        self.handler.close();
    }
}

pub struct InboundRequestState {
    /// Set when the reply must no longer be sent (peer abort, teardown).
    pub reply_done: bool,
}

/// A request the peer has in flight against a local client.
///
/// The byte input exists from construction: the first frame creates the
/// entity, and every frame for the id pushes into the same sink.
pub struct InboundRequest {
    id: u32,
    sink: ByteSink,
    state: Mutex<InboundRequestState>,
    acks: AckCounter,
}

impl InboundRequest {
    pub fn new(id: u32, sink: ByteSink) -> Self {
        Self {
            id,
            sink,
            state: Mutex::new(InboundRequestState { reply_done: false }),
            acks: AckCounter::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn sink(&self) -> &ByteSink {
        &self.sink
    }

    pub fn state(&self) -> MutexGuard<'_, InboundRequestState> {
        self.state.lock()
    }

    /// Acks for reply chunks this side sent.
    pub fn acks(&self) -> &AckCounter {
        &self.acks
    }
}

pub struct OutboundRequestState {
    /// Producer side of the reply byte input, installed by the first reply
    /// frame.
    pub reply_sink: Option<ByteSink>,
}

/// A request this side has in flight on the peer.
pub struct OutboundRequest {
    id: u32,
    reply_handler: Arc<dyn ReplyHandler>,
    state: Mutex<OutboundRequestState>,
    acks: AckCounter,
}

impl OutboundRequest {
    pub fn new(id: u32, reply_handler: Arc<dyn ReplyHandler>) -> Self {
        Self {
            id,
            reply_handler,
            state: Mutex::new(OutboundRequestState { reply_sink: None }),
            acks: AckCounter::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn reply_handler(&self) -> &Arc<dyn ReplyHandler> {
        &self.reply_handler
    }

    pub fn state(&self) -> MutexGuard<'_, OutboundRequestState> {
        self.state.lock()
    }

    /// Acks for request chunks this side sent.
    pub fn acks(&self) -> &AckCounter {
        &self.acks
    }
}

/// A peer-originated byte stream; ids arrive out of band inside payloads.
pub struct InboundStream {
    id: u32,
    receiver: ByteSink,
}

impl InboundStream {
    pub fn new(id: u32, receiver: ByteSink) -> Self {
        Self { id, receiver }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn receiver(&self) -> &ByteSink {
        &self.receiver
    }
}

/// A locally originated byte stream.
///
/// Holds the ack window for outgoing chunks plus the sticky signals the peer
/// may raise asynchronously. The stream owner polls the signals and decides
/// when to finish.
pub struct OutboundStream {
    id: u32,
    acks: AckCounter,
    sent: AtomicU32,
    start_signal: AtomicBool,
    close_signal: AtomicBool,
    exception_signal: AtomicBool,
    signal: Notify,
}

impl OutboundStream {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            acks: AckCounter::new(),
            sent: AtomicU32::new(0),
            start_signal: AtomicBool::new(false),
            close_signal: AtomicBool::new(false),
            exception_signal: AtomicBool::new(false),
            signal: Notify::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn acks(&self) -> &AckCounter {
        &self.acks
    }

    pub fn ack(&self) {
        self.acks.ack();
    }

    /// Sequence number for the next outgoing chunk.
    pub(crate) fn next_seq(&self) -> u32 {
        self.sent.fetch_add(1, Ordering::AcqRel)
    }

    pub fn signal_start(&self) {
        self.start_signal.store(true, Ordering::Release);
        self.signal.notify_waiters();
    }

    pub fn signal_close(&self) {
        self.close_signal.store(true, Ordering::Release);
        self.signal.notify_waiters();
    }

    pub fn signal_exception(&self) {
        self.exception_signal.store(true, Ordering::Release);
        self.signal.notify_waiters();
    }

    pub fn is_async_start(&self) -> bool {
        self.start_signal.load(Ordering::Acquire)
    }

    pub fn is_async_close(&self) -> bool {
        self.close_signal.load(Ordering::Acquire)
    }

    pub fn is_async_exception(&self) -> bool {
        self.exception_signal.load(Ordering::Acquire)
    }

    /// Suspend until any peer signal arrives. Callers re-check the flags.
    pub async fn wait_signal(&self) {
        self.signal.notified().await;
    }

    pub(crate) fn wake(&self) {
        self.signal.notify_waiters();
    }
}
