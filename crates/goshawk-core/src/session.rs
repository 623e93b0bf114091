//! The per-connection protocol engine.
//!
//! A [`Session`] owns one transport and the six id registries scoped to it.
//! The demux loop in [`Session::run`] pulls decoded frames off the transport
//! and feeds them to [`Session::handle_frame`], which routes each frame to
//! its per-id entity and drives that entity's state machine. Worker tasks
//! spawned for multi-frame payloads suspend on byte inputs; the dispatcher
//! never blocks on a worker.
//!
//! ```text
//!   transport ── recv ──► handle_frame ──┬─► registries / entity state
//!                                        ├─► byte-input pushes ──► workers
//!                                        └─► service-open reply frames
//! ```
//!
//! Frames naming an id with no live entity are logged and dropped; the peer
//! may legitimately send terminal frames that cross our own removal on the
//! wire. The only frame that creates an entity on its own is a REQUEST
//! carrying the first-frame flag. An unknown command byte is the one
//! per-frame condition that closes the connection.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Instant;

use bytes::{BufMut, Bytes};
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::byte_input::{ByteSource, InputHandler, byte_input};
use crate::entity::{
    AckCounter, ClientHandle, ClientPhase, InboundClient, InboundRequest, InboundStream,
    OutboundClient, OutboundRequest, OutboundStream,
};
use crate::error::{
    ProtocolError, RequestError, SendError, ServiceOpenError, StreamBreak, TransportError,
};
use crate::marshal::{MarshallerFactory, OptionMap};
use crate::protocol::{LENGTH_PLACEHOLDER, MsgFlags, cmd, put_string_z, take_string_z, take_u8, take_u32};
use crate::registry::Registries;
use crate::service::{ReplyHandler, ServiceRegistry};
use crate::transport::Transport;

const DEFAULT_CHUNK_WINDOW: u32 = 8;

/// Worst-case composed header: placeholder, command, id, flags, client id.
const FRAME_OVERHEAD: usize = 16;

fn chunk_window() -> u32 {
    std::env::var("GOSHAWK_CHUNK_WINDOW")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_CHUNK_WINDOW)
}

/// Peer signals a local stream consumer can raise against the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSignal {
    Start,
    Close,
    Exception,
}

/// One live connection's protocol engine.
pub struct Session<T: Transport> {
    transport: T,
    registries: Registries,
    services: Arc<dyn ServiceRegistry>,
    marshallers: Arc<dyn MarshallerFactory>,
    next_client_id: AtomicU32,
    next_request_id: AtomicU32,
    next_stream_id: AtomicU32,
    last_alive: Mutex<Option<Instant>>,
    chunk_window: u32,
    torn_down: AtomicBool,
}

impl<T: Transport> Session<T> {
    pub fn new(
        transport: T,
        services: Arc<dyn ServiceRegistry>,
        marshallers: Arc<dyn MarshallerFactory>,
    ) -> Self {
        Self {
            transport,
            registries: Registries::new(),
            services,
            marshallers,
            next_client_id: AtomicU32::new(1),
            next_request_id: AtomicU32::new(1),
            next_stream_id: AtomicU32::new(1),
            last_alive: Mutex::new(None),
            chunk_window: chunk_window(),
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// When the peer last showed a sign of life, if it ever sent ALIVE.
    pub fn last_peer_activity(&self) -> Option<Instant> {
        *self.last_alive.lock()
    }

    // ========================================================================
    // Demux loop
    // ========================================================================

    /// Receive and dispatch frames until the transport closes, then tear the
    /// session down.
    pub async fn run(self: Arc<Self>) -> Result<(), TransportError> {
        loop {
            let frame = match self.transport.recv().await {
                Ok(frame) => frame,
                Err(TransportError::Closed) => break,
                Err(e) => {
                    tracing::error!(error = %e, "transport failed");
                    self.teardown();
                    return Err(e);
                }
            };
            self.handle_frame(frame).await;
        }
        tracing::debug!("transport closed, tearing down session");
        self.teardown();
        Ok(())
    }

    /// Process exactly one decoded frame.
    ///
    /// The cursor of `frame` sits at the command byte. All outcomes are side
    /// effects; per-frame failures never propagate to the caller. A frame
    /// that cannot be parsed, or whose command byte is unknown, closes the
    /// connection.
    pub async fn handle_frame(self: &Arc<Self>, mut frame: Bytes) {
        let command = match take_u8(&mut frame) {
            Ok(command) => command,
            Err(_) => {
                tracing::error!("received empty frame, closing connection");
                self.transport.close();
                return;
            }
        };

        let result = match command {
            cmd::SERVICE_REQUEST => self.on_service_request(frame).await,
            cmd::SERVICE_NOT_FOUND => self.on_service_open_failed(frame, true),
            cmd::SERVICE_ERROR => self.on_service_open_failed(frame, false),
            cmd::SERVICE_CLIENT_OPENED => self.on_service_client_opened(frame),
            cmd::CHANNEL_CLOSE => self.on_channel_close(frame),
            cmd::CLIENT_ASYNC_CLOSE => self.on_client_async_close(frame),
            cmd::REQUEST => self.on_request(frame),
            cmd::REQUEST_ABORT => self.on_request_abort(frame),
            cmd::REQUEST_ACK_CHUNK => self.on_request_ack_chunk(frame),
            cmd::REPLY => self.on_reply(frame, false),
            cmd::REPLY_ACK_CHUNK => self.on_reply_ack_chunk(frame),
            cmd::REPLY_EXCEPTION => self.on_reply(frame, true),
            cmd::REPLY_EXCEPTION_ABORT => self.on_reply_exception_abort(frame),
            cmd::ALIVE => self.on_alive(),
            cmd::STREAM_DATA => self.on_stream_data(frame),
            cmd::STREAM_CLOSE => self.on_stream_terminated(frame, None),
            cmd::STREAM_EXCEPTION => {
                self.on_stream_terminated(frame, Some(StreamBreak::RemoteException))
            }
            cmd::STREAM_ACK => self.on_stream_ack(frame),
            cmd::STREAM_ASYNC_START => self.on_stream_signal(frame, StreamSignal::Start),
            cmd::STREAM_ASYNC_CLOSE => self.on_stream_signal(frame, StreamSignal::Close),
            cmd::STREAM_ASYNC_EXCEPTION => self.on_stream_signal(frame, StreamSignal::Exception),
            other => {
                tracing::error!(command = other, "received invalid command byte, closing connection");
                self.transport.close();
                Ok(())
            }
        };

        if let Err(e) = result {
            tracing::error!(command, error = %e, "malformed frame, closing connection");
            self.transport.close();
        }
    }

    // ========================================================================
    // Service open negotiation
    // ========================================================================

    /// The one exchange the engine answers on its own: parse the open
    /// request, consult the local service registry, and reply with opened,
    /// not-found or error. The reply is composed in a pooled buffer that
    /// returns to the pool on every path; a failed send is the transport's
    /// problem and is only logged.
    async fn on_service_request(self: &Arc<Self>, mut frame: Bytes) -> Result<(), ProtocolError> {
        let id = take_u32(&mut frame)?;
        let service_type = take_string_z(&mut frame)?;
        let group_name = take_string_z(&mut frame)?;

        let marshaller = self.marshallers.marshaller();
        let mut out = self.transport.buffer_pool().get();
        out.put_slice(&LENGTH_PLACEHOLDER);

        match marshaller.read_options(frame) {
            Ok(options) => {
                tracing::trace!(
                    client_id = id,
                    service_type = %service_type,
                    group_name = %group_name,
                    option_count = options.len(),
                    "service open requested"
                );
            }
            Err(e) => {
                tracing::error!(client_id = id, error = %e, "failed to decode service request options");
                out.put_u8(cmd::SERVICE_ERROR);
                out.put_u32(id);
                if let Err(e) = self.transport.send(out, true).await {
                    tracing::trace!(client_id = id, error = %e, "send failed");
                }
                return Ok(());
            }
        }

        match self.services.open_service(&service_type, &group_name) {
            None => {
                out.put_u8(cmd::SERVICE_NOT_FOUND);
            }
            Some(handler) => {
                let client = Arc::new(InboundClient::new(id, handler));
                self.registries.inbound_clients.insert(id, client);
                out.put_u8(cmd::SERVICE_CLIENT_OPENED);
            }
        }
        out.put_u32(id);
        if let Err(e) = self.transport.send(out, true).await {
            tracing::trace!(client_id = id, error = %e, "send failed");
        }
        Ok(())
    }

    fn on_service_open_failed(
        &self,
        mut frame: Bytes,
        not_found: bool,
    ) -> Result<(), ProtocolError> {
        let id = take_u32(&mut frame)?;
        let Some(client) = self.registries.outbound_clients.remove(id) else {
            tracing::trace!(client_id = id, "service open answer for unknown client");
            return Ok(());
        };
        let error = if not_found {
            ServiceOpenError::NotFound {
                service_type: client.service_type().to_string(),
                group_name: client.group_name().to_string(),
            }
        } else {
            ServiceOpenError::Failed
        };
        client.fail(error);
        Ok(())
    }

    fn on_service_client_opened(&self, mut frame: Bytes) -> Result<(), ProtocolError> {
        let id = take_u32(&mut frame)?;
        let Some(client) = self.registries.outbound_clients.get(id) else {
            tracing::trace!(client_id = id, "service-client-opened for unknown client");
            return Ok(());
        };
        let sender = {
            let mut st = client.state();
            if st.phase != ClientPhase::Waiting {
                tracing::trace!(client_id = id, phase = ?st.phase, "service-client-opened out of phase");
                return Ok(());
            }
            st.phase = ClientPhase::Established;
            st.result.take()
        };
        if let Some(tx) = sender {
            let _ = tx.send(Ok(ClientHandle { id }));
        }
        Ok(())
    }

    fn on_channel_close(&self, mut frame: Bytes) -> Result<(), ProtocolError> {
        let id = take_u32(&mut frame)?;
        let Some(client) = self.registries.inbound_clients.remove(id) else {
            tracing::trace!(client_id = id, "channel close for unknown client");
            return Ok(());
        };
        client.close();
        Ok(())
    }

    fn on_client_async_close(&self, mut frame: Bytes) -> Result<(), ProtocolError> {
        let id = take_u32(&mut frame)?;
        let Some(client) = self.registries.outbound_clients.remove(id) else {
            tracing::trace!(client_id = id, "async close for unknown client");
            return Ok(());
        };
        client.fail(ServiceOpenError::ConnectionClosed);
        Ok(())
    }

    // ========================================================================
    // Requests
    // ========================================================================

    fn on_request(self: &Arc<Self>, mut frame: Bytes) -> Result<(), ProtocolError> {
        let rid = take_u32(&mut frame)?;
        let flags = MsgFlags::from_bits_truncate(take_u8(&mut frame)?);

        if flags.contains(MsgFlags::FIRST) {
            let cid = take_u32(&mut frame)?;
            let handler = Arc::new(AckEmitter {
                session: self.clone(),
                id: rid,
                command: cmd::REQUEST_ACK_CHUNK,
            });
            let (sink, source) = byte_input(handler);
            let request = Arc::new(InboundRequest::new(rid, sink));
            if self
                .registries
                .inbound_requests
                .try_insert(rid, request.clone())
                .is_err()
            {
                tracing::trace!(request_id = rid, "duplicate first frame for live request, dropping");
                return Ok(());
            }
            tracing::trace!(request_id = rid, client_id = cid, "first request frame");
            {
                // Spawning under the entity lock keeps a racing local close
                // from finishing before the task can observe the entity.
                let _entity = request.state();
                let session = self.clone();
                let task_request = request.clone();
                tokio::spawn(async move {
                    session.inbound_request_task(task_request, cid, source).await;
                });
            }
            request.sink().push(frame);
        } else {
            let Some(request) = self.registries.inbound_requests.get(rid) else {
                tracing::trace!(request_id = rid, "request frame for unknown request id");
                return Ok(());
            };
            tracing::trace!(request_id = rid, "subsequent request frame");
            request.sink().push(frame);
        }
        Ok(())
    }

    fn on_request_abort(&self, mut frame: Bytes) -> Result<(), ProtocolError> {
        let rid = take_u32(&mut frame)?;
        let Some(request) = self.registries.inbound_requests.remove(rid) else {
            tracing::trace!(request_id = rid, "request abort for unknown request id");
            return Ok(());
        };
        {
            let mut st = request.state();
            st.reply_done = true;
        }
        // While the payload is still streaming this disrupts the decode and
        // prevents a reply.
        request.sink().push_error(StreamBreak::Aborted);
        Ok(())
    }

    fn on_request_ack_chunk(&self, mut frame: Bytes) -> Result<(), ProtocolError> {
        let rid = take_u32(&mut frame)?;
        let Some(request) = self.registries.outbound_requests.get(rid) else {
            tracing::trace!(request_id = rid, "request ack for unknown request id");
            return Ok(());
        };
        request.acks().ack();
        Ok(())
    }

    // ========================================================================
    // Replies
    // ========================================================================

    /// REPLY and REPLY_EXCEPTION differ only in which decoder task the first
    /// frame spawns.
    fn on_reply(self: &Arc<Self>, mut frame: Bytes, exception: bool) -> Result<(), ProtocolError> {
        let rid = take_u32(&mut frame)?;
        let flags = MsgFlags::from_bits_truncate(take_u8(&mut frame)?);
        let Some(request) = self.registries.outbound_requests.get(rid) else {
            tracing::trace!(request_id = rid, "reply frame for unknown request id");
            return Ok(());
        };

        let sink = {
            let mut st = request.state();
            if flags.contains(MsgFlags::FIRST) {
                if st.reply_sink.is_some() {
                    tracing::trace!(request_id = rid, "duplicate first frame for reply, dropping");
                    return Ok(());
                }
                tracing::trace!(request_id = rid, exception, "first reply frame");
                let handler = Arc::new(AckEmitter {
                    session: self.clone(),
                    id: rid,
                    command: cmd::REPLY_ACK_CHUNK,
                });
                let (sink, source) = byte_input(handler);
                st.reply_sink = Some(sink.clone());
                let session = self.clone();
                let reply_handler = request.reply_handler().clone();
                if exception {
                    tokio::spawn(async move {
                        session
                            .inbound_reply_exception_task(rid, source, reply_handler)
                            .await;
                    });
                } else {
                    tokio::spawn(async move {
                        session.inbound_reply_task(rid, source, reply_handler).await;
                    });
                }
                sink
            } else {
                match st.reply_sink.clone() {
                    Some(sink) => sink,
                    None => {
                        tracing::trace!(request_id = rid, "reply frame before first frame, dropping");
                        return Ok(());
                    }
                }
            }
        };
        sink.push(frame);
        Ok(())
    }

    fn on_reply_ack_chunk(&self, mut frame: Bytes) -> Result<(), ProtocolError> {
        let rid = take_u32(&mut frame)?;
        let Some(request) = self.registries.inbound_requests.get(rid) else {
            tracing::trace!(request_id = rid, "reply ack for unknown request id");
            return Ok(());
        };
        request.acks().ack();
        Ok(())
    }

    fn on_reply_exception_abort(&self, mut frame: Bytes) -> Result<(), ProtocolError> {
        let rid = take_u32(&mut frame)?;
        let Some(request) = self.registries.outbound_requests.get(rid) else {
            tracing::warn!(request_id = rid, "reply-exception-abort for unknown request id");
            return Ok(());
        };
        let sink = request.state().reply_sink.clone();
        if let Some(sink) = sink {
            sink.push_error(StreamBreak::ReplyAborted);
        }
        request
            .reply_handler()
            .handle_exception(RequestError::ReplyAborted);
        Ok(())
    }

    fn on_alive(&self) -> Result<(), ProtocolError> {
        *self.last_alive.lock() = Some(Instant::now());
        tracing::trace!("peer keepalive");
        Ok(())
    }

    // ========================================================================
    // Streams
    // ========================================================================

    fn on_stream_data(&self, mut frame: Bytes) -> Result<(), ProtocolError> {
        let sid = take_u32(&mut frame)?;
        let Some(stream) = self.registries.inbound_streams.get(sid) else {
            tracing::warn!(stream_id = sid, "stream data for unknown stream id");
            return Ok(());
        };
        stream.receiver().push(frame);
        Ok(())
    }

    fn on_stream_terminated(
        &self,
        mut frame: Bytes,
        error: Option<StreamBreak>,
    ) -> Result<(), ProtocolError> {
        let sid = take_u32(&mut frame)?;
        let Some(stream) = self.registries.inbound_streams.remove(sid) else {
            match error {
                None => tracing::warn!(stream_id = sid, "stream close for unknown stream id"),
                Some(_) => {
                    tracing::warn!(stream_id = sid, "stream exception for unknown stream id")
                }
            }
            return Ok(());
        };
        match error {
            None => stream.receiver().push_eof(),
            Some(e) => stream.receiver().push_error(e),
        }
        Ok(())
    }

    fn on_stream_ack(&self, mut frame: Bytes) -> Result<(), ProtocolError> {
        let sid = take_u32(&mut frame)?;
        let Some(stream) = self.registries.outbound_streams.get(sid) else {
            tracing::warn!(stream_id = sid, "stream ack for unknown stream id");
            return Ok(());
        };
        stream.ack();
        Ok(())
    }

    fn on_stream_signal(&self, mut frame: Bytes, signal: StreamSignal) -> Result<(), ProtocolError> {
        let sid = take_u32(&mut frame)?;
        let Some(stream) = self.registries.outbound_streams.get(sid) else {
            match signal {
                StreamSignal::Start => {
                    tracing::warn!(stream_id = sid, "stream-async-start for unknown stream id")
                }
                StreamSignal::Close => {
                    tracing::warn!(stream_id = sid, "stream-async-close for unknown stream id")
                }
                StreamSignal::Exception => {
                    tracing::warn!(stream_id = sid, "stream-async-exception for unknown stream id")
                }
            }
            return Ok(());
        };
        match signal {
            StreamSignal::Start => stream.signal_start(),
            StreamSignal::Close => stream.signal_close(),
            StreamSignal::Exception => stream.signal_exception(),
        }
        Ok(())
    }

    // ========================================================================
    // Worker tasks
    // ========================================================================

    /// Decode one inbound request, dispatch it to the target client's
    /// handler, and stream the reply back. The entity stays registered until
    /// the reply is fully sent so that reply acks keep finding it.
    async fn inbound_request_task(
        self: Arc<Self>,
        request: Arc<InboundRequest>,
        cid: u32,
        mut source: ByteSource,
    ) {
        let rid = request.id();
        let marshaller = self.marshallers.marshaller();
        let object = match marshaller.read_object(&mut source).await {
            Ok(object) => object,
            Err(e) => {
                tracing::debug!(request_id = rid, error = %e, "inbound request payload did not decode");
                self.registries.inbound_requests.remove(rid);
                return;
            }
        };
        drop(source);

        let Some(client) = self.registries.inbound_clients.get(cid) else {
            tracing::warn!(request_id = rid, client_id = cid, "request addressed to unknown client");
            self.send_fault(&request, b"no such client").await;
            self.registries.inbound_requests.remove(rid);
            return;
        };

        tracing::trace!(request_id = rid, client_id = cid, len = object.len(), "dispatching request");
        let outcome = AssertUnwindSafe(client.handler().handle_request(object))
            .catch_unwind()
            .await;

        if request.state().reply_done {
            tracing::trace!(request_id = rid, "request aborted, discarding reply");
            return;
        }

        match outcome {
            Ok(Ok(reply)) => {
                let mut body = Vec::with_capacity(reply.len() + 4);
                match marshaller.write_object(&reply, &mut body) {
                    Ok(()) => {
                        if let Err(e) = self
                            .send_chunked(cmd::REPLY, rid, None, &body, request.acks())
                            .await
                        {
                            tracing::trace!(request_id = rid, error = %e, "reply send failed");
                        }
                    }
                    Err(e) => {
                        tracing::error!(request_id = rid, error = %e, "reply object did not encode");
                        self.send_fault(&request, b"reply encoding failed").await;
                    }
                }
            }
            Ok(Err(fault)) => {
                self.send_fault(&request, &fault.payload).await;
            }
            Err(panic) => {
                let message = if let Some(s) = panic.downcast_ref::<&str>() {
                    (*s).to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "request handler panicked".to_string()
                };
                tracing::error!(request_id = rid, message = %message, "request handler panicked");
                self.send_fault(&request, message.as_bytes()).await;
            }
        }
        self.registries.inbound_requests.remove(rid);
    }

    /// Stream an exception object back. If the exception itself cannot be
    /// delivered, tell the peer to stop waiting for it.
    async fn send_fault(&self, request: &InboundRequest, payload: &[u8]) {
        let rid = request.id();
        let marshaller = self.marshallers.marshaller();
        let mut body = Vec::with_capacity(payload.len() + 4);
        if let Err(e) = marshaller.write_object(payload, &mut body) {
            tracing::error!(request_id = rid, error = %e, "exception object did not encode");
            return;
        }
        if let Err(e) = self
            .send_chunked(cmd::REPLY_EXCEPTION, rid, None, &body, request.acks())
            .await
        {
            tracing::trace!(request_id = rid, error = %e, "exception reply send failed");
            if let Err(e) = self.send_control(cmd::REPLY_EXCEPTION_ABORT, rid).await {
                tracing::trace!(request_id = rid, error = %e, "exception abort send failed");
            }
        }
    }

    async fn inbound_reply_task(
        self: Arc<Self>,
        rid: u32,
        mut source: ByteSource,
        handler: Arc<dyn ReplyHandler>,
    ) {
        let marshaller = self.marshallers.marshaller();
        let outcome = marshaller.read_object(&mut source).await;
        self.registries.outbound_requests.remove(rid);
        match outcome {
            Ok(reply) => {
                tracing::trace!(request_id = rid, len = reply.len(), "reply decoded");
                handler.handle_reply(reply);
            }
            Err(e) => {
                tracing::debug!(request_id = rid, error = %e, "reply did not decode");
                handler.handle_exception(RequestError::from_marshal(e));
            }
        }
    }

    async fn inbound_reply_exception_task(
        self: Arc<Self>,
        rid: u32,
        mut source: ByteSource,
        handler: Arc<dyn ReplyHandler>,
    ) {
        let marshaller = self.marshallers.marshaller();
        let outcome = marshaller.read_object(&mut source).await;
        self.registries.outbound_requests.remove(rid);
        match outcome {
            Ok(exception) => {
                tracing::trace!(request_id = rid, len = exception.len(), "reply exception decoded");
                handler.handle_exception(RequestError::Remote(exception));
            }
            Err(e) => {
                tracing::debug!(request_id = rid, error = %e, "reply exception did not decode");
                handler.handle_exception(RequestError::from_marshal(e));
            }
        }
    }

    // ========================================================================
    // Local actions
    // ========================================================================

    /// Ask the peer to open a service. The outcome arrives on the returned
    /// receiver once the peer answers, or earlier if the send fails.
    pub async fn open_remote_service(
        &self,
        service_type: &str,
        group_name: &str,
        options: &OptionMap,
    ) -> oneshot::Receiver<Result<ClientHandle, ServiceOpenError>> {
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let client = Arc::new(OutboundClient::new(id, service_type, group_name, tx));
        self.registries.outbound_clients.insert(id, client.clone());

        let marshaller = self.marshallers.marshaller();
        let mut out = self.transport.buffer_pool().get();
        out.put_slice(&LENGTH_PLACEHOLDER);
        out.put_u8(cmd::SERVICE_REQUEST);
        out.put_u32(id);
        put_string_z(&mut out, service_type);
        put_string_z(&mut out, group_name);
        if let Err(e) = marshaller.write_options(options, &mut out) {
            tracing::error!(client_id = id, error = %e, "service open options did not encode");
            self.registries.outbound_clients.remove(id);
            client.fail(ServiceOpenError::Failed);
            return rx;
        }
        tracing::trace!(
            client_id = id,
            service_type,
            group_name,
            "requesting remote service open"
        );
        if let Err(e) = self.transport.send(out, true).await {
            tracing::trace!(client_id = id, error = %e, "send failed");
            self.registries.outbound_clients.remove(id);
            client.fail(ServiceOpenError::ConnectionClosed);
        }
        rx
    }

    /// Close a locally opened client and tell the peer, which drops its
    /// inbound client under the same id.
    pub async fn close_client(&self, handle: ClientHandle) -> Result<(), TransportError> {
        let Some(client) = self.registries.outbound_clients.remove(handle.id) else {
            return Ok(());
        };
        {
            let mut st = client.state();
            st.phase = ClientPhase::Closed;
            // A close racing the open drops the pending result; the opener
            // observes a cancelled receiver.
            st.result.take();
        }
        self.send_control(cmd::CHANNEL_CLOSE, handle.id).await
    }

    /// Force-close a client the peer opened against a local service. The
    /// peer learns through an asynchronous close of its client handle.
    pub async fn close_service_client(&self, id: u32) -> Result<(), TransportError> {
        let Some(client) = self.registries.inbound_clients.remove(id) else {
            return Ok(());
        };
        client.close();
        self.send_control(cmd::CLIENT_ASYNC_CLOSE, id).await
    }

    /// Submit one request to an established client. The reply, a remote
    /// exception, or a failure is delivered through `reply_handler`.
    pub async fn submit_request(
        &self,
        client: ClientHandle,
        request: &[u8],
        reply_handler: Arc<dyn ReplyHandler>,
    ) -> Result<u32, SendError> {
        let rid = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let marshaller = self.marshallers.marshaller();
        let mut body = Vec::with_capacity(request.len() + 4);
        marshaller.write_object(request, &mut body)?;

        let entity = Arc::new(OutboundRequest::new(rid, reply_handler));
        self.registries.outbound_requests.insert(rid, entity.clone());
        tracing::trace!(
            request_id = rid,
            client_id = client.id,
            len = body.len(),
            "submitting request"
        );
        if let Err(e) = self
            .send_chunked(cmd::REQUEST, rid, Some(client.id), &body, entity.acks())
            .await
        {
            self.registries.outbound_requests.remove(rid);
            return Err(SendError::Transport(e));
        }
        Ok(rid)
    }

    /// Abort an in-flight outbound request.
    pub async fn abort_request(&self, rid: u32) -> Result<(), TransportError> {
        let Some(request) = self.registries.outbound_requests.remove(rid) else {
            return Ok(());
        };
        let sink = request.state().reply_sink.clone();
        if let Some(sink) = sink {
            sink.push_error(StreamBreak::Aborted);
        }
        self.send_control(cmd::REQUEST_ABORT, rid).await
    }

    /// Register the receiving end of a stream the peer announced out of
    /// band. The consumer reads the returned source; each drained chunk is
    /// acknowledged to the peer.
    pub fn register_inbound_stream(self: &Arc<Self>, sid: u32) -> ByteSource {
        let handler = Arc::new(AckEmitter {
            session: self.clone(),
            id: sid,
            command: cmd::STREAM_ACK,
        });
        let (sink, source) = byte_input(handler);
        self.registries
            .inbound_streams
            .insert(sid, Arc::new(InboundStream::new(sid, sink)));
        source
    }

    /// Open a locally originated stream. The id travels to the peer out of
    /// band inside a marshalled object.
    pub fn open_outbound_stream(&self) -> Arc<OutboundStream> {
        let sid = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let stream = Arc::new(OutboundStream::new(sid));
        self.registries.outbound_streams.insert(sid, stream.clone());
        stream
    }

    /// Send stream bytes, splitting into chunks and honoring the peer's ack
    /// window across calls.
    pub async fn send_stream_data(
        &self,
        stream: &OutboundStream,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let pool = self.transport.buffer_pool();
        let max_chunk = pool.buffer_size().saturating_sub(FRAME_OVERHEAD).max(1);
        let mut offset = 0;
        loop {
            let end = usize::min(offset + max_chunk, data.len());
            let seq = stream.next_seq();
            if seq >= self.chunk_window {
                stream.acks().wait_for(seq + 1 - self.chunk_window).await;
            }
            let mut out = pool.get();
            out.put_slice(&LENGTH_PLACEHOLDER);
            out.put_u8(cmd::STREAM_DATA);
            out.put_u32(stream.id());
            out.put_slice(&data[offset..end]);
            self.transport.send(out, end == data.len()).await?;
            offset = end;
            if offset == data.len() {
                return Ok(());
            }
        }
    }

    /// Finish a local stream normally.
    pub async fn finish_stream(&self, stream: &OutboundStream) -> Result<(), TransportError> {
        self.registries.outbound_streams.remove(stream.id());
        self.send_control(cmd::STREAM_CLOSE, stream.id()).await
    }

    /// Terminate a local stream with an exception.
    pub async fn fail_stream(&self, stream: &OutboundStream) -> Result<(), TransportError> {
        self.registries.outbound_streams.remove(stream.id());
        self.send_control(cmd::STREAM_EXCEPTION, stream.id()).await
    }

    /// Raise an asynchronous signal against the peer's sending stream.
    pub async fn send_stream_signal(
        &self,
        sid: u32,
        signal: StreamSignal,
    ) -> Result<(), TransportError> {
        let command = match signal {
            StreamSignal::Start => cmd::STREAM_ASYNC_START,
            StreamSignal::Close => cmd::STREAM_ASYNC_CLOSE,
            StreamSignal::Exception => cmd::STREAM_ASYNC_EXCEPTION,
        };
        self.send_control(command, sid).await
    }

    /// Tell the peer we are alive.
    pub async fn send_alive(&self) -> Result<(), TransportError> {
        let mut out = self.transport.buffer_pool().get();
        out.put_slice(&LENGTH_PLACEHOLDER);
        out.put_u8(cmd::ALIVE);
        self.transport.send(out, true).await
    }

    // ========================================================================
    // Frame composition
    // ========================================================================

    /// Compose and send a command-plus-id frame.
    async fn send_control(&self, command: u8, id: u32) -> Result<(), TransportError> {
        let mut out = self.transport.buffer_pool().get();
        out.put_slice(&LENGTH_PLACEHOLDER);
        out.put_u8(command);
        out.put_u32(id);
        self.transport.send(out, true).await
    }

    /// Send a multi-frame payload. The first frame carries the FIRST flag
    /// and, for requests, the target client id. At most `chunk_window`
    /// chunks ride unacknowledged; beyond that the sender waits for the
    /// peer's acks.
    async fn send_chunked(
        &self,
        command: u8,
        id: u32,
        first_extra: Option<u32>,
        body: &[u8],
        acks: &AckCounter,
    ) -> Result<(), TransportError> {
        let pool = self.transport.buffer_pool();
        let max_chunk = pool.buffer_size().saturating_sub(FRAME_OVERHEAD).max(1);
        let mut offset = 0;
        let mut seq: u32 = 0;
        loop {
            let end = usize::min(offset + max_chunk, body.len());
            let last = end == body.len();
            if seq >= self.chunk_window {
                acks.wait_for(seq + 1 - self.chunk_window).await;
            }
            let mut out = pool.get();
            out.put_slice(&LENGTH_PLACEHOLDER);
            out.put_u8(command);
            out.put_u32(id);
            let mut flags = MsgFlags::empty();
            if seq == 0 {
                flags |= MsgFlags::FIRST;
            }
            out.put_u8(flags.bits());
            if seq == 0 {
                if let Some(extra) = first_extra {
                    out.put_u32(extra);
                }
            }
            out.put_slice(&body[offset..end]);
            self.transport.send(out, last).await?;
            seq += 1;
            offset = end;
            if last {
                return Ok(());
            }
        }
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Cancel every in-flight entity. Safe to call more than once; only the
    /// first call does anything. `run` calls this when the transport dies.
    pub fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("tearing down session state");

        for (_, client) in self.registries.outbound_clients.drain() {
            client.fail(ServiceOpenError::ConnectionClosed);
        }
        for (_, client) in self.registries.inbound_clients.drain() {
            client.close();
        }
        for (_, request) in self.registries.inbound_requests.drain() {
            request.state().reply_done = true;
            request.sink().push_error(StreamBreak::ConnectionClosed);
        }
        for (_, request) in self.registries.outbound_requests.drain() {
            let sink = request.state().reply_sink.clone();
            if let Some(sink) = sink {
                sink.push_error(StreamBreak::ConnectionClosed);
            }
            request
                .reply_handler()
                .handle_exception(RequestError::ConnectionClosed);
        }
        for (_, stream) in self.registries.inbound_streams.drain() {
            stream.receiver().push_error(StreamBreak::ConnectionClosed);
        }
        for (_, stream) in self.registries.outbound_streams.drain() {
            stream.wake();
        }
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    pub fn inbound_client_ids(&self) -> Vec<u32> {
        self.registries.inbound_clients.ids()
    }

    pub fn outbound_client_ids(&self) -> Vec<u32> {
        self.registries.outbound_clients.ids()
    }

    pub fn inbound_request_ids(&self) -> Vec<u32> {
        self.registries.inbound_requests.ids()
    }

    pub fn outbound_request_ids(&self) -> Vec<u32> {
        self.registries.outbound_requests.ids()
    }

    pub fn inbound_stream_ids(&self) -> Vec<u32> {
        self.registries.inbound_streams.ids()
    }

    pub fn outbound_stream_ids(&self) -> Vec<u32> {
        self.registries.outbound_streams.ids()
    }

    /// Acks received so far for an outbound request, for diagnostics.
    pub fn request_ack_count(&self, rid: u32) -> Option<u32> {
        self.registries
            .outbound_requests
            .get(rid)
            .map(|r| r.acks().acked())
    }

    /// Acks received so far for an outbound stream, for diagnostics.
    pub fn stream_ack_count(&self, sid: u32) -> Option<u32> {
        self.registries
            .outbound_streams
            .get(sid)
            .map(|s| s.acks().acked())
    }
}

/// Byte-input handler that acknowledges each drained chunk on the wire.
struct AckEmitter<T: Transport> {
    session: Arc<Session<T>>,
    id: u32,
    command: u8,
}

impl<T: Transport> InputHandler for AckEmitter<T> {
    fn chunk_drained(&self) {
        let session = self.session.clone();
        let id = self.id;
        let command = self.command;
        tokio::spawn(async move {
            if let Err(e) = session.send_control(command, id).await {
                tracing::trace!(id, error = %e, "ack send failed");
            }
        });
    }

    fn closed(&self) {}
}
