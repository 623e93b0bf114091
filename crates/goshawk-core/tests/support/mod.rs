//! Shared fixtures for engine tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use goshawk_core::{
    BoxFuture, ByteSource, Fault, MarshalError, Marshaller, MarshallerFactory, MemTransport,
    OptionMap, PrefixMarshalling, ReplyHandler, RequestError, ServiceHandler, ServiceRegistry,
    Session, Transport,
};
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::sync::Notify;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(100);

/// Install a subscriber so failing tests show the engine's traces. Safe to
/// call from every test; only the first call wins.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

pub fn session_with(
    services: Arc<dyn ServiceRegistry>,
    marshallers: Arc<dyn MarshallerFactory>,
) -> (Arc<Session<MemTransport>>, MemTransport) {
    init_tracing();
    let (local, peer) = MemTransport::pair();
    (Arc::new(Session::new(local, services, marshallers)), peer)
}

pub fn plain_session(
    services: Arc<dyn ServiceRegistry>,
) -> (Arc<Session<MemTransport>>, MemTransport) {
    session_with(services, Arc::new(PrefixMarshalling))
}

/// Feed one frame to the dispatcher, cursor at the command byte.
pub async fn dispatch(session: &Arc<Session<MemTransport>>, body: &[u8]) {
    session.handle_frame(Bytes::copy_from_slice(body)).await;
}

/// Receive the next frame the engine emitted, or fail the test.
pub async fn peer_recv(peer: &MemTransport) -> Bytes {
    tokio::time::timeout(RECV_TIMEOUT, peer.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("peer transport closed")
}

/// Assert that no frame arrives for a little while.
pub async fn assert_no_frame(peer: &MemTransport) {
    let outcome = tokio::time::timeout(QUIET, peer.recv()).await;
    assert!(outcome.is_err(), "unexpected frame: {outcome:?}");
}

/// Poll `cond` until it holds, or fail the test.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(RECV_TIMEOUT, async {
        loop {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ============================================================================
// Services
// ============================================================================

#[derive(Default)]
pub struct MapRegistry {
    services: Mutex<HashMap<(String, String), Arc<dyn ServiceHandler>>>,
}

impl MapRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with(
        service_type: &str,
        group_name: &str,
        handler: Arc<dyn ServiceHandler>,
    ) -> Arc<Self> {
        let registry = Self::new();
        registry.add(service_type, group_name, handler);
        registry
    }

    pub fn add(&self, service_type: &str, group_name: &str, handler: Arc<dyn ServiceHandler>) {
        self.services
            .lock()
            .insert((service_type.to_string(), group_name.to_string()), handler);
    }
}

impl ServiceRegistry for MapRegistry {
    fn open_service(
        &self,
        service_type: &str,
        group_name: &str,
    ) -> Option<Arc<dyn ServiceHandler>> {
        self.services
            .lock()
            .get(&(service_type.to_string(), group_name.to_string()))
            .cloned()
    }
}

pub fn no_services() -> Arc<MapRegistry> {
    MapRegistry::new()
}

/// Echoes every request back as the reply.
#[derive(Default)]
pub struct EchoService {
    pub closed: AtomicBool,
}

impl EchoService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl ServiceHandler for EchoService {
    fn handle_request(&self, request: Bytes) -> BoxFuture<'static, Result<Bytes, Fault>> {
        Box::pin(async move { Ok(request) })
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Fails every request with a fixed fault.
pub struct FaultyService {
    pub fault: &'static [u8],
}

impl ServiceHandler for FaultyService {
    fn handle_request(&self, _request: Bytes) -> BoxFuture<'static, Result<Bytes, Fault>> {
        let fault = Fault::new(self.fault);
        Box::pin(async move { Err(fault) })
    }

    fn close(&self) {}
}

/// Accepts requests and never answers.
pub struct SilentService;

impl ServiceHandler for SilentService {
    fn handle_request(&self, _request: Bytes) -> BoxFuture<'static, Result<Bytes, Fault>> {
        Box::pin(std::future::pending())
    }

    fn close(&self) {}
}

// ============================================================================
// Reply handlers
// ============================================================================

#[derive(Default)]
pub struct RecordingReplyHandler {
    pub replies: Mutex<Vec<Bytes>>,
    pub errors: Mutex<Vec<RequestError>>,
    notify: Notify,
}

impl RecordingReplyHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn has_outcome(&self) -> bool {
        !self.replies.lock().is_empty() || !self.errors.lock().is_empty()
    }

    /// Suspend until a reply or an exception lands, or fail the test.
    pub async fn wait_outcome(&self) {
        tokio::time::timeout(RECV_TIMEOUT, async {
            loop {
                let notified = self.notify.notified();
                if self.has_outcome() {
                    return;
                }
                notified.await;
            }
        })
        .await
        .expect("no reply outcome in time");
    }
}

impl ReplyHandler for RecordingReplyHandler {
    fn handle_reply(&self, reply: Bytes) {
        self.replies.lock().push(reply);
        self.notify.notify_waiters();
    }

    fn handle_exception(&self, error: RequestError) {
        self.errors.lock().push(error);
        self.notify.notify_waiters();
    }
}

// ============================================================================
// Spy marshalling
// ============================================================================

/// Length-prefix marshalling that records every object byte it pulls from a
/// byte input, one read at a time, plus the final outcome of the decode.
#[derive(Clone, Default)]
pub struct SpyMarshalling {
    pub seen: Arc<Mutex<Vec<u8>>>,
    outcome: Arc<Mutex<Option<Result<(), io::ErrorKind>>>>,
    done: Arc<Notify>,
}

impl SpyMarshalling {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suspend until a decode finishes either way, or fail the test.
    pub async fn wait_outcome(&self) -> Result<(), io::ErrorKind> {
        tokio::time::timeout(RECV_TIMEOUT, async {
            loop {
                let notified = self.done.notified();
                if let Some(outcome) = *self.outcome.lock() {
                    return outcome;
                }
                notified.await;
            }
        })
        .await
        .expect("decode did not finish in time")
    }
}

impl MarshallerFactory for SpyMarshalling {
    fn marshaller(&self) -> Box<dyn Marshaller> {
        Box::new(SpyMarshaller(self.clone()))
    }
}

struct SpyMarshaller(SpyMarshalling);

impl Marshaller for SpyMarshaller {
    fn read_options(&self, bytes: Bytes) -> Result<OptionMap, MarshalError> {
        PrefixMarshalling.marshaller().read_options(bytes)
    }

    fn write_options(&self, options: &OptionMap, out: &mut Vec<u8>) -> Result<(), MarshalError> {
        PrefixMarshalling.marshaller().write_options(options, out)
    }

    fn read_object<'a>(
        &'a self,
        source: &'a mut ByteSource,
    ) -> BoxFuture<'a, Result<Bytes, MarshalError>> {
        Box::pin(async move {
            let spy = &self.0;
            let result = async {
                let len = source.read_u32().await? as usize;
                let mut object = Vec::with_capacity(len);
                let mut byte = [0u8; 1];
                while object.len() < len {
                    let n = source.read(&mut byte).await?;
                    if n == 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "object truncated",
                        ));
                    }
                    spy.seen.lock().push(byte[0]);
                    object.push(byte[0]);
                }
                Ok(Bytes::from(object))
            }
            .await;
            match result {
                Ok(object) => {
                    *spy.outcome.lock() = Some(Ok(()));
                    spy.done.notify_waiters();
                    Ok(object)
                }
                Err(e) => {
                    *spy.outcome.lock() = Some(Err(e.kind()));
                    spy.done.notify_waiters();
                    Err(MarshalError::from(e))
                }
            }
        })
    }

    fn write_object(&self, object: &[u8], out: &mut Vec<u8>) -> Result<(), MarshalError> {
        PrefixMarshalling.marshaller().write_object(object, out)
    }
}
