//! Transport trait and the in-memory transport.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::buffer_pool::{BufferPool, PooledBuf};
use crate::error::TransportError;
use crate::protocol::LENGTH_PLACEHOLDER;

/// A transport moves length-prefixed frames between the two peers.
///
/// Transports own framing: a sent buffer begins with the four-byte length
/// placeholder, which the transport fills in before transmission; a received
/// frame arrives with the prefix already stripped, cursor at the command
/// byte. A transport may buffer internally but must not reorder frames.
pub trait Transport: Send + Sync + 'static {
    /// Send one composed frame. `flush` asks for immediate transmission.
    fn send(
        &self,
        frame: PooledBuf,
        flush: bool,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Receive the next decoded frame.
    fn recv(&self) -> impl Future<Output = Result<Bytes, TransportError>> + Send;

    /// Shut the transport down. In-flight receives fail with `Closed`.
    fn close(&self);

    fn is_closed(&self) -> bool;

    /// The pool frames are composed in.
    fn buffer_pool(&self) -> &BufferPool;
}

const CHANNEL_CAPACITY: usize = 64;

/// A pair of linked in-process endpoints.
///
/// Frames sent on one side come out of `recv` on the other, length prefix
/// stripped, exactly as a socket transport would deliver them.
#[derive(Clone)]
pub struct MemTransport {
    inner: Arc<MemInner>,
    buffer_pool: BufferPool,
}

struct MemInner {
    tx: mpsc::Sender<Bytes>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    closed: AtomicBool,
}

impl MemTransport {
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::channel(CHANNEL_CAPACITY);
        let (tx_b, rx_b) = mpsc::channel(CHANNEL_CAPACITY);

        let side = |tx, rx| Self {
            inner: Arc::new(MemInner {
                tx,
                rx: tokio::sync::Mutex::new(rx),
                closed: AtomicBool::new(false),
            }),
            buffer_pool: BufferPool::new(),
        };

        (side(tx_b, rx_a), side(tx_a, rx_b))
    }
}

impl Transport for MemTransport {
    async fn send(&self, frame: PooledBuf, _flush: bool) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        debug_assert!(
            frame.len() > LENGTH_PLACEHOLDER.len(),
            "frame must carry a length placeholder and a command byte"
        );
        // Filling in the length and stripping it on receive cancel out here.
        let frame = frame.into_bytes().slice(LENGTH_PLACEHOLDER.len()..);
        self.inner
            .tx
            .send(frame)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&self) -> Result<Bytes, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut rx = self.inner.rx.lock().await;
        rx.recv().await.ok_or(TransportError::Closed)
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn buffer_pool(&self) -> &BufferPool {
        &self.buffer_pool
    }
}
