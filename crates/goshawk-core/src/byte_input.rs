//! Push-driven chunked byte inputs.
//!
//! A byte input bridges the dispatcher (producer) and a worker task
//! (consumer) for one in-flight multi-frame payload. The dispatcher pushes
//! decoded chunks or a terminator and never blocks; the consumer reads bytes
//! through [`AsyncRead`] and suspends while the queue is empty. Chunks pushed
//! before the consumer attaches are queued.
//!
//! The [`InputHandler`] hook fires once per fully drained chunk. The engine
//! installs handlers that emit the matching ack frame, which is how the peer
//! learns it may send the next chunk.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;

use crate::error::StreamBreak;

/// Consumer-side callbacks of a byte input.
pub trait InputHandler: Send + Sync + 'static {
    /// One pushed chunk has been fully consumed.
    fn chunk_drained(&self);

    /// The consumer is finished: the source hit a terminator or was dropped.
    /// Fires at most once.
    fn closed(&self);
}

/// Handler that ignores every event.
pub struct NoopHandler;

impl InputHandler for NoopHandler {
    fn chunk_drained(&self) {}
    fn closed(&self) {}
}

enum Segment {
    Data(Bytes),
    Eof,
    Break(StreamBreak),
}

#[derive(Clone, Copy)]
enum Terminal {
    Eof,
    Broken(StreamBreak),
}

/// Create a linked sink/source pair.
pub fn byte_input(handler: Arc<dyn InputHandler>) -> (ByteSink, ByteSource) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sink = ByteSink {
        tx,
        terminated: Arc::new(AtomicBool::new(false)),
    };
    let source = ByteSource {
        rx,
        current: Bytes::new(),
        terminal: None,
        handler,
        closed_fired: false,
    };
    (sink, source)
}

/// Producer side of a byte input. Cheap to clone; all methods are
/// non-blocking.
#[derive(Clone)]
pub struct ByteSink {
    tx: mpsc::UnboundedSender<Segment>,
    terminated: Arc<AtomicBool>,
}

impl ByteSink {
    /// Queue a chunk. Ignored after a terminator.
    pub fn push(&self, chunk: Bytes) {
        if self.terminated.load(Ordering::Acquire) {
            tracing::trace!(len = chunk.len(), "chunk pushed after terminator, dropping");
            return;
        }
        let _ = self.tx.send(Segment::Data(chunk));
    }

    /// Terminate with end-of-stream. Terminators are sticky; later pushes of
    /// any kind are ignored.
    pub fn push_eof(&self) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(Segment::Eof);
        }
    }

    /// Terminate with an error the consumer observes on this and every later
    /// read.
    pub fn push_error(&self, error: StreamBreak) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(Segment::Break(error));
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }
}

/// Consumer side of a byte input.
///
/// Reads yield the pushed chunks back-to-back in push order. After EOF,
/// reads return zero bytes; after an error terminator, reads fail with the
/// matching `io::Error`.
pub struct ByteSource {
    rx: mpsc::UnboundedReceiver<Segment>,
    current: Bytes,
    terminal: Option<Terminal>,
    handler: Arc<dyn InputHandler>,
    closed_fired: bool,
}

impl ByteSource {
    fn fire_closed(&mut self) {
        if !self.closed_fired {
            self.closed_fired = true;
            self.handler.closed();
        }
    }
}

impl Drop for ByteSource {
    fn drop(&mut self) {
        self.fire_closed();
    }
}

impl AsyncRead for ByteSource {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        loop {
            match self.terminal {
                Some(Terminal::Eof) => return Poll::Ready(Ok(())),
                Some(Terminal::Broken(e)) => return Poll::Ready(Err(e.to_io_error())),
                None => {}
            }

            if !self.current.is_empty() {
                let n = usize::min(self.current.len(), buf.remaining());
                let chunk = self.current.split_to(n);
                buf.put_slice(&chunk);
                if self.current.is_empty() {
                    self.handler.chunk_drained();
                }
                return Poll::Ready(Ok(()));
            }

            match self.rx.poll_recv(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Segment::Data(chunk))) => {
                    if chunk.is_empty() {
                        // An empty chunk is drained the moment it arrives.
                        self.handler.chunk_drained();
                        continue;
                    }
                    self.current = chunk;
                }
                Poll::Ready(Some(Segment::Eof)) => {
                    self.terminal = Some(Terminal::Eof);
                    self.fire_closed();
                }
                Poll::Ready(Some(Segment::Break(e))) => {
                    self.terminal = Some(Terminal::Broken(e));
                    self.fire_closed();
                }
                Poll::Ready(None) => {
                    // Every sink dropped without a terminator; the producer
                    // is gone for good.
                    self.terminal = Some(Terminal::Broken(StreamBreak::ConnectionClosed));
                    self.fire_closed();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::ErrorKind;
    use std::sync::atomic::AtomicUsize;

    use tokio::io::AsyncReadExt;

    use super::*;

    struct Counting {
        drained: AtomicUsize,
        closed: AtomicUsize,
    }

    impl Counting {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                drained: AtomicUsize::new(0),
                closed: AtomicUsize::new(0),
            })
        }
    }

    impl InputHandler for Counting {
        fn chunk_drained(&self) {
            self.drained.fetch_add(1, Ordering::SeqCst);
        }
        fn closed(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn chunks_queue_before_consumer_attaches() {
        let handler = Counting::new();
        let (sink, mut source) = byte_input(handler.clone());
        sink.push(Bytes::from_static(b"AB"));
        sink.push(Bytes::from_static(b"CD"));
        sink.push_eof();

        let mut out = Vec::new();
        source.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"ABCD");
        assert_eq!(handler.drained.load(Ordering::SeqCst), 2);
        assert_eq!(handler.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn error_terminator_unblocks_pending_reader() {
        let handler = Counting::new();
        let (sink, mut source) = byte_input(handler);
        sink.push(Bytes::from_static(b"AB"));

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 4];
            source.read_exact(&mut buf).await
        });
        tokio::task::yield_now().await;
        sink.push_error(StreamBreak::Aborted);

        let err = reader.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Interrupted);
    }

    #[tokio::test]
    async fn error_is_sticky() {
        let (sink, mut source) = byte_input(Counting::new());
        sink.push_error(StreamBreak::ReplyAborted);

        let mut buf = [0u8; 1];
        for _ in 0..2 {
            let err = source.read(&mut buf).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ConnectionAborted);
        }
    }

    #[tokio::test]
    async fn pushes_after_terminator_are_dropped() {
        let handler = Counting::new();
        let (sink, mut source) = byte_input(handler.clone());
        sink.push(Bytes::from_static(b"X"));
        sink.push_eof();
        sink.push(Bytes::from_static(b"Y"));
        sink.push_error(StreamBreak::Aborted);

        let mut out = Vec::new();
        source.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"X");
        assert_eq!(handler.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropped_sink_reads_as_connection_closed() {
        let (sink, mut source) = byte_input(Counting::new());
        drop(sink);
        let mut buf = [0u8; 1];
        let err = source.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn closed_fires_once_on_drop() {
        let handler = Counting::new();
        let (sink, source) = byte_input(handler.clone());
        sink.push_eof();
        drop(source);
        assert_eq!(handler.closed.load(Ordering::SeqCst), 1);
    }
}
