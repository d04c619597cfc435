//! A bounded in-process byte pipe: one producer, one consumer.
//!
//! Chunks are delivered in write order. The channel capacity bounds how far the
//! producer can run ahead, so memory stays constant regardless of payload size.
//! Dropping the reader makes further writes fail with `BrokenPipe`.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

/// Default number of in-flight chunks.
pub const DEFAULT_CAPACITY: usize = 8;

type Chunk = io::Result<Vec<u8>>;

/// Creates a connected pipe holding at most `capacity` unread chunks.
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (PipeWriter { tx }, PipeReader { rx })
}

/// Producer end.
pub struct PipeWriter {
    tx: mpsc::Sender<Chunk>,
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader closed")
}

impl PipeWriter {
    /// Sends `buf` as one chunk, waiting while the reader is behind.
    pub async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        self.tx
            .send(Ok(buf.to_vec()))
            .await
            .map_err(|_| broken_pipe())
    }

    /// Ends the stream normally.
    pub fn close(self) {}

    /// Ends the stream with `error`, which the reader observes after any pending chunks.
    pub async fn close_with_error(self, error: io::Error) {
        // A gone reader has nothing left to observe.
        let _ = self.tx.send(Err(error)).await;
    }

    /// True once the reader has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer end, a stream of chunks.
pub struct PipeReader {
    rx: mpsc::Receiver<Chunk>,
}

impl Stream for PipeReader {
    type Item = Chunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl From<PipeReader> for reqwest::Body {
    fn from(reader: PipeReader) -> Self {
        reqwest::Body::wrap_stream(reader)
    }
}
