//! Async frame reader and a bounded, single-flight frame writer.

use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tracing::trace;

use super::frame::{encode, Frame, FrameDecoder, FrameError, FrameTag};
use crate::{Error, Result};

/// Pulls frames off a byte stream.
pub struct FrameReader<R> {
    reader: R,
    decoder: FrameDecoder,
    read_quantum: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a reader.
    pub fn new(reader: R, max_frame_len: usize, read_quantum: usize) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(max_frame_len),
            read_quantum: read_quantum.max(64),
        }
    }

    /// Next frame, or `None` on a clean end of stream between frames.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(Some(frame));
            }
            let buf = self.decoder.buffer_mut();
            buf.reserve(self.read_quantum);
            let n = self.reader.read_buf(buf).await?;
            if n == 0 {
                let left = self.decoder.buffered();
                if left == 0 {
                    return Ok(None);
                }
                return Err(FrameError::Truncated(left).into());
            }
        }
    }
}

#[derive(Default)]
struct Queue {
    buf: BytesMut,
    closed: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    ready: Notify,
    limit: usize,
}

/// Cloneable handle that queues frames for a single writer task.
///
/// Queued bytes are bounded; a send that would exceed the bound fails with
/// [`Error::WriteQueueFull`] and the caller is expected to close the
/// connection.
#[derive(Clone)]
pub struct FrameWriter {
    shared: Arc<Shared>,
}

impl FrameWriter {
    /// Create a writer handle with the given queue limit.
    pub fn new(limit: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(Queue::default()),
                ready: Notify::new(),
                limit,
            }),
        }
    }

    /// Queue one frame.
    pub fn send(&self, tag: FrameTag, id: u64, payload: &[u8]) -> Result<()> {
        let frame_len = Frame::new(tag, id, bytes::Bytes::new()).encoded_len() + payload.len();
        {
            let mut queue = self
                .shared
                .queue
                .lock()
                .map_err(|_| Error::connection("write queue poisoned"))?;
            if queue.closed {
                return Err(Error::Closed("write side closed".into()));
            }
            let queued = queue.buf.len() + frame_len;
            if queued > self.shared.limit {
                return Err(Error::WriteQueueFull {
                    queued,
                    limit: self.shared.limit,
                });
            }
            encode(tag, id, payload, &mut queue.buf);
        }
        trace!(%tag, id, len = payload.len(), "queued frame");
        self.shared.ready.notify_one();
        Ok(())
    }

    /// Bytes waiting to be written.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().map(|q| q.buf.len()).unwrap_or(0)
    }

    /// Stop accepting frames. Already queued bytes are still flushed.
    pub fn close(&self) {
        if let Ok(mut queue) = self.shared.queue.lock() {
            queue.closed = true;
        }
        self.shared.ready.notify_one();
    }

    /// Drain the queue into `io` until closed. Exactly one write is
    /// outstanding at a time; bytes queued meanwhile go out in the next one.
    pub async fn run<W: AsyncWrite + Unpin>(self, mut io: W) -> Result<()> {
        loop {
            let (chunk, closed) = {
                let mut queue = self
                    .shared
                    .queue
                    .lock()
                    .map_err(|_| Error::connection("write queue poisoned"))?;
                (queue.buf.split().freeze(), queue.closed)
            };
            if !chunk.is_empty() {
                io.write_all(&chunk).await?;
                io.flush().await?;
                continue;
            }
            if closed {
                let _ = io.shutdown().await;
                return Ok(());
            }
            self.shared.ready.notified().await;
        }
    }
}
