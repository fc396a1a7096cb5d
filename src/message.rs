//! Logical messages: a JSON header plus a streamed body and optional error trailer.
//!
//! A body is produced on one side and consumed on the other. Production is
//! bounded by a window of unacknowledged bytes; bytes count as acknowledged
//! when the consumer takes them (or, for messages being sent over a
//! connection, when the peer ACKs them). Acknowledgements destined for the
//! wire go out through a channel, never from inside the consumer's call.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, Notify};

use crate::{Error, Result};

/// Message header: an ordered JSON object.
pub type Header = Map<String, Value>;

/// Error text attached when buffered consumption hits its cap.
pub const BUFFER_LIMIT_EXCEEDED: &str = "buffer limit exceeded";

const DEFAULT_WINDOW: usize = 64 * 1024;

/// A header and its body.
pub struct Message {
    /// Header fields.
    pub header: Header,
    /// Body, consumed once.
    pub body: Body,
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

impl Message {
    /// A message whose body is produced incrementally through the returned sender.
    pub fn channel(header: Header, window: usize) -> (BodySender, Message) {
        let shared = Shared::new(window, None);
        (
            BodySender {
                shared: shared.clone(),
            },
            Message {
                header,
                body: Body { shared },
            },
        )
    }

    /// A message with its whole body available up front.
    pub fn from_bytes(header: Header, body: impl Into<Bytes>) -> Message {
        let body = body.into();
        let shared = Shared::new(body.len().max(DEFAULT_WINDOW), None);
        shared.push(body);
        shared.finish(Ok(()));
        Message {
            header,
            body: Body { shared },
        }
    }

    /// A message with an empty body that ends with `error`.
    pub fn error(header: Header, error: impl Into<String>) -> Message {
        let shared = Shared::new(DEFAULT_WINDOW, None);
        shared.finish(Err(error.into()));
        Message {
            header,
            body: Body { shared },
        }
    }

    /// Inbound message fed by a connection. Consumption sends `(id, total)`
    /// acknowledgements on `acks`.
    pub(crate) fn inbound(
        header: Header,
        id: u64,
        acks: mpsc::UnboundedSender<(u64, u64)>,
    ) -> (Arc<Shared>, Message) {
        let shared = Shared::new(usize::MAX, Some(AckSink { id, tx: acks }));
        (
            shared.clone(),
            Message {
                header,
                body: Body { shared },
            },
        )
    }

    /// String-valued header field.
    pub fn header_str(&self, key: &str) -> Option<&str> {
        self.header.get(key).and_then(Value::as_str)
    }
}

pub(crate) struct AckSink {
    id: u64,
    tx: mpsc::UnboundedSender<(u64, u64)>,
}

#[derive(Default)]
struct State {
    queue: VecDeque<Bytes>,
    pushed: u64,
    taken: u64,
    acked: u64,
    end: Option<std::result::Result<(), String>>,
    cancelled: Option<String>,
    discard: bool,
    ack_sink: Option<AckSink>,
}

impl State {
    fn deliver_ack(&self) {
        if let Some(sink) = &self.ack_sink {
            let _ = sink.tx.send((sink.id, self.acked));
        }
    }
}

pub(crate) struct Shared {
    state: Mutex<State>,
    readable: Notify,
    writable: Notify,
    window: usize,
}

impl Shared {
    fn new(window: usize, ack_sink: Option<AckSink>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                ack_sink,
                ..State::default()
            }),
            readable: Notify::new(),
            writable: Notify::new(),
            window: window.max(1),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append bytes without waiting for window room.
    pub(crate) fn push(&self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        let mut st = self.lock();
        if st.end.is_some() {
            return;
        }
        let len = bytes.len() as u64;
        st.pushed += len;
        if st.discard {
            st.taken += len;
            st.acked = st.taken;
            st.deliver_ack();
            return;
        }
        st.queue.push_back(bytes);
        drop(st);
        self.readable.notify_one();
    }

    /// Record the end of the body. Later calls are ignored.
    pub(crate) fn finish(&self, result: std::result::Result<(), String>) {
        let mut st = self.lock();
        if st.end.is_none() {
            st.end = Some(result);
        }
        drop(st);
        self.readable.notify_one();
    }

    /// Abort both sides; pending and future waits fail with `reason`.
    pub(crate) fn cancel(&self, reason: &str) {
        let mut st = self.lock();
        if st.cancelled.is_none() {
            st.cancelled = Some(reason.to_string());
        }
        drop(st);
        self.readable.notify_one();
        self.writable.notify_one();
    }

    /// Apply a cumulative acknowledgement received from the peer.
    pub(crate) fn acknowledge(&self, total: u64) -> std::result::Result<(), String> {
        let mut st = self.lock();
        if total <= st.acked {
            return Err(format!("ACK {total} is not an advance over {}", st.acked));
        }
        if total > st.taken {
            return Err(format!("ACK {total} exceeds {} bytes sent", st.taken));
        }
        st.acked = total;
        drop(st);
        self.readable.notify_one();
        self.writable.notify_one();
        Ok(())
    }

    /// Take up to `max` bytes while keeping `taken - acked` within `window`.
    /// Taken bytes are not acknowledged. `Ok(None)` marks a clean end.
    pub(crate) async fn take_window(&self, window: usize, max: usize) -> Result<Option<Bytes>> {
        loop {
            {
                let mut st = self.lock();
                if let Some(reason) = &st.cancelled {
                    return Err(Error::Closed(reason.clone()));
                }
                let inflight = (st.taken - st.acked) as usize;
                if !st.queue.is_empty() && inflight < window {
                    let room = (window - inflight).min(max.max(1));
                    if let Some(mut chunk) = st.queue.pop_front() {
                        if chunk.len() > room {
                            let rest = chunk.split_off(room);
                            st.queue.push_front(rest);
                        }
                        st.taken += chunk.len() as u64;
                        return Ok(Some(chunk));
                    }
                }
                if st.queue.is_empty() {
                    match &st.end {
                        Some(Ok(())) => return Ok(None),
                        Some(Err(msg)) => return Err(Error::Message(msg.clone())),
                        None => {}
                    }
                }
            }
            self.readable.notified().await;
        }
    }
}

/// Producing half of a streamed body.
pub struct BodySender {
    shared: Arc<Shared>,
}

impl BodySender {
    /// Append a chunk, waiting while the window is full.
    pub async fn send(&self, bytes: impl Into<Bytes>) -> Result<()> {
        let bytes = bytes.into();
        loop {
            {
                let mut st = self.shared.lock();
                if let Some(reason) = &st.cancelled {
                    return Err(Error::Closed(reason.clone()));
                }
                if bytes.is_empty() {
                    return Ok(());
                }
                if ((st.pushed - st.acked) as usize) < self.shared.window {
                    st.pushed += bytes.len() as u64;
                    st.queue.push_back(bytes);
                    drop(st);
                    self.shared.readable.notify_one();
                    return Ok(());
                }
            }
            self.shared.writable.notified().await;
        }
    }

    /// Bytes produced so far.
    pub fn sent(&self) -> u64 {
        self.shared.lock().pushed
    }

    /// Bytes the consumer (or peer) has acknowledged.
    pub fn acknowledged(&self) -> u64 {
        self.shared.lock().acked
    }

    /// End the body normally.
    pub fn end(self) {
        self.shared.finish(Ok(()));
    }

    /// End the body with an error trailer.
    pub fn fail(self, error: impl Into<String>) {
        self.shared.finish(Err(error.into()));
    }
}

impl Drop for BodySender {
    fn drop(&mut self) {
        self.shared
            .finish(Err("message producer dropped before end".to_string()));
    }
}

/// Consuming half of a body.
pub struct Body {
    shared: Arc<Shared>,
}

/// Result of buffered consumption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collected {
    /// Body bytes, at most the requested cap.
    pub data: Bytes,
    /// Error trailer, or [`BUFFER_LIMIT_EXCEEDED`] when truncated.
    pub error: Option<String>,
}

impl Collected {
    /// Data if the body ended cleanly.
    pub fn into_result(self) -> Result<Bytes> {
        match self.error {
            None => Ok(self.data),
            Some(err) => Err(Error::Message(err)),
        }
    }
}

impl Body {
    /// Next chunk; `Ok(None)` after a clean end, `Err` with the trailer otherwise.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        loop {
            {
                let mut st = self.shared.lock();
                if let Some(chunk) = st.queue.pop_front() {
                    st.taken += chunk.len() as u64;
                    st.acked = st.taken;
                    st.deliver_ack();
                    drop(st);
                    self.shared.writable.notify_one();
                    return Ok(Some(chunk));
                }
                match &st.end {
                    Some(Ok(())) => return Ok(None),
                    Some(Err(msg)) => return Err(Error::Message(msg.clone())),
                    None => {}
                }
                if let Some(reason) = &st.cancelled {
                    return Err(Error::Message(reason.clone()));
                }
            }
            self.shared.readable.notified().await;
        }
    }

    /// Buffer the whole body, truncating at `max` bytes.
    pub async fn collect(mut self, max: usize) -> Collected {
        let mut data = BytesMut::new();
        loop {
            match self.chunk().await {
                Ok(Some(chunk)) => {
                    let room = max - data.len();
                    if chunk.len() > room {
                        data.extend_from_slice(&chunk[..room]);
                        return Collected {
                            data: data.freeze(),
                            error: Some(BUFFER_LIMIT_EXCEEDED.to_string()),
                        };
                    }
                    data.extend_from_slice(&chunk);
                }
                Ok(None) => {
                    return Collected {
                        data: data.freeze(),
                        error: None,
                    }
                }
                Err(err) => {
                    let error = match err {
                        Error::Message(msg) => msg,
                        other => other.to_string(),
                    };
                    return Collected {
                        data: data.freeze(),
                        error: Some(error),
                    };
                }
            }
        }
    }

    /// Drain and drop the body, returning its error trailer if any.
    pub async fn discard(mut self) -> Option<String> {
        loop {
            match self.chunk().await {
                Ok(Some(_)) => continue,
                Ok(None) => return None,
                Err(Error::Message(msg)) => return Some(msg),
                Err(other) => return Some(other.to_string()),
            }
        }
    }

    /// Body as a stream of chunks.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes>> + Send {
        futures_util::stream::unfold(Some(self), |body| async move {
            let mut body = body?;
            match body.chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(body))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl Drop for Body {
    fn drop(&mut self) {
        let mut st = self.shared.lock();
        st.discard = true;
        let dropped: u64 = st.queue.drain(..).map(|b| b.len() as u64).sum();
        if dropped > 0 {
            st.taken += dropped;
            st.acked = st.taken;
            st.deliver_ack();
        }
        if st.cancelled.is_none() && st.end.is_none() && st.ack_sink.is_none() {
            st.cancelled = Some("message consumer dropped".to_string());
        }
        drop(st);
        self.shared.writable.notify_one();
    }
}
