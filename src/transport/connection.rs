//! Multiplexer: many logical messages over one framed stream.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::Stream;
use serde_json::Value;
use tokio::io::ReadHalf;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, trace, warn};

use super::frame::{parse_canonical, Frame, FrameTag};
use super::framer::{FrameReader, FrameWriter};
use crate::config::ConnectionConfig;
use crate::message::{Body, Message, Shared};
use crate::stream::{PeerInfo, ScampStream};
use crate::{Error, Result};

/// Error given to inbound messages still open when the connection drops,
/// followed by `: <close reason>`.
pub const CLOSED_MID_MESSAGE: &str = "Connection closed before message finished";

const TXERR_PLACEHOLDER: &str = "unspecified error";

/// Inbound messages in HEADER order.
pub struct Incoming {
    receiver: UnboundedReceiverStream<Message>,
}

impl Stream for Incoming {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.receiver).poll_next(cx)
    }
}

#[derive(Default)]
struct Mux {
    next_out: u64,
    next_in: u64,
    outbound: HashMap<u64, Arc<Shared>>,
    inbound: HashMap<u64, Arc<Shared>>,
    incoming: Option<mpsc::UnboundedSender<Message>>,
}

struct Inner {
    writer: FrameWriter,
    config: ConnectionConfig,
    peer: PeerInfo,
    closed: watch::Sender<Option<Arc<str>>>,
    mux: Mutex<Mux>,
    acks: mpsc::UnboundedSender<(u64, u64)>,
    busy: AtomicBool,
    last_activity: Mutex<Instant>,
}

/// Handle to a running connection. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.inner.peer.address)
            .field("closed", &self.close_reason())
            .finish()
    }
}

impl Connection {
    /// Start the reader, writer, ack and idle tasks for `stream`.
    pub fn spawn(stream: ScampStream, config: ConnectionConfig) -> (Connection, Incoming) {
        let peer = stream.peer_info().clone();
        let (read_half, write_half) = tokio::io::split(stream);
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (acks_tx, acks_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(None);

        let conn = Connection {
            inner: Arc::new(Inner {
                writer: FrameWriter::new(config.max_write_queue),
                peer,
                closed,
                mux: Mutex::new(Mux {
                    incoming: Some(incoming_tx),
                    ..Mux::default()
                }),
                acks: acks_tx,
                busy: AtomicBool::new(false),
                last_activity: Mutex::new(Instant::now()),
                config,
            }),
        };
        debug!(peer = %conn.inner.peer.address, "connection started");

        let reader = FrameReader::new(
            read_half,
            conn.inner.config.max_frame_len,
            conn.inner.config.read_quantum,
        );
        tokio::spawn(conn.clone().read_loop(reader));
        tokio::spawn(conn.clone().write_loop(write_half));
        tokio::spawn(conn.clone().ack_loop(acks_rx));
        tokio::spawn(conn.clone().idle_loop());

        let incoming = Incoming {
            receiver: UnboundedReceiverStream::new(incoming_rx),
        };
        (conn, incoming)
    }

    /// Peer this connection talks to.
    pub fn peer(&self) -> &PeerInfo {
        &self.inner.peer
    }

    /// Send a message, returning its id. The body is pumped in the background
    /// under flow control.
    pub fn send_message(&self, message: Message) -> Result<u64> {
        let header = serde_json::to_vec(&message.header)?;
        let shared = message.body.shared().clone();
        let queued = {
            let mut mux = self.lock_mux();
            if let Some(reason) = self.close_reason() {
                return Err(Error::Closed(reason));
            }
            let id = mux.next_out;
            self.send_frame(FrameTag::Header, id, &header).map(|()| {
                mux.next_out += 1;
                mux.outbound.insert(id, shared);
                id
            })
        };
        match queued {
            Ok(id) => {
                trace!(id, "message sent");
                tokio::spawn(self.clone().pump(id, message.body));
                Ok(id)
            }
            Err(err) => {
                self.fail(&err);
                Err(err)
            }
        }
    }

    /// Mark the connection busy (pending requests) so it never idles out.
    pub fn set_busy(&self, busy: bool) {
        self.inner.busy.store(busy, Ordering::SeqCst);
        self.touch();
    }

    /// True when no message is open in either direction and nobody marked it busy.
    pub fn is_idle(&self) -> bool {
        if self.inner.busy.load(Ordering::SeqCst) {
            return false;
        }
        let mux = self.lock_mux();
        mux.inbound.is_empty() && mux.outbound.is_empty()
    }

    /// Close reason, once closed.
    pub fn close_reason(&self) -> Option<String> {
        self.inner.closed.borrow().as_ref().map(|r| r.to_string())
    }

    /// True once closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.borrow().is_some()
    }

    /// Wait for the connection to close and return the reason.
    pub async fn closed(&self) -> String {
        let mut rx = self.inner.closed.subscribe();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.as_ref().map(|r| r.to_string()).unwrap_or_default(),
            Err(_) => "connection dropped".to_string(),
        };
        reason
    }

    /// Close the connection. Only the first call has any effect.
    pub fn close(&self, reason: impl Into<String>) {
        let reason: String = reason.into();
        let reason: Arc<str> = Arc::from(reason);
        let first = self.inner.closed.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason.clone());
            true
        });
        if !first {
            return;
        }
        debug!(peer = %self.inner.peer.address, %reason, "connection closed");

        self.inner.writer.close();
        let (inbound, outbound, incoming) = {
            let mut mux = self.lock_mux();
            (
                std::mem::take(&mut mux.inbound),
                std::mem::take(&mut mux.outbound),
                mux.incoming.take(),
            )
        };
        for shared in inbound.values() {
            shared.finish(Err(format!("{CLOSED_MID_MESSAGE}: {reason}")));
        }
        for shared in outbound.values() {
            shared.cancel(&reason);
        }
        drop(incoming);
    }

    fn fail(&self, err: &Error) {
        if err.is_protocol() {
            warn!(peer = %self.inner.peer.address, error = %err, "SCAMP protocol error");
        }
        self.close(err.to_string());
    }

    fn lock_mux(&self) -> MutexGuard<'_, Mux> {
        self.inner
            .mux
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn touch(&self) {
        if let Ok(mut last) = self.inner.last_activity.lock() {
            *last = Instant::now();
        }
    }

    fn last_activity(&self) -> Instant {
        self.inner
            .last_activity
            .lock()
            .map(|last| *last)
            .unwrap_or_else(|_| Instant::now())
    }

    fn send_frame(&self, tag: FrameTag, id: u64, payload: &[u8]) -> Result<()> {
        self.inner.writer.send(tag, id, payload)?;
        self.touch();
        Ok(())
    }

    fn dispatch(&self, frame: Frame) -> Result<()> {
        let Frame { tag, id, payload } = frame;
        match tag {
            FrameTag::Header => {
                let mut mux = self.lock_mux();
                if id != mux.next_in {
                    return Err(Error::protocol("Out of sequence message received"));
                }
                mux.next_in += 1;
                let header = match serde_json::from_slice::<Value>(&payload) {
                    Ok(Value::Object(map)) => map,
                    _ => return Err(Error::protocol("Malformed JSON in received header")),
                };
                let (shared, message) = Message::inbound(header, id, self.inner.acks.clone());
                mux.inbound.insert(id, shared);
                if let Some(incoming) = &mux.incoming {
                    let _ = incoming.send(message);
                }
            }
            FrameTag::Data => {
                let shared = self
                    .inbound(id)
                    .ok_or_else(|| Error::protocol("Received DATA with no active message"))?;
                shared.push(payload);
            }
            FrameTag::Eof => {
                if self.inbound(id).is_none() {
                    return Err(Error::protocol("Received EOF with no active message"));
                }
                if !payload.is_empty() {
                    return Err(Error::protocol("EOF must have empty payload"));
                }
                if let Some(shared) = self.lock_mux().inbound.remove(&id) {
                    shared.finish(Ok(()));
                }
            }
            FrameTag::Txerr => {
                if self.inbound(id).is_none() {
                    return Err(Error::protocol("Received TXERR with no active message"));
                }
                let text = String::from_utf8_lossy(&payload).into_owned();
                if text.is_empty() || text == "0" {
                    return Err(Error::protocol("Forbidden error message"));
                }
                if let Some(shared) = self.lock_mux().inbound.remove(&id) {
                    shared.finish(Err(text));
                }
            }
            FrameTag::Ack => {
                // acks may trail a message we already finished sending
                let Some(shared) = self.lock_mux().outbound.get(&id).cloned() else {
                    return Ok(());
                };
                let total = parse_canonical("ack", &payload)
                    .map_err(|_| Error::protocol("Malformed ACK payload"))?;
                shared.acknowledge(total).map_err(Error::Protocol)?;
            }
        }
        Ok(())
    }

    fn inbound(&self, id: u64) -> Option<Arc<Shared>> {
        self.lock_mux().inbound.get(&id).cloned()
    }

    async fn read_loop(self, mut reader: FrameReader<ReadHalf<ScampStream>>) {
        let mut closed = self.inner.closed.subscribe();
        loop {
            let next = tokio::select! {
                next = reader.next_frame() => next,
                _ = closed.wait_for(Option::is_some) => return,
            };
            match next {
                Ok(Some(frame)) => {
                    trace!(tag = %frame.tag, id = frame.id, len = frame.payload.len(), "frame received");
                    self.touch();
                    if let Err(err) = self.dispatch(frame) {
                        self.fail(&err);
                        return;
                    }
                }
                Ok(None) => {
                    self.close("EOF received");
                    return;
                }
                Err(err) => {
                    self.fail(&err);
                    return;
                }
            }
        }
    }

    async fn write_loop(self, io: tokio::io::WriteHalf<ScampStream>) {
        if let Err(err) = self.inner.writer.clone().run(io).await {
            self.fail(&err);
        }
    }

    async fn ack_loop(self, mut acks: mpsc::UnboundedReceiver<(u64, u64)>) {
        let mut closed = self.inner.closed.subscribe();
        loop {
            let first = tokio::select! {
                ack = acks.recv() => match ack {
                    Some(ack) => ack,
                    None => return,
                },
                _ = closed.wait_for(Option::is_some) => return,
            };
            // coalesce a burst down to the latest total per message
            let mut latest: HashMap<u64, u64> = HashMap::new();
            latest.insert(first.0, first.1);
            while let Ok((id, total)) = acks.try_recv() {
                let entry = latest.entry(id).or_insert(total);
                *entry = (*entry).max(total);
            }
            for (id, total) in latest {
                let payload = Bytes::from(total.to_string());
                if let Err(err) = self.send_frame(FrameTag::Ack, id, &payload) {
                    self.fail(&err);
                    return;
                }
            }
        }
    }

    async fn idle_loop(self) {
        let idle = self.inner.config.idle_timeout;
        let mut closed = self.inner.closed.subscribe();
        let mut wake = self.last_activity() + idle;
        loop {
            tokio::select! {
                _ = sleep_until(wake) => {}
                _ = closed.wait_for(Option::is_some) => return,
            }
            let now = Instant::now();
            let due = self.last_activity() + idle;
            if now < due {
                wake = due;
            } else if self.is_idle() {
                self.close("idle timeout");
                return;
            } else {
                wake = now + idle;
            }
        }
    }

    async fn pump(self, id: u64, body: Body) {
        let shared = body.shared().clone();
        let window = self.inner.config.window;
        let chunk = self.inner.config.data_chunk;
        let result = loop {
            match shared.take_window(window, chunk).await {
                Ok(Some(bytes)) => {
                    if let Err(err) = self.send_frame(FrameTag::Data, id, &bytes) {
                        break Err(err);
                    }
                }
                Ok(None) => break self.send_frame(FrameTag::Eof, id, b""),
                Err(Error::Message(text)) => {
                    let text = if text.is_empty() || text == "0" {
                        TXERR_PLACEHOLDER.to_string()
                    } else {
                        text
                    };
                    break self.send_frame(FrameTag::Txerr, id, text.as_bytes());
                }
                Err(_) => break Ok(()),
            }
        };
        self.lock_mux().outbound.remove(&id);
        drop(body);
        self.touch();
        match result {
            Ok(()) => trace!(id, "message body finished"),
            Err(Error::Closed(_)) => {}
            Err(err) => self.fail(&err),
        }
    }
}
