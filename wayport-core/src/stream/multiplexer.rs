//! Stream multiplexer
//!
//! Demultiplexes the frames of one control connection into per-stream inboxes
//! keyed by `(request id, direction)`. Lookups are O(1) through a sharded
//! `DashMap`; each inbox is removed as soon as its stream reaches a terminal
//! state, so a long-lived connection does not accumulate state from short
//! exchanges.

use super::virtual_stream::{InboundEvent, InboundStream, StreamWriter};
use crate::transport::FrameSink;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use wayport_common::{Result, TunnelError};
use wayport_protocol::{Direction, Frame, RequestHead, RequestId};

/// Identity of one virtual stream
pub type StreamKey = (RequestId, Direction);

/// Number of retired streams remembered so late frames are dropped quietly
const RETIRED_CAPACITY: usize = 1024;

/// A `request` frame accepted on the tunnel client side
#[derive(Debug)]
pub struct IncomingRequest {
    pub request_id: RequestId,
    pub head: RequestHead,
    /// Request body stream
    pub body: InboundStream,
}

/// The gateway's half of a freshly opened exchange
#[derive(Debug)]
pub struct ExchangeStreams {
    pub request_id: RequestId,
    /// Request body writer (`request-pipe*`)
    pub request: StreamWriter,
    /// Response reader (`response`, `response-pipe*`, `request-error`)
    pub response: InboundStream,
}

#[derive(Debug, Default)]
struct RetiredStreams {
    order: VecDeque<StreamKey>,
    set: HashSet<StreamKey>,
}

impl RetiredStreams {
    fn insert(&mut self, key: StreamKey) {
        if !self.set.insert(key) {
            return;
        }
        self.order.push_back(key);
        if self.order.len() > RETIRED_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
    }

    fn contains(&self, key: &StreamKey) -> bool {
        self.set.contains(key)
    }
}

#[derive(Debug)]
struct Inner {
    streams: DashMap<StreamKey, UnboundedSender<InboundEvent>>,
    retired: Mutex<RetiredStreams>,
    /// Streams whose reader left before the peer ended them
    abandoned: Mutex<HashSet<StreamKey>>,
    sink: FrameSink,
    incoming: Option<kanal::AsyncSender<IncomingRequest>>,
    closed: CancellationToken,
}

/// Dispatch table and frame sink of one control connection
#[derive(Debug, Clone)]
pub struct Multiplexer {
    inner: Arc<Inner>,
}

impl Multiplexer {
    /// Multiplexer for the gateway side: opens exchanges, never accepts them
    pub fn gateway(sink: FrameSink) -> Self {
        Self::build(sink, None)
    }

    /// Multiplexer for the tunnel client side. Inbound `request` frames are
    /// queued on the returned receiver.
    pub fn client(sink: FrameSink) -> (Self, kanal::AsyncReceiver<IncomingRequest>) {
        let (tx, rx) = kanal::unbounded_async();
        (Self::build(sink, Some(tx)), rx)
    }

    fn build(sink: FrameSink, incoming: Option<kanal::AsyncSender<IncomingRequest>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                streams: DashMap::new(),
                retired: Mutex::new(RetiredStreams::default()),
                abandoned: Mutex::new(HashSet::new()),
                sink,
                incoming,
                closed: CancellationToken::new(),
            }),
        }
    }

    pub fn sink(&self) -> &FrameSink {
        &self.inner.sink
    }

    /// Cancelled once the control connection is gone
    pub fn closed(&self) -> &CancellationToken {
        &self.inner.closed
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Number of live inbound streams
    pub fn active_streams(&self) -> usize {
        self.inner.streams.len()
    }

    /// Register an inbox for `(request_id, direction)`
    pub fn subscribe(&self, request_id: RequestId, direction: Direction) -> Result<InboundStream> {
        let key = (request_id, direction);
        let (tx, rx) = unbounded_channel();
        match self.inner.streams.entry(key) {
            Entry::Occupied(_) => {
                return Err(TunnelError::InvalidState(format!(
                    "{direction} stream {request_id} already subscribed"
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(tx.clone());
            }
        }
        // Checked after inserting so a concurrent close cannot miss the inbox
        if self.is_closed() {
            let _ = tx.send(InboundEvent::Disconnected);
        }
        Ok(InboundStream::new(key, rx, self.clone()))
    }

    /// Writer for `(request_id, direction)`
    pub fn writer(&self, request_id: RequestId, direction: Direction) -> StreamWriter {
        StreamWriter::new(request_id, direction, self.inner.sink.clone())
    }

    /// Open a new exchange from the gateway: subscribe to its response stream,
    /// emit `request` and hand back the request body writer.
    pub async fn open_exchange(&self, head: RequestHead) -> Result<ExchangeStreams> {
        if self.is_closed() {
            return Err(TunnelError::PeerDisconnected);
        }
        let request_id = RequestId::generate();
        let response = self.subscribe(request_id, Direction::Response)?;
        self.inner
            .sink
            .send(Frame::Request {
                request_id,
                head: Box::new(head),
            })
            .await?;
        Ok(ExchangeStreams {
            request_id,
            request: self.writer(request_id, Direction::Request),
            response,
        })
    }

    /// Route one frame read from the connection. A frame for a stream that
    /// was never opened means the peers disagree about the exchange; it is
    /// logged and counted, and the connection carries on.
    pub fn dispatch(&self, frame: Frame) {
        let name = frame.event_name();
        if let Err(e) = self.try_dispatch(frame) {
            error!("Protocol desync: {} for {}", name, e);
            #[cfg(feature = "metrics")]
            if let Some(m) = wayport_observability::gateway_metrics() {
                m.unknown_stream_frames.inc();
            }
        }
    }

    /// Route one frame, failing with [`TunnelError::UnknownStream`] when no
    /// live, retired or abandoned stream owns it
    pub fn try_dispatch(&self, frame: Frame) -> Result<()> {
        if let Frame::Request { request_id, head } = frame {
            self.accept_request(request_id, *head);
            return Ok(());
        }

        let (Some(request_id), Some(direction)) = (frame.request_id(), frame.direction()) else {
            debug!("Ignoring control frame {} in dispatch", frame.event_name());
            return Ok(());
        };
        let key = (request_id, direction);
        let terminal = frame.is_terminal();
        let name = frame.event_name();

        let delivered = match self.inner.streams.get(&key) {
            Some(inbox) => {
                for event in events_of(frame) {
                    // A dropped reader is released separately
                    let _ = inbox.send(event);
                }
                true
            }
            None => false,
        };

        if !delivered {
            return self.unroutable(key, name, terminal);
        }
        if terminal {
            self.release(key);
        }
        Ok(())
    }

    fn accept_request(&self, request_id: RequestId, head: RequestHead) {
        let Some(incoming) = &self.inner.incoming else {
            warn!("Peer sent a request frame to the gateway ({}), ignoring", request_id);
            return;
        };
        let body = match self.subscribe(request_id, Direction::Request) {
            Ok(body) => body,
            Err(e) => {
                error!("Duplicate request id {}: {}", request_id, e);
                return;
            }
        };
        let request = IncomingRequest {
            request_id,
            head,
            body,
        };
        if !matches!(incoming.try_send(request), Ok(true)) {
            warn!("Request {} arrived after the handler queue closed", request_id);
        }
    }

    fn unroutable(&self, key: StreamKey, name: &str, terminal: bool) -> Result<()> {
        if self.drop_abandoned(key, terminal) {
            debug!("Dropping {} for abandoned stream {}", name, key.0);
            return Ok(());
        }
        let retired = self
            .inner
            .retired
            .lock()
            .map(|r| r.contains(&key))
            .unwrap_or(false);
        if retired {
            debug!("Dropping late {} for retired stream {}", name, key.0);
            return Ok(());
        }
        Err(TunnelError::UnknownStream(key.0.as_uuid()))
    }

    /// True if `key` was abandoned; its terminal frame retires it for good
    fn drop_abandoned(&self, key: StreamKey, terminal: bool) -> bool {
        let Ok(mut abandoned) = self.inner.abandoned.lock() else {
            return false;
        };
        if !abandoned.contains(&key) {
            return false;
        }
        if terminal {
            abandoned.remove(&key);
            drop(abandoned);
            self.retire(key);
        }
        true
    }

    fn retire(&self, key: StreamKey) {
        if let Ok(mut retired) = self.inner.retired.lock() {
            retired.insert(key);
        }
    }

    /// Remove a stream's inbox and remember it as retired
    pub(crate) fn release(&self, key: StreamKey) {
        if self.inner.streams.remove(&key).is_some() {
            self.retire(key);
        }
    }

    /// Remove the inbox of a stream whose reader left before the terminal
    /// event. The peer may still be sending; those frames are dropped
    /// quietly until it ends the stream.
    pub(crate) fn abandon(&self, key: StreamKey) {
        if self.inner.streams.remove(&key).is_some() && !self.is_closed() {
            if let Ok(mut abandoned) = self.inner.abandoned.lock() {
                abandoned.insert(key);
            }
        }
    }

    /// Tear down after the control connection ended: every live stream
    /// observes `Disconnected` and the accept queue closes.
    pub fn close(&self) {
        self.inner.closed.cancel();
        let keys: Vec<StreamKey> = self.inner.streams.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some((_, inbox)) = self.inner.streams.remove(&key) {
                let _ = inbox.send(InboundEvent::Disconnected);
            }
        }
        if let Some(incoming) = &self.inner.incoming {
            let _ = incoming.close();
        }
        if let Ok(mut abandoned) = self.inner.abandoned.lock() {
            abandoned.clear();
        }
    }
}

/// Flatten a stream frame into reader events
fn events_of(frame: Frame) -> Vec<InboundEvent> {
    match frame {
        Frame::RequestPipe { chunk, .. } | Frame::ResponsePipe { chunk, .. } => {
            vec![InboundEvent::Data(chunk)]
        }
        Frame::RequestPipes { chunks, .. } | Frame::ResponsePipes { chunks, .. } => {
            chunks.into_iter().map(InboundEvent::Data).collect()
        }
        Frame::RequestPipeEnd { .. } => vec![InboundEvent::End],
        Frame::ResponsePipeEnd { chunk, .. } => match chunk {
            Some(chunk) => vec![InboundEvent::Data(chunk), InboundEvent::End],
            None => vec![InboundEvent::End],
        },
        Frame::RequestPipeError { message, .. } | Frame::ResponsePipeError { message, .. } => {
            vec![InboundEvent::Error(message)]
        }
        Frame::RequestError { message, .. } => vec![InboundEvent::RequestError(message)],
        Frame::Response { head, .. } => vec![InboundEvent::Head(head)],
        _ => Vec::new(),
    }
}
