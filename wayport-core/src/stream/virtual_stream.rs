//! Per-exchange virtual streams
//!
//! A virtual stream is identified by `(request id, direction)`. The local side
//! of a stream is either a [`StreamWriter`] (frames we emit) or an
//! [`InboundStream`] (frames the peer emits, routed to us by the multiplexer).

use super::multiplexer::{Multiplexer, StreamKey};
use crate::transport::FrameSink;
use bytes::Bytes;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::debug;
use wayport_common::{Result, TunnelError};
use wayport_protocol::{Direction, Frame, RequestId, ResponseHead};

/// Lifecycle of a locally written stream. Transitions are one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    /// A terminal frame is being flushed
    Ending,
    Closed,
    Errored,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(self, StreamState::Closed | StreamState::Errored)
    }
}

/// Write half of a virtual stream.
///
/// Every emission waits for the connection's drain signal, so a slow control
/// connection throttles every stream riding it. Dropping a writer that is
/// still open emits one best-effort `*-pipe-error` so the peer can release its
/// half.
#[derive(Debug)]
pub struct StreamWriter {
    request_id: RequestId,
    direction: Direction,
    sink: FrameSink,
    state: StreamState,
}

impl StreamWriter {
    pub(crate) fn new(request_id: RequestId, direction: Direction, sink: FrameSink) -> Self {
        Self {
            request_id,
            direction,
            sink,
            state: StreamState::Open,
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state == StreamState::Open {
            Ok(())
        } else {
            Err(TunnelError::InvalidState(format!(
                "{} stream {} is {:?}",
                self.direction, self.request_id, self.state
            )))
        }
    }

    async fn emit(&mut self, frame: Frame) -> Result<()> {
        let result = self.sink.send_and_drain(frame).await;
        if result.is_err() {
            self.state = StreamState::Errored;
        }
        result
    }

    /// Append one chunk
    pub async fn write(&mut self, chunk: Bytes) -> Result<()> {
        self.ensure_open()?;
        if chunk.is_empty() {
            return Ok(());
        }
        self.emit(self.direction.pipe(self.request_id, chunk)).await
    }

    /// Append several chunks in one event
    pub async fn write_batch(&mut self, chunks: Vec<Bytes>) -> Result<()> {
        self.ensure_open()?;
        let mut chunks: Vec<Bytes> = chunks.into_iter().filter(|c| !c.is_empty()).collect();
        let frame = match chunks.len() {
            0 => return Ok(()),
            1 => self.direction.pipe(self.request_id, chunks.remove(0)),
            _ => self.direction.pipes(self.request_id, chunks),
        };
        self.emit(frame).await
    }

    /// End the stream cleanly
    pub async fn end(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.state = StreamState::Ending;
        self.emit(self.direction.end(self.request_id)).await?;
        self.state = StreamState::Closed;
        Ok(())
    }

    /// Write a final chunk and end the stream.
    ///
    /// The response direction carries the chunk inside `response-pipe-end`.
    pub async fn end_with(&mut self, chunk: Bytes) -> Result<()> {
        match self.direction {
            Direction::Response => {
                self.ensure_open()?;
                self.state = StreamState::Ending;
                self.emit(Frame::ResponsePipeEnd {
                    request_id: self.request_id,
                    chunk: (!chunk.is_empty()).then_some(chunk),
                })
                .await?;
                self.state = StreamState::Closed;
                Ok(())
            }
            Direction::Request => {
                self.write(chunk).await?;
                self.end().await
            }
        }
    }

    /// Destroy the stream with an error. No-op once terminal.
    pub async fn abort(&mut self, reason: impl Into<String>) -> Result<()> {
        if self.state != StreamState::Open {
            return Ok(());
        }
        self.state = StreamState::Errored;
        let frame = self.direction.error(self.request_id, reason.into());
        self.sink.send_and_drain(frame).await
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        if self.state == StreamState::Open {
            self.state = StreamState::Errored;
            let frame = self.direction.error(self.request_id, "stream dropped".into());
            if !self.sink.try_send(frame) {
                debug!("Could not signal drop of {} stream {}", self.direction, self.request_id);
            }
        }
    }
}

/// An event delivered to the read side of a virtual stream
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// Response status line and headers (`status_code == None` for upgrades)
    Head(Box<ResponseHead>),
    Data(Bytes),
    End,
    /// The peer destroyed the stream
    Error(String),
    /// The tunnel client could not reach its local service
    RequestError(String),
    /// The control connection went away
    Disconnected,
}

impl InboundEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, InboundEvent::Head(_) | InboundEvent::Data(_))
    }

    /// Map a terminal event to the error it represents
    pub fn into_error(self) -> Option<TunnelError> {
        match self {
            InboundEvent::Error(message) => Some(TunnelError::StreamAbort(message)),
            InboundEvent::RequestError(message) => Some(TunnelError::UpstreamUnreachable(message)),
            InboundEvent::Disconnected => Some(TunnelError::PeerDisconnected),
            _ => None,
        }
    }
}

/// Read half of a virtual stream.
///
/// Holds the stream's subscription in the connection's dispatch table and
/// releases it on the first terminal event. Dropping it earlier abandons the
/// stream, so frames the peer is still sending are discarded quietly.
#[derive(Debug)]
pub struct InboundStream {
    key: StreamKey,
    rx: UnboundedReceiver<InboundEvent>,
    mux: Multiplexer,
    finished: bool,
}

impl InboundStream {
    pub(crate) fn new(key: StreamKey, rx: UnboundedReceiver<InboundEvent>, mux: Multiplexer) -> Self {
        Self {
            key,
            rx,
            mux,
            finished: false,
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.key.0
    }

    pub fn direction(&self) -> Direction {
        self.key.1
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Next event, or `None` after the terminal event was delivered
    pub async fn recv(&mut self) -> Option<InboundEvent> {
        if self.finished {
            return None;
        }
        let event = self.rx.recv().await.unwrap_or(InboundEvent::Disconnected);
        if event.is_terminal() {
            self.finish();
        }
        Some(event)
    }

    /// Next body chunk; `Ok(None)` on clean end
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        match self.recv().await {
            Some(InboundEvent::Data(chunk)) => Ok(Some(chunk)),
            Some(InboundEvent::End) | None => Ok(None),
            Some(InboundEvent::Head(_)) => Err(TunnelError::Protocol(format!(
                "unexpected head on {} stream {}",
                self.key.1, self.key.0
            ))),
            Some(terminal) => Err(terminal
                .into_error()
                .unwrap_or(TunnelError::PeerDisconnected)),
        }
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.mux.release(self.key);
        }
    }
}

impl Drop for InboundStream {
    fn drop(&mut self) {
        if !self.finished {
            self.finished = true;
            self.mux.abandon(self.key);
        }
    }
}
